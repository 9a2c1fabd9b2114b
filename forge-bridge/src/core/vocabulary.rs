//! Vocabulary types shared across the bridge.
//!
//! Status, RoleClass, FrameRate, Timecode, FrameRange, and the Role display
//! surface. Entities and the registry reference these throughout; nothing
//! here touches the network or the store.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors produced while parsing or validating vocabulary values
#[derive(Debug, Error, Clone, PartialEq)]
pub enum VocabularyError {
    #[error("unknown status {0:?}")]
    UnknownStatus(String),

    #[error("cannot parse frame rate {0:?}")]
    BadFrameRate(String),

    #[error("cannot parse timecode {0:?}")]
    BadTimecode(String),

    #[error("timecode rates must match: {0} vs {1}")]
    RateMismatch(FrameRate, FrameRate),

    #[error("frame range end ({end}) must be >= start ({start})")]
    InvertedRange { start: i64, end: i64 },

    #[error("missing token {token:?} for path template {template:?}")]
    MissingToken { token: String, template: String },

    #[error("unknown role class {0:?}")]
    UnknownRoleClass(String),

    #[error("unknown entity type {0:?}")]
    UnknownEntityType(String),

    #[error("{entity_type} is missing required attribute {attribute:?}")]
    MissingAttribute {
        entity_type: String,
        attribute: String,
    },
}

/// Title-case a snake_case name for use as a default display label
pub(crate) fn title_case(name: &str) -> String {
    name.split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// Status
// ============================================================================

/// Canonical lifecycle status values.
///
/// Pipelines use different terms for the same stage; the closed alias table
/// in [`Status::parse`] maps endpoint-specific spellings onto these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    InProgress,
    Review,
    Approved,
    Rejected,
    Delivered,
    Archived,
}

impl Status {
    /// Parse a status string, accepting common pipeline aliases
    pub fn parse(value: &str) -> Result<Self, VocabularyError> {
        let normalized = value.trim().to_lowercase();
        let status = match normalized.as_str() {
            "pending" => Self::Pending,
            "in_progress" | "wip" | "work_in_progress" | "ip" => Self::InProgress,
            "review" | "pending_review" | "for_review" => Self::Review,
            "approved" => Self::Approved,
            "rejected" => Self::Rejected,
            "delivered" | "final" | "done" | "complete" => Self::Delivered,
            "archived" | "omit" => Self::Archived,
            _ => return Err(VocabularyError::UnknownStatus(value.to_string())),
        };
        Ok(status)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Delivered => "delivered",
            Self::Archived => "archived",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Status {
    type Err = VocabularyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ============================================================================
// RoleClass
// ============================================================================

/// The two classes a role can belong to.
///
/// `track` roles describe the compositional function of a layer within a
/// shot's stack; `media` roles describe the pipeline stage that produced a
/// media atom. The same media entity keeps its media role for life while its
/// track role is contextual per consuming version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleClass {
    #[default]
    Track,
    Media,
}

impl RoleClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Track => "track",
            Self::Media => "media",
        }
    }

    pub fn parse(value: &str) -> Result<Self, VocabularyError> {
        match value {
            "track" => Ok(Self::Track),
            "media" => Ok(Self::Media),
            other => Err(VocabularyError::UnknownRoleClass(other.to_string())),
        }
    }
}

impl fmt::Display for RoleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// FrameRate
// ============================================================================

/// An exact rational frame rate.
///
/// Stored reduced, so `30000/1001` and `60000/2002` compare equal. The
/// `nominal` rate (rounded to the nearest integer) drives timecode
/// arithmetic; both conversion directions use it, which is what makes the
/// frame round-trip law hold for fractional rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameRate {
    num: u32,
    den: u32,
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

impl FrameRate {
    pub const FILM: Self = Self { num: 24, den: 1 };
    pub const PAL: Self = Self { num: 25, den: 1 };
    pub const NTSC_FILM: Self = Self { num: 24000, den: 1001 };
    pub const NTSC: Self = Self { num: 30000, den: 1001 };
    pub const NTSC_HIGH: Self = Self { num: 60000, den: 1001 };
    pub const HIGH: Self = Self { num: 60, den: 1 };

    pub fn new(num: u32, den: u32) -> Result<Self, VocabularyError> {
        if num == 0 || den == 0 {
            return Err(VocabularyError::BadFrameRate(format!("{}/{}", num, den)));
        }
        let g = gcd(num, den);
        Ok(Self {
            num: num / g,
            den: den / g,
        })
    }

    pub fn whole(fps: u32) -> Result<Self, VocabularyError> {
        Self::new(fps, 1)
    }

    pub fn numer(&self) -> u32 {
        self.num
    }

    pub fn denom(&self) -> u32 {
        self.den
    }

    /// The rounded integer rate used for timecode arithmetic
    pub fn nominal(&self) -> u32 {
        (2 * self.num + self.den) / (2 * self.den)
    }

    pub fn as_f64(&self) -> f64 {
        f64::from(self.num) / f64::from(self.den)
    }
}

impl Default for FrameRate {
    fn default() -> Self {
        Self::FILM
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

impl FromStr for FrameRate {
    type Err = VocabularyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // Conventional decimal spellings of the NTSC family
        match s {
            "23.976" | "23.98" => return Ok(Self::NTSC_FILM),
            "29.97" => return Ok(Self::NTSC),
            "59.94" => return Ok(Self::NTSC_HIGH),
            _ => {}
        }
        if let Some((num, den)) = s.split_once('/') {
            let num = num
                .trim()
                .parse::<u32>()
                .map_err(|_| VocabularyError::BadFrameRate(s.to_string()))?;
            let den = den
                .trim()
                .parse::<u32>()
                .map_err(|_| VocabularyError::BadFrameRate(s.to_string()))?;
            return Self::new(num, den);
        }
        let whole = s
            .parse::<u32>()
            .map_err(|_| VocabularyError::BadFrameRate(s.to_string()))?;
        Self::whole(whole)
    }
}

impl Serialize for FrameRate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FrameRate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Timecode
// ============================================================================

static TC_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{2})[;:](\d{2})[;:](\d{2})[;:](\d{2})$").expect("timecode pattern is valid")
});

/// A position expressed in hours:minutes:seconds:frames notation.
///
/// Given a frame rate, converts between timecode and frame indexes in
/// either direction. A `;` separator anywhere in the string form marks
/// drop-frame material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timecode {
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
    pub frames: u32,
    pub rate: FrameRate,
    pub drop_frame: bool,
}

impl Timecode {
    pub fn new(hours: u32, minutes: u32, seconds: u32, frames: u32, rate: FrameRate) -> Self {
        Self {
            hours,
            minutes,
            seconds,
            frames,
            rate,
            drop_frame: false,
        }
    }

    /// Parse a timecode string like `01:00:00:00` or `01;00;00;00`
    pub fn parse(raw: &str, rate: FrameRate) -> Result<Self, VocabularyError> {
        let trimmed = raw.trim();
        let captures = TC_PATTERN
            .captures(trimmed)
            .ok_or_else(|| VocabularyError::BadTimecode(raw.to_string()))?;
        let part = |i: usize| -> u32 {
            // The pattern guarantees two decimal digits per group
            captures[i].parse().unwrap_or(0)
        };
        Ok(Self {
            hours: part(1),
            minutes: part(2),
            seconds: part(3),
            frames: part(4),
            rate,
            drop_frame: trimmed.contains(';'),
        })
    }

    /// Convert an absolute frame index to timecode at the given rate
    pub fn from_frames(frame: u64, rate: FrameRate) -> Self {
        let nominal = u64::from(rate.nominal().max(1));
        let total_seconds = frame / nominal;
        let frames = (frame % nominal) as u32;
        let minutes = total_seconds / 60;
        let seconds = (total_seconds % 60) as u32;
        let hours = (minutes / 60) as u32;
        let minutes = (minutes % 60) as u32;
        Self {
            hours,
            minutes,
            seconds,
            frames,
            rate,
            drop_frame: false,
        }
    }

    /// Convert this timecode to an absolute frame index
    pub fn to_frames(&self) -> i64 {
        let total_seconds =
            i64::from(self.hours) * 3600 + i64::from(self.minutes) * 60 + i64::from(self.seconds);
        total_seconds * i64::from(self.rate.nominal()) + i64::from(self.frames)
    }
}

impl fmt::Display for Timecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = if self.drop_frame { ';' } else { ':' };
        write!(
            f,
            "{:02}:{:02}:{:02}{}{:02}",
            self.hours, self.minutes, self.seconds, sep, self.frames
        )
    }
}

impl Serialize for Timecode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timecode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw, FrameRate::default()).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// FrameRange
// ============================================================================

/// An inclusive start/end frame span. Duration is `end - start + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRange {
    pub start: i64,
    pub end: i64,
    #[serde(rename = "fps", default)]
    pub rate: FrameRate,
}

impl FrameRange {
    pub fn new(start: i64, end: i64, rate: FrameRate) -> Result<Self, VocabularyError> {
        if end < start {
            return Err(VocabularyError::InvertedRange { start, end });
        }
        Ok(Self { start, end, rate })
    }

    /// Build a range from two timecode positions with matching rates
    pub fn from_timecodes(tc_in: Timecode, tc_out: Timecode) -> Result<Self, VocabularyError> {
        if tc_in.rate != tc_out.rate {
            return Err(VocabularyError::RateMismatch(tc_in.rate, tc_out.rate));
        }
        Self::new(tc_in.to_frames(), tc_out.to_frames(), tc_in.rate)
    }

    /// Number of frames, inclusive of both endpoints
    pub fn duration(&self) -> i64 {
        self.end - self.start + 1
    }

    pub fn to_timecodes(&self) -> (Timecode, Timecode) {
        (
            Timecode::from_frames(self.start.max(0) as u64, self.rate),
            Timecode::from_frames(self.end.max(0) as u64, self.rate),
        )
    }

    pub fn contains(&self, frame: i64) -> bool {
        self.start <= frame && frame <= self.end
    }

    pub fn overlaps(&self, other: &FrameRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }
}

impl fmt::Display for FrameRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{} ({} frames @ {}fps)",
            self.start,
            self.end,
            self.duration(),
            self.rate
        )
    }
}

// ============================================================================
// Role display surface
// ============================================================================

/// The display surface of a registered role.
///
/// What one workstation calls `L01` and another pipeline calls `hero` are
/// the same role — the aliases map holds the per-endpoint spellings, and
/// the optional path template describes where media for the role lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub label: String,
    #[serde(default)]
    pub order: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_template: Option<String>,
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

impl Role {
    pub fn new(name: impl Into<String>, label: Option<String>) -> Self {
        let name = name.into();
        let label = label.unwrap_or_else(|| title_case(&name));
        Self {
            name,
            label,
            order: 0,
            path_template: None,
            aliases: BTreeMap::new(),
        }
    }

    /// The name this role is known by in a specific endpoint
    pub fn alias(&self, endpoint: &str) -> &str {
        self.aliases.get(endpoint).map_or(&self.name, String::as_str)
    }

    /// Resolve the path template with the given token values.
    ///
    /// Returns `None` when the role carries no template. Unknown tokens in
    /// the template are an error; extra tokens in the map are ignored.
    pub fn resolve_path(
        &self,
        tokens: &BTreeMap<String, String>,
    ) -> Result<Option<String>, VocabularyError> {
        let Some(template) = self.path_template.as_deref() else {
            return Ok(None);
        };
        let mut out = String::with_capacity(template.len());
        let mut chars = template.chars();
        while let Some(c) = chars.next() {
            if c != '{' {
                out.push(c);
                continue;
            }
            let mut token = String::new();
            for t in chars.by_ref() {
                if t == '}' {
                    break;
                }
                token.push(t);
            }
            match tokens.get(&token) {
                Some(value) => out.push_str(value),
                None => {
                    return Err(VocabularyError::MissingToken {
                        token,
                        template: template.to_string(),
                    })
                }
            }
        }
        Ok(Some(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_aliases() {
        assert_eq!(Status::parse("wip").unwrap(), Status::InProgress);
        assert_eq!(Status::parse("work_in_progress").unwrap(), Status::InProgress);
        assert_eq!(Status::parse("final").unwrap(), Status::Delivered);
        assert_eq!(Status::parse("omit").unwrap(), Status::Archived);
        assert_eq!(Status::parse("Pending_Review").unwrap(), Status::Review);
        assert!(Status::parse("shipped").is_err());
    }

    #[test]
    fn test_status_wire_form() {
        let encoded = serde_json::to_string(&Status::InProgress).unwrap();
        assert_eq!(encoded, "\"in_progress\"");
    }

    #[test]
    fn test_frame_rate_parsing() {
        assert_eq!("24".parse::<FrameRate>().unwrap(), FrameRate::FILM);
        assert_eq!("30000/1001".parse::<FrameRate>().unwrap(), FrameRate::NTSC);
        assert_eq!("29.97".parse::<FrameRate>().unwrap(), FrameRate::NTSC);
        assert_eq!("23.976".parse::<FrameRate>().unwrap(), FrameRate::NTSC_FILM);
        assert!("zero".parse::<FrameRate>().is_err());
        assert!("24/0".parse::<FrameRate>().is_err());
    }

    #[test]
    fn test_frame_rate_reduction() {
        let reduced = FrameRate::new(60000, 2002).unwrap();
        assert_eq!(reduced, FrameRate::NTSC);
        assert_eq!(reduced.to_string(), "30000/1001");
    }

    #[test]
    fn test_frame_rate_nominal() {
        assert_eq!(FrameRate::FILM.nominal(), 24);
        assert_eq!(FrameRate::NTSC.nominal(), 30);
        assert_eq!(FrameRate::NTSC_FILM.nominal(), 24);
        assert_eq!(FrameRate::HIGH.nominal(), 60);
    }

    #[test]
    fn test_timecode_roundtrip_at_common_rates() {
        for rate in [
            FrameRate::FILM,
            FrameRate::PAL,
            FrameRate::NTSC,
            FrameRate::HIGH,
        ] {
            for frame in [0u64, 1, 23, 999, 86_399, 123_456] {
                let tc = Timecode::from_frames(frame, rate);
                assert_eq!(
                    tc.to_frames(),
                    frame as i64,
                    "frame round-trip failed at {} for frame {}",
                    rate,
                    frame
                );
                let reparsed = Timecode::parse(&tc.to_string(), rate).unwrap();
                assert_eq!(reparsed, tc, "string round-trip failed at {}", rate);
            }
        }
    }

    #[test]
    fn test_timecode_parse() {
        let tc = Timecode::parse("01:02:03:12", FrameRate::FILM).unwrap();
        assert_eq!((tc.hours, tc.minutes, tc.seconds, tc.frames), (1, 2, 3, 12));
        assert!(!tc.drop_frame);
        assert_eq!(tc.to_frames(), (3600 + 120 + 3) * 24 + 12);
    }

    #[test]
    fn test_timecode_drop_frame_marker() {
        let tc = Timecode::parse("00:01:00;02", FrameRate::NTSC).unwrap();
        assert!(tc.drop_frame);
        assert_eq!(tc.to_string(), "00:01:00;02");
    }

    #[test]
    fn test_timecode_rejects_garbage() {
        assert!(Timecode::parse("1:2:3:4", FrameRate::FILM).is_err());
        assert!(Timecode::parse("nonsense", FrameRate::FILM).is_err());
    }

    #[test]
    fn test_frame_range_duration_is_inclusive() {
        let range = FrameRange::new(1001, 1100, FrameRate::FILM).unwrap();
        assert_eq!(range.duration(), 100);
        assert!(range.contains(1001));
        assert!(range.contains(1100));
        assert!(!range.contains(1101));
    }

    #[test]
    fn test_frame_range_rejects_inverted() {
        assert!(FrameRange::new(100, 99, FrameRate::FILM).is_err());
    }

    #[test]
    fn test_frame_range_from_timecodes_requires_matching_rates() {
        let tc_in = Timecode::from_frames(0, FrameRate::FILM);
        let tc_out = Timecode::from_frames(100, FrameRate::PAL);
        assert!(FrameRange::from_timecodes(tc_in, tc_out).is_err());

        let tc_out = Timecode::from_frames(100, FrameRate::FILM);
        let range = FrameRange::from_timecodes(tc_in, tc_out).unwrap();
        assert_eq!(range.duration(), 101);
    }

    #[test]
    fn test_frame_range_to_timecodes() {
        let range = FrameRange::new(24, 48, FrameRate::FILM).unwrap();
        let (tc_in, tc_out) = range.to_timecodes();
        assert_eq!(tc_in.to_string(), "00:00:01:00");
        assert_eq!(tc_out.to_string(), "00:00:02:00");
        assert_eq!(
            FrameRange::from_timecodes(tc_in, tc_out).unwrap(),
            range
        );
    }

    #[test]
    fn test_frame_range_overlap() {
        let a = FrameRange::new(10, 20, FrameRate::FILM).unwrap();
        let b = FrameRange::new(20, 30, FrameRate::FILM).unwrap();
        let c = FrameRange::new(21, 30, FrameRate::FILM).unwrap();
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn test_role_path_template() {
        let mut role = Role::new("primary", None);
        role.path_template = Some("{project}/{shot}/plates/v{version}".to_string());
        let mut tokens = BTreeMap::new();
        tokens.insert("project".to_string(), "EP60".to_string());
        tokens.insert("shot".to_string(), "EP60_010".to_string());
        tokens.insert("version".to_string(), "0004".to_string());
        assert_eq!(
            role.resolve_path(&tokens).unwrap().unwrap(),
            "EP60/EP60_010/plates/v0004"
        );

        tokens.remove("version");
        assert!(matches!(
            role.resolve_path(&tokens),
            Err(VocabularyError::MissingToken { token, .. }) if token == "version"
        ));
    }

    #[test]
    fn test_role_alias_fallback() {
        let mut role = Role::new("primary", None);
        role.aliases.insert("flame".to_string(), "L01".to_string());
        assert_eq!(role.alias("flame"), "L01");
        assert_eq!(role.alias("maya"), "primary");
    }

    #[test]
    fn test_auto_label_title_case() {
        let role = Role::new("color_grade", None);
        assert_eq!(role.label, "Color Grade");
    }
}
