//! The canonical entities of the bridge vocabulary.
//!
//! Entity hierarchy:
//!
//! ```text
//! Project
//! └── Sequence
//!     └── Shot
//!         ├── Version
//!         │   └── Media
//!         └── Stack
//!             └── Layer (carries a Role, references a Version)
//! ```
//!
//! Asset is a parallel track — not a Shot, but used in shots. Entities
//! cross-reference each other by UUID only; traversal goes through the
//! repository layer or the registry's reference index, never through
//! pointers.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::core::registry::{keys, Registry};
use crate::core::traits::{Locatable, Location, Relational, Relationship, Versionable};
use crate::core::vocabulary::{FrameRange, FrameRate, Status, Timecode, VocabularyError};
use crate::protocol::JsonMap;

/// The closed set of non-project entity types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Sequence,
    Shot,
    Asset,
    Version,
    Media,
    Layer,
    Stack,
}

impl EntityType {
    pub const ALL: [EntityType; 7] = [
        Self::Sequence,
        Self::Shot,
        Self::Asset,
        Self::Version,
        Self::Media,
        Self::Layer,
        Self::Stack,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequence => "sequence",
            Self::Shot => "shot",
            Self::Asset => "asset",
            Self::Version => "version",
            Self::Media => "media",
            Self::Layer => "layer",
            Self::Stack => "stack",
        }
    }

    pub fn parse(value: &str) -> Result<Self, VocabularyError> {
        match value {
            "sequence" => Ok(Self::Sequence),
            "shot" => Ok(Self::Shot),
            "asset" => Ok(Self::Asset),
            "version" => Ok(Self::Version),
            "media" => Ok(Self::Media),
            "layer" => Ok(Self::Layer),
            "stack" => Ok(Self::Stack),
            other => Err(VocabularyError::UnknownEntityType(other.to_string())),
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Project
// ============================================================================

/// Top-level container. Everything in the bridge lives inside a project.
#[derive(Debug, Clone)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub code: String,
    pub metadata: JsonMap,
    pub locations: Vec<Location>,
    pub relationships: Vec<Relationship>,
}

impl Project {
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            code: code.into(),
            metadata: JsonMap::new(),
            locations: Vec::new(),
            relationships: Vec::new(),
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "code": self.code,
            "attributes": self.metadata,
        })
    }
}

impl Versionable for Project {}

// ============================================================================
// Entity structs
// ============================================================================

/// An ordered collection of shots: a reel, episode, scene, or cut
#[derive(Debug, Clone)]
pub struct Sequence {
    pub id: Uuid,
    pub name: Option<String>,
    pub project_id: Option<Uuid>,
    pub frame_rate: FrameRate,
    pub duration: Option<Timecode>,
    pub metadata: JsonMap,
    pub locations: Vec<Location>,
    pub relationships: Vec<Relationship>,
}

impl Sequence {
    pub fn new(name: Option<String>, project_id: Option<Uuid>, frame_rate: FrameRate) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            project_id,
            frame_rate,
            duration: None,
            metadata: JsonMap::new(),
            locations: Vec::new(),
            relationships: Vec::new(),
        }
    }
}

impl Versionable for Sequence {}

/// One shot within a sequence
#[derive(Debug, Clone)]
pub struct Shot {
    pub id: Uuid,
    pub name: Option<String>,
    pub sequence_id: Option<Uuid>,
    pub cut_in: Option<Timecode>,
    pub cut_out: Option<Timecode>,
    pub status: Status,
    pub metadata: JsonMap,
    pub locations: Vec<Location>,
    pub relationships: Vec<Relationship>,
}

impl Shot {
    pub fn new(name: Option<String>, sequence_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            sequence_id,
            cut_in: None,
            cut_out: None,
            status: Status::Pending,
            metadata: JsonMap::new(),
            locations: Vec::new(),
            relationships: Vec::new(),
        }
    }

    /// Cut length in frames, when both cut points are known
    pub fn duration(&self) -> Option<i64> {
        match (self.cut_in, self.cut_out) {
            (Some(tc_in), Some(tc_out)) => Some(tc_out.to_frames() - tc_in.to_frames() + 1),
            _ => None,
        }
    }
}

impl Versionable for Shot {}

/// A reusable element belonging to a project
#[derive(Debug, Clone)]
pub struct Asset {
    pub id: Uuid,
    pub name: Option<String>,
    pub project_id: Option<Uuid>,
    pub asset_type: String,
    pub status: Status,
    pub metadata: JsonMap,
    pub locations: Vec<Location>,
    pub relationships: Vec<Relationship>,
}

impl Asset {
    pub fn new(name: Option<String>, project_id: Option<Uuid>, asset_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            project_id,
            asset_type: asset_type.into(),
            status: Status::Pending,
            metadata: JsonMap::new(),
            locations: Vec::new(),
            relationships: Vec::new(),
        }
    }
}

impl Versionable for Asset {}

/// An immutable iteration of a shot or asset.
///
/// Versions are never updated after creation — a new iteration is a new
/// Version entity.
#[derive(Debug, Clone)]
pub struct Version {
    pub id: Uuid,
    pub version_number: i32,
    pub parent_id: Option<Uuid>,
    pub parent_type: String,
    pub status: Status,
    pub created_by: Option<String>,
    pub metadata: JsonMap,
    pub locations: Vec<Location>,
    pub relationships: Vec<Relationship>,
}

impl Version {
    pub fn new(version_number: i32, parent_id: Option<Uuid>, parent_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            version_number,
            parent_id,
            parent_type: parent_type.into(),
            status: Status::Pending,
            created_by: None,
            metadata: JsonMap::new(),
            locations: Vec::new(),
            relationships: Vec::new(),
        }
    }
}

/// An atomic content unit: a plate, render, or clip
#[derive(Debug, Clone)]
pub struct Media {
    pub id: Uuid,
    pub name: Option<String>,
    pub format: String,
    pub resolution: Option<String>,
    pub frame_range: Option<FrameRange>,
    pub colorspace: Option<String>,
    pub bit_depth: Option<i32>,
    pub version_id: Option<Uuid>,
    pub status: Status,
    pub metadata: JsonMap,
    pub locations: Vec<Location>,
    pub relationships: Vec<Relationship>,
}

impl Media {
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: None,
            format: format.into(),
            resolution: None,
            frame_range: None,
            colorspace: None,
            bit_depth: None,
            version_id: None,
            status: Status::Pending,
            metadata: JsonMap::new(),
            locations: Vec::new(),
            relationships: Vec::new(),
        }
    }
}

impl Versionable for Media {}

/// A member of a stack carrying one role.
///
/// `role_key` is the stable registry key — never a name. Lookup to a name
/// always goes through the registry, so renames never touch layers.
#[derive(Debug, Clone)]
pub struct Layer {
    pub id: Uuid,
    pub role_key: Uuid,
    pub order: i32,
    pub stack_id: Option<Uuid>,
    pub version_id: Option<Uuid>,
    pub metadata: JsonMap,
    pub locations: Vec<Location>,
    pub relationships: Vec<Relationship>,
}

impl Layer {
    pub fn new(role_key: Uuid, order: i32, stack_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role_key,
            order,
            stack_id,
            version_id: None,
            metadata: JsonMap::new(),
            locations: Vec::new(),
            relationships: Vec::new(),
        }
    }

    /// Resolve the current display name of this layer's role
    pub fn role_name<'r>(&self, registry: &'r Registry) -> Option<&'r str> {
        registry
            .roles
            .get_by_key(self.role_key)
            .ok()
            .map(|d| d.name.as_str())
    }
}

/// A group of peer layers belonging to one shot
#[derive(Debug, Clone)]
pub struct Stack {
    pub id: Uuid,
    pub shot_id: Option<Uuid>,
    /// In-memory convenience only — the attribute search is authoritative
    pub layer_ids: Vec<Uuid>,
    pub metadata: JsonMap,
    pub locations: Vec<Location>,
    pub relationships: Vec<Relationship>,
}

impl Stack {
    pub fn new(shot_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            shot_id,
            layer_ids: Vec::new(),
            metadata: JsonMap::new(),
            locations: Vec::new(),
            relationships: Vec::new(),
        }
    }

    /// Track a layer in the in-memory convenience list
    pub fn add_layer(&mut self, layer_id: Uuid) {
        if !self.layer_ids.contains(&layer_id) {
            self.layer_ids.push(layer_id);
        }
    }

    pub fn depth(&self) -> usize {
        self.layer_ids.len()
    }
}

macro_rules! impl_entity_traits {
    ($($ty:ty),+ $(,)?) => {$(
        impl Locatable for $ty {
            fn locations(&self) -> &[Location] {
                &self.locations
            }
            fn locations_mut(&mut self) -> &mut Vec<Location> {
                &mut self.locations
            }
        }

        impl Relational for $ty {
            fn entity_id(&self) -> Uuid {
                self.id
            }
            fn relationships(&self) -> &[Relationship] {
                &self.relationships
            }
            fn relationships_mut(&mut self) -> &mut Vec<Relationship> {
                &mut self.relationships
            }
        }
    )+};
}

impl_entity_traits!(Project, Sequence, Shot, Asset, Version, Media, Layer, Stack);

// ============================================================================
// Entity — the polymorphic collection
// ============================================================================

/// Any non-project entity, discriminated by type
#[derive(Debug, Clone)]
pub enum Entity {
    Sequence(Sequence),
    Shot(Shot),
    Asset(Asset),
    Version(Version),
    Media(Media),
    Layer(Layer),
    Stack(Stack),
}

fn get_str<'a>(attrs: &'a JsonMap, key: &str) -> Option<&'a str> {
    attrs.get(key).and_then(Value::as_str)
}

fn get_uuid(attrs: &JsonMap, key: &str) -> Option<Uuid> {
    get_str(attrs, key).and_then(|s| Uuid::parse_str(s).ok())
}

fn get_i64(attrs: &JsonMap, key: &str) -> Option<i64> {
    attrs.get(key).and_then(Value::as_i64)
}

fn insert_uuid(attrs: &mut JsonMap, key: &str, value: Option<Uuid>) {
    if let Some(v) = value {
        attrs.insert(key.to_string(), json!(v.to_string()));
    }
}

impl Entity {
    pub fn id(&self) -> Uuid {
        match self {
            Self::Sequence(e) => e.id,
            Self::Shot(e) => e.id,
            Self::Asset(e) => e.id,
            Self::Version(e) => e.id,
            Self::Media(e) => e.id,
            Self::Layer(e) => e.id,
            Self::Stack(e) => e.id,
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::Sequence(_) => EntityType::Sequence,
            Self::Shot(_) => EntityType::Shot,
            Self::Asset(_) => EntityType::Asset,
            Self::Version(_) => EntityType::Version,
            Self::Media(_) => EntityType::Media,
            Self::Layer(_) => EntityType::Layer,
            Self::Stack(_) => EntityType::Stack,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Sequence(e) => e.name.as_deref(),
            Self::Shot(e) => e.name.as_deref(),
            Self::Asset(e) => e.name.as_deref(),
            Self::Media(e) => e.name.as_deref(),
            Self::Version(_) | Self::Layer(_) | Self::Stack(_) => None,
        }
    }

    /// Set the display name, for the types that carry one
    pub fn set_name(&mut self, name: Option<String>) -> bool {
        match self {
            Self::Sequence(e) => e.name = name,
            Self::Shot(e) => e.name = name,
            Self::Asset(e) => e.name = name,
            Self::Media(e) => e.name = name,
            Self::Version(_) | Self::Layer(_) | Self::Stack(_) => return false,
        }
        true
    }

    pub fn status(&self) -> Option<Status> {
        match self {
            Self::Shot(e) => Some(e.status),
            Self::Asset(e) => Some(e.status),
            Self::Version(e) => Some(e.status),
            Self::Media(e) => Some(e.status),
            Self::Sequence(_) | Self::Layer(_) | Self::Stack(_) => None,
        }
    }

    pub fn set_status(&mut self, status: Status) -> bool {
        match self {
            Self::Shot(e) => e.status = status,
            Self::Asset(e) => e.status = status,
            Self::Version(e) => e.status = status,
            Self::Media(e) => e.status = status,
            Self::Sequence(_) | Self::Layer(_) | Self::Stack(_) => return false,
        }
        true
    }

    pub fn locations(&self) -> &[Location] {
        match self {
            Self::Sequence(e) => &e.locations,
            Self::Shot(e) => &e.locations,
            Self::Asset(e) => &e.locations,
            Self::Version(e) => &e.locations,
            Self::Media(e) => &e.locations,
            Self::Layer(e) => &e.locations,
            Self::Stack(e) => &e.locations,
        }
    }

    pub fn locations_mut(&mut self) -> &mut Vec<Location> {
        match self {
            Self::Sequence(e) => &mut e.locations,
            Self::Shot(e) => &mut e.locations,
            Self::Asset(e) => &mut e.locations,
            Self::Version(e) => &mut e.locations,
            Self::Media(e) => &mut e.locations,
            Self::Layer(e) => &mut e.locations,
            Self::Stack(e) => &mut e.locations,
        }
    }

    /// The layer's role usage, for registry ref counting
    pub fn role_usage(&self) -> Option<(Uuid, Uuid)> {
        match self {
            Self::Layer(layer) => Some((layer.role_key, layer.id)),
            _ => None,
        }
    }

    /// Edges implied by the natural structure of the entity.
    ///
    /// Containment and lineage come in with the data itself — a shot knows
    /// its sequence, a layer knows its stack — so the graph edges are
    /// derived here rather than declared by the caller.
    pub fn structural_edges(&self) -> Vec<(Uuid, Uuid, Uuid)> {
        let mut edges = Vec::new();
        match self {
            Self::Shot(shot) => {
                if let Some(seq) = shot.sequence_id {
                    edges.push((shot.id, seq, keys::REL_MEMBER_OF));
                }
            }
            Self::Stack(stack) => {
                if let Some(shot) = stack.shot_id {
                    edges.push((stack.id, shot, keys::REL_MEMBER_OF));
                }
            }
            Self::Layer(layer) => {
                if let Some(stack) = layer.stack_id {
                    edges.push((layer.id, stack, keys::REL_MEMBER_OF));
                }
                if let Some(version) = layer.version_id {
                    edges.push((layer.id, version, keys::REL_REFERENCES));
                }
            }
            Self::Version(version) => {
                if let Some(parent) = version.parent_id {
                    edges.push((version.id, parent, keys::REL_VERSION_OF));
                }
            }
            Self::Media(media) => {
                if let Some(version) = media.version_id {
                    edges.push((version, media.id, keys::REL_PRODUCES));
                }
            }
            Self::Sequence(_) | Self::Asset(_) => {}
        }
        edges
    }

    // ── Attribute projection ────────────────────────────────────────────

    /// Type-specific fields flattened for JSONB storage.
    ///
    /// Open metadata goes in first so the typed fields win on collision;
    /// arbitrary pipeline attributes survive the round-trip without schema
    /// changes.
    pub fn attributes_json(&self) -> JsonMap {
        match self {
            Self::Sequence(e) => {
                let mut a = e.metadata.clone();
                a.insert("frame_rate".to_string(), json!(e.frame_rate.to_string()));
                if let Some(duration) = e.duration {
                    a.insert("duration_tc".to_string(), json!(duration.to_string()));
                }
                a
            }
            Self::Shot(e) => {
                let mut a = e.metadata.clone();
                if let Some(tc) = e.cut_in {
                    a.insert("cut_in".to_string(), json!(tc.to_string()));
                }
                if let Some(tc) = e.cut_out {
                    a.insert("cut_out".to_string(), json!(tc.to_string()));
                }
                insert_uuid(&mut a, "sequence_id", e.sequence_id);
                a
            }
            Self::Asset(e) => {
                let mut a = e.metadata.clone();
                a.insert("asset_type".to_string(), json!(e.asset_type));
                a
            }
            Self::Version(e) => {
                let mut a = e.metadata.clone();
                a.insert("version_number".to_string(), json!(e.version_number));
                insert_uuid(&mut a, "parent_id", e.parent_id);
                a.insert("parent_type".to_string(), json!(e.parent_type));
                if let Some(by) = &e.created_by {
                    a.insert("created_by".to_string(), json!(by));
                }
                a
            }
            Self::Media(e) => {
                let mut a = e.metadata.clone();
                a.insert("format".to_string(), json!(e.format));
                if let Some(res) = &e.resolution {
                    a.insert("resolution".to_string(), json!(res));
                }
                if let Some(cs) = &e.colorspace {
                    a.insert("colorspace".to_string(), json!(cs));
                }
                if let Some(depth) = e.bit_depth {
                    a.insert("bit_depth".to_string(), json!(depth));
                }
                insert_uuid(&mut a, "version_id", e.version_id);
                if let Some(range) = &e.frame_range {
                    a.insert(
                        "frame_range".to_string(),
                        serde_json::to_value(range).unwrap_or(Value::Null),
                    );
                }
                a
            }
            Self::Layer(e) => {
                let mut a = e.metadata.clone();
                a.insert("role_key".to_string(), json!(e.role_key.to_string()));
                a.insert("order".to_string(), json!(e.order));
                insert_uuid(&mut a, "stack_id", e.stack_id);
                insert_uuid(&mut a, "version_id", e.version_id);
                a
            }
            Self::Stack(e) => {
                let mut a = e.metadata.clone();
                insert_uuid(&mut a, "shot_id", e.shot_id);
                a
            }
        }
    }

    /// Rebuild an entity from its persisted parts
    pub fn from_parts(
        entity_type: EntityType,
        id: Uuid,
        name: Option<String>,
        status: Option<&str>,
        project_id: Option<Uuid>,
        attributes: &JsonMap,
    ) -> Result<Self, VocabularyError> {
        let status = status
            .map(Status::parse)
            .transpose()?
            .unwrap_or(Status::Pending);

        let entity = match entity_type {
            EntityType::Sequence => {
                let frame_rate = get_str(attributes, "frame_rate")
                    .map(|raw| raw.parse::<FrameRate>())
                    .transpose()?
                    .unwrap_or_default();
                let mut seq = Sequence::new(name, project_id, frame_rate);
                seq.id = id;
                seq.duration = get_str(attributes, "duration_tc")
                    .map(|s| Timecode::parse(s, frame_rate))
                    .transpose()?;
                Self::Sequence(seq)
            }
            EntityType::Shot => {
                let mut shot = Shot::new(name, get_uuid(attributes, "sequence_id"));
                shot.id = id;
                shot.status = status;
                shot.cut_in = get_str(attributes, "cut_in")
                    .map(|s| Timecode::parse(s, FrameRate::default()))
                    .transpose()?;
                shot.cut_out = get_str(attributes, "cut_out")
                    .map(|s| Timecode::parse(s, FrameRate::default()))
                    .transpose()?;
                Self::Shot(shot)
            }
            EntityType::Asset => {
                let asset_type = get_str(attributes, "asset_type").unwrap_or("generic");
                let mut asset = Asset::new(name, project_id, asset_type);
                asset.id = id;
                asset.status = status;
                Self::Asset(asset)
            }
            EntityType::Version => {
                let number = get_i64(attributes, "version_number").unwrap_or(1) as i32;
                let parent_type = get_str(attributes, "parent_type").unwrap_or("shot");
                let mut version =
                    Version::new(number, get_uuid(attributes, "parent_id"), parent_type);
                version.id = id;
                version.status = status;
                version.created_by = get_str(attributes, "created_by").map(str::to_string);
                Self::Version(version)
            }
            EntityType::Media => {
                let format = get_str(attributes, "format").unwrap_or("unknown");
                let mut media = Media::new(format);
                media.id = id;
                media.name = name;
                media.status = status;
                media.resolution = get_str(attributes, "resolution").map(str::to_string);
                media.colorspace = get_str(attributes, "colorspace").map(str::to_string);
                media.bit_depth = get_i64(attributes, "bit_depth").map(|d| d as i32);
                media.version_id = get_uuid(attributes, "version_id");
                media.frame_range = attributes
                    .get("frame_range")
                    .and_then(|v| serde_json::from_value(v.clone()).ok());
                Self::Media(media)
            }
            EntityType::Layer => {
                let role_key = get_uuid(attributes, "role_key").ok_or_else(|| {
                    VocabularyError::MissingAttribute {
                        entity_type: "layer".to_string(),
                        attribute: "role_key".to_string(),
                    }
                })?;
                let order = get_i64(attributes, "order").unwrap_or(0) as i32;
                let mut layer = Layer::new(role_key, order, get_uuid(attributes, "stack_id"));
                layer.id = id;
                layer.version_id = get_uuid(attributes, "version_id");
                Self::Layer(layer)
            }
            EntityType::Stack => {
                let mut stack = Stack::new(get_uuid(attributes, "shot_id"));
                stack.id = id;
                Self::Stack(stack)
            }
        };
        Ok(entity)
    }

    /// Merge an attribute map onto the typed fields.
    ///
    /// Known keys update their typed counterparts; unknown keys land in the
    /// open metadata store.
    pub fn apply_attributes(&mut self, attrs: &JsonMap) -> Result<(), VocabularyError> {
        for (key, value) in attrs {
            let consumed = match self {
                Self::Sequence(e) => match key.as_str() {
                    "frame_rate" => {
                        if let Some(raw) = value.as_str() {
                            e.frame_rate = raw.parse()?;
                        }
                        true
                    }
                    "duration_tc" => {
                        e.duration = value
                            .as_str()
                            .map(|s| Timecode::parse(s, e.frame_rate))
                            .transpose()?;
                        true
                    }
                    _ => false,
                },
                Self::Shot(e) => match key.as_str() {
                    "cut_in" => {
                        e.cut_in = value
                            .as_str()
                            .map(|s| Timecode::parse(s, FrameRate::default()))
                            .transpose()?;
                        true
                    }
                    "cut_out" => {
                        e.cut_out = value
                            .as_str()
                            .map(|s| Timecode::parse(s, FrameRate::default()))
                            .transpose()?;
                        true
                    }
                    "sequence_id" => {
                        e.sequence_id = value.as_str().and_then(|s| Uuid::parse_str(s).ok());
                        true
                    }
                    _ => false,
                },
                Self::Asset(e) => match key.as_str() {
                    "asset_type" => {
                        if let Some(t) = value.as_str() {
                            e.asset_type = t.to_string();
                        }
                        true
                    }
                    _ => false,
                },
                Self::Version(_) => false,
                Self::Media(e) => match key.as_str() {
                    "format" => {
                        if let Some(f) = value.as_str() {
                            e.format = f.to_string();
                        }
                        true
                    }
                    "resolution" => {
                        e.resolution = value.as_str().map(str::to_string);
                        true
                    }
                    "colorspace" => {
                        e.colorspace = value.as_str().map(str::to_string);
                        true
                    }
                    "bit_depth" => {
                        e.bit_depth = value.as_i64().map(|d| d as i32);
                        true
                    }
                    "frame_range" => {
                        e.frame_range = serde_json::from_value(value.clone()).ok();
                        true
                    }
                    _ => false,
                },
                Self::Layer(e) => match key.as_str() {
                    "order" => {
                        if let Some(order) = value.as_i64() {
                            e.order = order as i32;
                        }
                        true
                    }
                    "version_id" => {
                        e.version_id = value.as_str().and_then(|s| Uuid::parse_str(s).ok());
                        true
                    }
                    _ => false,
                },
                Self::Stack(_) => false,
            };
            if !consumed {
                self.metadata_mut().insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    fn metadata_mut(&mut self) -> &mut JsonMap {
        match self {
            Self::Sequence(e) => &mut e.metadata,
            Self::Shot(e) => &mut e.metadata,
            Self::Asset(e) => &mut e.metadata,
            Self::Version(e) => &mut e.metadata,
            Self::Media(e) => &mut e.metadata,
            Self::Layer(e) => &mut e.metadata,
            Self::Stack(e) => &mut e.metadata,
        }
    }

    /// The full entity dict handed back on `entity.get`
    pub fn to_value(&self) -> Value {
        json!({
            "id": self.id(),
            "entity_type": self.entity_type(),
            "name": self.name(),
            "status": self.status(),
            "attributes": self.attributes_json(),
            "locations": self.locations(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_type_closed_set() {
        for t in EntityType::ALL {
            assert_eq!(EntityType::parse(t.as_str()).unwrap(), t);
        }
        assert!(EntityType::parse("project").is_err());
        assert!(EntityType::parse("clip").is_err());
    }

    #[test]
    fn test_shot_duration() {
        let mut shot = Shot::new(Some("EP60_010".into()), None);
        shot.cut_in = Some(Timecode::from_frames(1001, FrameRate::FILM));
        shot.cut_out = Some(Timecode::from_frames(1100, FrameRate::FILM));
        assert_eq!(shot.duration(), Some(100));
    }

    #[test]
    fn test_attributes_roundtrip_shot() {
        let mut shot = Shot::new(Some("EP60_010".into()), Some(Uuid::new_v4()));
        shot.cut_in = Some(Timecode::from_frames(1001, FrameRate::FILM));
        shot.status = Status::Review;
        let entity = Entity::Shot(shot.clone());

        let attrs = entity.attributes_json();
        let rebuilt = Entity::from_parts(
            EntityType::Shot,
            shot.id,
            shot.name.clone(),
            Some("review"),
            None,
            &attrs,
        )
        .unwrap();
        match rebuilt {
            Entity::Shot(r) => {
                assert_eq!(r.id, shot.id);
                assert_eq!(r.sequence_id, shot.sequence_id);
                assert_eq!(r.cut_in, shot.cut_in);
                assert_eq!(r.status, Status::Review);
            }
            other => panic!("expected shot, got {:?}", other.entity_type()),
        }
    }

    #[test]
    fn test_attributes_roundtrip_layer() {
        let layer = Layer::new(keys::ROLE_MATTE, 2, Some(Uuid::new_v4()));
        let entity = Entity::Layer(layer.clone());
        let attrs = entity.attributes_json();
        assert_eq!(
            attrs.get("role_key").and_then(Value::as_str),
            Some(layer.role_key.to_string().as_str())
        );

        let rebuilt =
            Entity::from_parts(EntityType::Layer, layer.id, None, None, None, &attrs).unwrap();
        match rebuilt {
            Entity::Layer(r) => {
                assert_eq!(r.role_key, keys::ROLE_MATTE);
                assert_eq!(r.order, 2);
                assert_eq!(r.stack_id, layer.stack_id);
            }
            other => panic!("expected layer, got {:?}", other.entity_type()),
        }
    }

    #[test]
    fn test_layer_requires_role_key() {
        let attrs = JsonMap::new();
        assert!(matches!(
            Entity::from_parts(EntityType::Layer, Uuid::new_v4(), None, None, None, &attrs),
            Err(VocabularyError::MissingAttribute { .. })
        ));
    }

    #[test]
    fn test_metadata_survives_projection() {
        let mut media = Media::new("EXR");
        media
            .metadata
            .insert("tape_name".to_string(), json!("A001_C004"));
        let attrs = Entity::Media(media).attributes_json();
        assert_eq!(attrs.get("tape_name"), Some(&json!("A001_C004")));
        // Typed fields win on collision
        assert_eq!(attrs.get("format"), Some(&json!("EXR")));
    }

    #[test]
    fn test_structural_edges_shot() {
        let seq_id = Uuid::new_v4();
        let shot = Shot::new(None, Some(seq_id));
        let shot_id = shot.id;
        let edges = Entity::Shot(shot).structural_edges();
        assert_eq!(edges, vec![(shot_id, seq_id, keys::REL_MEMBER_OF)]);
    }

    #[test]
    fn test_structural_edges_layer() {
        let stack_id = Uuid::new_v4();
        let version_id = Uuid::new_v4();
        let mut layer = Layer::new(keys::ROLE_PRIMARY, 0, Some(stack_id));
        layer.version_id = Some(version_id);
        let layer_id = layer.id;
        let edges = Entity::Layer(layer).structural_edges();
        assert!(edges.contains(&(layer_id, stack_id, keys::REL_MEMBER_OF)));
        assert!(edges.contains(&(layer_id, version_id, keys::REL_REFERENCES)));
    }

    #[test]
    fn test_apply_attributes_updates_typed_fields() {
        let mut entity = Entity::Shot(Shot::new(None, None));
        let mut attrs = JsonMap::new();
        attrs.insert("cut_in".to_string(), json!("00:00:41:17"));
        attrs.insert("client_note".to_string(), json!("approved by ep"));
        entity.apply_attributes(&attrs).unwrap();

        match &entity {
            Entity::Shot(shot) => {
                assert_eq!(shot.cut_in.map(|tc| tc.to_frames()), Some(1001));
                assert_eq!(shot.metadata.get("client_note"), Some(&json!("approved by ep")));
            }
            other => panic!("expected shot, got {:?}", other.entity_type()),
        }
    }

    #[test]
    fn test_apply_attributes_rejects_bad_timecode() {
        let mut entity = Entity::Shot(Shot::new(None, None));
        let mut attrs = JsonMap::new();
        attrs.insert("cut_in".to_string(), json!("garbage"));
        assert!(entity.apply_attributes(&attrs).is_err());
    }

    #[test]
    fn test_name_and_status_surface() {
        let mut entity = Entity::Version(Version::new(3, None, "shot"));
        assert_eq!(entity.name(), None);
        assert!(!entity.set_name(Some("v003".into())));
        assert!(entity.set_status(Status::Approved));
        assert_eq!(entity.status(), Some(Status::Approved));
    }

    #[test]
    fn test_stack_layer_bookkeeping() {
        let mut stack = Stack::new(Some(Uuid::new_v4()));
        let layer = Uuid::new_v4();
        stack.add_layer(layer);
        stack.add_layer(layer);
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn test_role_name_through_registry() {
        let registry = Registry::default();
        let layer = Layer::new(keys::ROLE_PRIMARY, 0, None);
        assert_eq!(layer.role_name(&registry), Some("primary"));
    }
}
