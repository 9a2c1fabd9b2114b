//! Cross-cutting entity capabilities.
//!
//! Rather than baking locations or graph edges into each entity type, the
//! behaviors live here once as traits. An entity that carries the trait
//! gets the behavior through the provided methods; the structs only supply
//! storage access.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::registry::RelationshipTypeRegistry;

// ============================================================================
// Location
// ============================================================================

/// Where a location's path lives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Local,
    Network,
    Cloud,
    Archive,
    Clip,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Network => "network",
            Self::Cloud => "cloud",
            Self::Archive => "archive",
            Self::Clip => "clip",
        }
    }
}

/// A path-based address for a locatable entity.
///
/// One entity may carry several locations — a local cache, a network share,
/// and a cloud bucket all pointing at the same media. `exists` caches the
/// last filesystem probe; `None` means never checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub path: String,
    #[serde(default)]
    pub storage_type: StorageType,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub exists: Option<bool>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Location {
    pub fn new(path: impl Into<String>, storage_type: StorageType, priority: i32) -> Self {
        Self {
            path: path.into(),
            storage_type,
            priority,
            exists: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Probe the filesystem and refresh the existence cache
    pub fn probe(&mut self) -> bool {
        let found = Path::new(&self.path).exists();
        self.exists = Some(found);
        found
    }
}

// ============================================================================
// Relationship
// ============================================================================

/// A directed edge between two entities.
///
/// Edges are value tuples of UUIDs — no pointers, no cycles in memory.
/// `rel_type_key` resolves through the relationship-type registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub rel_type_key: Uuid,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Relationship {
    pub fn new(source_id: Uuid, target_id: Uuid, rel_type_key: Uuid) -> Self {
        Self {
            source_id,
            target_id,
            rel_type_key,
            attributes: serde_json::Map::new(),
            created_at: Utc::now(),
        }
    }

    /// The uniqueness triple for this edge
    pub fn triple(&self) -> (Uuid, Uuid, Uuid) {
        (self.source_id, self.target_id, self.rel_type_key)
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Marker for entities that exist as a series of discrete iterations
pub trait Versionable {}

/// An entity with one or more path-based addresses
pub trait Locatable {
    fn locations(&self) -> &[Location];
    fn locations_mut(&mut self) -> &mut Vec<Location>;

    /// Register a new location, keeping the list ordered by priority
    fn add_location(&mut self, location: Location) {
        let list = self.locations_mut();
        list.push(location);
        list.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// The highest-priority location, if any are registered
    fn primary_location(&self) -> Option<&Location> {
        self.locations().first()
    }

    /// Probe every location and refresh the existence caches
    fn refresh_locations(&mut self) {
        for location in self.locations_mut() {
            location.probe();
        }
    }

    /// The best available path given current filesystem state.
    ///
    /// Walks locations in priority order and returns the first path that
    /// exists on disk. Falls back to the highest-priority path when nothing
    /// is confirmed — the media may be offline or archived.
    fn resolve_path(&self) -> Option<String> {
        for location in self.locations() {
            if Path::new(&location.path).exists() {
                return Some(location.path.clone());
            }
        }
        self.primary_location().map(|loc| loc.path.clone())
    }
}

/// An entity that declares and traverses directed relationships
pub trait Relational {
    fn entity_id(&self) -> Uuid;
    fn relationships(&self) -> &[Relationship];
    fn relationships_mut(&mut self) -> &mut Vec<Relationship>;

    /// Declare an edge from this entity and record the usage in the registry
    fn add_relationship(
        &mut self,
        target_id: Uuid,
        rel_type_key: Uuid,
        registry: &mut RelationshipTypeRegistry,
    ) {
        let source_id = self.entity_id();
        registry.register_usage(rel_type_key, (source_id, target_id));
        self.relationships_mut()
            .push(Relationship::new(source_id, target_id, rel_type_key));
    }

    /// Drop an edge and release the registry usage. Returns whether an edge
    /// was removed.
    fn remove_relationship(
        &mut self,
        target_id: Uuid,
        rel_type_key: Uuid,
        registry: &mut RelationshipTypeRegistry,
    ) -> bool {
        let source_id = self.entity_id();
        let list = self.relationships_mut();
        let before = list.len();
        list.retain(|rel| !(rel.target_id == target_id && rel.rel_type_key == rel_type_key));
        let removed = list.len() < before;
        if removed {
            registry.unregister_usage(rel_type_key, (source_id, target_id));
        }
        removed
    }

    /// Edges of one kind, by registry key
    fn relationships_of(&self, rel_type_key: Uuid) -> Vec<&Relationship> {
        self.relationships()
            .iter()
            .filter(|rel| rel.rel_type_key == rel_type_key)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct Probe {
        id: Uuid,
        locations: Vec<Location>,
        relationships: Vec<Relationship>,
    }

    impl Probe {
        fn new() -> Self {
            Self {
                id: Uuid::new_v4(),
                locations: Vec::new(),
                relationships: Vec::new(),
            }
        }
    }

    impl Locatable for Probe {
        fn locations(&self) -> &[Location] {
            &self.locations
        }
        fn locations_mut(&mut self) -> &mut Vec<Location> {
            &mut self.locations
        }
    }

    impl Relational for Probe {
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

    #[test]
    fn test_locations_ordered_by_priority() {
        let mut probe = Probe::new();
        probe.add_location(Location::new("/low", StorageType::Archive, 0));
        probe.add_location(Location::new("/high", StorageType::Local, 10));
        probe.add_location(Location::new("/mid", StorageType::Network, 5));
        assert_eq!(probe.primary_location().unwrap().path, "/high");
        let paths: Vec<_> = probe.locations().iter().map(|l| l.path.as_str()).collect();
        assert_eq!(paths, ["/high", "/mid", "/low"]);
    }

    #[test]
    fn test_resolve_path_prefers_existing() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"plate").unwrap();
        let real = file.path().to_string_lossy().to_string();

        let mut probe = Probe::new();
        probe.add_location(Location::new("/does/not/exist", StorageType::Network, 10));
        probe.add_location(Location::new(&real, StorageType::Local, 0));
        assert_eq!(probe.resolve_path().unwrap(), real);
    }

    #[test]
    fn test_resolve_path_falls_back_to_primary() {
        let mut probe = Probe::new();
        probe.add_location(Location::new("/offline/a", StorageType::Archive, 1));
        probe.add_location(Location::new("/offline/b", StorageType::Archive, 9));
        assert_eq!(probe.resolve_path().unwrap(), "/offline/b");
    }

    #[test]
    fn test_resolve_path_empty() {
        let probe = Probe::new();
        assert!(probe.resolve_path().is_none());
    }

    #[test]
    fn test_relationship_usage_tracking() {
        let mut registry = RelationshipTypeRegistry::with_system_types();
        let member_of = registry.key_of("member_of").unwrap();
        let target = Uuid::new_v4();

        let mut probe = Probe::new();
        probe.add_relationship(target, member_of, &mut registry);
        assert_eq!(registry.ref_count("member_of").unwrap(), 1);
        assert_eq!(probe.relationships_of(member_of).len(), 1);

        assert!(probe.remove_relationship(target, member_of, &mut registry));
        assert_eq!(registry.ref_count("member_of").unwrap(), 0);
        assert!(!probe.remove_relationship(target, member_of, &mut registry));
    }

    #[test]
    fn test_location_probe_updates_cache() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut loc = Location::new(file.path().to_string_lossy(), StorageType::Local, 0);
        assert_eq!(loc.exists, None);
        assert!(loc.probe());
        assert_eq!(loc.exists, Some(true));
    }
}
