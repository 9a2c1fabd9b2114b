//! The registry: roles and relationship types.
//!
//! The registry is the single source of truth for what names mean. It
//! enforces the rule that no entity is ever orphaned by a deletion:
//!
//!   - Names are mutable display artifacts. Always rename-safe.
//!   - Keys (UUIDs) are permanent. Entities hold keys, never names.
//!   - Deletion is blocked while any entity holds the key, unless the
//!     caller migrates the references to another entry.
//!   - Protected entries can be renamed but never deleted — they are the
//!     structural grammar of the dependency graph.
//!
//! Both registries share one implementation of that contract,
//! [`DefinitionStore`], parameterized over the definition type and the
//! holder identifier (entity UUID for roles, `(source, target)` pair for
//! relationship types).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::core::vocabulary::{title_case, Role, RoleClass};

// ============================================================================
// Errors
// ============================================================================

/// Registry invariant violations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no registry entry named {0:?}")]
    NotFound(String),

    #[error("registry entry {0:?} already exists")]
    AlreadyExists(String),

    #[error(
        "cannot delete {name:?} — {references} holder(s) still reference it; \
         migrate or remove them first"
    )]
    Orphaned { name: String, references: usize },

    #[error("{0:?} is protected and cannot be deleted — protected entries may only be renamed")]
    Protected(String),
}

// ============================================================================
// Definitions
// ============================================================================

/// Directionality of a relationship type's edges
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Directionality {
    #[default]
    #[serde(rename = "→")]
    Forward,
    #[serde(rename = "←")]
    Reverse,
    #[serde(rename = "↔")]
    Bidirectional,
}

impl fmt::Display for Directionality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = match self {
            Self::Forward => "→",
            Self::Reverse => "←",
            Self::Bidirectional => "↔",
        };
        write!(f, "{}", arrow)
    }
}

/// A role with a stable key and a mutable display name.
///
/// Layers hold `key` in their `role_key`; the name can change freely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleDefinition {
    pub key: Uuid,
    pub name: String,
    pub label: String,
    #[serde(default)]
    pub role_class: RoleClass,
    #[serde(default)]
    pub order: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_template: Option<String>,
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    #[serde(default)]
    pub protected: bool,
}

impl RoleDefinition {
    /// The display surface handed to endpoints
    pub fn display(&self) -> Role {
        Role {
            name: self.name.clone(),
            label: self.label.clone(),
            order: self.order,
            path_template: self.path_template.clone(),
            aliases: self.aliases.clone(),
        }
    }

    /// The name this role is known by in a specific endpoint
    pub fn alias(&self, endpoint: &str) -> &str {
        self.aliases.get(endpoint).map_or(&self.name, String::as_str)
    }
}

/// A relationship type with a stable key and a mutable display name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipTypeDef {
    pub key: Uuid,
    pub name: String,
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub directionality: Directionality,
    #[serde(default)]
    pub protected: bool,
}

/// Shared shape of a registry definition, used by [`DefinitionStore`]
pub trait Definition {
    fn key(&self) -> Uuid;
    fn name(&self) -> &str;
    fn set_name(&mut self, name: String);
    fn label(&self) -> &str;
    fn set_label(&mut self, label: String);
    fn is_protected(&self) -> bool;
}

impl Definition for RoleDefinition {
    fn key(&self) -> Uuid {
        self.key
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn set_name(&mut self, name: String) {
        self.name = name;
    }
    fn label(&self) -> &str {
        &self.label
    }
    fn set_label(&mut self, label: String) {
        self.label = label;
    }
    fn is_protected(&self) -> bool {
        self.protected
    }
}

impl Definition for RelationshipTypeDef {
    fn key(&self) -> Uuid {
        self.key
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn set_name(&mut self, name: String) {
        self.name = name;
    }
    fn label(&self) -> &str {
        &self.label
    }
    fn set_label(&mut self, label: String) {
        self.label = label;
    }
    fn is_protected(&self) -> bool {
        self.protected
    }
}

// ============================================================================
// DefinitionStore — the shared operational contract
// ============================================================================

/// Result of a successful delete, carrying what moved where.
///
/// When references were migrated, `reassigned` lists every holder that now
/// points at `migrated_to` — callers walk it to update their own caches and
/// persisted rows, one entry per reassigned holder.
#[derive(Debug, Clone)]
pub struct DeleteOutcome<H> {
    pub key: Uuid,
    pub migrated_to: Option<Uuid>,
    pub reassigned: Vec<H>,
}

/// Name↔key index with reference counting for one definition kind
#[derive(Debug, Clone)]
pub struct DefinitionStore<D, H> {
    by_key: HashMap<Uuid, D>,
    by_name: HashMap<String, Uuid>,
    usage: HashMap<Uuid, HashSet<H>>,
}

impl<D: Definition, H: Copy + Eq + Hash> DefinitionStore<D, H> {
    pub fn new() -> Self {
        Self {
            by_key: HashMap::new(),
            by_name: HashMap::new(),
            usage: HashMap::new(),
        }
    }

    // ── Query ───────────────────────────────────────────────────────────

    pub fn get_by_key(&self, key: Uuid) -> Result<&D, RegistryError> {
        self.by_key
            .get(&key)
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))
    }

    pub fn get_by_name(&self, name: &str) -> Result<&D, RegistryError> {
        let key = self.key_of(name)?;
        self.get_by_key(key)
    }

    pub fn key_of(&self, name: &str) -> Result<Uuid, RegistryError> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &D> {
        self.by_key.values()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    // ── Mutation ────────────────────────────────────────────────────────

    /// Bind a new definition. Fails if the name or the key is taken.
    pub fn insert(&mut self, defn: D) -> Result<Uuid, RegistryError> {
        if self.by_name.contains_key(defn.name()) {
            return Err(RegistryError::AlreadyExists(defn.name().to_string()));
        }
        if self.by_key.contains_key(&defn.key()) {
            return Err(RegistryError::AlreadyExists(defn.key().to_string()));
        }
        let key = defn.key();
        self.by_name.insert(defn.name().to_string(), key);
        self.by_key.insert(key, defn);
        self.usage.entry(key).or_default();
        Ok(key)
    }

    /// Insert-or-replace by key, preserving any tracked usage.
    ///
    /// Used when rebuilding from the persisted state of record, where rows
    /// may carry renames of already-seeded entries.
    pub(crate) fn restore(&mut self, defn: D) {
        let key = defn.key();
        if let Some(old) = self.by_key.get(&key) {
            self.by_name.remove(old.name());
        }
        self.by_name.insert(defn.name().to_string(), key);
        self.by_key.insert(key, defn);
        self.usage.entry(key).or_default();
    }

    /// Rebind a name. The key never changes, so every entity holding it
    /// observes the new name immediately.
    pub fn rename(&mut self, old_name: &str, new_name: &str) -> Result<&D, RegistryError> {
        let key = self.key_of(old_name)?;
        if let Some(existing) = self.by_name.get(new_name) {
            if *existing != key {
                return Err(RegistryError::AlreadyExists(new_name.to_string()));
            }
        }
        self.by_name.remove(old_name);
        if let Some(defn) = self.by_key.get_mut(&key) {
            // Follow the rename only while the label is still the
            // auto-generated default
            if defn.label() == title_case(old_name) {
                defn.set_label(title_case(new_name));
            }
            defn.set_name(new_name.to_string());
        }
        self.by_name.insert(new_name.to_string(), key);
        self.get_by_key(key)
    }

    pub fn rename_label(&mut self, name: &str, new_label: &str) -> Result<&D, RegistryError> {
        let key = self.key_of(name)?;
        if let Some(defn) = self.by_key.get_mut(&key) {
            defn.set_label(new_label.to_string());
        }
        self.get_by_key(key)
    }

    /// Apply a field merge to one definition. The closure must not touch
    /// the name — renames go through [`rename`](Self::rename).
    pub fn update_with<F>(&mut self, name: &str, apply: F) -> Result<&D, RegistryError>
    where
        F: FnOnce(&mut D),
    {
        let key = self.key_of(name)?;
        if let Some(defn) = self.by_key.get_mut(&key) {
            apply(defn);
        }
        self.get_by_key(key)
    }

    /// Remove a definition.
    ///
    /// Blocked for protected entries, and for referenced entries unless
    /// `migrate_to` names another entry — in which case every holder is
    /// reassigned to the target key before the entry is dropped.
    pub fn delete(
        &mut self,
        name: &str,
        migrate_to: Option<&str>,
    ) -> Result<DeleteOutcome<H>, RegistryError> {
        let key = self.key_of(name)?;
        if self.get_by_key(key)?.is_protected() {
            return Err(RegistryError::Protected(name.to_string()));
        }
        let target_key = match migrate_to {
            Some(target) => Some(self.key_of(target)?),
            None => None,
        };
        let holders: Vec<H> = self
            .usage
            .get(&key)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        let (migrated_to, reassigned) = if holders.is_empty() {
            (None, Vec::new())
        } else {
            match target_key {
                Some(target) if target != key => {
                    let moved = self.usage.remove(&key).unwrap_or_default();
                    self.usage.entry(target).or_default().extend(moved.iter());
                    (Some(target), holders)
                }
                _ => {
                    return Err(RegistryError::Orphaned {
                        name: name.to_string(),
                        references: holders.len(),
                    })
                }
            }
        };

        self.by_name.remove(name);
        self.by_key.remove(&key);
        self.usage.remove(&key);
        Ok(DeleteOutcome {
            key,
            migrated_to,
            reassigned,
        })
    }

    // ── Usage tracking ──────────────────────────────────────────────────

    /// Record that `holder` references `key`. Silent when the key is not
    /// registered.
    pub fn register_usage(&mut self, key: Uuid, holder: H) {
        if self.by_key.contains_key(&key) {
            self.usage.entry(key).or_default().insert(holder);
        }
    }

    /// Drop a holder's reference. Silent when the key is not registered.
    pub fn unregister_usage(&mut self, key: Uuid, holder: H) {
        if let Some(set) = self.usage.get_mut(&key) {
            set.remove(&holder);
        }
    }

    pub fn ref_count(&self, name: &str) -> Result<usize, RegistryError> {
        let key = self.key_of(name)?;
        Ok(self.usage.get(&key).map_or(0, HashSet::len))
    }

    pub fn who_references(&self, name: &str) -> Result<Vec<H>, RegistryError> {
        let key = self.key_of(name)?;
        Ok(self
            .usage
            .get(&key)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }
}

impl<D: Definition, H: Copy + Eq + Hash> Default for DefinitionStore<D, H> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Fixed system keys
// ============================================================================

/// Stable UUIDs for seeded definitions, fixed so upgrades preserve
/// cross-version meaning.
pub mod keys {
    use uuid::Uuid;

    // Track-class roles
    pub const ROLE_PRIMARY: Uuid = Uuid::from_u128(0x1000_0000_0000_0000_0000_0000_0000_0001);
    pub const ROLE_REFERENCE: Uuid = Uuid::from_u128(0x1000_0000_0000_0000_0000_0000_0000_0002);
    pub const ROLE_MATTE: Uuid = Uuid::from_u128(0x1000_0000_0000_0000_0000_0000_0000_0003);
    pub const ROLE_BACKGROUND: Uuid = Uuid::from_u128(0x1000_0000_0000_0000_0000_0000_0000_0004);
    pub const ROLE_FOREGROUND: Uuid = Uuid::from_u128(0x1000_0000_0000_0000_0000_0000_0000_0005);
    pub const ROLE_COLOR: Uuid = Uuid::from_u128(0x1000_0000_0000_0000_0000_0000_0000_0006);
    pub const ROLE_AUDIO: Uuid = Uuid::from_u128(0x1000_0000_0000_0000_0000_0000_0000_0007);

    // Media-class roles
    pub const ROLE_RAW: Uuid = Uuid::from_u128(0x2000_0000_0000_0000_0000_0000_0000_0001);
    pub const ROLE_GRADE: Uuid = Uuid::from_u128(0x2000_0000_0000_0000_0000_0000_0000_0002);
    pub const ROLE_DENOISE: Uuid = Uuid::from_u128(0x2000_0000_0000_0000_0000_0000_0000_0003);
    pub const ROLE_PREP: Uuid = Uuid::from_u128(0x2000_0000_0000_0000_0000_0000_0000_0004);
    pub const ROLE_ROTO: Uuid = Uuid::from_u128(0x2000_0000_0000_0000_0000_0000_0000_0005);
    pub const ROLE_COMP: Uuid = Uuid::from_u128(0x2000_0000_0000_0000_0000_0000_0000_0006);

    // System relationship types
    pub const REL_MEMBER_OF: Uuid = Uuid::from_u128(0x3000_0000_0000_0000_0000_0000_0000_0001);
    pub const REL_VERSION_OF: Uuid = Uuid::from_u128(0x3000_0000_0000_0000_0000_0000_0000_0002);
    pub const REL_DERIVED_FROM: Uuid = Uuid::from_u128(0x3000_0000_0000_0000_0000_0000_0000_0003);
    pub const REL_REFERENCES: Uuid = Uuid::from_u128(0x3000_0000_0000_0000_0000_0000_0000_0004);
    pub const REL_PEER_OF: Uuid = Uuid::from_u128(0x3000_0000_0000_0000_0000_0000_0000_0005);
    pub const REL_CONSUMES: Uuid = Uuid::from_u128(0x3000_0000_0000_0000_0000_0000_0000_0006);
    pub const REL_PRODUCES: Uuid = Uuid::from_u128(0x3000_0000_0000_0000_0000_0000_0000_0007);
}

/// name, class, stack order, key, flame alias
const STANDARD_ROLES: &[(&str, RoleClass, i32, Uuid, Option<&str>)] = &[
    ("primary", RoleClass::Track, 0, keys::ROLE_PRIMARY, Some("L01")),
    ("reference", RoleClass::Track, 1, keys::ROLE_REFERENCE, Some("L02")),
    ("matte", RoleClass::Track, 2, keys::ROLE_MATTE, Some("L03")),
    ("background", RoleClass::Track, 3, keys::ROLE_BACKGROUND, None),
    ("foreground", RoleClass::Track, 4, keys::ROLE_FOREGROUND, None),
    ("color", RoleClass::Track, 5, keys::ROLE_COLOR, None),
    ("audio", RoleClass::Track, 6, keys::ROLE_AUDIO, None),
    ("raw", RoleClass::Media, 10, keys::ROLE_RAW, None),
    ("grade", RoleClass::Media, 11, keys::ROLE_GRADE, None),
    ("denoise", RoleClass::Media, 12, keys::ROLE_DENOISE, None),
    ("prep", RoleClass::Media, 13, keys::ROLE_PREP, None),
    ("roto", RoleClass::Media, 14, keys::ROLE_ROTO, None),
    ("comp", RoleClass::Media, 15, keys::ROLE_COMP, None),
];

/// name, label, description, key
const SYSTEM_RELATIONSHIP_TYPES: &[(&str, &str, &str, Uuid)] = &[
    (
        "member_of",
        "Member Of",
        "Source belongs to target collection",
        keys::REL_MEMBER_OF,
    ),
    (
        "version_of",
        "Version Of",
        "Source is an iteration of the target",
        keys::REL_VERSION_OF,
    ),
    (
        "derived_from",
        "Derived From",
        "Source was produced from target",
        keys::REL_DERIVED_FROM,
    ),
    (
        "references",
        "References",
        "Source uses target without ownership",
        keys::REL_REFERENCES,
    ),
    (
        "peer_of",
        "Peer Of",
        "Source and target are at the same level",
        keys::REL_PEER_OF,
    ),
    (
        "consumes",
        "Consumes",
        "Source reads target as an input",
        keys::REL_CONSUMES,
    ),
    (
        "produces",
        "Produces",
        "Source emits target as an output",
        keys::REL_PRODUCES,
    ),
];

// ============================================================================
// RoleRegistry
// ============================================================================

/// Fields accepted when registering a role
#[derive(Debug, Clone, Default)]
pub struct RoleSpec {
    pub label: Option<String>,
    pub order: i32,
    pub role_class: RoleClass,
    pub path_template: Option<String>,
    pub aliases: BTreeMap<String, String>,
    pub key: Option<Uuid>,
    pub protected: bool,
}

/// Optional field merge for an existing role
#[derive(Debug, Clone, Default)]
pub struct RoleUpdate {
    pub label: Option<String>,
    pub order: Option<i32>,
    pub path_template: Option<String>,
    pub aliases: Option<BTreeMap<String, String>>,
}

/// Role definitions, referenced by layers via `role_key`
#[derive(Debug, Clone, Default)]
pub struct RoleRegistry {
    store: DefinitionStore<RoleDefinition, Uuid>,
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: &str,
        spec: RoleSpec,
    ) -> Result<&RoleDefinition, RegistryError> {
        let key = spec.key.unwrap_or_else(Uuid::new_v4);
        let defn = RoleDefinition {
            key,
            name: name.to_string(),
            label: spec.label.unwrap_or_else(|| title_case(name)),
            role_class: spec.role_class,
            order: spec.order,
            path_template: spec.path_template,
            aliases: spec.aliases,
            protected: spec.protected,
        };
        let key = self.store.insert(defn)?;
        self.store.get_by_key(key)
    }

    pub fn get_by_name(&self, name: &str) -> Result<&RoleDefinition, RegistryError> {
        self.store.get_by_name(name)
    }

    pub fn get_by_key(&self, key: Uuid) -> Result<&RoleDefinition, RegistryError> {
        self.store.get_by_key(key)
    }

    pub fn key_of(&self, name: &str) -> Result<Uuid, RegistryError> {
        self.store.key_of(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.store.contains(name)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// All roles, ordered by stack position then name
    pub fn all(&self) -> Vec<&RoleDefinition> {
        let mut roles: Vec<&RoleDefinition> = self.store.iter().collect();
        roles.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.name.cmp(&b.name)));
        roles
    }

    pub fn names(&self) -> Vec<String> {
        self.store.names()
    }

    pub fn rename(&mut self, old_name: &str, new_name: &str) -> Result<&RoleDefinition, RegistryError> {
        self.store.rename(old_name, new_name)
    }

    pub fn rename_label(
        &mut self,
        name: &str,
        new_label: &str,
    ) -> Result<&RoleDefinition, RegistryError> {
        self.store.rename_label(name, new_label)
    }

    pub fn update(
        &mut self,
        name: &str,
        update: RoleUpdate,
    ) -> Result<&RoleDefinition, RegistryError> {
        self.store.update_with(name, |defn| {
            if let Some(label) = update.label {
                defn.label = label;
            }
            if let Some(order) = update.order {
                defn.order = order;
            }
            if let Some(template) = update.path_template {
                defn.path_template = Some(template);
            }
            if let Some(aliases) = update.aliases {
                defn.aliases = aliases;
            }
        })
    }

    pub fn delete(
        &mut self,
        name: &str,
        migrate_to: Option<&str>,
    ) -> Result<DeleteOutcome<Uuid>, RegistryError> {
        self.store.delete(name, migrate_to)
    }

    pub fn register_usage(&mut self, key: Uuid, entity_id: Uuid) {
        self.store.register_usage(key, entity_id);
    }

    pub fn unregister_usage(&mut self, key: Uuid, entity_id: Uuid) {
        self.store.unregister_usage(key, entity_id);
    }

    pub fn ref_count(&self, name: &str) -> Result<usize, RegistryError> {
        self.store.ref_count(name)
    }

    pub fn who_references(&self, name: &str) -> Result<Vec<Uuid>, RegistryError> {
        self.store.who_references(name)
    }

    pub(crate) fn restore(&mut self, defn: RoleDefinition) {
        self.store.restore(defn);
    }
}

// ============================================================================
// RelationshipTypeRegistry
// ============================================================================

/// Holder identifier for relationship-type usage: one edge endpoint pair
pub type EdgeHolder = (Uuid, Uuid);

/// Fields accepted when registering a relationship type
#[derive(Debug, Clone, Default)]
pub struct RelationshipTypeSpec {
    pub label: Option<String>,
    pub description: String,
    pub directionality: Directionality,
    pub key: Option<Uuid>,
    pub protected: bool,
}

/// Relationship type definitions, referenced by edges via `rel_type_key`
#[derive(Debug, Clone, Default)]
pub struct RelationshipTypeRegistry {
    store: DefinitionStore<RelationshipTypeDef, EdgeHolder>,
}

impl RelationshipTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-seeded with the protected system types
    pub fn with_system_types() -> Self {
        let mut registry = Self::new();
        registry.seed_system_types();
        registry
    }

    pub(crate) fn seed_system_types(&mut self) {
        for (name, label, description, key) in SYSTEM_RELATIONSHIP_TYPES {
            self.store.restore(RelationshipTypeDef {
                key: *key,
                name: (*name).to_string(),
                label: (*label).to_string(),
                description: (*description).to_string(),
                directionality: Directionality::Forward,
                protected: true,
            });
        }
    }

    pub fn register(
        &mut self,
        name: &str,
        spec: RelationshipTypeSpec,
    ) -> Result<&RelationshipTypeDef, RegistryError> {
        let key = spec.key.unwrap_or_else(Uuid::new_v4);
        let defn = RelationshipTypeDef {
            key,
            name: name.to_string(),
            label: spec.label.unwrap_or_else(|| title_case(name)),
            description: spec.description,
            directionality: spec.directionality,
            protected: spec.protected,
        };
        let key = self.store.insert(defn)?;
        self.store.get_by_key(key)
    }

    pub fn get_by_name(&self, name: &str) -> Result<&RelationshipTypeDef, RegistryError> {
        self.store.get_by_name(name)
    }

    pub fn get_by_key(&self, key: Uuid) -> Result<&RelationshipTypeDef, RegistryError> {
        self.store.get_by_key(key)
    }

    pub fn key_of(&self, name: &str) -> Result<Uuid, RegistryError> {
        self.store.key_of(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.store.contains(name)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn all(&self) -> Vec<&RelationshipTypeDef> {
        let mut types: Vec<&RelationshipTypeDef> = self.store.iter().collect();
        types.sort_by(|a, b| a.name.cmp(&b.name));
        types
    }

    pub fn names(&self) -> Vec<String> {
        self.store.names()
    }

    pub fn system_types(&self) -> Vec<&RelationshipTypeDef> {
        self.all().into_iter().filter(|d| d.protected).collect()
    }

    pub fn custom_types(&self) -> Vec<&RelationshipTypeDef> {
        self.all().into_iter().filter(|d| !d.protected).collect()
    }

    pub fn rename(
        &mut self,
        old_name: &str,
        new_name: &str,
    ) -> Result<&RelationshipTypeDef, RegistryError> {
        self.store.rename(old_name, new_name)
    }

    pub fn rename_label(
        &mut self,
        name: &str,
        new_label: &str,
    ) -> Result<&RelationshipTypeDef, RegistryError> {
        self.store.rename_label(name, new_label)
    }

    pub fn delete(
        &mut self,
        name: &str,
        migrate_to: Option<&str>,
    ) -> Result<DeleteOutcome<EdgeHolder>, RegistryError> {
        self.store.delete(name, migrate_to)
    }

    pub fn register_usage(&mut self, key: Uuid, holder: EdgeHolder) {
        self.store.register_usage(key, holder);
    }

    pub fn unregister_usage(&mut self, key: Uuid, holder: EdgeHolder) {
        self.store.unregister_usage(key, holder);
    }

    pub fn ref_count(&self, name: &str) -> Result<usize, RegistryError> {
        self.store.ref_count(name)
    }

    pub fn who_references(&self, name: &str) -> Result<Vec<EdgeHolder>, RegistryError> {
        self.store.who_references(name)
    }

    pub(crate) fn restore(&mut self, defn: RelationshipTypeDef) {
        self.store.restore(defn);
    }
}

// ============================================================================
// Registry — top-level container
// ============================================================================

/// Serialized registry state, modulo ref counts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub roles: Vec<RoleDefinition>,
    pub relationship_types: Vec<RelationshipTypeDef>,
}

/// The registry for one bridge instance: roles plus relationship types
#[derive(Debug, Clone)]
pub struct Registry {
    pub roles: RoleRegistry,
    pub relationship_types: RelationshipTypeRegistry,
}

impl Registry {
    /// A registry with no definitions at all
    pub fn empty() -> Self {
        Self {
            roles: RoleRegistry::new(),
            relationship_types: RelationshipTypeRegistry::new(),
        }
    }

    /// Summary handed to clients in the `welcome` frame
    pub fn summary(&self) -> Value {
        let roles: Vec<Value> = self
            .roles
            .all()
            .into_iter()
            .map(|d| {
                json!({
                    "key": d.key,
                    "name": d.name,
                    "label": d.label,
                    "order": d.order,
                    "role_class": d.role_class,
                    "protected": d.protected,
                    "ref_count": self.roles.ref_count(&d.name).unwrap_or(0),
                })
            })
            .collect();
        let relationship_types: Vec<Value> = self
            .relationship_types
            .all()
            .into_iter()
            .map(|d| {
                json!({
                    "key": d.key,
                    "name": d.name,
                    "label": d.label,
                    "directionality": d.directionality,
                    "protected": d.protected,
                    "ref_count": self.relationship_types.ref_count(&d.name).unwrap_or(0),
                })
            })
            .collect();
        json!({
            "role_count": roles.len(),
            "relationship_type_count": relationship_types.len(),
            "roles": roles,
            "relationship_types": relationship_types,
        })
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            roles: self.roles.all().into_iter().cloned().collect(),
            relationship_types: self
                .relationship_types
                .all()
                .into_iter()
                .cloned()
                .collect(),
        }
    }

    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Result<Self, RegistryError> {
        let mut registry = Self::empty();
        for role in snapshot.roles {
            registry.roles.store.insert(role)?;
        }
        for typedef in snapshot.relationship_types {
            registry.relationship_types.store.insert(typedef)?;
        }
        Ok(registry)
    }
}

impl Default for Registry {
    /// The standard pipeline setup: protected track and media roles plus
    /// all system relationship types, under their fixed keys.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.relationship_types.seed_system_types();
        for (name, role_class, order, key, flame_alias) in STANDARD_ROLES {
            let mut aliases = BTreeMap::new();
            if let Some(alias) = flame_alias {
                aliases.insert("flame".to_string(), (*alias).to_string());
            }
            registry.roles.restore(RoleDefinition {
                key: *key,
                name: (*name).to_string(),
                label: title_case(name),
                role_class: *role_class,
                order: *order,
                path_template: None,
                aliases,
                protected: true,
            });
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn custom_role(registry: &mut Registry, name: &str) -> Uuid {
        registry
            .roles
            .register(name, RoleSpec::default())
            .map(|d| d.key)
            .unwrap()
    }

    #[test]
    fn test_default_seeds_fixed_keys() {
        let registry = Registry::default();
        assert_eq!(registry.roles.key_of("primary").unwrap(), keys::ROLE_PRIMARY);
        assert_eq!(registry.roles.key_of("comp").unwrap(), keys::ROLE_COMP);
        assert_eq!(
            registry.relationship_types.key_of("member_of").unwrap(),
            keys::REL_MEMBER_OF
        );
        assert_eq!(registry.roles.len(), 13);
        assert_eq!(registry.relationship_types.len(), 7);
        assert!(registry.roles.get_by_name("primary").unwrap().protected);
    }

    #[test]
    fn test_register_and_duplicate() {
        let mut registry = Registry::default();
        let key = custom_role(&mut registry, "paint");
        assert_eq!(registry.roles.key_of("paint").unwrap(), key);
        assert!(matches!(
            registry.roles.register("paint", RoleSpec::default()),
            Err(RegistryError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_rename_keeps_key() {
        let mut registry = Registry::default();
        let key = registry.roles.key_of("primary").unwrap();
        registry.roles.rename("primary", "hero").unwrap();
        assert_eq!(registry.roles.key_of("hero").unwrap(), key);
        assert!(matches!(
            registry.roles.key_of("primary"),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_rename_collision() {
        let mut registry = Registry::default();
        assert!(matches!(
            registry.roles.rename("primary", "matte"),
            Err(RegistryError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_rename_follows_auto_label_only() {
        let mut registry = Registry::default();
        registry.roles.rename("primary", "hero").unwrap();
        assert_eq!(registry.roles.get_by_name("hero").unwrap().label, "Hero");

        registry.roles.rename_label("hero", "Hero Plate").unwrap();
        registry.roles.rename("hero", "main").unwrap();
        assert_eq!(registry.roles.get_by_name("main").unwrap().label, "Hero Plate");
    }

    #[test]
    fn test_delete_unreferenced() {
        let mut registry = Registry::default();
        custom_role(&mut registry, "paint");
        let outcome = registry.roles.delete("paint", None).unwrap();
        assert!(outcome.reassigned.is_empty());
        assert!(outcome.migrated_to.is_none());
        assert!(!registry.roles.contains("paint"));
    }

    #[test]
    fn test_orphan_protection() {
        let mut registry = Registry::default();
        let key = custom_role(&mut registry, "paint");
        let entity = Uuid::new_v4();
        registry.roles.register_usage(key, entity);

        assert!(matches!(
            registry.roles.delete("paint", None),
            Err(RegistryError::Orphaned { references: 1, .. })
        ));
        // Blocked delete leaves state untouched
        assert!(registry.roles.contains("paint"));
        assert_eq!(registry.roles.ref_count("paint").unwrap(), 1);
    }

    #[test]
    fn test_delete_with_migration_reassigns_holders() {
        let mut registry = Registry::default();
        let key = custom_role(&mut registry, "paint");
        let holder_a = Uuid::new_v4();
        let holder_b = Uuid::new_v4();
        registry.roles.register_usage(key, holder_a);
        registry.roles.register_usage(key, holder_b);

        let outcome = registry.roles.delete("paint", Some("primary")).unwrap();
        assert_eq!(outcome.migrated_to, Some(keys::ROLE_PRIMARY));
        assert_eq!(outcome.reassigned.len(), 2);
        assert!(outcome.reassigned.contains(&holder_a));
        assert_eq!(registry.roles.ref_count("primary").unwrap(), 2);
        assert!(!registry.roles.contains("paint"));
    }

    #[test]
    fn test_delete_migration_target_must_exist() {
        let mut registry = Registry::default();
        let key = custom_role(&mut registry, "paint");
        registry.roles.register_usage(key, Uuid::new_v4());
        assert!(matches!(
            registry.roles.delete("paint", Some("nope")),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_protected_delete_blocked_regardless_of_refs() {
        let mut registry = Registry::default();
        assert!(matches!(
            registry.roles.delete("primary", None),
            Err(RegistryError::Protected(_))
        ));
        // Renamed protected entries stay protected
        registry.roles.rename("primary", "hero").unwrap();
        assert!(matches!(
            registry.roles.delete("hero", Some("matte")),
            Err(RegistryError::Protected(_))
        ));
    }

    #[test]
    fn test_system_relationship_types_protected() {
        let mut registry = Registry::default();
        assert!(matches!(
            registry.relationship_types.delete("member_of", None),
            Err(RegistryError::Protected(_))
        ));
        registry
            .relationship_types
            .rename("member_of", "belongs_to")
            .unwrap();
        assert_eq!(
            registry.relationship_types.key_of("belongs_to").unwrap(),
            keys::REL_MEMBER_OF
        );
    }

    #[test]
    fn test_relationship_usage_holder_pairs() {
        let mut registry = Registry::default();
        let typedef = registry
            .relationship_types
            .register("blocks", RelationshipTypeSpec::default())
            .map(|d| d.key)
            .unwrap();
        let edge = (Uuid::new_v4(), Uuid::new_v4());
        registry.relationship_types.register_usage(typedef, edge);
        assert_eq!(registry.relationship_types.ref_count("blocks").unwrap(), 1);

        assert!(matches!(
            registry.relationship_types.delete("blocks", None),
            Err(RegistryError::Orphaned { .. })
        ));
        registry.relationship_types.unregister_usage(typedef, edge);
        registry.relationship_types.delete("blocks", None).unwrap();
    }

    #[test]
    fn test_update_merges_fields() {
        let mut registry = Registry::default();
        custom_role(&mut registry, "paint");
        registry
            .roles
            .update(
                "paint",
                RoleUpdate {
                    order: Some(7),
                    path_template: Some("{project}/paint".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        let defn = registry.roles.get_by_name("paint").unwrap();
        assert_eq!(defn.order, 7);
        assert_eq!(defn.path_template.as_deref(), Some("{project}/paint"));
        assert_eq!(defn.label, "Paint");
    }

    #[test]
    fn test_usage_silent_on_unknown_key() {
        let mut registry = Registry::default();
        registry.roles.register_usage(Uuid::new_v4(), Uuid::new_v4());
        registry.roles.unregister_usage(Uuid::new_v4(), Uuid::new_v4());
    }

    #[test]
    fn test_who_references() {
        let mut registry = Registry::default();
        let key = custom_role(&mut registry, "paint");
        let entity = Uuid::new_v4();
        registry.roles.register_usage(key, entity);
        assert_eq!(registry.roles.who_references("paint").unwrap(), vec![entity]);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut registry = Registry::default();
        custom_role(&mut registry, "paint");
        registry.roles.rename("primary", "hero").unwrap();
        registry
            .relationship_types
            .register(
                "blocks",
                RelationshipTypeSpec {
                    directionality: Directionality::Bidirectional,
                    ..Default::default()
                },
            )
            .unwrap();

        let snapshot = registry.snapshot();
        let encoded = serde_json::to_string(&snapshot).unwrap();
        let decoded: RegistrySnapshot = serde_json::from_str(&encoded).unwrap();
        let restored = Registry::from_snapshot(decoded).unwrap();

        assert_eq!(restored.roles.len(), registry.roles.len());
        assert_eq!(
            restored.roles.key_of("hero").unwrap(),
            registry.roles.key_of("hero").unwrap()
        );
        assert_eq!(
            restored.relationship_types.get_by_name("blocks").unwrap().directionality,
            Directionality::Bidirectional
        );
        // Ref counts are runtime state, not part of the snapshot
        assert_eq!(restored.roles.ref_count("hero").unwrap(), 0);
    }

    #[test]
    fn test_summary_shape() {
        let registry = Registry::default();
        let summary = registry.summary();
        assert_eq!(summary["role_count"], 13);
        assert_eq!(summary["relationship_type_count"], 7);
        let names: Vec<&str> = summary["roles"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"primary"));
        assert!(names.contains(&"comp"));
    }
}
