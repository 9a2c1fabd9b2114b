//! Row types and their conversions into core objects.
//!
//! `sqlx::FromRow` structs for queries that need mapping, plus the two
//! records (events, sessions) that surface directly in query responses.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::core::registry::{Directionality, RelationshipTypeDef, RoleDefinition};
use crate::core::traits::{Location, Relationship, StorageType};
use crate::core::vocabulary::RoleClass;
use crate::protocol::JsonMap;

pub(crate) fn value_to_map(value: Value) -> JsonMap {
    match value {
        Value::Object(map) => map,
        _ => JsonMap::new(),
    }
}

// ── Registry rows ───────────────────────────────────────────────────────

#[derive(Debug, FromRow)]
pub(crate) struct RoleRow {
    pub key: Uuid,
    pub name: String,
    pub label: String,
    pub role_class: String,
    pub sort_order: i32,
    pub protected: bool,
    pub attributes: Value,
}

impl From<RoleRow> for RoleDefinition {
    fn from(row: RoleRow) -> Self {
        let attrs = value_to_map(row.attributes);
        RoleDefinition {
            key: row.key,
            name: row.name,
            label: row.label,
            role_class: RoleClass::parse(&row.role_class).unwrap_or_default(),
            order: row.sort_order,
            path_template: attrs
                .get("path_template")
                .and_then(Value::as_str)
                .map(str::to_string),
            aliases: attrs
                .get("aliases")
                .and_then(Value::as_object)
                .map(|map| {
                    map.iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect()
                })
                .unwrap_or_default(),
            protected: row.protected,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct RelationshipTypeRow {
    pub key: Uuid,
    pub name: String,
    pub label: String,
    pub description: String,
    pub directionality: String,
    pub protected: bool,
}

impl From<RelationshipTypeRow> for RelationshipTypeDef {
    fn from(row: RelationshipTypeRow) -> Self {
        let directionality = match row.directionality.as_str() {
            "←" => Directionality::Reverse,
            "↔" => Directionality::Bidirectional,
            _ => Directionality::Forward,
        };
        RelationshipTypeDef {
            key: row.key,
            name: row.name,
            label: row.label,
            description: row.description,
            directionality,
            protected: row.protected,
        }
    }
}

// ── Entity rows ─────────────────────────────────────────────────────────

#[derive(Debug, FromRow)]
pub(crate) struct EntityRow {
    pub id: Uuid,
    pub entity_type: String,
    pub project_id: Option<Uuid>,
    pub name: Option<String>,
    pub status: Option<String>,
    pub attributes: Value,
}

// ── Location rows ───────────────────────────────────────────────────────

#[derive(Debug, FromRow)]
pub(crate) struct LocationRow {
    pub path: String,
    pub storage_type: String,
    pub priority: i32,
    pub exists: Option<bool>,
    pub attributes: Value,
}

impl From<LocationRow> for Location {
    fn from(row: LocationRow) -> Self {
        let storage_type = match row.storage_type.as_str() {
            "network" => StorageType::Network,
            "cloud" => StorageType::Cloud,
            "archive" => StorageType::Archive,
            "clip" => StorageType::Clip,
            _ => StorageType::Local,
        };
        Location {
            path: row.path,
            storage_type,
            priority: row.priority,
            exists: row.exists,
            metadata: value_to_map(row.attributes).into_iter().collect(),
        }
    }
}

// ── Relationship rows ───────────────────────────────────────────────────

#[derive(Debug, FromRow)]
pub(crate) struct RelationshipRow {
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub rel_type_key: Uuid,
    pub attributes: Value,
    pub created_at: DateTime<Utc>,
}

impl From<RelationshipRow> for Relationship {
    fn from(row: RelationshipRow) -> Self {
        Relationship {
            source_id: row.source_id,
            target_id: row.target_id,
            rel_type_key: row.rel_type_key,
            attributes: value_to_map(row.attributes),
            created_at: row.created_at,
        }
    }
}

// ── Event & session records ─────────────────────────────────────────────

/// One committed row of the append-only event log
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct EventRecord {
    pub id: Uuid,
    pub event_type: String,
    pub session_id: Option<Uuid>,
    pub client_name: Option<String>,
    pub project_id: Option<Uuid>,
    pub entity_id: Option<Uuid>,
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
}

/// One client session row, open or closed
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct SessionRecord {
    pub id: Uuid,
    pub client_name: String,
    pub endpoint_type: Option<String>,
    pub host: Option<String>,
    pub capabilities: Value,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub last_seen_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn is_active(&self) -> bool {
        self.disconnected_at.is_none()
    }
}
