//! Wire protocol for the bridge.
//!
//! Every frame that crosses the socket is one JSON object with a `type`
//! field. Requests additionally carry a client-generated `id`; the server
//! echoes that `id` in the matching `ok` or `error` response. Server-push
//! events carry no request id but a unique `event_id`.
//!
//! Both the server and the client modules build frames exclusively through
//! the constructors here — if it is not in this module it does not exist on
//! the wire.
//!
//! ```text
//! request:  {"type": "role.rename", "id": "<uuid>", "old_name": "...", ...}
//! success:  {"type": "ok", "id": "<same uuid>", "result": {...}}
//! failure:  {"type": "error", "id": "<same uuid>", "code": "NOT_FOUND", "message": "..."}
//! push:     {"type": "event", "event_id": "<uuid>", "event_type": "entity.updated", ...}
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::core::registry::Directionality;
use crate::core::traits::StorageType;
use crate::core::vocabulary::RoleClass;

/// Open key/value payload carried by several message kinds
pub type JsonMap = serde_json::Map<String, Value>;

// ============================================================================
// Error codes
// ============================================================================

/// The closed set of wire error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    OrphanBlocked,
    Protected,
    Invalid,
    Unauthorized,
    Internal,
    UnknownType,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::OrphanBlocked => "ORPHAN_BLOCKED",
            Self::Protected => "PROTECTED",
            Self::Invalid => "INVALID",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Internal => "INTERNAL",
            Self::UnknownType => "UNKNOWN_TYPE",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Parse errors
// ============================================================================

/// Why an inbound frame could not become a [`Message`]
///
/// `UnknownType` and `InvalidPayload` capture the request id (when one was
/// present and well-formed) so the connection loop can still send a
/// correlated error reply.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {reason}")]
    Malformed { reason: String },

    #[error("frame root must be a JSON object")]
    NotAnObject,

    #[error("frame is missing the 'type' field")]
    MissingType,

    #[error("unknown message type {msg_type:?}")]
    UnknownType { msg_type: String, id: Option<Uuid> },

    #[error("invalid {msg_type} payload: {reason}")]
    InvalidPayload {
        msg_type: String,
        id: Option<Uuid>,
        reason: String,
    },

    #[error("message serialization failed: {0}")]
    Serialize(String),
}

impl ProtocolError {
    /// Build the error reply a server should send for this parse failure
    pub fn to_error_message(&self) -> Message {
        match self {
            Self::UnknownType { msg_type, id } => Message::error(
                *id,
                ErrorCode::UnknownType,
                format!("Unknown message type: {:?}", msg_type),
                None,
            ),
            Self::InvalidPayload {
                msg_type,
                id,
                reason,
            } => Message::error(
                *id,
                ErrorCode::Invalid,
                format!("Invalid {} payload: {}", msg_type, reason),
                None,
            ),
            other => Message::error(None, ErrorCode::Invalid, other.to_string(), None),
        }
    }
}

// ============================================================================
// Server-push event frame
// ============================================================================

/// Payload of a server-push `event` frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event_id: Uuid,
    pub event_type: String,
    #[serde(default)]
    pub project_id: Option<Uuid>,
    #[serde(default)]
    pub entity_id: Option<Uuid>,
    #[serde(default)]
    pub payload: Value,
}

// ============================================================================
// Message
// ============================================================================

fn default_endpoint_type() -> String {
    "unknown".to_string()
}

fn default_bye_reason() -> String {
    "client_shutdown".to_string()
}

fn default_event_limit() -> u32 {
    50
}

/// One wire frame, discriminated by the `type` field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    // ── Handshake & liveness ────────────────────────────────────────────
    #[serde(rename = "hello")]
    Hello {
        id: Uuid,
        client_name: String,
        #[serde(default = "default_endpoint_type")]
        endpoint_type: String,
        #[serde(default)]
        capabilities: JsonMap,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_event_id: Option<Uuid>,
    },

    #[serde(rename = "welcome")]
    Welcome {
        id: Uuid,
        session_id: Uuid,
        server_version: String,
        registry_summary: Value,
    },

    #[serde(rename = "ping")]
    Ping { id: Uuid },

    #[serde(rename = "pong")]
    Pong { id: Uuid },

    #[serde(rename = "bye")]
    Bye {
        #[serde(default = "default_bye_reason")]
        reason: String,
    },

    // ── Generic responses ───────────────────────────────────────────────
    #[serde(rename = "ok")]
    Ok {
        id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },

    #[serde(rename = "error")]
    Error {
        id: Option<Uuid>,
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },

    // ── Subscriptions ───────────────────────────────────────────────────
    #[serde(rename = "subscribe")]
    Subscribe { id: Uuid, project_id: Uuid },

    #[serde(rename = "unsubscribe")]
    Unsubscribe { id: Uuid, project_id: Uuid },

    // ── Registry: roles ─────────────────────────────────────────────────
    #[serde(rename = "role.register")]
    RoleRegister {
        id: Uuid,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(default)]
        order: i32,
        #[serde(default)]
        role_class: RoleClass,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path_template: Option<String>,
        #[serde(default)]
        aliases: BTreeMap<String, String>,
    },

    #[serde(rename = "role.rename")]
    RoleRename {
        id: Uuid,
        old_name: String,
        new_name: String,
    },

    #[serde(rename = "role.rename_label")]
    RoleRenameLabel {
        id: Uuid,
        name: String,
        new_label: String,
    },

    #[serde(rename = "role.update")]
    RoleUpdate {
        id: Uuid,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        order: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path_template: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        aliases: Option<BTreeMap<String, String>>,
    },

    #[serde(rename = "role.delete")]
    RoleDelete {
        id: Uuid,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        migrate_to: Option<String>,
    },

    #[serde(rename = "role.list")]
    RoleList { id: Uuid },

    // ── Registry: relationship types ────────────────────────────────────
    #[serde(rename = "rel_type.register")]
    RelTypeRegister {
        id: Uuid,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(default)]
        description: String,
        #[serde(default)]
        directionality: Directionality,
    },

    #[serde(rename = "rel_type.rename")]
    RelTypeRename {
        id: Uuid,
        old_name: String,
        new_name: String,
    },

    #[serde(rename = "rel_type.rename_label")]
    RelTypeRenameLabel {
        id: Uuid,
        name: String,
        new_label: String,
    },

    #[serde(rename = "rel_type.delete")]
    RelTypeDelete {
        id: Uuid,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        migrate_to: Option<String>,
    },

    #[serde(rename = "rel_type.list")]
    RelTypeList { id: Uuid },

    // ── Projects ────────────────────────────────────────────────────────
    #[serde(rename = "project.create")]
    ProjectCreate {
        id: Uuid,
        name: String,
        code: String,
        #[serde(default)]
        metadata: JsonMap,
    },

    #[serde(rename = "project.update")]
    ProjectUpdate {
        id: Uuid,
        project_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },

    #[serde(rename = "project.get")]
    ProjectGet { id: Uuid, project_id: Uuid },

    #[serde(rename = "project.list")]
    ProjectList { id: Uuid },

    #[serde(rename = "project.delete")]
    ProjectDelete { id: Uuid, project_id: Uuid },

    // ── Entities ────────────────────────────────────────────────────────
    #[serde(rename = "entity.create")]
    EntityCreate {
        id: Uuid,
        entity_type: String,
        project_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        #[serde(default)]
        attributes: JsonMap,
    },

    #[serde(rename = "entity.update")]
    EntityUpdate {
        id: Uuid,
        entity_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attributes: Option<JsonMap>,
    },

    #[serde(rename = "entity.get")]
    EntityGet { id: Uuid, entity_id: Uuid },

    #[serde(rename = "entity.list")]
    EntityList {
        id: Uuid,
        entity_type: String,
        project_id: Uuid,
    },

    #[serde(rename = "entity.delete")]
    EntityDelete { id: Uuid, entity_id: Uuid },

    // ── Graph ───────────────────────────────────────────────────────────
    #[serde(rename = "relationship.create")]
    RelationshipCreate {
        id: Uuid,
        source_id: Uuid,
        target_id: Uuid,
        rel_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attributes: Option<JsonMap>,
    },

    #[serde(rename = "relationship.remove")]
    RelationshipRemove {
        id: Uuid,
        source_id: Uuid,
        target_id: Uuid,
        rel_type: String,
    },

    #[serde(rename = "location.add")]
    LocationAdd {
        id: Uuid,
        entity_id: Uuid,
        path: String,
        #[serde(default)]
        storage_type: StorageType,
        #[serde(default)]
        priority: i32,
    },

    #[serde(rename = "location.remove")]
    LocationRemove {
        id: Uuid,
        entity_id: Uuid,
        path: String,
    },

    // ── Queries ─────────────────────────────────────────────────────────
    #[serde(rename = "query.dependents")]
    QueryDependents { id: Uuid, entity_id: Uuid },

    #[serde(rename = "query.dependencies")]
    QueryDependencies { id: Uuid, entity_id: Uuid },

    #[serde(rename = "query.shot_stack")]
    QueryShotStack { id: Uuid, shot_id: Uuid },

    #[serde(rename = "query.events")]
    QueryEvents {
        id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity_id: Option<Uuid>,
        #[serde(default = "default_event_limit")]
        limit: u32,
    },

    // ── Server push ─────────────────────────────────────────────────────
    #[serde(rename = "event")]
    Event(EventFrame),
}

impl Message {
    /// Deserialize a frame, distinguishing the failure modes the router
    /// cares about (unknown type vs. known type with a bad payload).
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed {
            reason: e.to_string(),
        })?;
        let obj = value.as_object().ok_or(ProtocolError::NotAnObject)?;
        let msg_type = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_string();
        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok());
        if !Self::is_known_type(&msg_type) {
            return Err(ProtocolError::UnknownType { msg_type, id });
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
            msg_type,
            id,
            reason: e.to_string(),
        })
    }

    /// Serialize to a JSON string
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialize(e.to_string()))
    }

    /// The wire value of the `type` field
    pub fn msg_type(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Welcome { .. } => "welcome",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Bye { .. } => "bye",
            Self::Ok { .. } => "ok",
            Self::Error { .. } => "error",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::RoleRegister { .. } => "role.register",
            Self::RoleRename { .. } => "role.rename",
            Self::RoleRenameLabel { .. } => "role.rename_label",
            Self::RoleUpdate { .. } => "role.update",
            Self::RoleDelete { .. } => "role.delete",
            Self::RoleList { .. } => "role.list",
            Self::RelTypeRegister { .. } => "rel_type.register",
            Self::RelTypeRename { .. } => "rel_type.rename",
            Self::RelTypeRenameLabel { .. } => "rel_type.rename_label",
            Self::RelTypeDelete { .. } => "rel_type.delete",
            Self::RelTypeList { .. } => "rel_type.list",
            Self::ProjectCreate { .. } => "project.create",
            Self::ProjectUpdate { .. } => "project.update",
            Self::ProjectGet { .. } => "project.get",
            Self::ProjectList { .. } => "project.list",
            Self::ProjectDelete { .. } => "project.delete",
            Self::EntityCreate { .. } => "entity.create",
            Self::EntityUpdate { .. } => "entity.update",
            Self::EntityGet { .. } => "entity.get",
            Self::EntityList { .. } => "entity.list",
            Self::EntityDelete { .. } => "entity.delete",
            Self::RelationshipCreate { .. } => "relationship.create",
            Self::RelationshipRemove { .. } => "relationship.remove",
            Self::LocationAdd { .. } => "location.add",
            Self::LocationRemove { .. } => "location.remove",
            Self::QueryDependents { .. } => "query.dependents",
            Self::QueryDependencies { .. } => "query.dependencies",
            Self::QueryShotStack { .. } => "query.shot_stack",
            Self::QueryEvents { .. } => "query.events",
            Self::Event(_) => "event",
        }
    }

    /// The request id, for frames that carry one
    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            Self::Hello { id, .. }
            | Self::Welcome { id, .. }
            | Self::Ping { id, .. }
            | Self::Pong { id, .. }
            | Self::Ok { id, .. }
            | Self::Subscribe { id, .. }
            | Self::Unsubscribe { id, .. }
            | Self::RoleRegister { id, .. }
            | Self::RoleRename { id, .. }
            | Self::RoleRenameLabel { id, .. }
            | Self::RoleUpdate { id, .. }
            | Self::RoleDelete { id, .. }
            | Self::RoleList { id }
            | Self::RelTypeRegister { id, .. }
            | Self::RelTypeRename { id, .. }
            | Self::RelTypeRenameLabel { id, .. }
            | Self::RelTypeDelete { id, .. }
            | Self::RelTypeList { id }
            | Self::ProjectCreate { id, .. }
            | Self::ProjectUpdate { id, .. }
            | Self::ProjectGet { id, .. }
            | Self::ProjectList { id }
            | Self::ProjectDelete { id, .. }
            | Self::EntityCreate { id, .. }
            | Self::EntityUpdate { id, .. }
            | Self::EntityGet { id, .. }
            | Self::EntityList { id, .. }
            | Self::EntityDelete { id, .. }
            | Self::RelationshipCreate { id, .. }
            | Self::RelationshipRemove { id, .. }
            | Self::LocationAdd { id, .. }
            | Self::LocationRemove { id, .. }
            | Self::QueryDependents { id, .. }
            | Self::QueryDependencies { id, .. }
            | Self::QueryShotStack { id, .. }
            | Self::QueryEvents { id, .. } => Some(*id),
            Self::Error { id, .. } => *id,
            Self::Bye { .. } | Self::Event(_) => None,
        }
    }

    /// Whether `msg_type` names a variant this protocol version understands
    pub fn is_known_type(msg_type: &str) -> bool {
        matches!(
            msg_type,
            "hello"
                | "welcome"
                | "ping"
                | "pong"
                | "bye"
                | "ok"
                | "error"
                | "subscribe"
                | "unsubscribe"
                | "role.register"
                | "role.rename"
                | "role.rename_label"
                | "role.update"
                | "role.delete"
                | "role.list"
                | "rel_type.register"
                | "rel_type.rename"
                | "rel_type.rename_label"
                | "rel_type.delete"
                | "rel_type.list"
                | "project.create"
                | "project.update"
                | "project.get"
                | "project.list"
                | "project.delete"
                | "entity.create"
                | "entity.update"
                | "entity.get"
                | "entity.list"
                | "entity.delete"
                | "relationship.create"
                | "relationship.remove"
                | "location.add"
                | "location.remove"
                | "query.dependents"
                | "query.dependencies"
                | "query.shot_stack"
                | "query.events"
                | "event"
        )
    }

    // ── Constructors: client → server ───────────────────────────────────

    pub fn hello(
        client_name: impl Into<String>,
        endpoint_type: impl Into<String>,
        capabilities: JsonMap,
        last_event_id: Option<Uuid>,
    ) -> Self {
        Self::Hello {
            id: Uuid::new_v4(),
            client_name: client_name.into(),
            endpoint_type: endpoint_type.into(),
            capabilities,
            last_event_id,
        }
    }

    pub fn ping() -> Self {
        Self::Ping { id: Uuid::new_v4() }
    }

    pub fn bye(reason: impl Into<String>) -> Self {
        Self::Bye {
            reason: reason.into(),
        }
    }

    pub fn subscribe(project_id: Uuid) -> Self {
        Self::Subscribe {
            id: Uuid::new_v4(),
            project_id,
        }
    }

    pub fn unsubscribe(project_id: Uuid) -> Self {
        Self::Unsubscribe {
            id: Uuid::new_v4(),
            project_id,
        }
    }

    pub fn role_register(
        name: impl Into<String>,
        label: Option<String>,
        order: i32,
        role_class: RoleClass,
        path_template: Option<String>,
        aliases: BTreeMap<String, String>,
    ) -> Self {
        Self::RoleRegister {
            id: Uuid::new_v4(),
            name: name.into(),
            label,
            order,
            role_class,
            path_template,
            aliases,
        }
    }

    pub fn role_rename(old_name: impl Into<String>, new_name: impl Into<String>) -> Self {
        Self::RoleRename {
            id: Uuid::new_v4(),
            old_name: old_name.into(),
            new_name: new_name.into(),
        }
    }

    pub fn role_rename_label(name: impl Into<String>, new_label: impl Into<String>) -> Self {
        Self::RoleRenameLabel {
            id: Uuid::new_v4(),
            name: name.into(),
            new_label: new_label.into(),
        }
    }

    pub fn role_delete(name: impl Into<String>, migrate_to: Option<String>) -> Self {
        Self::RoleDelete {
            id: Uuid::new_v4(),
            name: name.into(),
            migrate_to,
        }
    }

    pub fn role_list() -> Self {
        Self::RoleList { id: Uuid::new_v4() }
    }

    pub fn rel_type_register(
        name: impl Into<String>,
        label: Option<String>,
        description: impl Into<String>,
        directionality: Directionality,
    ) -> Self {
        Self::RelTypeRegister {
            id: Uuid::new_v4(),
            name: name.into(),
            label,
            description: description.into(),
            directionality,
        }
    }

    pub fn rel_type_rename(old_name: impl Into<String>, new_name: impl Into<String>) -> Self {
        Self::RelTypeRename {
            id: Uuid::new_v4(),
            old_name: old_name.into(),
            new_name: new_name.into(),
        }
    }

    pub fn rel_type_delete(name: impl Into<String>, migrate_to: Option<String>) -> Self {
        Self::RelTypeDelete {
            id: Uuid::new_v4(),
            name: name.into(),
            migrate_to,
        }
    }

    pub fn rel_type_list() -> Self {
        Self::RelTypeList { id: Uuid::new_v4() }
    }

    pub fn project_create(
        name: impl Into<String>,
        code: impl Into<String>,
        metadata: JsonMap,
    ) -> Self {
        Self::ProjectCreate {
            id: Uuid::new_v4(),
            name: name.into(),
            code: code.into(),
            metadata,
        }
    }

    pub fn project_update(project_id: Uuid, name: Option<String>, code: Option<String>) -> Self {
        Self::ProjectUpdate {
            id: Uuid::new_v4(),
            project_id,
            name,
            code,
        }
    }

    pub fn project_get(project_id: Uuid) -> Self {
        Self::ProjectGet {
            id: Uuid::new_v4(),
            project_id,
        }
    }

    pub fn project_list() -> Self {
        Self::ProjectList { id: Uuid::new_v4() }
    }

    pub fn project_delete(project_id: Uuid) -> Self {
        Self::ProjectDelete {
            id: Uuid::new_v4(),
            project_id,
        }
    }

    pub fn entity_create(
        entity_type: impl Into<String>,
        project_id: Uuid,
        name: Option<String>,
        status: Option<String>,
        attributes: JsonMap,
    ) -> Self {
        Self::EntityCreate {
            id: Uuid::new_v4(),
            entity_type: entity_type.into(),
            project_id,
            name,
            status,
            attributes,
        }
    }

    pub fn entity_update(
        entity_id: Uuid,
        name: Option<String>,
        status: Option<String>,
        attributes: Option<JsonMap>,
    ) -> Self {
        Self::EntityUpdate {
            id: Uuid::new_v4(),
            entity_id,
            name,
            status,
            attributes,
        }
    }

    pub fn entity_get(entity_id: Uuid) -> Self {
        Self::EntityGet {
            id: Uuid::new_v4(),
            entity_id,
        }
    }

    pub fn entity_list(entity_type: impl Into<String>, project_id: Uuid) -> Self {
        Self::EntityList {
            id: Uuid::new_v4(),
            entity_type: entity_type.into(),
            project_id,
        }
    }

    pub fn entity_delete(entity_id: Uuid) -> Self {
        Self::EntityDelete {
            id: Uuid::new_v4(),
            entity_id,
        }
    }

    pub fn relationship_create(
        source_id: Uuid,
        target_id: Uuid,
        rel_type: impl Into<String>,
        attributes: Option<JsonMap>,
    ) -> Self {
        Self::RelationshipCreate {
            id: Uuid::new_v4(),
            source_id,
            target_id,
            rel_type: rel_type.into(),
            attributes,
        }
    }

    pub fn relationship_remove(
        source_id: Uuid,
        target_id: Uuid,
        rel_type: impl Into<String>,
    ) -> Self {
        Self::RelationshipRemove {
            id: Uuid::new_v4(),
            source_id,
            target_id,
            rel_type: rel_type.into(),
        }
    }

    pub fn location_add(
        entity_id: Uuid,
        path: impl Into<String>,
        storage_type: StorageType,
        priority: i32,
    ) -> Self {
        Self::LocationAdd {
            id: Uuid::new_v4(),
            entity_id,
            path: path.into(),
            storage_type,
            priority,
        }
    }

    pub fn location_remove(entity_id: Uuid, path: impl Into<String>) -> Self {
        Self::LocationRemove {
            id: Uuid::new_v4(),
            entity_id,
            path: path.into(),
        }
    }

    pub fn query_dependents(entity_id: Uuid) -> Self {
        Self::QueryDependents {
            id: Uuid::new_v4(),
            entity_id,
        }
    }

    pub fn query_dependencies(entity_id: Uuid) -> Self {
        Self::QueryDependencies {
            id: Uuid::new_v4(),
            entity_id,
        }
    }

    pub fn query_shot_stack(shot_id: Uuid) -> Self {
        Self::QueryShotStack {
            id: Uuid::new_v4(),
            shot_id,
        }
    }

    pub fn query_events(project_id: Option<Uuid>, entity_id: Option<Uuid>, limit: u32) -> Self {
        Self::QueryEvents {
            id: Uuid::new_v4(),
            project_id,
            entity_id,
            limit,
        }
    }

    // ── Constructors: server → client ───────────────────────────────────

    pub fn ok(request_id: Uuid, result: Option<Value>) -> Self {
        Self::Ok {
            id: request_id,
            result,
        }
    }

    pub fn error(
        request_id: Option<Uuid>,
        code: ErrorCode,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> Self {
        Self::Error {
            id: request_id,
            code,
            message: message.into(),
            details,
        }
    }

    pub fn welcome(
        request_id: Uuid,
        session_id: Uuid,
        server_version: impl Into<String>,
        registry_summary: Value,
    ) -> Self {
        Self::Welcome {
            id: request_id,
            session_id,
            server_version: server_version.into(),
            registry_summary,
        }
    }

    pub fn pong(request_id: Uuid) -> Self {
        Self::Pong { id: request_id }
    }

    pub fn event(
        event_id: Uuid,
        event_type: impl Into<String>,
        project_id: Option<Uuid>,
        entity_id: Option<Uuid>,
        payload: Value,
    ) -> Self {
        Self::Event(EventFrame {
            event_id,
            event_type: event_type.into(),
            project_id,
            entity_id,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(msg: Message) {
        let encoded = msg.to_json().unwrap();
        let decoded = Message::parse(&encoded).unwrap();
        assert_eq!(msg, decoded, "round-trip mismatch for {}", msg.msg_type());
    }

    #[test]
    fn test_roundtrip_all_constructors() {
        let pid = Uuid::new_v4();
        let eid = Uuid::new_v4();
        roundtrip(Message::hello("flame_a", "flame", JsonMap::new(), Some(eid)));
        roundtrip(Message::ping());
        roundtrip(Message::bye("client_shutdown"));
        roundtrip(Message::subscribe(pid));
        roundtrip(Message::unsubscribe(pid));
        roundtrip(Message::role_register(
            "paint",
            Some("Paint Pass".into()),
            7,
            RoleClass::Track,
            None,
            BTreeMap::new(),
        ));
        roundtrip(Message::role_rename("primary", "hero"));
        roundtrip(Message::role_rename_label("primary", "Hero Plate"));
        roundtrip(Message::role_delete("paint", Some("primary".into())));
        roundtrip(Message::role_list());
        roundtrip(Message::rel_type_register(
            "blocks",
            None,
            "Source blocks target",
            Directionality::Forward,
        ));
        roundtrip(Message::rel_type_rename("blocks", "gates"));
        roundtrip(Message::rel_type_delete("gates", None));
        roundtrip(Message::rel_type_list());
        roundtrip(Message::project_create("Episode 60", "EP60", JsonMap::new()));
        roundtrip(Message::project_update(pid, Some("EP60x".into()), None));
        roundtrip(Message::project_get(pid));
        roundtrip(Message::project_list());
        roundtrip(Message::project_delete(pid));
        roundtrip(Message::entity_create(
            "shot",
            pid,
            Some("EP60_010".into()),
            Some("pending".into()),
            JsonMap::new(),
        ));
        roundtrip(Message::entity_update(eid, None, Some("review".into()), None));
        roundtrip(Message::entity_get(eid));
        roundtrip(Message::entity_list("shot", pid));
        roundtrip(Message::entity_delete(eid));
        roundtrip(Message::relationship_create(eid, pid, "member_of", None));
        roundtrip(Message::relationship_remove(eid, pid, "member_of"));
        roundtrip(Message::location_add(eid, "/mnt/x", StorageType::Network, 5));
        roundtrip(Message::location_remove(eid, "/mnt/x"));
        roundtrip(Message::query_dependents(eid));
        roundtrip(Message::query_dependencies(eid));
        roundtrip(Message::query_shot_stack(eid));
        roundtrip(Message::query_events(Some(pid), None, 50));
        roundtrip(Message::ok(eid, Some(json!({"entity_id": eid}))));
        roundtrip(Message::error(
            Some(eid),
            ErrorCode::OrphanBlocked,
            "still referenced",
            Some(json!({"entity_ids": []})),
        ));
        roundtrip(Message::welcome(eid, pid, "0.1.0", json!({"roles": []})));
        roundtrip(Message::pong(eid));
        roundtrip(Message::event(
            eid,
            "role.registered",
            Some(pid),
            None,
            json!({"name": "r1"}),
        ));
    }

    #[test]
    fn test_every_constructor_type_is_known() {
        let samples = [
            Message::ping(),
            Message::role_list(),
            Message::project_list(),
            Message::rel_type_list(),
            Message::event(Uuid::new_v4(), "x", None, None, json!({})),
        ];
        for msg in samples {
            assert!(Message::is_known_type(msg.msg_type()));
        }
    }

    #[test]
    fn test_parse_rejects_non_object() {
        assert!(matches!(
            Message::parse("[1, 2, 3]"),
            Err(ProtocolError::NotAnObject)
        ));
    }

    #[test]
    fn test_parse_rejects_missing_type() {
        assert!(matches!(
            Message::parse(r#"{"id": "x"}"#),
            Err(ProtocolError::MissingType)
        ));
    }

    #[test]
    fn test_parse_unknown_type_keeps_request_id() {
        let id = Uuid::new_v4();
        let raw = format!(r#"{{"type": "warp.engage", "id": "{}"}}"#, id);
        match Message::parse(&raw) {
            Err(ProtocolError::UnknownType { msg_type, id: got }) => {
                assert_eq!(msg_type, "warp.engage");
                assert_eq!(got, Some(id));
            }
            other => panic!("expected UnknownType, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_invalid_payload_keeps_request_id() {
        let id = Uuid::new_v4();
        let raw = format!(
            r#"{{"type": "subscribe", "id": "{}", "project_id": "not-a-uuid"}}"#,
            id
        );
        match Message::parse(&raw) {
            Err(ProtocolError::InvalidPayload { msg_type, id: got, .. }) => {
                assert_eq!(msg_type, "subscribe");
                assert_eq!(got, Some(id));
            }
            other => panic!("expected InvalidPayload, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_malformed_json() {
        assert!(matches!(
            Message::parse("{nope"),
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[test]
    fn test_error_code_wire_spelling() {
        let encoded = serde_json::to_string(&ErrorCode::OrphanBlocked).unwrap();
        assert_eq!(encoded, "\"ORPHAN_BLOCKED\"");
        assert_eq!(ErrorCode::OrphanBlocked.to_string(), "ORPHAN_BLOCKED");
    }

    #[test]
    fn test_unknown_type_error_reply() {
        let err = Message::parse(r#"{"type": "warp.engage"}"#).unwrap_err();
        match err.to_error_message() {
            Message::Error { code, id, .. } => {
                assert_eq!(code, ErrorCode::UnknownType);
                assert_eq!(id, None);
            }
            other => panic!("expected error message, got {:?}", other),
        }
    }

    #[test]
    fn test_event_has_no_request_id() {
        let msg = Message::event(Uuid::new_v4(), "entity.updated", None, None, json!({}));
        assert_eq!(msg.request_id(), None);
    }
}
