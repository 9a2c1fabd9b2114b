//! Message router.
//!
//! Every frame that arrives from a client lands here. Each message type
//! maps to one handler, and every mutating handler follows the same fixed
//! order:
//!
//!   1. Validate the payload (`INVALID` on failure).
//!   2. Mutate the in-memory registry; typed registry errors map to wire
//!      codes.
//!   3. Open one transaction for the write(s) AND the event append, so a
//!      reader can never see a state mutation without its event.
//!   4. Commit. If the commit fails, revert the in-memory change and
//!      answer `INTERNAL`.
//!   5. After commit, broadcast the event with the originator excluded.
//!   6. Reply `ok` or `error`.
//!
//! The router is the only place that touches both the store and the
//! connection layer. Errors never crash the server or drop the client.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::{json, Value};
use uuid::Uuid;

use crate::core::entities::{
    Asset, Entity, EntityType, Layer, Media, Project, Sequence, Shot, Stack, Version,
};
use crate::core::registry::{
    Registry, RegistryError, RelationshipTypeSpec, RoleSpec, RoleUpdate as RegistryRoleUpdate,
};
use crate::core::traits::{Location, Relationship, StorageType};
use crate::core::vocabulary::{FrameRate, RoleClass, Status, Timecode};
use crate::error::{Error, Result};
use crate::protocol::{ErrorCode, JsonMap, Message};
use crate::server::connections::ConnectionManager;
use crate::store::{
    is_foreign_key_violation, is_unique_violation, ClientSessionRepo, EntityRepo, EventFilter,
    EventRepo, LocationRepo, NewEvent, ProjectRepo, RegistryRepo, RelationshipRepo, Store,
};

/// Who sent the frame being dispatched
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub session_id: Uuid,
    pub client_name: String,
}

/// Dispatches incoming messages to handlers
pub struct Router {
    connections: Arc<ConnectionManager>,
    registry: Arc<RwLock<Registry>>,
    store: Store,
}

fn ok(id: Uuid, result: Value) -> Message {
    Message::ok(id, Some(result))
}

fn ok_empty(id: Uuid) -> Message {
    Message::ok(id, None)
}

fn invalid(id: Uuid, message: impl Into<String>) -> Message {
    Message::error(Some(id), ErrorCode::Invalid, message, None)
}

fn not_found(id: Uuid, message: impl Into<String>) -> Message {
    Message::error(Some(id), ErrorCode::NotFound, message, None)
}

/// Map a typed registry failure to its wire code
fn registry_error(id: Uuid, err: &RegistryError, details: Option<Value>) -> Message {
    let code = match err {
        RegistryError::NotFound(_) => ErrorCode::NotFound,
        RegistryError::AlreadyExists(_) => ErrorCode::AlreadyExists,
        RegistryError::Orphaned { .. } => ErrorCode::OrphanBlocked,
        RegistryError::Protected(_) => ErrorCode::Protected,
    };
    Message::error(Some(id), code, err.to_string(), details)
}

impl Router {
    pub fn new(
        connections: Arc<ConnectionManager>,
        registry: Arc<RwLock<Registry>>,
        store: Store,
    ) -> Self {
        Self {
            connections,
            registry,
            store,
        }
    }

    fn registry_read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn registry_write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Persistence failures roll back and surface as `INTERNAL`; the log
    /// keeps the full chain, the client only the message.
    fn internal(&self, id: Uuid, err: &Error, context: &str) -> Message {
        tracing::error!(error = %err, context = %context, "Handler failed");
        Message::error(Some(id), ErrorCode::Internal, err.to_string(), None)
    }

    /// Route one message. `None` means no reply goes out (`bye`).
    pub async fn dispatch(&self, msg: Message, ctx: &RequestContext) -> Option<Message> {
        let reply = match msg {
            Message::Ping { id } => {
                self.heartbeat(ctx.session_id).await;
                Message::pong(id)
            }
            Message::Bye { reason } => {
                tracing::debug!(
                    session_id = %ctx.session_id,
                    reason = %reason,
                    "Client said bye"
                );
                return None;
            }
            Message::Hello { id, .. } => invalid(id, "Connection already completed its handshake"),

            Message::Subscribe { id, project_id } => {
                self.connections.subscribe(ctx.session_id, project_id);
                ok(id, json!({ "subscribed": project_id }))
            }
            Message::Unsubscribe { id, project_id } => {
                self.connections.unsubscribe(ctx.session_id, project_id);
                ok(id, json!({ "unsubscribed": project_id }))
            }

            Message::RoleRegister {
                id,
                name,
                label,
                order,
                role_class,
                path_template,
                aliases,
            } => {
                self.handle_role_register(id, name, label, order, role_class, path_template, aliases, ctx)
                    .await
            }
            Message::RoleRename { id, old_name, new_name } => {
                self.handle_role_rename(id, old_name, new_name, ctx).await
            }
            Message::RoleRenameLabel { id, name, new_label } => {
                self.handle_role_rename_label(id, name, new_label, ctx).await
            }
            Message::RoleUpdate {
                id,
                name,
                label,
                order,
                path_template,
                aliases,
            } => {
                self.handle_role_update(id, name, label, order, path_template, aliases, ctx)
                    .await
            }
            Message::RoleDelete { id, name, migrate_to } => {
                self.handle_role_delete(id, name, migrate_to, ctx).await
            }
            Message::RoleList { id } => self.handle_role_list(id),

            Message::RelTypeRegister {
                id,
                name,
                label,
                description,
                directionality,
            } => {
                self.handle_rel_type_register(id, name, label, description, directionality, ctx)
                    .await
            }
            Message::RelTypeRename { id, old_name, new_name } => {
                self.handle_rel_type_rename(id, old_name, new_name, ctx).await
            }
            Message::RelTypeRenameLabel { id, name, new_label } => {
                self.handle_rel_type_rename_label(id, name, new_label, ctx).await
            }
            Message::RelTypeDelete { id, name, migrate_to } => {
                self.handle_rel_type_delete(id, name, migrate_to, ctx).await
            }
            Message::RelTypeList { id } => self.handle_rel_type_list(id),

            Message::ProjectCreate { id, name, code, metadata } => {
                self.handle_project_create(id, name, code, metadata, ctx).await
            }
            Message::ProjectUpdate { id, project_id, name, code } => {
                self.handle_project_update(id, project_id, name, code, ctx).await
            }
            Message::ProjectGet { id, project_id } => self.handle_project_get(id, project_id).await,
            Message::ProjectList { id } => self.handle_project_list(id).await,
            Message::ProjectDelete { id, project_id } => {
                self.handle_project_delete(id, project_id, ctx).await
            }

            Message::EntityCreate {
                id,
                entity_type,
                project_id,
                name,
                status,
                attributes,
            } => {
                self.handle_entity_create(id, entity_type, project_id, name, status, attributes, ctx)
                    .await
            }
            Message::EntityUpdate {
                id,
                entity_id,
                name,
                status,
                attributes,
            } => {
                self.handle_entity_update(id, entity_id, name, status, attributes, ctx)
                    .await
            }
            Message::EntityGet { id, entity_id } => self.handle_entity_get(id, entity_id).await,
            Message::EntityList { id, entity_type, project_id } => {
                self.handle_entity_list(id, entity_type, project_id).await
            }
            Message::EntityDelete { id, entity_id } => {
                self.handle_entity_delete(id, entity_id, ctx).await
            }

            Message::RelationshipCreate {
                id,
                source_id,
                target_id,
                rel_type,
                attributes,
            } => {
                self.handle_relationship_create(id, source_id, target_id, rel_type, attributes, ctx)
                    .await
            }
            Message::RelationshipRemove {
                id,
                source_id,
                target_id,
                rel_type,
            } => {
                self.handle_relationship_remove(id, source_id, target_id, rel_type, ctx)
                    .await
            }
            Message::LocationAdd {
                id,
                entity_id,
                path,
                storage_type,
                priority,
            } => {
                self.handle_location_add(id, entity_id, path, storage_type, priority, ctx)
                    .await
            }
            Message::LocationRemove { id, entity_id, path } => {
                self.handle_location_remove(id, entity_id, path, ctx).await
            }

            Message::QueryDependents { id, entity_id } => {
                self.handle_query_dependents(id, entity_id).await
            }
            Message::QueryDependencies { id, entity_id } => {
                self.handle_query_dependencies(id, entity_id).await
            }
            Message::QueryShotStack { id, shot_id } => {
                self.handle_query_shot_stack(id, shot_id).await
            }
            Message::QueryEvents {
                id,
                project_id,
                entity_id,
                limit,
            } => self.handle_query_events(id, project_id, entity_id, limit).await,

            // Server-side frames have no inbound handler
            other => Message::error(
                other.request_id(),
                ErrorCode::UnknownType,
                format!("No handler for message type {:?}", other.msg_type()),
                None,
            ),
        };
        Some(reply)
    }

    /// Refresh the session row's liveness stamp. Best-effort.
    async fn heartbeat(&self, session_id: Uuid) {
        let result: Result<()> = async {
            let mut conn = self.store.acquire().await?;
            ClientSessionRepo::new(&mut conn).heartbeat(session_id).await
        }
        .await;
        if let Err(e) = result {
            tracing::debug!(session_id = %session_id, error = %e, "Heartbeat write failed");
        }
    }

    /// Mark the session row closed. Called by the connection task on
    /// disconnect.
    pub async fn close_session(&self, session_id: Uuid) {
        let result: Result<()> = async {
            let mut conn = self.store.acquire().await?;
            ClientSessionRepo::new(&mut conn).close(session_id).await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to close session row");
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Registry: roles
    // ────────────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn handle_role_register(
        &self,
        id: Uuid,
        name: String,
        label: Option<String>,
        order: i32,
        role_class: RoleClass,
        path_template: Option<String>,
        aliases: std::collections::BTreeMap<String, String>,
        ctx: &RequestContext,
    ) -> Message {
        if name.trim().is_empty() {
            return invalid(id, "name is required");
        }
        let defn = {
            let mut registry = self.registry_write();
            let spec = RoleSpec {
                label,
                order,
                role_class,
                path_template,
                aliases,
                ..Default::default()
            };
            match registry.roles.register(&name, spec) {
                Ok(defn) => defn.clone(),
                Err(e) => return registry_error(id, &e, None),
            }
        };

        let payload = json!({ "name": name, "key": defn.key });
        let persisted: Result<crate::store::EventRecord> = async {
            let mut tx = self.store.begin().await?;
            RegistryRepo::new(&mut tx).save_role(&defn).await?;
            let event = EventRepo::new(&mut tx)
                .append(
                    NewEvent::new("role.registered", payload.clone())
                        .session(ctx.session_id, &ctx.client_name),
                )
                .await?;
            tx.commit().await?;
            Ok(event)
        }
        .await;

        match persisted {
            Ok(event) => {
                self.connections.broadcast_event(
                    event.id,
                    "role.registered",
                    payload,
                    None,
                    None,
                    Some(ctx.session_id),
                );
                ok(id, json!({ "key": defn.key, "name": name }))
            }
            Err(e) => {
                if let Err(revert) = self.registry_write().roles.delete(&name, None) {
                    tracing::error!(error = %revert, "Failed to revert role registration");
                }
                self.internal(id, &e, "role.register")
            }
        }
    }

    async fn handle_role_rename(
        &self,
        id: Uuid,
        old_name: String,
        new_name: String,
        ctx: &RequestContext,
    ) -> Message {
        if old_name.trim().is_empty() || new_name.trim().is_empty() {
            return invalid(id, "old_name and new_name are required");
        }
        let defn = {
            let mut registry = self.registry_write();
            match registry.roles.rename(&old_name, &new_name) {
                Ok(defn) => defn.clone(),
                Err(e) => return registry_error(id, &e, None),
            }
        };

        let payload = json!({ "old_name": old_name, "new_name": new_name, "key": defn.key });
        let persisted: Result<crate::store::EventRecord> = async {
            let mut tx = self.store.begin().await?;
            RegistryRepo::new(&mut tx).save_role(&defn).await?;
            let event = EventRepo::new(&mut tx)
                .append(
                    NewEvent::new("role.renamed", payload.clone())
                        .session(ctx.session_id, &ctx.client_name),
                )
                .await?;
            tx.commit().await?;
            Ok(event)
        }
        .await;

        match persisted {
            Ok(event) => {
                self.connections.broadcast_event(
                    event.id,
                    "role.renamed",
                    payload,
                    None,
                    None,
                    Some(ctx.session_id),
                );
                ok(id, json!({ "key": defn.key, "new_name": new_name }))
            }
            Err(e) => {
                if let Err(revert) = self.registry_write().roles.rename(&new_name, &old_name) {
                    tracing::error!(error = %revert, "Failed to revert role rename");
                }
                self.internal(id, &e, "role.rename")
            }
        }
    }

    async fn handle_role_rename_label(
        &self,
        id: Uuid,
        name: String,
        new_label: String,
        ctx: &RequestContext,
    ) -> Message {
        if name.trim().is_empty() || new_label.trim().is_empty() {
            return invalid(id, "name and new_label are required");
        }
        let before = match self.registry_read().roles.get_by_name(&name) {
            Ok(defn) => defn.clone(),
            Err(e) => return registry_error(id, &e, None),
        };
        let defn = {
            let mut registry = self.registry_write();
            match registry.roles.rename_label(&name, &new_label) {
                Ok(defn) => defn.clone(),
                Err(e) => return registry_error(id, &e, None),
            }
        };

        let payload = json!({ "name": name, "new_label": new_label, "key": defn.key });
        let persisted: Result<crate::store::EventRecord> = async {
            let mut tx = self.store.begin().await?;
            RegistryRepo::new(&mut tx).save_role(&defn).await?;
            let event = EventRepo::new(&mut tx)
                .append(
                    NewEvent::new("role.label_changed", payload.clone())
                        .session(ctx.session_id, &ctx.client_name),
                )
                .await?;
            tx.commit().await?;
            Ok(event)
        }
        .await;

        match persisted {
            Ok(event) => {
                self.connections.broadcast_event(
                    event.id,
                    "role.label_changed",
                    payload,
                    None,
                    None,
                    Some(ctx.session_id),
                );
                ok_empty(id)
            }
            Err(e) => {
                self.registry_write().roles.restore(before);
                self.internal(id, &e, "role.rename_label")
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_role_update(
        &self,
        id: Uuid,
        name: String,
        label: Option<String>,
        order: Option<i32>,
        path_template: Option<String>,
        aliases: Option<std::collections::BTreeMap<String, String>>,
        ctx: &RequestContext,
    ) -> Message {
        if name.trim().is_empty() {
            return invalid(id, "name is required");
        }
        let before = match self.registry_read().roles.get_by_name(&name) {
            Ok(defn) => defn.clone(),
            Err(e) => return registry_error(id, &e, None),
        };
        let defn = {
            let mut registry = self.registry_write();
            let update = RegistryRoleUpdate {
                label,
                order,
                path_template,
                aliases,
            };
            match registry.roles.update(&name, update) {
                Ok(defn) => defn.clone(),
                Err(e) => return registry_error(id, &e, None),
            }
        };

        let payload = json!({ "name": name, "key": defn.key });
        let persisted: Result<crate::store::EventRecord> = async {
            let mut tx = self.store.begin().await?;
            RegistryRepo::new(&mut tx).save_role(&defn).await?;
            let event = EventRepo::new(&mut tx)
                .append(
                    NewEvent::new("role.updated", payload.clone())
                        .session(ctx.session_id, &ctx.client_name),
                )
                .await?;
            tx.commit().await?;
            Ok(event)
        }
        .await;

        match persisted {
            Ok(event) => {
                self.connections.broadcast_event(
                    event.id,
                    "role.updated",
                    payload,
                    None,
                    None,
                    Some(ctx.session_id),
                );
                ok_empty(id)
            }
            Err(e) => {
                self.registry_write().roles.restore(before);
                self.internal(id, &e, "role.update")
            }
        }
    }

    async fn handle_role_delete(
        &self,
        id: Uuid,
        name: String,
        migrate_to: Option<String>,
        ctx: &RequestContext,
    ) -> Message {
        if name.trim().is_empty() {
            return invalid(id, "name is required");
        }
        let (before, holders) = {
            let registry = self.registry_read();
            let before = match registry.roles.get_by_name(&name) {
                Ok(defn) => defn.clone(),
                Err(e) => return registry_error(id, &e, None),
            };
            let holders = registry.roles.who_references(&name).unwrap_or_default();
            (before, holders)
        };

        let outcome = {
            let mut registry = self.registry_write();
            match registry.roles.delete(&name, migrate_to.as_deref()) {
                Ok(outcome) => outcome,
                Err(e) => {
                    let details = match &e {
                        RegistryError::Orphaned { .. } => Some(json!({
                            "entity_ids": holders.iter().take(20).collect::<Vec<_>>(),
                        })),
                        _ => None,
                    };
                    return registry_error(id, &e, details);
                }
            }
        };

        let migrated = outcome.reassigned.len();
        let payload = json!({
            "name": name,
            "key": outcome.key,
            "migrated": migrated,
            "migrate_to": migrate_to,
        });
        let persisted: Result<crate::store::EventRecord> = async {
            let mut tx = self.store.begin().await?;
            RegistryRepo::new(&mut tx).delete_role(outcome.key).await?;
            if let Some(target) = outcome.migrated_to {
                EntityRepo::new(&mut tx)
                    .rewrite_role_key(outcome.key, target)
                    .await?;
            }
            let event = EventRepo::new(&mut tx)
                .append(
                    NewEvent::new("role.deleted", payload.clone())
                        .session(ctx.session_id, &ctx.client_name),
                )
                .await?;
            tx.commit().await?;
            Ok(event)
        }
        .await;

        match persisted {
            Ok(event) => {
                self.connections.broadcast_event(
                    event.id,
                    "role.deleted",
                    payload,
                    None,
                    None,
                    Some(ctx.session_id),
                );
                ok(id, json!({ "migrated": migrated }))
            }
            Err(e) => {
                if outcome.migrated_to.is_some() {
                    // Holders were already reassigned in memory; the
                    // persisted state of record reconverges the delete on
                    // the next restart
                    tracing::error!(
                        role = %name,
                        error = %e,
                        "Role delete-with-migration failed to persist; will reconverge from store"
                    );
                } else {
                    self.registry_write().roles.restore(before);
                }
                self.internal(id, &e, "role.delete")
            }
        }
    }

    fn handle_role_list(&self, id: Uuid) -> Message {
        let registry = self.registry_read();
        let roles: Vec<Value> = registry
            .roles
            .all()
            .into_iter()
            .map(|defn| {
                json!({
                    "key": defn.key,
                    "name": defn.name,
                    "label": defn.label,
                    "order": defn.order,
                    "role_class": defn.role_class,
                    "path_template": defn.path_template,
                    "aliases": defn.aliases,
                    "protected": defn.protected,
                    "ref_count": registry.roles.ref_count(&defn.name).unwrap_or(0),
                })
            })
            .collect();
        ok(id, json!({ "roles": roles }))
    }

    // ────────────────────────────────────────────────────────────────────
    // Registry: relationship types
    // ────────────────────────────────────────────────────────────────────

    async fn handle_rel_type_register(
        &self,
        id: Uuid,
        name: String,
        label: Option<String>,
        description: String,
        directionality: crate::core::registry::Directionality,
        ctx: &RequestContext,
    ) -> Message {
        if name.trim().is_empty() {
            return invalid(id, "name is required");
        }
        let defn = {
            let mut registry = self.registry_write();
            let spec = RelationshipTypeSpec {
                label,
                description,
                directionality,
                ..Default::default()
            };
            match registry.relationship_types.register(&name, spec) {
                Ok(defn) => defn.clone(),
                Err(e) => return registry_error(id, &e, None),
            }
        };

        let payload = json!({ "name": name, "key": defn.key });
        let persisted: Result<crate::store::EventRecord> = async {
            let mut tx = self.store.begin().await?;
            RegistryRepo::new(&mut tx).save_relationship_type(&defn).await?;
            let event = EventRepo::new(&mut tx)
                .append(
                    NewEvent::new("relationship_type.registered", payload.clone())
                        .session(ctx.session_id, &ctx.client_name),
                )
                .await?;
            tx.commit().await?;
            Ok(event)
        }
        .await;

        match persisted {
            Ok(event) => {
                self.connections.broadcast_event(
                    event.id,
                    "relationship_type.registered",
                    payload,
                    None,
                    None,
                    Some(ctx.session_id),
                );
                ok(id, json!({ "key": defn.key, "name": name }))
            }
            Err(e) => {
                if let Err(revert) = self.registry_write().relationship_types.delete(&name, None) {
                    tracing::error!(error = %revert, "Failed to revert relationship type registration");
                }
                self.internal(id, &e, "rel_type.register")
            }
        }
    }

    async fn handle_rel_type_rename(
        &self,
        id: Uuid,
        old_name: String,
        new_name: String,
        ctx: &RequestContext,
    ) -> Message {
        if old_name.trim().is_empty() || new_name.trim().is_empty() {
            return invalid(id, "old_name and new_name are required");
        }
        let defn = {
            let mut registry = self.registry_write();
            match registry.relationship_types.rename(&old_name, &new_name) {
                Ok(defn) => defn.clone(),
                Err(e) => return registry_error(id, &e, None),
            }
        };

        let payload = json!({ "old_name": old_name, "new_name": new_name, "key": defn.key });
        let persisted: Result<crate::store::EventRecord> = async {
            let mut tx = self.store.begin().await?;
            RegistryRepo::new(&mut tx).save_relationship_type(&defn).await?;
            let event = EventRepo::new(&mut tx)
                .append(
                    NewEvent::new("relationship_type.renamed", payload.clone())
                        .session(ctx.session_id, &ctx.client_name),
                )
                .await?;
            tx.commit().await?;
            Ok(event)
        }
        .await;

        match persisted {
            Ok(event) => {
                self.connections.broadcast_event(
                    event.id,
                    "relationship_type.renamed",
                    payload,
                    None,
                    None,
                    Some(ctx.session_id),
                );
                ok(id, json!({ "key": defn.key, "new_name": new_name }))
            }
            Err(e) => {
                if let Err(revert) = self
                    .registry_write()
                    .relationship_types
                    .rename(&new_name, &old_name)
                {
                    tracing::error!(error = %revert, "Failed to revert relationship type rename");
                }
                self.internal(id, &e, "rel_type.rename")
            }
        }
    }

    async fn handle_rel_type_rename_label(
        &self,
        id: Uuid,
        name: String,
        new_label: String,
        ctx: &RequestContext,
    ) -> Message {
        if name.trim().is_empty() || new_label.trim().is_empty() {
            return invalid(id, "name and new_label are required");
        }
        let before = match self.registry_read().relationship_types.get_by_name(&name) {
            Ok(defn) => defn.clone(),
            Err(e) => return registry_error(id, &e, None),
        };
        let defn = {
            let mut registry = self.registry_write();
            match registry.relationship_types.rename_label(&name, &new_label) {
                Ok(defn) => defn.clone(),
                Err(e) => return registry_error(id, &e, None),
            }
        };

        let payload = json!({ "name": name, "new_label": new_label, "key": defn.key });
        let persisted: Result<crate::store::EventRecord> = async {
            let mut tx = self.store.begin().await?;
            RegistryRepo::new(&mut tx).save_relationship_type(&defn).await?;
            let event = EventRepo::new(&mut tx)
                .append(
                    NewEvent::new("relationship_type.label_changed", payload.clone())
                        .session(ctx.session_id, &ctx.client_name),
                )
                .await?;
            tx.commit().await?;
            Ok(event)
        }
        .await;

        match persisted {
            Ok(event) => {
                self.connections.broadcast_event(
                    event.id,
                    "relationship_type.label_changed",
                    payload,
                    None,
                    None,
                    Some(ctx.session_id),
                );
                ok_empty(id)
            }
            Err(e) => {
                self.registry_write().relationship_types.restore(before);
                self.internal(id, &e, "rel_type.rename_label")
            }
        }
    }

    async fn handle_rel_type_delete(
        &self,
        id: Uuid,
        name: String,
        migrate_to: Option<String>,
        ctx: &RequestContext,
    ) -> Message {
        if name.trim().is_empty() {
            return invalid(id, "name is required");
        }
        let before = match self.registry_read().relationship_types.get_by_name(&name) {
            Ok(defn) => defn.clone(),
            Err(e) => return registry_error(id, &e, None),
        };

        let outcome = {
            let mut registry = self.registry_write();
            match registry
                .relationship_types
                .delete(&name, migrate_to.as_deref())
            {
                Ok(outcome) => outcome,
                Err(e) => return registry_error(id, &e, None),
            }
        };

        let migrated = outcome.reassigned.len();
        let payload = json!({
            "name": name,
            "key": outcome.key,
            "migrated": migrated,
            "migrate_to": migrate_to,
        });
        let persisted: Result<crate::store::EventRecord> = async {
            let mut tx = self.store.begin().await?;
            RegistryRepo::new(&mut tx)
                .delete_relationship_type(outcome.key)
                .await?;
            if let Some(target) = outcome.migrated_to {
                RelationshipRepo::new(&mut tx)
                    .migrate_type(outcome.key, target)
                    .await?;
            }
            let event = EventRepo::new(&mut tx)
                .append(
                    NewEvent::new("relationship_type.deleted", payload.clone())
                        .session(ctx.session_id, &ctx.client_name),
                )
                .await?;
            tx.commit().await?;
            Ok(event)
        }
        .await;

        match persisted {
            Ok(event) => {
                self.connections.broadcast_event(
                    event.id,
                    "relationship_type.deleted",
                    payload,
                    None,
                    None,
                    Some(ctx.session_id),
                );
                ok(id, json!({ "migrated": migrated }))
            }
            Err(e) => {
                if outcome.migrated_to.is_some() {
                    tracing::error!(
                        relationship_type = %name,
                        error = %e,
                        "Type delete-with-migration failed to persist; will reconverge from store"
                    );
                } else {
                    self.registry_write().relationship_types.restore(before);
                }
                self.internal(id, &e, "rel_type.delete")
            }
        }
    }

    fn handle_rel_type_list(&self, id: Uuid) -> Message {
        let registry = self.registry_read();
        let types: Vec<Value> = registry
            .relationship_types
            .all()
            .into_iter()
            .map(|defn| {
                json!({
                    "key": defn.key,
                    "name": defn.name,
                    "label": defn.label,
                    "description": defn.description,
                    "directionality": defn.directionality,
                    "protected": defn.protected,
                    "ref_count": registry.relationship_types.ref_count(&defn.name).unwrap_or(0),
                })
            })
            .collect();
        ok(id, json!({ "relationship_types": types }))
    }

    // ────────────────────────────────────────────────────────────────────
    // Projects
    // ────────────────────────────────────────────────────────────────────

    async fn handle_project_create(
        &self,
        id: Uuid,
        name: String,
        code: String,
        metadata: JsonMap,
        ctx: &RequestContext,
    ) -> Message {
        if name.trim().is_empty() || code.trim().is_empty() {
            return invalid(id, "name and code are required");
        }
        let mut project = Project::new(name, code);
        project.metadata = metadata;

        let persisted: Result<crate::store::EventRecord> = async {
            let mut tx = self.store.begin().await?;
            ProjectRepo::new(&mut tx).save(&project).await?;
            let event = EventRepo::new(&mut tx)
                .append(
                    NewEvent::new("project.created", project.to_value())
                        .session(ctx.session_id, &ctx.client_name)
                        .project(Some(project.id)),
                )
                .await?;
            tx.commit().await?;
            Ok(event)
        }
        .await;

        match persisted {
            Ok(event) => {
                self.connections.broadcast_event(
                    event.id,
                    "project.created",
                    json!({ "id": project.id, "name": project.name, "code": project.code }),
                    Some(project.id),
                    None,
                    Some(ctx.session_id),
                );
                ok(id, json!({ "project_id": project.id }))
            }
            Err(e) if is_unique_violation(&e, "uq_projects_code") => Message::error(
                Some(id),
                ErrorCode::AlreadyExists,
                format!("Project code {:?} is already in use", project.code),
                None,
            ),
            Err(e) => self.internal(id, &e, "project.create"),
        }
    }

    async fn handle_project_update(
        &self,
        id: Uuid,
        project_id: Uuid,
        name: Option<String>,
        code: Option<String>,
        ctx: &RequestContext,
    ) -> Message {
        let existing = {
            let mut conn = match self.store.acquire().await {
                Ok(conn) => conn,
                Err(e) => return self.internal(id, &e, "project.update"),
            };
            match ProjectRepo::new(&mut conn).get(project_id).await {
                Ok(project) => project,
                Err(e) => return self.internal(id, &e, "project.update"),
            }
        };
        let Some(mut project) = existing else {
            return not_found(id, format!("Project {} not found", project_id));
        };
        if let Some(name) = name {
            project.name = name;
        }
        if let Some(code) = code {
            project.code = code;
        }

        let persisted: Result<crate::store::EventRecord> = async {
            let mut tx = self.store.begin().await?;
            ProjectRepo::new(&mut tx).save(&project).await?;
            let event = EventRepo::new(&mut tx)
                .append(
                    NewEvent::new("project.updated", project.to_value())
                        .session(ctx.session_id, &ctx.client_name)
                        .project(Some(project.id)),
                )
                .await?;
            tx.commit().await?;
            Ok(event)
        }
        .await;

        match persisted {
            Ok(event) => {
                self.connections.broadcast_event(
                    event.id,
                    "project.updated",
                    json!({ "id": project.id, "name": project.name, "code": project.code }),
                    Some(project.id),
                    None,
                    Some(ctx.session_id),
                );
                ok_empty(id)
            }
            Err(e) if is_unique_violation(&e, "uq_projects_code") => Message::error(
                Some(id),
                ErrorCode::AlreadyExists,
                format!("Project code {:?} is already in use", project.code),
                None,
            ),
            Err(e) => self.internal(id, &e, "project.update"),
        }
    }

    async fn handle_project_get(&self, id: Uuid, project_id: Uuid) -> Message {
        let result: Result<Option<Project>> = async {
            let mut conn = self.store.acquire().await?;
            ProjectRepo::new(&mut conn).get(project_id).await
        }
        .await;
        match result {
            Ok(Some(project)) => ok(id, project.to_value()),
            Ok(None) => not_found(id, format!("Project {} not found", project_id)),
            Err(e) => self.internal(id, &e, "project.get"),
        }
    }

    async fn handle_project_list(&self, id: Uuid) -> Message {
        let result: Result<Vec<Project>> = async {
            let mut conn = self.store.acquire().await?;
            ProjectRepo::new(&mut conn).list_all().await
        }
        .await;
        match result {
            Ok(projects) => ok(
                id,
                json!({ "projects": projects.iter().map(Project::to_value).collect::<Vec<_>>() }),
            ),
            Err(e) => self.internal(id, &e, "project.list"),
        }
    }

    async fn handle_project_delete(&self, id: Uuid, project_id: Uuid, ctx: &RequestContext) -> Message {
        // Gather everything whose registry usage dies with the project
        let gathered: Result<Option<(Project, Vec<Entity>, Vec<Relationship>)>> = async {
            let mut conn = self.store.acquire().await?;
            let Some(project) = ProjectRepo::new(&mut conn).get(project_id).await? else {
                return Ok(None);
            };
            let layers = EntityRepo::new(&mut conn)
                .list_by_type(EntityType::Layer, Some(project_id))
                .await?;
            let edges = RelationshipRepo::new(&mut conn).for_project(project_id).await?;
            Ok(Some((project, layers, edges)))
        }
        .await;

        let (project, layers, edges) = match gathered {
            Ok(Some(parts)) => parts,
            Ok(None) => return not_found(id, format!("Project {} not found", project_id)),
            Err(e) => return self.internal(id, &e, "project.delete"),
        };

        {
            let mut registry = self.registry_write();
            for layer in &layers {
                if let Some((role_key, entity_id)) = layer.role_usage() {
                    registry.roles.unregister_usage(role_key, entity_id);
                }
            }
            for edge in &edges {
                registry
                    .relationship_types
                    .unregister_usage(edge.rel_type_key, (edge.source_id, edge.target_id));
            }
        }

        let payload = json!({ "project_id": project_id, "code": project.code });
        let persisted: Result<crate::store::EventRecord> = async {
            let mut tx = self.store.begin().await?;
            ProjectRepo::new(&mut tx).delete(project_id).await?;
            let event = EventRepo::new(&mut tx)
                .append(
                    NewEvent::new("project.deleted", payload.clone())
                        .session(ctx.session_id, &ctx.client_name)
                        .project(Some(project_id)),
                )
                .await?;
            tx.commit().await?;
            Ok(event)
        }
        .await;

        match persisted {
            Ok(event) => {
                self.connections.broadcast_event(
                    event.id,
                    "project.deleted",
                    payload,
                    Some(project_id),
                    None,
                    Some(ctx.session_id),
                );
                ok_empty(id)
            }
            Err(e) => {
                let mut registry = self.registry_write();
                for layer in &layers {
                    if let Some((role_key, entity_id)) = layer.role_usage() {
                        registry.roles.register_usage(role_key, entity_id);
                    }
                }
                for edge in &edges {
                    registry
                        .relationship_types
                        .register_usage(edge.rel_type_key, (edge.source_id, edge.target_id));
                }
                drop(registry);
                self.internal(id, &e, "project.delete")
            }
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Entities
    // ────────────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn handle_entity_create(
        &self,
        id: Uuid,
        entity_type: String,
        project_id: Uuid,
        name: Option<String>,
        status: Option<String>,
        attributes: JsonMap,
        ctx: &RequestContext,
    ) -> Message {
        let entity_type = match EntityType::parse(&entity_type) {
            Ok(t) => t,
            Err(_) => return invalid(id, format!("Unknown entity_type {:?}", entity_type)),
        };
        let entity = match self.build_entity(id, entity_type, project_id, name, status, &attributes) {
            Ok(entity) => entity,
            Err(reply) => return *reply,
        };

        let edges = entity.structural_edges();
        {
            let mut registry = self.registry_write();
            if let Some((role_key, entity_id)) = entity.role_usage() {
                registry.roles.register_usage(role_key, entity_id);
            }
            for (source, target, rel_key) in &edges {
                registry
                    .relationship_types
                    .register_usage(*rel_key, (*source, *target));
            }
        }

        let persisted: Result<crate::store::EventRecord> = async {
            let mut tx = self.store.begin().await?;
            EntityRepo::new(&mut tx).save(&entity, Some(project_id)).await?;
            for (source, target, rel_key) in &edges {
                RelationshipRepo::new(&mut tx)
                    .save(&Relationship::new(*source, *target, *rel_key))
                    .await?;
            }
            let event = EventRepo::new(&mut tx)
                .append(
                    NewEvent::new("entity.created", entity.to_value())
                        .session(ctx.session_id, &ctx.client_name)
                        .project(Some(project_id))
                        .entity(Some(entity.id())),
                )
                .await?;
            tx.commit().await?;
            Ok(event)
        }
        .await;

        match persisted {
            Ok(event) => {
                self.connections.broadcast_event(
                    event.id,
                    "entity.created",
                    json!({
                        "entity_type": entity.entity_type(),
                        "entity_id": entity.id(),
                        "name": entity.name(),
                    }),
                    Some(project_id),
                    Some(entity.id()),
                    Some(ctx.session_id),
                );
                ok(id, json!({ "entity_id": entity.id() }))
            }
            Err(e) => {
                let mut registry = self.registry_write();
                if let Some((role_key, entity_id)) = entity.role_usage() {
                    registry.roles.unregister_usage(role_key, entity_id);
                }
                for (source, target, rel_key) in &edges {
                    registry
                        .relationship_types
                        .unregister_usage(*rel_key, (*source, *target));
                }
                drop(registry);
                if is_foreign_key_violation(&e) {
                    return not_found(id, format!("Project {} not found", project_id));
                }
                self.internal(id, &e, "entity.create")
            }
        }
    }

    async fn handle_entity_update(
        &self,
        id: Uuid,
        entity_id: Uuid,
        name: Option<String>,
        status: Option<String>,
        attributes: Option<JsonMap>,
        ctx: &RequestContext,
    ) -> Message {
        let fetched: Result<Option<(Entity, Option<Uuid>)>> = async {
            let mut conn = self.store.acquire().await?;
            let mut repo = EntityRepo::new(&mut conn);
            let Some(entity) = repo.get(entity_id).await? else {
                return Ok(None);
            };
            let project = repo.project_of(entity_id).await?;
            Ok(Some((entity, project)))
        }
        .await;

        let (mut entity, project) = match fetched {
            Ok(Some(parts)) => parts,
            Ok(None) => return not_found(id, format!("Entity {} not found", entity_id)),
            Err(e) => return self.internal(id, &e, "entity.update"),
        };

        if entity.entity_type() == EntityType::Version {
            return invalid(id, "Versions are immutable once created");
        }
        if name.is_some() {
            entity.set_name(name);
        }
        if let Some(status) = status {
            match Status::parse(&status) {
                Ok(status) => {
                    entity.set_status(status);
                }
                Err(e) => return invalid(id, e.to_string()),
            }
        }
        if let Some(attributes) = attributes {
            if let Err(e) = entity.apply_attributes(&attributes) {
                return invalid(id, e.to_string());
            }
        }

        let persisted: Result<crate::store::EventRecord> = async {
            let mut tx = self.store.begin().await?;
            EntityRepo::new(&mut tx).save(&entity, None).await?;
            let event = EventRepo::new(&mut tx)
                .append(
                    NewEvent::new("entity.updated", entity.to_value())
                        .session(ctx.session_id, &ctx.client_name)
                        .project(project)
                        .entity(Some(entity_id)),
                )
                .await?;
            tx.commit().await?;
            Ok(event)
        }
        .await;

        match persisted {
            Ok(event) => {
                self.connections.broadcast_event(
                    event.id,
                    "entity.updated",
                    json!({ "entity_id": entity_id, "entity_type": entity.entity_type() }),
                    project,
                    Some(entity_id),
                    Some(ctx.session_id),
                );
                ok_empty(id)
            }
            Err(e) => self.internal(id, &e, "entity.update"),
        }
    }

    async fn handle_entity_get(&self, id: Uuid, entity_id: Uuid) -> Message {
        let result: Result<Option<Entity>> = async {
            let mut conn = self.store.acquire().await?;
            let Some(mut entity) = EntityRepo::new(&mut conn).get(entity_id).await? else {
                return Ok(None);
            };
            let locations = LocationRepo::new(&mut conn).list_for_entity(entity_id).await?;
            *entity.locations_mut() = locations;
            Ok(Some(entity))
        }
        .await;
        match result {
            Ok(Some(entity)) => ok(id, entity.to_value()),
            Ok(None) => not_found(id, format!("Entity {} not found", entity_id)),
            Err(e) => self.internal(id, &e, "entity.get"),
        }
    }

    async fn handle_entity_list(&self, id: Uuid, entity_type: String, project_id: Uuid) -> Message {
        let entity_type = match EntityType::parse(&entity_type) {
            Ok(t) => t,
            Err(_) => return invalid(id, format!("Unknown entity_type {:?}", entity_type)),
        };
        let result: Result<Vec<Entity>> = async {
            let mut conn = self.store.acquire().await?;
            EntityRepo::new(&mut conn)
                .list_by_type(entity_type, Some(project_id))
                .await
        }
        .await;
        match result {
            Ok(entities) => ok(
                id,
                json!({ "entities": entities.iter().map(Entity::to_value).collect::<Vec<_>>() }),
            ),
            Err(e) => self.internal(id, &e, "entity.list"),
        }
    }

    async fn handle_entity_delete(&self, id: Uuid, entity_id: Uuid, ctx: &RequestContext) -> Message {
        let gathered: Result<Option<(Entity, Vec<Relationship>, Option<Uuid>)>> = async {
            let mut conn = self.store.acquire().await?;
            let Some(entity) = EntityRepo::new(&mut conn).get(entity_id).await? else {
                return Ok(None);
            };
            let edges = RelationshipRepo::new(&mut conn).for_entity(entity_id).await?;
            let project = EntityRepo::new(&mut conn).project_of(entity_id).await?;
            Ok(Some((entity, edges, project)))
        }
        .await;

        let (entity, edges, project) = match gathered {
            Ok(Some(parts)) => parts,
            Ok(None) => return not_found(id, format!("Entity {} not found", entity_id)),
            Err(e) => return self.internal(id, &e, "entity.delete"),
        };

        {
            let mut registry = self.registry_write();
            if let Some((role_key, holder)) = entity.role_usage() {
                registry.roles.unregister_usage(role_key, holder);
            }
            for edge in &edges {
                registry
                    .relationship_types
                    .unregister_usage(edge.rel_type_key, (edge.source_id, edge.target_id));
            }
        }

        let persisted: Result<crate::store::EventRecord> = async {
            let mut tx = self.store.begin().await?;
            EntityRepo::new(&mut tx).delete(entity_id).await?;
            let event = EventRepo::new(&mut tx)
                .append(
                    NewEvent::new("entity.deleted", json!({ "entity_id": entity_id }))
                        .session(ctx.session_id, &ctx.client_name)
                        .project(project)
                        .entity(Some(entity_id)),
                )
                .await?;
            tx.commit().await?;
            Ok(event)
        }
        .await;

        match persisted {
            Ok(event) => {
                self.connections.broadcast_event(
                    event.id,
                    "entity.deleted",
                    json!({ "entity_id": entity_id, "entity_type": entity.entity_type() }),
                    project,
                    Some(entity_id),
                    Some(ctx.session_id),
                );
                ok_empty(id)
            }
            Err(e) => {
                let mut registry = self.registry_write();
                if let Some((role_key, holder)) = entity.role_usage() {
                    registry.roles.register_usage(role_key, holder);
                }
                for edge in &edges {
                    registry
                        .relationship_types
                        .register_usage(edge.rel_type_key, (edge.source_id, edge.target_id));
                }
                drop(registry);
                self.internal(id, &e, "entity.delete")
            }
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Graph: relationships and locations
    // ────────────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn handle_relationship_create(
        &self,
        id: Uuid,
        source_id: Uuid,
        target_id: Uuid,
        rel_type: String,
        attributes: Option<JsonMap>,
        ctx: &RequestContext,
    ) -> Message {
        let rel_key = match self.registry_read().relationship_types.key_of(&rel_type) {
            Ok(key) => key,
            Err(_) => return not_found(id, format!("Relationship type {:?} not found", rel_type)),
        };

        // Idempotence on the triple: an existing edge is a successful no-op
        let exists: Result<bool> = async {
            let mut conn = self.store.acquire().await?;
            let outgoing = RelationshipRepo::new(&mut conn)
                .outgoing(source_id, Some(rel_key))
                .await?;
            Ok(outgoing.iter().any(|edge| edge.target_id == target_id))
        }
        .await;
        match exists {
            Ok(true) => return ok_empty(id),
            Ok(false) => {}
            Err(e) => return self.internal(id, &e, "relationship.create"),
        }

        let mut rel = Relationship::new(source_id, target_id, rel_key);
        if let Some(attributes) = attributes {
            rel.attributes = attributes;
        }
        self.registry_write()
            .relationship_types
            .register_usage(rel_key, (source_id, target_id));

        let payload = json!({
            "source_id": source_id,
            "target_id": target_id,
            "rel_type": rel_type,
        });
        let persisted: Result<Option<crate::store::EventRecord>> = async {
            let mut tx = self.store.begin().await?;
            let inserted = RelationshipRepo::new(&mut tx).save(&rel).await?;
            let event = if inserted {
                Some(
                    EventRepo::new(&mut tx)
                        .append(
                            NewEvent::new("relationship.created", payload.clone())
                                .session(ctx.session_id, &ctx.client_name)
                                .entity(Some(source_id)),
                        )
                        .await?,
                )
            } else {
                None
            };
            tx.commit().await?;
            Ok(event)
        }
        .await;

        match persisted {
            Ok(Some(event)) => {
                self.connections.broadcast_event(
                    event.id,
                    "relationship.created",
                    payload,
                    None,
                    Some(source_id),
                    Some(ctx.session_id),
                );
                ok_empty(id)
            }
            Ok(None) => ok_empty(id),
            Err(e) => {
                self.registry_write()
                    .relationship_types
                    .unregister_usage(rel_key, (source_id, target_id));
                // Either endpoint missing trips the entity FK
                if is_foreign_key_violation(&e) {
                    return not_found(id, "Source or target entity not found");
                }
                self.internal(id, &e, "relationship.create")
            }
        }
    }

    async fn handle_relationship_remove(
        &self,
        id: Uuid,
        source_id: Uuid,
        target_id: Uuid,
        rel_type: String,
        ctx: &RequestContext,
    ) -> Message {
        let rel_key = match self.registry_read().relationship_types.key_of(&rel_type) {
            Ok(key) => key,
            Err(_) => return not_found(id, format!("Relationship type {:?} not found", rel_type)),
        };

        let payload = json!({
            "source_id": source_id,
            "target_id": target_id,
            "rel_type": rel_type,
        });
        let persisted: Result<Option<crate::store::EventRecord>> = async {
            let mut tx = self.store.begin().await?;
            let deleted = RelationshipRepo::new(&mut tx)
                .delete(source_id, target_id, rel_key)
                .await?;
            let event = if deleted {
                Some(
                    EventRepo::new(&mut tx)
                        .append(
                            NewEvent::new("relationship.removed", payload.clone())
                                .session(ctx.session_id, &ctx.client_name)
                                .entity(Some(source_id)),
                        )
                        .await?,
                )
            } else {
                None
            };
            tx.commit().await?;
            Ok(event)
        }
        .await;

        match persisted {
            Ok(Some(event)) => {
                self.registry_write()
                    .relationship_types
                    .unregister_usage(rel_key, (source_id, target_id));
                self.connections.broadcast_event(
                    event.id,
                    "relationship.removed",
                    payload,
                    None,
                    Some(source_id),
                    Some(ctx.session_id),
                );
                ok_empty(id)
            }
            Ok(None) => ok_empty(id),
            Err(e) => self.internal(id, &e, "relationship.remove"),
        }
    }

    async fn handle_location_add(
        &self,
        id: Uuid,
        entity_id: Uuid,
        path: String,
        storage_type: StorageType,
        priority: i32,
        ctx: &RequestContext,
    ) -> Message {
        if path.trim().is_empty() {
            return invalid(id, "path is required");
        }
        let gathered: Result<Option<(Vec<Location>, Option<Uuid>)>> = async {
            let mut conn = self.store.acquire().await?;
            if EntityRepo::new(&mut conn).get(entity_id).await?.is_none() {
                return Ok(None);
            }
            let locations = LocationRepo::new(&mut conn).list_for_entity(entity_id).await?;
            let project = EntityRepo::new(&mut conn).project_of(entity_id).await?;
            Ok(Some((locations, project)))
        }
        .await;

        let (mut locations, project) = match gathered {
            Ok(Some(parts)) => parts,
            Ok(None) => return not_found(id, format!("Entity {} not found", entity_id)),
            Err(e) => return self.internal(id, &e, "location.add"),
        };
        locations.push(Location::new(&path, storage_type, priority));
        locations.sort_by(|a, b| b.priority.cmp(&a.priority));

        let payload = json!({ "entity_id": entity_id, "path": path });
        let persisted: Result<crate::store::EventRecord> = async {
            let mut tx = self.store.begin().await?;
            LocationRepo::new(&mut tx)
                .replace_entity_locations(entity_id, &locations)
                .await?;
            let event = EventRepo::new(&mut tx)
                .append(
                    NewEvent::new("location.added", payload.clone())
                        .session(ctx.session_id, &ctx.client_name)
                        .project(project)
                        .entity(Some(entity_id)),
                )
                .await?;
            tx.commit().await?;
            Ok(event)
        }
        .await;

        match persisted {
            Ok(event) => {
                self.connections.broadcast_event(
                    event.id,
                    "location.added",
                    payload,
                    project,
                    Some(entity_id),
                    Some(ctx.session_id),
                );
                ok_empty(id)
            }
            Err(e) => self.internal(id, &e, "location.add"),
        }
    }

    async fn handle_location_remove(
        &self,
        id: Uuid,
        entity_id: Uuid,
        path: String,
        ctx: &RequestContext,
    ) -> Message {
        let gathered: Result<Option<(Vec<Location>, Option<Uuid>)>> = async {
            let mut conn = self.store.acquire().await?;
            if EntityRepo::new(&mut conn).get(entity_id).await?.is_none() {
                return Ok(None);
            }
            let locations = LocationRepo::new(&mut conn).list_for_entity(entity_id).await?;
            let project = EntityRepo::new(&mut conn).project_of(entity_id).await?;
            Ok(Some((locations, project)))
        }
        .await;

        let (locations, project) = match gathered {
            Ok(Some(parts)) => parts,
            Ok(None) => return not_found(id, format!("Entity {} not found", entity_id)),
            Err(e) => return self.internal(id, &e, "location.remove"),
        };
        let remaining: Vec<Location> = locations
            .iter()
            .filter(|loc| loc.path != path)
            .cloned()
            .collect();
        if remaining.len() == locations.len() {
            return ok_empty(id);
        }

        let payload = json!({ "entity_id": entity_id, "path": path });
        let persisted: Result<crate::store::EventRecord> = async {
            let mut tx = self.store.begin().await?;
            LocationRepo::new(&mut tx)
                .replace_entity_locations(entity_id, &remaining)
                .await?;
            let event = EventRepo::new(&mut tx)
                .append(
                    NewEvent::new("location.removed", payload.clone())
                        .session(ctx.session_id, &ctx.client_name)
                        .project(project)
                        .entity(Some(entity_id)),
                )
                .await?;
            tx.commit().await?;
            Ok(event)
        }
        .await;

        match persisted {
            Ok(event) => {
                self.connections.broadcast_event(
                    event.id,
                    "location.removed",
                    payload,
                    project,
                    Some(entity_id),
                    Some(ctx.session_id),
                );
                ok_empty(id)
            }
            Err(e) => self.internal(id, &e, "location.remove"),
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Queries
    // ────────────────────────────────────────────────────────────────────

    async fn handle_query_dependents(&self, id: Uuid, entity_id: Uuid) -> Message {
        let result: Result<Vec<Uuid>> = async {
            let mut conn = self.store.acquire().await?;
            RelationshipRepo::new(&mut conn).get_dependents(entity_id).await
        }
        .await;
        match result {
            Ok(dependents) => {
                let count = dependents.len();
                ok(
                    id,
                    json!({
                        "entity_id": entity_id,
                        "dependents": dependents,
                        "count": count,
                    }),
                )
            }
            Err(e) => self.internal(id, &e, "query.dependents"),
        }
    }

    async fn handle_query_dependencies(&self, id: Uuid, entity_id: Uuid) -> Message {
        let result: Result<Vec<Uuid>> = async {
            let mut conn = self.store.acquire().await?;
            RelationshipRepo::new(&mut conn).get_dependencies(entity_id).await
        }
        .await;
        match result {
            Ok(dependencies) => {
                let count = dependencies.len();
                ok(
                    id,
                    json!({
                        "entity_id": entity_id,
                        "dependencies": dependencies,
                        "count": count,
                    }),
                )
            }
            Err(e) => self.internal(id, &e, "query.dependencies"),
        }
    }

    async fn handle_query_shot_stack(&self, id: Uuid, shot_id: Uuid) -> Message {
        let result: Result<Option<(Uuid, Vec<Entity>)>> = async {
            let mut conn = self.store.acquire().await?;
            let mut repo = EntityRepo::new(&mut conn);

            let mut filter = JsonMap::new();
            filter.insert("shot_id".to_string(), json!(shot_id.to_string()));
            let stacks = repo.find_by_attribute(EntityType::Stack, &filter, None).await?;
            let Some(stack) = stacks.into_iter().next() else {
                return Ok(None);
            };

            let mut filter = JsonMap::new();
            filter.insert("stack_id".to_string(), json!(stack.id().to_string()));
            let mut layers = repo.find_by_attribute(EntityType::Layer, &filter, None).await?;
            layers.sort_by_key(|entity| match entity {
                Entity::Layer(layer) => layer.order,
                _ => 0,
            });
            Ok(Some((stack.id(), layers)))
        }
        .await;

        match result {
            Ok(Some((stack_id, layers))) => ok(
                id,
                json!({
                    "shot_id": shot_id,
                    "stack_id": stack_id,
                    "layers": layers.iter().map(Entity::to_value).collect::<Vec<_>>(),
                }),
            ),
            Ok(None) => ok(id, json!({ "shot_id": shot_id, "layers": [] })),
            Err(e) => self.internal(id, &e, "query.shot_stack"),
        }
    }

    async fn handle_query_events(
        &self,
        id: Uuid,
        project_id: Option<Uuid>,
        entity_id: Option<Uuid>,
        limit: u32,
    ) -> Message {
        let limit = limit.min(500);
        let filter = EventFilter {
            event_type: None,
            project_id,
            entity_id,
        };
        let result: Result<Vec<crate::store::EventRecord>> = async {
            let mut conn = self.store.acquire().await?;
            EventRepo::new(&mut conn).get_recent(limit, &filter).await
        }
        .await;
        match result {
            Ok(events) => match serde_json::to_value(&events) {
                Ok(events) => ok(id, json!({ "events": events })),
                Err(e) => self.internal(
                    id,
                    &Error::internal(format!("event serialization failed: {}", e)),
                    "query.events",
                ),
            },
            Err(e) => self.internal(id, &e, "query.events"),
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Entity factory
    // ────────────────────────────────────────────────────────────────────

    /// Construct a core entity from an `entity.create` payload. The error
    /// arm carries a ready reply.
    fn build_entity(
        &self,
        id: Uuid,
        entity_type: EntityType,
        project_id: Uuid,
        name: Option<String>,
        status: Option<String>,
        attributes: &JsonMap,
    ) -> std::result::Result<Entity, Box<Message>> {
        let status = match status.as_deref().map(Status::parse).transpose() {
            Ok(status) => status.unwrap_or(Status::Pending),
            Err(e) => return Err(Box::new(invalid(id, e.to_string()))),
        };
        let get_str = |key: &str| attributes.get(key).and_then(Value::as_str);
        let get_uuid = |key: &str| get_str(key).and_then(|s| Uuid::parse_str(s).ok());
        let get_i32 = |key: &str| attributes.get(key).and_then(Value::as_i64).map(|v| v as i32);

        let mut consumed: Vec<&str> = Vec::new();
        let mut entity = match entity_type {
            EntityType::Sequence => {
                let frame_rate = match get_str("frame_rate").unwrap_or("24").parse::<FrameRate>() {
                    Ok(rate) => rate,
                    Err(e) => return Err(Box::new(invalid(id, e.to_string()))),
                };
                consumed.extend(["frame_rate", "duration_tc"]);
                let mut seq = Sequence::new(name, Some(project_id), frame_rate);
                match get_str("duration_tc").map(|s| Timecode::parse(s, frame_rate)).transpose() {
                    Ok(duration) => seq.duration = duration,
                    Err(e) => return Err(Box::new(invalid(id, e.to_string()))),
                }
                Entity::Sequence(seq)
            }
            EntityType::Shot => {
                consumed.extend(["sequence_id", "cut_in", "cut_out"]);
                let mut shot = Shot::new(name, get_uuid("sequence_id"));
                shot.status = status;
                let parse_tc = |raw: Option<&str>| {
                    raw.map(|s| Timecode::parse(s, FrameRate::default())).transpose()
                };
                match parse_tc(get_str("cut_in")) {
                    Ok(tc) => shot.cut_in = tc,
                    Err(e) => return Err(Box::new(invalid(id, e.to_string()))),
                }
                match parse_tc(get_str("cut_out")) {
                    Ok(tc) => shot.cut_out = tc,
                    Err(e) => return Err(Box::new(invalid(id, e.to_string()))),
                }
                Entity::Shot(shot)
            }
            EntityType::Asset => {
                consumed.push("asset_type");
                let mut asset = Asset::new(
                    name,
                    Some(project_id),
                    get_str("asset_type").unwrap_or("generic"),
                );
                asset.status = status;
                Entity::Asset(asset)
            }
            EntityType::Version => {
                consumed.extend(["version_number", "parent_id", "parent_type", "created_by"]);
                let mut version = Version::new(
                    get_i32("version_number").unwrap_or(1),
                    get_uuid("parent_id"),
                    get_str("parent_type").unwrap_or("shot"),
                );
                version.status = status;
                version.created_by = get_str("created_by").map(str::to_string);
                Entity::Version(version)
            }
            EntityType::Media => {
                consumed.extend([
                    "format",
                    "resolution",
                    "colorspace",
                    "bit_depth",
                    "version_id",
                    "frame_range",
                ]);
                let mut media = Media::new(get_str("format").unwrap_or("EXR"));
                media.name = name;
                media.status = status;
                media.resolution = get_str("resolution").map(str::to_string);
                media.colorspace = get_str("colorspace").map(str::to_string);
                media.bit_depth = get_i32("bit_depth");
                media.version_id = get_uuid("version_id");
                if let Some(range) = attributes.get("frame_range") {
                    match serde_json::from_value(range.clone()) {
                        Ok(range) => media.frame_range = Some(range),
                        Err(e) => {
                            return Err(Box::new(invalid(id, format!("invalid frame_range: {}", e))))
                        }
                    }
                }
                Entity::Media(media)
            }
            EntityType::Layer => {
                consumed.extend(["role", "role_key", "order", "stack_id", "version_id"]);
                let role_key = if let Some(key) = get_uuid("role_key") {
                    match self.registry_read().roles.get_by_key(key) {
                        Ok(defn) => defn.key,
                        Err(e) => return Err(Box::new(registry_error(id, &e, None))),
                    }
                } else {
                    let role_name = get_str("role").unwrap_or("primary");
                    match self.registry_read().roles.key_of(role_name) {
                        Ok(key) => key,
                        Err(e) => return Err(Box::new(registry_error(id, &e, None))),
                    }
                };
                let mut layer = Layer::new(role_key, get_i32("order").unwrap_or(0), get_uuid("stack_id"));
                layer.version_id = get_uuid("version_id");
                Entity::Layer(layer)
            }
            EntityType::Stack => {
                consumed.push("shot_id");
                Entity::Stack(Stack::new(get_uuid("shot_id")))
            }
        };

        // Anything the typed constructor did not consume survives as open
        // metadata
        let leftovers: JsonMap = attributes
            .iter()
            .filter(|(key, _)| !consumed.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if !leftovers.is_empty() {
            if let Err(e) = entity.apply_attributes(&leftovers) {
                return Err(Box::new(invalid(id, e.to_string())));
            }
        }
        Ok(entity)
    }
}
