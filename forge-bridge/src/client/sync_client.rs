//! Blocking adapter over the async client.
//!
//! Host-application hooks run in a synchronous context — no event loop, no
//! await. This client owns a dedicated tokio runtime; every public method
//! submits work onto that runtime and blocks the caller until completion.
//!
//! Event callbacks registered through [`SyncClient::on`] fire on the
//! runtime's worker threads: they must not block, and must not call back
//! into the `SyncClient`.
//!
//! ```rust,ignore
//! let client = SyncClient::connect("flame_a", "ws://server:9998/ws")?;
//! let project_id = client.project_create("Episode 60", "EP60")?;
//! let shot_id = client.entity_create("shot", project_id, Some("EP60_010"), attrs)?;
//! client.disconnect();
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::runtime::{Builder, Runtime};
use uuid::Uuid;

use crate::client::async_client::{AsyncClient, ClientOptions, ListenerHandle};
use crate::client::ClientError;
use crate::core::registry::Directionality;
use crate::core::traits::StorageType;
use crate::core::vocabulary::RoleClass;
use crate::protocol::{EventFrame, JsonMap, Message};

/// Blocking client for synchronous host environments
pub struct SyncClient {
    runtime: Runtime,
    client: AsyncClient,
}

fn uuid_from(result: &Value, field: &str) -> Result<Uuid, ClientError> {
    result
        .get(field)
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| {
            ClientError::ConnectionFailed(format!("response missing {:?} field", field))
        })
}

impl SyncClient {
    /// Connect and block until the handshake completes.
    ///
    /// Must not be called from inside an async context.
    pub fn connect(
        client_name: impl Into<String>,
        server_url: impl Into<String>,
    ) -> Result<Self, ClientError> {
        Self::connect_with_options(client_name, server_url, ClientOptions::default())
    }

    pub fn connect_with_options(
        client_name: impl Into<String>,
        server_url: impl Into<String>,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("forge-bridge-client")
            .enable_all()
            .build()
            .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;
        let client = AsyncClient::with_options(client_name, server_url, options);
        runtime.block_on(client.start())?;
        Ok(Self { runtime, client })
    }

    /// Disconnect cleanly and shut the background runtime down
    pub fn disconnect(self) {
        self.runtime.block_on(self.client.stop());
        self.runtime.shutdown_timeout(Duration::from_secs(5));
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.client.session_id()
    }

    pub fn registry_summary(&self) -> Value {
        self.client.registry_summary()
    }

    /// Send a raw request and block for its result
    pub fn request(&self, msg: Message) -> Result<Value, ClientError> {
        self.runtime.block_on(self.client.request(msg))
    }

    // ── Subscriptions & listeners ───────────────────────────────────────

    pub fn subscribe(&self, project_id: Uuid) -> Result<(), ClientError> {
        self.runtime.block_on(self.client.subscribe(project_id))
    }

    pub fn unsubscribe(&self, project_id: Uuid) -> Result<(), ClientError> {
        self.runtime.block_on(self.client.unsubscribe(project_id))
    }

    /// Register an event listener. The callback runs on the background
    /// runtime and must not block.
    pub fn on(
        &self,
        event_type: impl Into<String>,
        listener: impl Fn(&EventFrame) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.client.on(event_type, listener)
    }

    pub fn off(&self, handle: &ListenerHandle) {
        self.client.off(handle);
    }

    // ── Projects ────────────────────────────────────────────────────────

    pub fn project_create(
        &self,
        name: impl Into<String>,
        code: impl Into<String>,
    ) -> Result<Uuid, ClientError> {
        let result = self.request(Message::project_create(name, code, JsonMap::new()))?;
        uuid_from(&result, "project_id")
    }

    pub fn project_get(&self, project_id: Uuid) -> Result<Value, ClientError> {
        self.request(Message::project_get(project_id))
    }

    pub fn project_list(&self) -> Result<Vec<Value>, ClientError> {
        let result = self.request(Message::project_list())?;
        Ok(result
            .get("projects")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    pub fn project_delete(&self, project_id: Uuid) -> Result<(), ClientError> {
        self.request(Message::project_delete(project_id))?;
        Ok(())
    }

    // ── Entities ────────────────────────────────────────────────────────

    pub fn entity_create(
        &self,
        entity_type: impl Into<String>,
        project_id: Uuid,
        name: Option<String>,
        attributes: JsonMap,
    ) -> Result<Uuid, ClientError> {
        let result = self.request(Message::entity_create(
            entity_type,
            project_id,
            name,
            None,
            attributes,
        ))?;
        uuid_from(&result, "entity_id")
    }

    pub fn entity_update(
        &self,
        entity_id: Uuid,
        name: Option<String>,
        status: Option<String>,
        attributes: Option<JsonMap>,
    ) -> Result<(), ClientError> {
        self.request(Message::entity_update(entity_id, name, status, attributes))?;
        Ok(())
    }

    pub fn entity_get(&self, entity_id: Uuid) -> Result<Value, ClientError> {
        self.request(Message::entity_get(entity_id))
    }

    pub fn entity_list(
        &self,
        entity_type: impl Into<String>,
        project_id: Uuid,
    ) -> Result<Vec<Value>, ClientError> {
        let result = self.request(Message::entity_list(entity_type, project_id))?;
        Ok(result
            .get("entities")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    pub fn entity_delete(&self, entity_id: Uuid) -> Result<(), ClientError> {
        self.request(Message::entity_delete(entity_id))?;
        Ok(())
    }

    // ── Graph ───────────────────────────────────────────────────────────

    pub fn relationship_create(
        &self,
        source_id: Uuid,
        target_id: Uuid,
        rel_type: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.request(Message::relationship_create(source_id, target_id, rel_type, None))?;
        Ok(())
    }

    pub fn relationship_remove(
        &self,
        source_id: Uuid,
        target_id: Uuid,
        rel_type: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.request(Message::relationship_remove(source_id, target_id, rel_type))?;
        Ok(())
    }

    pub fn location_add(
        &self,
        entity_id: Uuid,
        path: impl Into<String>,
        storage_type: StorageType,
        priority: i32,
    ) -> Result<(), ClientError> {
        self.request(Message::location_add(entity_id, path, storage_type, priority))?;
        Ok(())
    }

    pub fn location_remove(
        &self,
        entity_id: Uuid,
        path: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.request(Message::location_remove(entity_id, path))?;
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub fn get_dependents(&self, entity_id: Uuid) -> Result<Vec<Uuid>, ClientError> {
        let result = self.request(Message::query_dependents(entity_id))?;
        Ok(uuid_list(&result, "dependents"))
    }

    pub fn get_dependencies(&self, entity_id: Uuid) -> Result<Vec<Uuid>, ClientError> {
        let result = self.request(Message::query_dependencies(entity_id))?;
        Ok(uuid_list(&result, "dependencies"))
    }

    pub fn get_shot_stack(&self, shot_id: Uuid) -> Result<Value, ClientError> {
        self.request(Message::query_shot_stack(shot_id))
    }

    pub fn get_events(
        &self,
        project_id: Option<Uuid>,
        entity_id: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<Value>, ClientError> {
        let result = self.request(Message::query_events(project_id, entity_id, limit))?;
        Ok(result
            .get("events")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    // ── Registry ────────────────────────────────────────────────────────

    pub fn role_register(
        &self,
        name: impl Into<String>,
        label: Option<String>,
        order: i32,
        role_class: RoleClass,
    ) -> Result<Uuid, ClientError> {
        let result = self.request(Message::role_register(
            name,
            label,
            order,
            role_class,
            None,
            BTreeMap::new(),
        ))?;
        uuid_from(&result, "key")
    }

    pub fn role_rename(
        &self,
        old_name: impl Into<String>,
        new_name: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.request(Message::role_rename(old_name, new_name))?;
        Ok(())
    }

    pub fn role_delete(
        &self,
        name: impl Into<String>,
        migrate_to: Option<String>,
    ) -> Result<u64, ClientError> {
        let result = self.request(Message::role_delete(name, migrate_to))?;
        Ok(result.get("migrated").and_then(Value::as_u64).unwrap_or(0))
    }

    pub fn role_list(&self) -> Result<Vec<Value>, ClientError> {
        let result = self.request(Message::role_list())?;
        Ok(result
            .get("roles")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    pub fn rel_type_register(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        directionality: Directionality,
    ) -> Result<Uuid, ClientError> {
        let result = self.request(Message::rel_type_register(
            name,
            None,
            description,
            directionality,
        ))?;
        uuid_from(&result, "key")
    }

    // ── Composites ──────────────────────────────────────────────────────

    /// Create a stack for a shot plus one layer per role name, in order
    pub fn create_shot_stack(
        &self,
        project_id: Uuid,
        shot_id: Uuid,
        role_names: &[&str],
    ) -> Result<Uuid, ClientError> {
        let mut attrs = JsonMap::new();
        attrs.insert("shot_id".to_string(), json!(shot_id.to_string()));
        let stack_id = self.entity_create("stack", project_id, None, attrs)?;

        for (order, role) in role_names.iter().enumerate() {
            let mut attrs = JsonMap::new();
            attrs.insert("stack_id".to_string(), json!(stack_id.to_string()));
            attrs.insert("role".to_string(), json!(role));
            attrs.insert("order".to_string(), json!(order));
            self.entity_create("layer", project_id, None, attrs)?;
        }
        Ok(stack_id)
    }
}

fn uuid_list(result: &Value, field: &str) -> Vec<Uuid> {
    result
        .get(field)
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .filter_map(|s| Uuid::parse_str(s).ok())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_list_parses_mixed_input() {
        let a = Uuid::new_v4();
        let value = json!({ "dependents": [a.to_string(), "not-a-uuid", 42] });
        assert_eq!(uuid_list(&value, "dependents"), vec![a]);
        assert!(uuid_list(&value, "missing").is_empty());
    }

    #[test]
    fn test_uuid_from_field() {
        let id = Uuid::new_v4();
        let value = json!({ "project_id": id.to_string() });
        assert_eq!(uuid_from(&value, "project_id").unwrap(), id);
        assert!(uuid_from(&value, "entity_id").is_err());
    }
}
