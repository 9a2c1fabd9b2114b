//! Connection manager.
//!
//! Tracks every live WebSocket client: registration on connect, cleanup on
//! disconnect, project subscriptions, targeted sends, and scoped
//! broadcasts. It has no database access — it only knows about live
//! connections. The router calls it; it never calls the router.
//!
//! Each client owns a bounded outbound queue drained by its connection
//! task. Sends here never block: a full queue drops that one send and the
//! client catches up from the event log on its next reconnect.

use std::collections::HashSet;

use axum::extract::ws::Message as WsMessage;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::Message;

/// Everything the server knows about one live connection
#[derive(Debug)]
pub struct ConnectedClient {
    pub session_id: Uuid,
    pub client_name: String,
    pub endpoint_type: String,
    sender: mpsc::Sender<WsMessage>,
    /// Subscribed project ids. Empty set = wildcard: receives every
    /// broadcast. This is the default state after the handshake until the
    /// first subscribe.
    pub subscriptions: HashSet<Uuid>,
    /// Most recent event id delivered to this client, for reconnect
    /// catch-up
    pub last_event_id: Option<Uuid>,
}

impl ConnectedClient {
    fn subscribes_to(&self, project_id: Uuid) -> bool {
        self.subscriptions.is_empty() || self.subscriptions.contains(&project_id)
    }
}

/// Manages all live connections.
///
/// Lock discipline: the maps are sharded concurrent maps, and every send
/// is a non-blocking `try_send` into the recipient's queue, so no lock is
/// ever held across I/O.
pub struct ConnectionManager {
    clients: DashMap<Uuid, ConnectedClient>,
    project_subs: DashMap<Uuid, HashSet<Uuid>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            project_subs: DashMap::new(),
        }
    }

    // ── Connection lifecycle ────────────────────────────────────────────

    pub fn register(
        &self,
        session_id: Uuid,
        sender: mpsc::Sender<WsMessage>,
        client_name: &str,
        endpoint_type: &str,
        last_event_id: Option<Uuid>,
    ) {
        self.clients.insert(
            session_id,
            ConnectedClient {
                session_id,
                client_name: client_name.to_string(),
                endpoint_type: endpoint_type.to_string(),
                sender,
                subscriptions: HashSet::new(),
                last_event_id,
            },
        );
        tracing::info!(
            session_id = %session_id,
            client_name = %client_name,
            endpoint_type = %endpoint_type,
            "Client connected"
        );
    }

    /// Remove a connection from every index
    pub fn unregister(&self, session_id: Uuid) {
        if let Some((_, client)) = self.clients.remove(&session_id) {
            for project_id in &client.subscriptions {
                if let Some(mut subs) = self.project_subs.get_mut(project_id) {
                    subs.remove(&session_id);
                }
            }
            tracing::info!(
                session_id = %session_id,
                client_name = %client.client_name,
                "Client disconnected"
            );
        }
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    pub fn session_ids(&self) -> Vec<Uuid> {
        self.clients.iter().map(|entry| *entry.key()).collect()
    }

    // ── Subscriptions ───────────────────────────────────────────────────

    pub fn subscribe(&self, session_id: Uuid, project_id: Uuid) {
        if let Some(mut client) = self.clients.get_mut(&session_id) {
            client.subscriptions.insert(project_id);
            self.project_subs
                .entry(project_id)
                .or_default()
                .insert(session_id);
            tracing::debug!(
                session_id = %session_id,
                project_id = %project_id,
                "Subscribed"
            );
        }
    }

    pub fn unsubscribe(&self, session_id: Uuid, project_id: Uuid) {
        if let Some(mut client) = self.clients.get_mut(&session_id) {
            client.subscriptions.remove(&project_id);
        }
        if let Some(mut subs) = self.project_subs.get_mut(&project_id) {
            subs.remove(&session_id);
        }
    }

    // ── Sending ─────────────────────────────────────────────────────────

    /// Targeted send to one client. Failures are reported, never raised.
    pub fn send_to(&self, session_id: Uuid, msg: &Message) -> bool {
        let Ok(text) = msg.to_json() else {
            return false;
        };
        match self.clients.get(&session_id) {
            Some(client) => enqueue(&client, WsMessage::Text(text.into())),
            None => false,
        }
    }

    /// Fan a message out.
    ///
    /// With a project scope the target set is that project's subscribers
    /// plus every wildcard client; without one, every client. `exclude`
    /// removes the originator. Returns the number of clients reached.
    pub fn broadcast(&self, msg: &Message, project_id: Option<Uuid>, exclude: Option<Uuid>) -> usize {
        let Ok(text) = msg.to_json() else {
            tracing::warn!("Dropping unserializable broadcast");
            return 0;
        };
        let targets = self.broadcast_targets(project_id, exclude);
        let mut reached = 0;
        for session_id in targets {
            if let Some(client) = self.clients.get(&session_id) {
                if enqueue(&client, WsMessage::Text(text.clone().into())) {
                    reached += 1;
                }
            }
        }
        reached
    }

    /// Build and broadcast an event frame, advancing the cursor of every
    /// eligible recipient. The originator's cursor advances too — it saw
    /// the change through its own `ok` reply.
    #[allow(clippy::too_many_arguments)]
    pub fn broadcast_event(
        &self,
        event_id: Uuid,
        event_type: &str,
        payload: Value,
        project_id: Option<Uuid>,
        entity_id: Option<Uuid>,
        originator: Option<Uuid>,
    ) -> usize {
        for mut client in self.clients.iter_mut() {
            let eligible = match project_id {
                Some(pid) => client.subscribes_to(pid),
                None => true,
            };
            if eligible {
                client.last_event_id = Some(event_id);
            }
        }
        let msg = Message::event(event_id, event_type, project_id, entity_id, payload);
        let reached = self.broadcast(&msg, project_id, originator);
        tracing::debug!(
            event_type = %event_type,
            event_id = %event_id,
            reached = reached,
            "Event broadcast"
        );
        reached
    }

    fn broadcast_targets(&self, project_id: Option<Uuid>, exclude: Option<Uuid>) -> Vec<Uuid> {
        let mut targets: HashSet<Uuid> = match project_id {
            Some(pid) => {
                let mut set: HashSet<Uuid> = self
                    .project_subs
                    .get(&pid)
                    .map(|subs| subs.clone())
                    .unwrap_or_default();
                // Wildcard clients receive every scoped broadcast
                set.extend(
                    self.clients
                        .iter()
                        .filter(|entry| entry.subscriptions.is_empty())
                        .map(|entry| *entry.key()),
                );
                set
            }
            None => self.clients.iter().map(|entry| *entry.key()).collect(),
        };
        if let Some(origin) = exclude {
            targets.remove(&origin);
        }
        targets.into_iter().collect()
    }

    // ── Status ──────────────────────────────────────────────────────────

    /// Summary of current connection state, for logs and diagnostics
    pub fn status(&self) -> Value {
        let clients: Vec<Value> = self
            .clients
            .iter()
            .map(|entry| {
                json!({
                    "session_id": entry.session_id,
                    "client_name": entry.client_name,
                    "endpoint_type": entry.endpoint_type,
                    "subscriptions": entry.subscriptions.iter().collect::<Vec<_>>(),
                    "last_event_id": entry.last_event_id,
                })
            })
            .collect();
        json!({
            "total_connections": self.count(),
            "clients": clients,
        })
    }

    #[cfg(test)]
    pub(crate) fn last_event_id(&self, session_id: Uuid) -> Option<Uuid> {
        self.clients
            .get(&session_id)
            .and_then(|client| client.last_event_id)
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

fn enqueue(client: &ConnectedClient, frame: WsMessage) -> bool {
    match client.sender.try_send(frame) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            // Slow consumer: drop this one send; its stale cursor will
            // trigger catch-up on the next reconnect
            tracing::warn!(
                session_id = %client.session_id,
                client_name = %client.client_name,
                "Outbound queue full, dropping send"
            );
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            tracing::debug!(
                session_id = %client.session_id,
                "Send to closed connection"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(
        manager: &ConnectionManager,
        name: &str,
        queue: usize,
    ) -> (Uuid, mpsc::Receiver<WsMessage>) {
        let (tx, rx) = mpsc::channel(queue);
        let session_id = Uuid::new_v4();
        manager.register(session_id, tx, name, "test", None);
        (session_id, rx)
    }

    #[tokio::test]
    async fn test_scoped_broadcast_reaches_subscribers_and_wildcards() {
        let manager = ConnectionManager::new();
        let project = Uuid::new_v4();
        let other = Uuid::new_v4();

        let (subscriber, mut sub_rx) = register(&manager, "subscriber", 8);
        let (wildcard, mut wild_rx) = register(&manager, "wildcard", 8);
        let (elsewhere, mut else_rx) = register(&manager, "elsewhere", 8);

        manager.subscribe(subscriber, project);
        manager.subscribe(elsewhere, other);
        let _ = wildcard;

        let msg = Message::ping();
        let reached = manager.broadcast(&msg, Some(project), None);
        assert_eq!(reached, 2);
        assert!(sub_rx.try_recv().is_ok());
        assert!(wild_rx.try_recv().is_ok());
        assert!(else_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_excludes_originator() {
        let manager = ConnectionManager::new();
        let (a, mut a_rx) = register(&manager, "a", 8);
        let (_b, mut b_rx) = register(&manager, "b", 8);

        let reached = manager.broadcast(&Message::ping(), None, Some(a));
        assert_eq!(reached, 1);
        assert!(a_rx.try_recv().is_err());
        assert!(b_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_to_empty_project_reaches_zero() {
        let manager = ConnectionManager::new();
        let project = Uuid::new_v4();
        let (session, _rx) = register(&manager, "a", 8);
        let other = Uuid::new_v4();
        manager.subscribe(session, other);

        assert_eq!(manager.broadcast(&Message::ping(), Some(project), None), 0);
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let manager = ConnectionManager::new();
        let project = Uuid::new_v4();
        let (session, mut rx) = register(&manager, "a", 8);

        manager.subscribe(session, project);
        manager.subscribe(session, project);
        manager.unsubscribe(session, project);

        // Not subscribed and not a wildcard? No — empty set IS wildcard,
        // so after unsubscribing the last project the client receives
        // scoped broadcasts again.
        assert_eq!(manager.broadcast(&Message::ping(), Some(project), None), 1);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_full_queue_drops_send() {
        let manager = ConnectionManager::new();
        let (session, mut rx) = register(&manager, "slow", 1);

        assert_eq!(manager.broadcast(&Message::ping(), None, None), 1);
        assert_eq!(manager.broadcast(&Message::ping(), None, None), 0);
        assert!(rx.try_recv().is_ok());
        let _ = session;
    }

    #[tokio::test]
    async fn test_broadcast_event_advances_cursors() {
        let manager = ConnectionManager::new();
        let (originator, _a_rx) = register(&manager, "originator", 8);
        let (subscriber, mut b_rx) = register(&manager, "subscriber", 8);

        let event_id = Uuid::new_v4();
        let reached = manager.broadcast_event(
            event_id,
            "role.registered",
            json!({"name": "r1"}),
            None,
            None,
            Some(originator),
        );
        assert_eq!(reached, 1);
        assert!(b_rx.try_recv().is_ok());
        // Both cursors advance — the originator saw the change via its ok
        assert_eq!(manager.last_event_id(subscriber), Some(event_id));
        assert_eq!(manager.last_event_id(originator), Some(event_id));
    }

    #[tokio::test]
    async fn test_status_reflects_connections() {
        let manager = ConnectionManager::new();
        let project = Uuid::new_v4();
        let (session, _rx) = register(&manager, "flame_a", 8);
        manager.subscribe(session, project);

        let status = manager.status();
        assert_eq!(status["total_connections"], 1);
        assert_eq!(status["clients"][0]["client_name"], "flame_a");
    }

    #[tokio::test]
    async fn test_unregister_cleans_indexes() {
        let manager = ConnectionManager::new();
        let project = Uuid::new_v4();
        let (session, _rx) = register(&manager, "a", 8);
        manager.subscribe(session, project);

        manager.unregister(session);
        assert_eq!(manager.count(), 0);
        assert_eq!(manager.broadcast(&Message::ping(), Some(project), None), 0);
        assert!(!manager.send_to(session, &Message::ping()));
    }
}
