//! Async WebSocket client.
//!
//! The async client is the foundation; the sync adapter wraps it for
//! blocking hosts. It keeps one persistent connection, reconnects with
//! exponential backoff, correlates requests to responses by message id,
//! and fans server-push events out to registered listeners.
//!
//! ```rust,ignore
//! let client = AsyncClient::new("flame_a", "ws://server:9998/ws");
//! client.start().await?;
//! client.subscribe(project_id).await?;
//!
//! let handle = client.on("entity.updated", |event| {
//!     println!("entity updated: {:?}", event.entity_id);
//! });
//!
//! let result = client.request(Message::project_list()).await?;
//! ```

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::client::ClientError;
use crate::protocol::{EventFrame, JsonMap, Message};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Tunables for one client instance
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub endpoint_type: String,
    pub capabilities: JsonMap,
    pub auto_reconnect: bool,
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            endpoint_type: "unknown".to_string(),
            capabilities: JsonMap::new(),
            auto_reconnect: true,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Identifies one registered listener, for [`AsyncClient::off`]
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    event_type: String,
    id: u64,
}

type Listener = Arc<dyn Fn(&EventFrame) + Send + Sync>;

#[derive(Debug, Default)]
struct SessionState {
    session_id: Option<Uuid>,
    registry_summary: Value,
    last_event_id: Option<Uuid>,
}

struct Inner {
    client_name: String,
    server_url: String,
    options: ClientOptions,
    state: Mutex<SessionState>,
    pending: DashMap<Uuid, oneshot::Sender<Message>>,
    listeners: Mutex<HashMap<String, Vec<(u64, Listener)>>>,
    listener_seq: AtomicU64,
    subscriptions: Mutex<HashSet<Uuid>>,
    connected: watch::Sender<bool>,
    writer: tokio::sync::Mutex<Option<WsSink>>,
    reconnect_delay: Mutex<Duration>,
    cancel: CancellationToken,
}

/// Async client for the bridge server
#[derive(Clone)]
pub struct AsyncClient {
    inner: Arc<Inner>,
}

impl AsyncClient {
    pub fn new(client_name: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self::with_options(client_name, server_url, ClientOptions::default())
    }

    pub fn with_options(
        client_name: impl Into<String>,
        server_url: impl Into<String>,
        options: ClientOptions,
    ) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                client_name: client_name.into(),
                server_url: server_url.into(),
                options,
                state: Mutex::new(SessionState::default()),
                pending: DashMap::new(),
                listeners: Mutex::new(HashMap::new()),
                listener_seq: AtomicU64::new(0),
                subscriptions: Mutex::new(HashSet::new()),
                connected,
                writer: tokio::sync::Mutex::new(None),
                reconnect_delay: Mutex::new(RECONNECT_BASE_DELAY),
                cancel: CancellationToken::new(),
            }),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Connect, perform the hello/welcome exchange, and launch the
    /// receive task
    pub async fn start(&self) -> Result<(), ClientError> {
        let reader = self.connect_handshake().await?;
        let client = self.clone();
        tokio::spawn(async move { client.receive_loop(reader).await });
        Ok(())
    }

    /// Send `bye`, close the socket, cancel the receive task, and fail
    /// every pending request
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let _ = self.send_raw(&Message::bye("client_shutdown")).await;
        if let Some(mut sink) = self.inner.writer.lock().await.take() {
            let _ = sink.close().await;
        }
        self.inner.connected.send_replace(false);
        self.fail_pending();
        tracing::info!(client_name = %self.inner.client_name, "Client stopped");
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.lock_state().session_id
    }

    /// The registry state reported by the server at connect time
    pub fn registry_summary(&self) -> Value {
        self.lock_state().registry_summary.clone()
    }

    /// The id of the most recent event received, fed back to the server
    /// on reconnect for catch-up
    pub fn last_event_id(&self) -> Option<Uuid> {
        self.lock_state().last_event_id
    }

    /// Block until the handshake completes
    pub async fn wait_until_connected(&self, limit: Duration) -> Result<(), ClientError> {
        let mut rx = self.inner.connected.subscribe();
        let outcome = timeout(limit, async {
            loop {
                if *rx.borrow() {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;
        match outcome {
            Ok(true) => Ok(()),
            Ok(false) => Err(ClientError::ConnectionClosed),
            Err(_) => Err(ClientError::Timeout {
                msg_type: "hello",
                timeout: limit,
            }),
        }
    }

    // ── Request/response ────────────────────────────────────────────────

    /// Send a request and wait for the correlated response.
    ///
    /// Returns the result object from the `ok` response; server `error`
    /// frames surface as [`ClientError::Server`]. A timeout rejects this
    /// request only — the socket stays up.
    pub async fn request(&self, msg: Message) -> Result<Value, ClientError> {
        self.request_with_timeout(msg, self.inner.options.request_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        msg: Message,
        limit: Duration,
    ) -> Result<Value, ClientError> {
        let id = msg.request_id().ok_or(ClientError::NotARequest)?;
        let msg_type = msg.msg_type();
        if !self.is_connected() {
            self.wait_until_connected(limit).await?;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.pending.insert(id, reply_tx);
        if let Err(e) = self.send_raw(&msg).await {
            self.inner.pending.remove(&id);
            return Err(e);
        }

        let outcome = timeout(limit, reply_rx).await;
        // The pending entry is popped on every exit path
        self.inner.pending.remove(&id);
        match outcome {
            Err(_) => Err(ClientError::Timeout {
                msg_type,
                timeout: limit,
            }),
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Ok(Ok(reply)) => match reply {
                Message::Ok { result, .. } => {
                    Ok(result.unwrap_or_else(|| Value::Object(JsonMap::new())))
                }
                Message::Pong { .. } => Ok(Value::Object(JsonMap::new())),
                Message::Error {
                    code,
                    message,
                    details,
                    ..
                } => Err(ClientError::Server {
                    code,
                    message,
                    details,
                }),
                other => Err(ClientError::ConnectionFailed(format!(
                    "unexpected reply {:?}",
                    other.msg_type()
                ))),
            },
        }
    }

    /// Fire-and-forget write; no response expected
    pub async fn send(&self, msg: Message) -> Result<(), ClientError> {
        self.send_raw(&msg).await
    }

    // ── Subscriptions ───────────────────────────────────────────────────

    /// Subscribe to a project's events. Remembered locally and replayed
    /// after every reconnect.
    pub async fn subscribe(&self, project_id: Uuid) -> Result<(), ClientError> {
        self.request(Message::subscribe(project_id)).await?;
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(project_id);
        Ok(())
    }

    pub async fn unsubscribe(&self, project_id: Uuid) -> Result<(), ClientError> {
        self.request(Message::unsubscribe(project_id)).await?;
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&project_id);
        Ok(())
    }

    // ── Event listeners ─────────────────────────────────────────────────

    /// Register a listener for an event type. `"*"` receives every event.
    /// Listeners run on the receive task and must not block it.
    pub fn on(
        &self,
        event_type: impl Into<String>,
        listener: impl Fn(&EventFrame) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let event_type = event_type.into();
        let id = self.inner.listener_seq.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(event_type.clone())
            .or_default()
            .push((id, Arc::new(listener)));
        ListenerHandle { event_type, id }
    }

    /// Remove one listener by its handle
    pub fn off(&self, handle: &ListenerHandle) {
        let mut listeners = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if let Some(list) = listeners.get_mut(&handle.event_type) {
            list.retain(|(id, _)| *id != handle.id);
        }
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn send_raw(&self, msg: &Message) -> Result<(), ClientError> {
        let text = msg.to_json()?;
        let mut guard = self.inner.writer.lock().await;
        match guard.as_mut() {
            Some(sink) => {
                sink.send(WsMessage::Text(text)).await?;
                Ok(())
            }
            None => Err(ClientError::ConnectionClosed),
        }
    }

    /// Establish the socket and complete the hello/welcome exchange.
    /// Returns the read half; the write half is stowed for senders.
    async fn connect_handshake(&self) -> Result<WsSource, ClientError> {
        let (stream, _response) = connect_async(&self.inner.server_url)
            .await
            .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let hello = Message::hello(
            self.inner.client_name.clone(),
            self.inner.options.endpoint_type.clone(),
            self.inner.options.capabilities.clone(),
            self.last_event_id(),
        );
        sink.send(WsMessage::Text(hello.to_json()?)).await?;

        let welcome = loop {
            let frame = timeout(HANDSHAKE_TIMEOUT, source.next())
                .await
                .map_err(|_| ClientError::Timeout {
                    msg_type: "welcome",
                    timeout: HANDSHAKE_TIMEOUT,
                })?;
            match frame {
                Some(Ok(WsMessage::Text(text))) => break Message::parse(&text)?,
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ClientError::ConnectionFailed(e.to_string())),
                None => return Err(ClientError::ConnectionClosed),
            }
        };
        let Message::Welcome {
            session_id,
            registry_summary,
            ..
        } = welcome
        else {
            return Err(ClientError::ConnectionFailed(format!(
                "expected welcome, got {:?}",
                welcome.msg_type()
            )));
        };

        {
            let mut state = self.lock_state();
            state.session_id = Some(session_id);
            state.registry_summary = registry_summary;
        }
        *self.inner.writer.lock().await = Some(sink);
        *self
            .inner
            .reconnect_delay
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = RECONNECT_BASE_DELAY;
        self.inner.connected.send_replace(true);
        tracing::info!(
            client_name = %self.inner.client_name,
            session_id = %session_id,
            "Connected to {}",
            self.inner.server_url
        );

        // Replay remembered subscriptions after a reconnect
        let subscriptions: Vec<Uuid> = self
            .inner
            .subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .copied()
            .collect();
        for project_id in subscriptions {
            if let Err(e) = self.send_raw(&Message::subscribe(project_id)).await {
                tracing::warn!(project_id = %project_id, error = %e, "Re-subscribe failed");
            }
        }

        Ok(source)
    }

    async fn receive_loop(self, mut reader: WsSource) {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                frame = reader.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => self.handle_frame(&text),
                        Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => {
                            self.inner.connected.send_replace(false);
                            self.fail_pending();
                            if self.inner.options.auto_reconnect && !self.inner.cancel.is_cancelled() {
                                match self.reconnect().await {
                                    Some(new_reader) => {
                                        reader = new_reader;
                                        continue;
                                    }
                                    None => break,
                                }
                            }
                            break;
                        }
                        // The transport layer answers pings itself
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        let msg = match Message::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to parse inbound frame");
                return;
            }
        };
        match msg {
            Message::Ok { .. } | Message::Error { .. } | Message::Pong { .. } => {
                let Some(id) = msg.request_id() else {
                    return;
                };
                match self.inner.pending.remove(&id) {
                    Some((_, reply_tx)) => {
                        let _ = reply_tx.send(msg);
                    }
                    None => {
                        tracing::debug!(request_id = %id, "Response with no pending request");
                    }
                }
            }
            Message::Event(frame) => {
                self.lock_state().last_event_id = Some(frame.event_id);
                self.dispatch_event(&frame);
            }
            Message::Welcome {
                session_id,
                registry_summary,
                ..
            } => {
                // Fresh session after a server-side reconnect
                let mut state = self.lock_state();
                state.session_id = Some(session_id);
                state.registry_summary = registry_summary;
                drop(state);
                self.inner.connected.send_replace(true);
            }
            other => {
                tracing::debug!(msg_type = %other.msg_type(), "Unhandled inbound frame");
            }
        }
    }

    /// Fire listeners for one event. A panicking listener is logged and
    /// never takes the receive loop down.
    fn dispatch_event(&self, frame: &EventFrame) {
        let targets: Vec<Listener> = {
            let listeners = self
                .inner
                .listeners
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            listeners
                .get(&frame.event_type)
                .into_iter()
                .chain(listeners.get("*"))
                .flatten()
                .map(|(_, listener)| listener.clone())
                .collect()
        };
        for listener in targets {
            if catch_unwind(AssertUnwindSafe(|| listener(frame))).is_err() {
                tracing::error!(
                    event_type = %frame.event_type,
                    "Event listener panicked"
                );
            }
        }
    }

    /// Next backoff delay: doubles per attempt, capped
    fn next_reconnect_delay(&self) -> Duration {
        let mut guard = self
            .inner
            .reconnect_delay
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let current = *guard;
        *guard = (current * 2).min(RECONNECT_MAX_DELAY);
        current
    }

    async fn reconnect(&self) -> Option<WsSource> {
        loop {
            let delay = self.next_reconnect_delay();
            tracing::info!(delay = ?delay, "Reconnecting...");
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.connect_handshake().await {
                Ok(reader) => {
                    tracing::info!("Reconnected");
                    return Some(reader);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Reconnect attempt failed");
                }
            }
        }
    }

    fn fail_pending(&self) {
        let ids: Vec<Uuid> = self.inner.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            // Dropping the sender resolves the waiter with a closed error
            self.inner.pending.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn client() -> AsyncClient {
        AsyncClient::new("test", "ws://localhost:9998/ws")
    }

    fn event_text(event_type: &str) -> String {
        Message::event(Uuid::new_v4(), event_type, None, None, json!({}))
            .to_json()
            .unwrap()
    }

    #[tokio::test]
    async fn test_listeners_fire_by_type_and_wildcard() {
        let client = client();
        let typed = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        let typed_count = typed.clone();
        client.on("entity.updated", move |_| {
            typed_count.fetch_add(1, Ordering::SeqCst);
        });
        let all_count = all.clone();
        client.on("*", move |_| {
            all_count.fetch_add(1, Ordering::SeqCst);
        });

        client.handle_frame(&event_text("entity.updated"));
        client.handle_frame(&event_text("entity.created"));

        assert_eq!(typed.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_off_removes_listener() {
        let client = client();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let handle = client.on("entity.updated", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        client.handle_frame(&event_text("entity.updated"));
        client.off(&handle);
        client.handle_frame(&event_text("entity.updated"));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_listener_panic_is_contained() {
        let client = client();
        let reached = Arc::new(AtomicUsize::new(0));
        client.on("entity.updated", |_| panic!("listener bug"));
        let counter = reached.clone();
        client.on("entity.updated", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        client.handle_frame(&event_text("entity.updated"));
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_event_advances_cursor() {
        let client = client();
        assert_eq!(client.last_event_id(), None);
        let event_id = Uuid::new_v4();
        let text = Message::event(event_id, "role.renamed", None, None, json!({}))
            .to_json()
            .unwrap();
        client.handle_frame(&text);
        assert_eq!(client.last_event_id(), Some(event_id));
    }

    #[tokio::test]
    async fn test_response_resolves_pending() {
        let client = client();
        let request_id = Uuid::new_v4();
        let (reply_tx, reply_rx) = oneshot::channel();
        client.inner.pending.insert(request_id, reply_tx);

        let text = Message::ok(request_id, Some(json!({"project_id": "x"})))
            .to_json()
            .unwrap();
        client.handle_frame(&text);

        match reply_rx.await {
            Ok(Message::Ok { id, .. }) => assert_eq!(id, request_id),
            other => panic!("expected resolved ok, got {:?}", other),
        }
        assert!(client.inner.pending.is_empty());
    }

    #[tokio::test]
    async fn test_backoff_doubles_to_cap() {
        let client = client();
        let mut delays = Vec::new();
        for _ in 0..8 {
            delays.push(client.next_reconnect_delay());
        }
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert_eq!(delays[2], Duration::from_secs(4));
        assert_eq!(delays[7], Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_welcome_refreshes_session() {
        let client = client();
        let session_id = Uuid::new_v4();
        let text = Message::welcome(Uuid::new_v4(), session_id, "0.1.0", json!({"roles": []}))
            .to_json()
            .unwrap();
        client.handle_frame(&text);
        assert_eq!(client.session_id(), Some(session_id));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_request_rejects_frames_without_id() {
        let client = client();
        let err = client.request(Message::bye("x")).await.unwrap_err();
        assert!(matches!(err, ClientError::NotARequest));
    }
}
