//! The bridge server application.
//!
//! Lifecycle:
//!   1. Start — connect to the store, verify the schema, restore the
//!      registry, bind the WebSocket port.
//!   2. Run — accept connections; each accepted socket gets its own task.
//!   3. Stop — SIGINT/SIGTERM drains connections, then the pool closes.
//!
//! Per-connection flow: wait up to the handshake timeout for `hello`,
//! register the client, open a session row, send `welcome`, replay missed
//! events, then run the receive loop until disconnect. Application-level
//! pings go out every ping interval; a missing pong past the pong timeout
//! is a disconnect.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Router as AxumRouter,
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time::{timeout, MissedTickBehavior, Sleep};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::{Config, WebSocketConfig};
use crate::core::registry::Registry;
use crate::error::Result;
use crate::protocol::{ErrorCode, Message};
use crate::server::connections::ConnectionManager;
use crate::server::router::{RequestContext, Router};
use crate::store::{ClientSessionRepo, EventRepo, NewSession, RegistryRepo, Store};

/// Shared state handed to every connection task
#[derive(Clone)]
struct AppState {
    router: Arc<Router>,
    connections: Arc<ConnectionManager>,
    registry: Arc<RwLock<Registry>>,
    store: Store,
    config: Arc<Config>,
}

/// The forge-bridge WebSocket server
pub struct BridgeServer {
    config: Config,
}

impl BridgeServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Initialize everything and serve until a shutdown signal arrives
    pub async fn run(self) -> Result<()> {
        tracing::info!(
            "{} v{} starting...",
            self.config.service.name,
            env!("CARGO_PKG_VERSION")
        );

        let store = Store::connect(&self.config.database).await?;
        store.ensure_schema().await?;
        tracing::info!("Database schema verified");

        // Restore the registry from the persisted state of record, then
        // write the seeds through so first boot lands them in the store
        let registry = {
            let mut conn = store.acquire().await?;
            let mut repo = RegistryRepo::new(&mut conn);
            let registry = repo.restore_registry().await?;
            repo.persist_registry(&registry).await?;
            registry
        };
        tracing::info!(
            roles = registry.roles.len(),
            relationship_types = registry.relationship_types.len(),
            "Registry loaded"
        );

        // Sessions still marked active belong to a previous run; nobody is
        // connected yet
        {
            let mut conn = store.acquire().await?;
            let mut sessions = ClientSessionRepo::new(&mut conn);
            let stale = sessions.list_active().await?;
            if !stale.is_empty() {
                tracing::info!(count = stale.len(), "Closing stale session rows");
                for session in stale {
                    sessions.close(session.id).await?;
                }
            }
        }

        let connections = Arc::new(ConnectionManager::new());
        let registry = Arc::new(RwLock::new(registry));
        let router = Arc::new(Router::new(
            connections.clone(),
            registry.clone(),
            store.clone(),
        ));
        let state = AppState {
            router: router.clone(),
            connections: connections.clone(),
            registry,
            store: store.clone(),
            config: Arc::new(self.config.clone()),
        };

        let app = AxumRouter::new()
            .route("/ws", get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        let addr = self.config.bind_addr()?;
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Listening on ws://{}/ws", addr);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        // Any sessions still open at shutdown are marked closed
        for session_id in connections.session_ids() {
            router.close_session(session_id).await;
        }
        store.close().await;
        tracing::info!("Server stopped");
        Ok(())
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}

async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let max_bytes = state.config.websocket.max_message_bytes;
    ws.max_message_size(max_bytes)
        .on_upgrade(move |socket| handle_connection(state, socket, addr))
}

/// What the handshake learned about the peer
struct Handshake {
    request_id: Uuid,
    client_name: String,
    endpoint_type: String,
    capabilities: Value,
    last_event_id: Option<Uuid>,
}

/// Manage one client connection from accept to disconnect
async fn handle_connection(state: AppState, socket: WebSocket, addr: SocketAddr) {
    let ws_config = state.config.websocket.clone();

    let (socket, handshake) = match await_hello(socket, &ws_config, addr).await {
        Some(parts) => parts,
        None => return,
    };

    let session_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<WsMessage>(ws_config.outbound_queue);
    state.connections.register(
        session_id,
        tx.clone(),
        &handshake.client_name,
        &handshake.endpoint_type,
        handshake.last_event_id,
    );

    // Session row is bookkeeping; a store hiccup must not refuse the client
    let opened: Result<()> = async {
        let mut conn = state.store.acquire().await?;
        ClientSessionRepo::new(&mut conn)
            .open(&NewSession {
                id: session_id,
                client_name: handshake.client_name.clone(),
                endpoint_type: Some(handshake.endpoint_type.clone()),
                host: Some(addr.to_string()),
                capabilities: handshake.capabilities.clone(),
            })
            .await
    }
    .await;
    if let Err(e) = opened {
        tracing::warn!(session_id = %session_id, error = %e, "Failed to open session row");
    }

    // Writer half: the only task that touches the sink, draining the
    // bounded queue in FIFO order
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(frame).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let summary = state
        .registry
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .summary();
    let welcome = Message::welcome(
        handshake.request_id,
        session_id,
        env!("CARGO_PKG_VERSION"),
        summary,
    );
    state.connections.send_to(session_id, &welcome);

    // Catch-up is best-effort: on a read failure the client proceeds live
    if let Some(cursor) = handshake.last_event_id {
        match replay_missed_events(&state, session_id, cursor).await {
            Ok(0) => {}
            Ok(count) => {
                tracing::info!(
                    session_id = %session_id,
                    count = count,
                    "Replayed missed events"
                );
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Catch-up replay failed");
            }
        }
    }

    let ctx = RequestContext {
        session_id,
        client_name: handshake.client_name.clone(),
    };
    receive_loop(&state, &mut ws_receiver, &tx, &ctx, &ws_config).await;

    state.connections.unregister(session_id);
    state.router.close_session(session_id).await;
    drop(tx);
    let _ = writer.await;
}

/// Step 1: the first frame must be a well-formed `hello` within the
/// handshake timeout. Anything else closes the socket.
async fn await_hello(
    mut socket: WebSocket,
    ws_config: &WebSocketConfig,
    addr: SocketAddr,
) -> Option<(WebSocket, Handshake)> {
    let first = match timeout(ws_config.handshake_timeout(), socket.recv()).await {
        Ok(frame) => frame,
        Err(_) => {
            tracing::warn!(peer = %addr, "Timed out waiting for hello");
            let _ = socket.send(WsMessage::Close(None)).await;
            return None;
        }
    };
    let Some(Ok(WsMessage::Text(text))) = first else {
        tracing::warn!(peer = %addr, "Connection dropped before hello");
        return None;
    };
    match Message::parse(text.as_str()) {
        Ok(Message::Hello {
            id,
            client_name,
            endpoint_type,
            capabilities,
            last_event_id,
        }) => Some((
            socket,
            Handshake {
                request_id: id,
                client_name,
                endpoint_type,
                capabilities: Value::Object(capabilities),
                last_event_id,
            },
        )),
        Ok(other) => {
            tracing::warn!(peer = %addr, msg_type = %other.msg_type(), "Expected hello");
            let reply = Message::error(
                other.request_id(),
                ErrorCode::Invalid,
                "First message must be hello",
                None,
            );
            if let Ok(text) = reply.to_json() {
                let _ = socket.send(WsMessage::Text(text.into())).await;
            }
            let _ = socket.send(WsMessage::Close(None)).await;
            None
        }
        Err(e) => {
            tracing::warn!(peer = %addr, error = %e, "Malformed hello");
            let _ = socket.send(WsMessage::Close(None)).await;
            None
        }
    }
}

/// Deliver every event after `cursor` in log order, ahead of live traffic
async fn replay_missed_events(state: &AppState, session_id: Uuid, cursor: Uuid) -> Result<usize> {
    let mut conn = state.store.acquire().await?;
    let missed = EventRepo::new(&mut conn).get_since(cursor, 500).await?;
    let count = missed.len();
    for record in missed {
        let msg = Message::event(
            record.id,
            record.event_type,
            record.project_id,
            record.entity_id,
            record.payload,
        );
        state.connections.send_to(session_id, &msg);
    }
    Ok(count)
}

/// Receive and dispatch frames until the connection goes away
async fn receive_loop(
    state: &AppState,
    ws_receiver: &mut (impl futures::Stream<Item = std::result::Result<WsMessage, axum::Error>> + Unpin),
    tx: &mpsc::Sender<WsMessage>,
    ctx: &RequestContext,
    ws_config: &WebSocketConfig,
) {
    let mut ping_interval = tokio::time::interval(ws_config.ping_interval());
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; consume it so pings start one
    // interval in
    ping_interval.tick().await;
    let mut pong_deadline: Option<Pin<Box<Sleep>>> = None;

    loop {
        tokio::select! {
            frame = ws_receiver.next() => {
                let Some(Ok(frame)) = frame else { break };
                match frame {
                    WsMessage::Text(text) => {
                        match Message::parse(text.as_str()) {
                            Ok(msg) => {
                                let is_bye = matches!(msg, Message::Bye { .. });
                                if let Some(reply) = state.router.dispatch(msg, ctx).await {
                                    if !send_message(tx, &reply).await {
                                        break;
                                    }
                                }
                                if is_bye {
                                    break;
                                }
                            }
                            Err(parse_err) => {
                                if !send_message(tx, &parse_err.to_error_message()).await {
                                    break;
                                }
                            }
                        }
                    }
                    WsMessage::Binary(_) => {
                        let reply = Message::error(
                            None,
                            ErrorCode::Invalid,
                            "Binary frames are not part of the protocol",
                            None,
                        );
                        if !send_message(tx, &reply).await {
                            break;
                        }
                    }
                    WsMessage::Pong(_) => {
                        pong_deadline = None;
                    }
                    // The transport answers pings for us
                    WsMessage::Ping(_) => {}
                    WsMessage::Close(_) => break,
                }
            }
            _ = ping_interval.tick() => {
                if tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                if pong_deadline.is_none() {
                    pong_deadline = Some(Box::pin(tokio::time::sleep(ws_config.pong_timeout())));
                }
            }
            _ = async {
                match pong_deadline.as_mut() {
                    Some(deadline) => deadline.as_mut().await,
                    None => std::future::pending().await,
                }
            } => {
                tracing::warn!(
                    session_id = %ctx.session_id,
                    "No pong within the timeout; disconnecting"
                );
                break;
            }
        }
    }
}

/// Serialize and enqueue a reply on the connection's own queue. Returns
/// false when the connection is gone.
async fn send_message(tx: &mpsc::Sender<WsMessage>, msg: &Message) -> bool {
    match msg.to_json() {
        Ok(text) => tx.send(WsMessage::Text(text.into())).await.is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize reply");
            true
        }
    }
}
