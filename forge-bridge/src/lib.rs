//! # forge-bridge
//!
//! Coordination hub for a fleet of creative-workstation processes around a
//! shared VFX pipeline database. A central server holds the authoritative
//! registry of roles and relationship types, persists entities and their
//! directed relationships, and fans change events out to every interested
//! client in real time.
//!
//! The crate splits into:
//!
//! - [`protocol`] — the typed JSON wire protocol
//! - [`core`] — entities, traits, vocabulary, and the registry with
//!   orphan protection
//! - [`store`] — sqlx/PostgreSQL repositories and the append-only event
//!   log
//! - [`server`] — connection manager, message router, and the WebSocket
//!   application
//! - [`client`] — the reconnecting async client and its blocking adapter
//!
//! ## Running a server
//!
//! ```rust,no_run
//! use forge_bridge::{config::Config, observability, server::BridgeServer};
//!
//! #[tokio::main]
//! async fn main() -> forge_bridge::Result<()> {
//!     let config = Config::load()?;
//!     observability::init_tracing(&config.service);
//!     BridgeServer::new(config).run().await
//! }
//! ```
//!
//! ## Talking to one
//!
//! ```rust,no_run
//! use forge_bridge::client::AsyncClient;
//! use forge_bridge::protocol::Message;
//!
//! # async fn run() -> Result<(), forge_bridge::client::ClientError> {
//! let client = AsyncClient::new("workstation_a", "ws://localhost:9998/ws");
//! client.start().await?;
//! let projects = client.request(Message::project_list()).await?;
//! client.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod core;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod server;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
pub use protocol::{ErrorCode, Message};
