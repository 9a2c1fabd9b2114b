//! The server: connection manager, message router, and the application
//! that ties them to the WebSocket transport.

pub mod app;
pub mod connections;
pub mod router;

pub use app::BridgeServer;
pub use connections::{ConnectedClient, ConnectionManager};
pub use router::{RequestContext, Router};
