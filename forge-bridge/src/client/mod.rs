//! Client library: the async client and its blocking adapter.

pub mod async_client;
pub mod sync_client;

pub use async_client::{AsyncClient, ClientOptions, ListenerHandle};
pub use sync_client::SyncClient;

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::protocol::{ErrorCode, ProtocolError};

/// Client-side failures.
///
/// `Server` carries the wire error taxonomy, so callers can distinguish
/// recoverable conditions (orphan-blocked, already-exists, invalid input)
/// from infrastructure faults (internal errors, lost connections).
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server answered with an error frame
    #[error("[{code}] {message}")]
    Server {
        code: ErrorCode,
        message: String,
        details: Option<Value>,
    },

    /// No response arrived in time; the connection stays up
    #[error("no response to {msg_type:?} after {timeout:?}")]
    Timeout {
        msg_type: &'static str,
        timeout: Duration,
    },

    /// The connection is gone
    #[error("connection closed")]
    ConnectionClosed,

    /// Connecting or the handshake failed
    #[error("could not connect: {0}")]
    ConnectionFailed(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// The message carries no request id; use the protocol constructors
    #[error("message has no request id")]
    NotARequest,
}

impl ClientError {
    /// Whether retrying the same request could succeed without operator
    /// intervention
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Server { code, .. } => matches!(
                code,
                ErrorCode::OrphanBlocked | ErrorCode::AlreadyExists | ErrorCode::Invalid
            ),
            Self::Timeout { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_split() {
        let orphaned = ClientError::Server {
            code: ErrorCode::OrphanBlocked,
            message: "still referenced".to_string(),
            details: None,
        };
        let internal = ClientError::Server {
            code: ErrorCode::Internal,
            message: "boom".to_string(),
            details: None,
        };
        assert!(orphaned.is_recoverable());
        assert!(!internal.is_recoverable());
        assert!(!ClientError::ConnectionClosed.is_recoverable());
    }

    #[test]
    fn test_server_error_display() {
        let err = ClientError::Server {
            code: ErrorCode::NotFound,
            message: "Shot EP60_010 not found".to_string(),
            details: None,
        };
        assert_eq!(err.to_string(), "[NOT_FOUND] Shot EP60_010 not found");
    }
}
