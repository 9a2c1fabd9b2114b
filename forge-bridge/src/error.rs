//! Crate-wide error types

use thiserror::Error;

use crate::core::registry::RegistryError;
use crate::core::vocabulary::VocabularyError;
use crate::protocol::ProtocolError;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for server and store operations
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be loaded or validated
    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Registry invariant violation
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Vocabulary value could not be parsed or validated
    #[error(transparent)]
    Vocabulary(#[from] VocabularyError),

    /// Wire frame could not be parsed or serialized
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Network binding or socket failure
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Anything else that should not leak internals to clients
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an internal error from any displayable value
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
