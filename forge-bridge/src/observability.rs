//! Tracing initialization

use tracing_subscriber::EnvFilter;

use crate::config::ServiceConfig;

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured log level, so operators can raise
/// verbosity per-module without touching configuration files.
pub fn init_tracing(config: &ServiceConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
