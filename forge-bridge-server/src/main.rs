//! forge-bridge server binary.
//!
//! Loads configuration from files and FORGE_* environment variables,
//! initializes tracing, and runs the server until SIGINT/SIGTERM.

use anyhow::Context;
use forge_bridge::{config::Config, observability, server::BridgeServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    observability::init_tracing(&config.service);

    BridgeServer::new(config)
        .run()
        .await
        .context("server exited with an error")?;
    Ok(())
}
