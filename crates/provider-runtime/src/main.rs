//! # Taskmesh Provider
//!
//! Runs the bundled KV provider behind the provider server until signalled.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use provider_runtime::providers::{KvProvider, KvStore};
use provider_runtime::{init_logging, ProviderConfig, Server};
use shared_bus::CookieRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ProviderConfig::load().context("Failed to load configuration")?;
    init_logging(&config.logging).context("Failed to initialize logging")?;

    let mut server = Server::new(config).context("Failed to create provider server")?;

    let kv = Arc::new(KvProvider::new(
        Arc::new(KvStore::default()),
        Arc::new(CookieRegistry::new()),
        server.stream_transport(),
        server.config().stream_dir_for("kv-watch"),
    ));
    kv.register(server.tasks());

    if server.registered_tasks().is_empty() {
        warn!("No registered tasks, exiting");
        return Ok(());
    }

    let addr = server.start().await.context("Failed to start provider server")?;
    info!(addr = %addr, "Provider ready");

    server
        .stop_on_signal()
        .await
        .context("Failed waiting for shutdown signal")?;
    Ok(())
}
