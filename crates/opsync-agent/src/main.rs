//! # opsync agent daemon
//!
//! Opens the local event log and runs two background loops until Ctrl+C:
//! 1. **Sync**: pull, verify, merge, and push against the configured relay
//! 2. **Prune**: drop expired events of ephemeral entity types

use anyhow::{Context, Result};
use opsync_agent::scheduler::{spawn_prune_loop, spawn_sync_loop};
use opsync_agent::{AgentConfig, SyncEngine};
use opsync_relay::{HttpRelay, RelayClientConfig};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting opsync agent");

    let config = AgentConfig::from_env()?;
    let engine = Arc::new(SyncEngine::open(&config).context("Failed to open sync engine")?);
    let cancel = engine.cancellation_token();

    let status = engine.get_sync_status()?;
    tracing::info!(
        device_id = %status.device_id,
        events = status.events_in_log,
        unsynced = status.unsynced_count,
        quarantined = status.quarantined_count,
        "Agent initialized"
    );

    let mut tasks = Vec::new();

    match (&config.relay.url, config.sync.enabled) {
        (Some(url), true) => {
            let relay = HttpRelay::new(RelayClientConfig {
                base_url: url.clone(),
                timeout: config.relay.timeout,
                bearer_token: config.relay.bearer_token.clone(),
                ca_cert_path: config.relay.ca_cert_path.clone(),
            })
            .context("Failed to create relay client")?;
            tasks.push(spawn_sync_loop(
                engine.clone(),
                Arc::new(relay),
                config.sync.interval,
                cancel.clone(),
            ));
        }
        (None, true) => tracing::warn!("No relay configured (OPSYNC_RELAY_URL); sync is idle"),
        (_, false) => tracing::info!("Sync disabled"),
    }

    if !config.ephemeral_types.is_empty() {
        tasks.push(spawn_prune_loop(
            engine.clone(),
            config.prune_interval,
            cancel.clone(),
        ));
    }

    tracing::info!("Agent running, press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutdown signal received");
    engine.shutdown();
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Background task ended abnormally");
        }
    }

    tracing::info!("Agent stopped");
    Ok(())
}
