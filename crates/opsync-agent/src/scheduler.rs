//! Periodic background work: sync cycles and TTL pruning.
//!
//! The cadence comes from a [`Ticker`], so tests drive cycles explicitly
//! instead of sleeping. Every loop stops when its cancellation token fires.

use crate::engine::SyncEngine;
use crate::sync::SyncOutcome;
use async_trait::async_trait;
use opsync_relay::Relay;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Source of scheduling ticks.
#[async_trait]
pub trait Ticker: Send {
    /// Wait for the next tick. Returns `false` once no more ticks will come.
    async fn tick(&mut self) -> bool;
}

/// Ticks on a fixed period; missed ticks are skipped, not bunched up.
#[derive(Debug)]
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    /// Ticker firing immediately and then every `period`.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) -> bool {
        self.interval.tick().await;
        true
    }
}

/// Ticker driven by hand through a [`ManualTickHandle`].
#[derive(Debug)]
pub struct ManualTicker {
    rx: mpsc::UnboundedReceiver<()>,
}

/// Fires ticks on its [`ManualTicker`]. Dropping every handle ends the ticker.
#[derive(Debug, Clone)]
pub struct ManualTickHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl ManualTicker {
    /// Create a ticker and its handle.
    #[must_use]
    pub fn new() -> (Self, ManualTickHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx }, ManualTickHandle { tx })
    }
}

impl ManualTickHandle {
    /// Fire one tick. Returns `false` if the ticker is gone.
    pub fn tick(&self) -> bool {
        self.tx.send(()).is_ok()
    }
}

#[async_trait]
impl Ticker for ManualTicker {
    async fn tick(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}

/// Start a sync cycle on every tick until cancelled or the ticker ends.
///
/// Each cycle runs as its own task, so a tick that arrives while a cycle is
/// still running is answered with [`SyncOutcome::Skipped`] rather than queued.
/// In-flight cycles are awaited before returning.
pub async fn run_sync_loop<T: Ticker>(
    engine: Arc<SyncEngine>,
    relay: Arc<dyn Relay>,
    mut ticker: T,
    cancel: CancellationToken,
) {
    let mut running = JoinSet::new();
    info!(peer = relay.peer(), "sync loop started");

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            more = ticker.tick() => {
                if !more {
                    break;
                }
                let engine = engine.clone();
                let relay = relay.clone();
                running.spawn(async move { engine.sync_with(relay.as_ref()).await });
            }
            Some(joined) = running.join_next(), if !running.is_empty() => {
                log_cycle(joined);
            }
        }
    }

    while let Some(joined) = running.join_next().await {
        log_cycle(joined);
    }
    info!(peer = relay.peer(), "sync loop stopped");
}

fn log_cycle(joined: Result<Result<SyncOutcome, opsync_core::SyncError>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(SyncOutcome::Completed(report))) => {
            debug!(peer = %report.peer, complete = report.is_complete(), "sync cycle finished");
        }
        Ok(Ok(SyncOutcome::Skipped)) => {}
        Ok(Err(e)) => warn!(error = %e, retryable = e.is_retryable(), "sync cycle failed"),
        Err(e) => error!(error = %e, "sync cycle task panicked"),
    }
}

/// Spawn [`run_sync_loop`] on an [`IntervalTicker`].
#[must_use]
pub fn spawn_sync_loop(
    engine: Arc<SyncEngine>,
    relay: Arc<dyn Relay>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_sync_loop(engine, relay, IntervalTicker::new(period), cancel).await;
    })
}

/// Prune expired ephemeral events on every tick until cancelled.
pub async fn run_prune_loop<T: Ticker>(engine: Arc<SyncEngine>, mut ticker: T, cancel: CancellationToken) {
    info!(
        types = engine.options().ephemeral_types.len(),
        "prune loop started"
    );

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            more = ticker.tick() => {
                if !more {
                    break;
                }
                match engine.prune_expired() {
                    Ok(0) => {}
                    Ok(pruned) => debug!(pruned, "prune run finished"),
                    Err(e) => warn!(error = %e, "prune run failed"),
                }
            }
        }
    }
    info!("prune loop stopped");
}

/// Spawn [`run_prune_loop`] on an [`IntervalTicker`].
#[must_use]
pub fn spawn_prune_loop(
    engine: Arc<SyncEngine>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_prune_loop(engine, IntervalTicker::new(period), cancel).await;
    })
}
