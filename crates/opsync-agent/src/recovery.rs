//! Rebuilding a device from a relay or a backup bundle.
//!
//! Recovery imports the full history, keeps whatever verifies, and replays
//! every key from scratch. Events that fail verification are reported as
//! integrity failures but never block the rest of the history.

use crate::engine::{refold, SyncEngine};
use crate::notify::SyncNotification;
use crate::persistence::WatermarkKind;
use crate::sync::retry_with_backoff;
use opsync_core::verify::import_with_links;
use opsync_core::{ChainLink, Event, EventHash, SyncError, Timestamp};
use opsync_proto::EventBundle;
use opsync_relay::Relay;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{error, info};

/// Outcome of a recovery run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Events verified and appended
    pub accepted: usize,
    /// Events already present locally
    pub duplicates: usize,
    /// Events rejected by verification
    pub quarantined: usize,
    /// Devices with at least one accepted event
    pub devices: usize,
    /// Entities with folded state after the replay
    pub entities: usize,
    /// Rejections caused by a broken hash, signature, or chain link
    pub integrity_failures: usize,
    /// Chain links recorded for events pruned at the source
    pub bridged: usize,
    /// Highest accepted HLC
    pub highest_accepted: Option<Timestamp>,
    /// Local chain head after recovery
    pub chain_head: Option<EventHash>,
}

/// Pull the full history from a relay and rebuild local state.
///
/// The relay's pull watermark is reset to the highest event kept before the
/// first rejection, so rejected events are offered again by the next cycle.
///
/// # Errors
///
/// Returns [`SyncError::Network`] if the relay cannot be reached after
/// retries, or a storage error.
pub async fn recover_from_relay(
    engine: &SyncEngine,
    relay: &dyn Relay,
) -> Result<RecoveryReport, SyncError> {
    let peer = relay.peer().to_string();
    let device_id = engine.device_id();
    let cancel = engine.cancellation_token();
    info!(%peer, "recovering from relay");

    let events = retry_with_backoff(&engine.options().retry, &cancel, "recover", || {
        relay.fetch_since(None, device_id)
    })
    .await?;

    recover(engine, events, Vec::new(), Some(&peer))
}

/// Rebuild local state from a backup bundle.
///
/// Chain links in the bundle stand in for events pruned before export.
///
/// # Errors
///
/// Returns a storage error.
pub fn recover_from_bundle(
    engine: &SyncEngine,
    bundle: EventBundle,
) -> Result<RecoveryReport, SyncError> {
    info!(
        source = %bundle.device_id,
        exported_at = %bundle.exported_at,
        events = bundle.events.len(),
        links = bundle.links.len(),
        "recovering from bundle"
    );
    recover(engine, bundle.events, bundle.links, None)
}

fn recover(
    engine: &SyncEngine,
    events: Vec<Event>,
    links: Vec<ChainLink>,
    peer: Option<&str>,
) -> Result<RecoveryReport, SyncError> {
    let (report, rejected) = engine.with_state(|state, keys, schema| {
        let outcome =
            import_with_links(&mut state.store, &state.trusted, keys, schema, events, links)?;

        for entry in &outcome.quarantined {
            state.store.record_quarantine(entry)?;
        }
        for (event, _) in &outcome.accepted {
            state.builder.observe(event.hlc);
            state.store.release_quarantine(&event.op_id)?;
        }

        refold(state, keys)?;
        let chain_head = state.builder.repair_chain_head(&state.store)?;

        if let (Some(peer), Some(hlc)) = (peer, outcome.resume_at) {
            state.store.set_watermark(peer, WatermarkKind::Pull, &hlc)?;
        }

        let devices: BTreeSet<_> = outcome.accepted.iter().map(|(e, _)| e.device_id).collect();
        let report = RecoveryReport {
            accepted: outcome.accepted.len(),
            duplicates: outcome.duplicates,
            quarantined: outcome.quarantined.len(),
            devices: devices.len(),
            entities: state.resolver.len(),
            integrity_failures: outcome.integrity_failures(),
            bridged: outcome.bridged,
            highest_accepted: outcome.highest_accepted,
            chain_head,
        };
        Ok::<_, SyncError>((report, outcome.quarantined))
    })?;

    for entry in rejected {
        engine.notify(SyncNotification::EventQuarantined(entry));
    }

    if report.integrity_failures > 0 {
        error!(
            failures = report.integrity_failures,
            "recovery skipped events that failed integrity checks"
        );
    }
    info!(
        accepted = report.accepted,
        duplicates = report.duplicates,
        quarantined = report.quarantined,
        bridged = report.bridged,
        devices = report.devices,
        entities = report.entities,
        "recovery completed"
    );
    Ok(report)
}
