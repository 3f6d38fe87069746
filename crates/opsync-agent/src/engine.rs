//! The sync engine facade used by the daemon, the CLI, and applications.
//!
//! All mutable state sits behind one mutex: local writes and remote merges
//! never interleave. The lock is never held across an `.await`; relay I/O
//! happens between short critical sections.

use crate::config::{AgentConfig, RelayConfig};
use crate::keys;
use crate::notify::{Notifier, SyncNotification};
use crate::persistence::{SqliteStore, WatermarkKind, META_LOCAL_DEVICE};
use crate::sync::{retry_with_backoff, CycleGuard, RetryPolicy, SyncOutcome, SyncReport};
use chrono::{DateTime, Utc};
use opsync_core::verify::{import_with_links, sort_for_import};
use opsync_core::{
    ChainLink, DeviceId, EntityKey, EntityPayload, EntityState, Event, EventBuilder, EventHash,
    EventLog, Hlc, ImportOutcome, KeyStore, MergePolicies, Op, PublicKey, Quarantined, Resolver,
    SchemaRegistry, SyncError, SystemClock, TrustedDevices, Verifier, WallClock,
};
use opsync_proto::EventBundle;
use opsync_relay::{HttpRelay, Relay, RelayClientConfig};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Tunables of a [`SyncEngine`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Whether periodic sync is enabled; reported in status
    pub sync_enabled: bool,
    /// Backoff for relay requests
    pub retry: RetryPolicy,
    /// Deadline for a whole sync cycle
    pub deadline: Duration,
    /// Events per push request
    pub push_batch: usize,
    /// Entries kept by append-only history fields
    pub history_limit: usize,
    /// Ephemeral entity types and their time to live
    pub ephemeral_types: HashMap<String, Duration>,
    /// Settings for relays opened by URL
    pub relay: RelayConfig,
    /// Wall clock feeding the HLC and TTL pruning
    pub wall: Arc<dyn WallClock>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default())
    }
}

impl EngineOptions {
    /// Options from the agent configuration, using the system clock.
    #[must_use]
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            sync_enabled: config.sync.enabled,
            retry: RetryPolicy::from_config(&config.sync),
            deadline: config.sync.deadline,
            push_batch: config.sync.push_batch.max(1),
            history_limit: config.history_limit,
            ephemeral_types: config.ephemeral_types.clone(),
            relay: config.relay.clone(),
            wall: Arc::new(SystemClock),
        }
    }
}

/// Outcome of [`SyncEngine::import_event_log`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Events verified and appended
    pub accepted: usize,
    /// Events already present
    pub duplicates: usize,
    /// Rejected events
    pub quarantined: Vec<Quarantined>,
    /// Rejections caused by a broken hash, signature, or chain link
    pub integrity_failures: usize,
    /// Chain links recorded for events pruned at the source
    pub bridged: usize,
}

/// Snapshot of the engine for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    /// Whether periodic sync is enabled
    pub enabled: bool,
    /// Local device
    pub device_id: DeviceId,
    /// Events held in the log
    pub events_in_log: usize,
    /// Completion time of the last full sync cycle
    pub last_sync: Option<DateTime<Utc>>,
    /// Own events not yet acknowledged by any relay
    pub unsynced_count: usize,
    /// Events rejected by verification so far
    pub quarantined_count: usize,
    /// Local writes are halted after a chain integrity failure
    pub chain_halted: bool,
    /// Entities with folded state
    pub entities: usize,
    /// Devices whose events are trusted, this one included
    pub trusted_devices: usize,
}

pub(crate) struct State {
    pub(crate) store: SqliteStore,
    pub(crate) builder: EventBuilder,
    pub(crate) resolver: Resolver,
    pub(crate) trusted: TrustedDevices,
}

/// Why a bounded relay request did not finish.
enum Interrupted {
    Deadline,
    Cancelled,
}

/// Local event log, derived state, and sync client for one device.
pub struct SyncEngine {
    keys: Arc<KeyStore>,
    schema: Arc<SchemaRegistry>,
    options: EngineOptions,
    state: Mutex<State>,
    notifier: Notifier,
    cycle: AtomicBool,
    cancel: CancellationToken,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("device_id", &self.keys.device_id())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Open the engine described by `config`, creating the data directory,
    /// database, and key file on first run.
    ///
    /// # Errors
    ///
    /// Returns error if the store or key material cannot be opened.
    pub fn open(config: &AgentConfig) -> Result<Self, SyncError> {
        if let Some(parent) = config.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                SyncError::Storage(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        let store = SqliteStore::open(&config.db_path)?;
        let keys = keys::load_or_create(&config.key_path, &store)?;
        Self::from_parts(store, keys, EngineOptions::from_config(config))
    }

    /// Engine over an in-memory store, for tests and tools.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be created.
    pub fn open_in_memory(keys: KeyStore) -> Result<Self, SyncError> {
        Self::open_in_memory_with(keys, EngineOptions::default())
    }

    /// Engine over an in-memory store with explicit options.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be created.
    pub fn open_in_memory_with(keys: KeyStore, options: EngineOptions) -> Result<Self, SyncError> {
        Self::from_parts(SqliteStore::in_memory()?, keys, options)
    }

    /// Assemble an engine from an opened store and loaded keys.
    ///
    /// Rebuilds entity state by replaying the whole log.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read, or if it belongs to another device.
    pub fn from_parts(
        store: SqliteStore,
        keys: KeyStore,
        options: EngineOptions,
    ) -> Result<Self, SyncError> {
        let keys = Arc::new(keys);
        let device_id = keys.device_id();

        match store.local_device()? {
            Some(recorded) if recorded != device_id => {
                return Err(SyncError::Key(format!(
                    "event log belongs to {recorded}, keys belong to {device_id}"
                )));
            }
            Some(_) => {}
            None => store.set_meta(META_LOCAL_DEVICE, &device_id.to_string())?,
        }
        store.trust_device(device_id, &keys.public_key())?;
        let trusted = store.trusted_devices()?;

        let schema = Arc::new(SchemaRegistry::with_builtin());
        let clock = Hlc::with_clock(device_id, options.wall.clone());
        let builder = EventBuilder::resume(keys.clone(), schema.clone(), clock, &store)?;
        let resolver = Resolver::new(MergePolicies::builtin(options.history_limit));

        let mut state = State {
            store,
            builder,
            resolver,
            trusted,
        };
        let events = refold(&mut state, &keys)?;
        info!(
            %device_id,
            events,
            entities = state.resolver.len(),
            trusted = state.trusted.len(),
            "sync engine opened"
        );

        Ok(Self {
            keys,
            schema,
            options,
            state: Mutex::new(state),
            notifier: Notifier::default(),
            cycle: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    /// Local device.
    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        self.keys.device_id()
    }

    /// Local key handle.
    #[must_use]
    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    /// Engine options.
    #[must_use]
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Token cancelling in-flight sync cycles and background loops.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel in-flight sync cycles and background loops.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Subscribe to engine notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.notifier.subscribe()
    }

    pub(crate) fn notify(&self, notification: SyncNotification) {
        self.notifier.send(notification);
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut State, &KeyStore, &SchemaRegistry) -> R) -> R {
        let mut state = self.state.lock();
        f(&mut *state, &*self.keys, &*self.schema)
    }

    /// Record a local mutation as a signed, encrypted, chained event.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Schema`] for an invalid payload, [`SyncError::LogHalted`]
    /// while the chain is halted, or the first failure of building or appending.
    /// Nothing is appended on error.
    pub fn create_sync_event(
        &self,
        entity_type: &str,
        entity_id: &str,
        op: Op,
        payload: &Value,
    ) -> Result<Event, SyncError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let was_halted = state.builder.is_halted();

        match state
            .builder
            .create_event(&mut state.store, entity_type, entity_id, op, payload)
        {
            Ok(event) => {
                state.resolver.apply(&event, payload.clone());
                drop(guard);
                self.notify(SyncNotification::EventCreated {
                    op_id: event.op_id,
                    key: event.key(),
                    hlc: event.hlc,
                });
                Ok(event)
            }
            Err(e) => {
                if !was_halted && state.builder.is_halted() {
                    drop(guard);
                    self.notify(SyncNotification::ChainHalted {
                        device_id: self.device_id(),
                    });
                }
                Err(e)
            }
        }
    }

    /// Record a typed payload for its entity type.
    ///
    /// # Errors
    ///
    /// Same as [`SyncEngine::create_sync_event`].
    pub fn create_typed_event<P: EntityPayload>(
        &self,
        entity_id: &str,
        op: Op,
        payload: &P,
    ) -> Result<Event, SyncError> {
        let value = serde_json::to_value(payload)?;
        self.create_sync_event(P::ENTITY_TYPE, entity_id, op, &value)
    }

    /// Folded state of one entity.
    #[must_use]
    pub fn state(&self, entity_type: &str, entity_id: &str) -> Option<EntityState> {
        self.state
            .lock()
            .resolver
            .state(&EntityKey::new(entity_type, entity_id))
            .cloned()
    }

    /// Folded state of every entity, ordered by key.
    #[must_use]
    pub fn states(&self) -> Vec<(EntityKey, EntityState)> {
        let state = self.state.lock();
        let mut all: Vec<_> = state
            .resolver
            .states()
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Trust a peer device's signing key. Returns `true` if the device is new.
    ///
    /// # Errors
    ///
    /// Returns error if the key cannot be stored, or if it would replace the
    /// local device's own key.
    pub fn pair(&self, device_id: DeviceId, key: PublicKey) -> Result<bool, SyncError> {
        if device_id == self.device_id() && key != self.keys.public_key() {
            return Err(SyncError::Key(
                "refusing to replace the local device key".to_string(),
            ));
        }
        let mut state = self.state.lock();
        let added = state.store.trust_device(device_id, &key)?;
        state.trusted.insert(device_id, key);
        info!(%device_id, added, "device paired");
        Ok(added)
    }

    /// Every event in the log, in HLC order.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read.
    pub fn export_event_log(&self) -> Result<Vec<Event>, SyncError> {
        self.state.lock().store.export_all()
    }

    /// The whole log as a portable bundle, with chain links for pruned events.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read.
    pub fn export_bundle(&self) -> Result<EventBundle, SyncError> {
        let state = self.state.lock();
        let bundle = EventBundle::new(self.device_id(), state.store.export_all()?)
            .with_links(state.store.pruned_links()?);
        Ok(bundle)
    }

    /// Verify and merge a bundle, bridging the gaps its links describe.
    ///
    /// # Errors
    ///
    /// Returns error only on storage failure; rejected events are reported.
    pub fn import_bundle(&self, bundle: EventBundle) -> Result<ImportReport, SyncError> {
        self.import_batch(bundle.events, bundle.links)
    }

    /// Verify and append events from another source, merging accepted ones.
    ///
    /// # Errors
    ///
    /// Returns error only on storage failure; rejected events are reported.
    pub fn import_event_log(&self, events: Vec<Event>) -> Result<ImportReport, SyncError> {
        self.import_batch(events, Vec::new())
    }

    fn import_batch(
        &self,
        events: Vec<Event>,
        links: Vec<ChainLink>,
    ) -> Result<ImportReport, SyncError> {
        let outcome = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let outcome = import_with_links(
                &mut state.store,
                &state.trusted,
                &self.keys,
                &self.schema,
                events,
                links,
            )?;
            self.absorb(state, &outcome)?;
            outcome
        };

        let report = ImportReport {
            accepted: outcome.accepted.len(),
            duplicates: outcome.duplicates,
            integrity_failures: outcome.integrity_failures(),
            bridged: outcome.bridged,
            quarantined: outcome.quarantined,
        };
        info!(
            accepted = report.accepted,
            duplicates = report.duplicates,
            bridged = report.bridged,
            quarantined = report.quarantined.len(),
            "event log imported"
        );
        Ok(report)
    }

    /// Counts for status displays.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read.
    pub fn get_sync_status(&self) -> Result<SyncStatus, SyncError> {
        let state = self.state.lock();
        let device_id = self.device_id();
        let pushed_to = state.store.max_push_watermark()?;

        Ok(SyncStatus {
            enabled: self.options.sync_enabled,
            device_id,
            events_in_log: state.store.len()?,
            last_sync: state.store.last_sync()?,
            unsynced_count: state
                .store
                .count_device_events_after(device_id, pushed_to.as_ref())?,
            quarantined_count: state.store.quarantined_count()?,
            chain_halted: state.builder.is_halted(),
            entities: state.resolver.len(),
            trusted_devices: state.trusted.len(),
        })
    }

    /// Rejected events, most recent first.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read.
    pub fn quarantined(&self, limit: usize) -> Result<Vec<Quarantined>, SyncError> {
        self.state.lock().store.quarantined(limit)
    }

    /// Reload the chain head from the log and resume local writes.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read.
    pub fn repair_chain_head(&self) -> Result<Option<EventHash>, SyncError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.builder.repair_chain_head(&state.store)
    }

    /// Delete expired events of ephemeral entity types and refold state.
    ///
    /// Own events are kept until every relay has acknowledged them, so peers
    /// never see a gap in this device's chain.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be written.
    pub fn prune_expired(&self) -> Result<usize, SyncError> {
        if self.options.ephemeral_types.is_empty() {
            return Ok(0);
        }
        let now_ms = self.options.wall.now_ms();
        let mut state = self.state.lock();
        let pruned = state
            .store
            .prune_expired(&self.options.ephemeral_types, now_ms, self.device_id())?;
        if pruned > 0 {
            refold(&mut state, &self.keys)?;
            info!(pruned, "expired events pruned");
        }
        Ok(pruned)
    }

    /// Run one sync cycle against a relay URL.
    ///
    /// # Errors
    ///
    /// Returns error if the relay client cannot be built, or as [`SyncEngine::sync_with`].
    pub async fn sync_with_relay(&self, url: &str) -> Result<SyncOutcome, SyncError> {
        let relay = HttpRelay::new(RelayClientConfig {
            base_url: url.to_string(),
            timeout: self.options.relay.timeout,
            bearer_token: self.options.relay.bearer_token.clone(),
            ca_cert_path: self.options.relay.ca_cert_path.clone(),
        })?;
        self.sync_with(&relay).await
    }

    /// Run one pull-then-push cycle against a relay.
    ///
    /// Returns [`SyncOutcome::Skipped`] if a cycle is already running. A cycle
    /// interrupted by its deadline or by cancellation keeps everything it
    /// processed and reports `timed_out` or `cancelled`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Network`] once retries are exhausted, or a storage
    /// error. Progress made before the failure is kept.
    pub async fn sync_with(&self, relay: &dyn Relay) -> Result<SyncOutcome, SyncError> {
        let peer = relay.peer().to_string();
        let Some(_guard) = CycleGuard::try_acquire(&self.cycle) else {
            warn!(%peer, "sync cycle still running, skipping");
            self.notify(SyncNotification::CycleSkipped { peer });
            return Ok(SyncOutcome::Skipped);
        };

        let deadline = Instant::now() + self.options.deadline;
        let cancel = self.cancel.child_token();
        let device_id = self.device_id();
        let mut report = SyncReport::new(&peer);
        debug!(%peer, "sync cycle started");

        // Pull
        let since = self.state.lock().store.watermark(&peer, WatermarkKind::Pull)?;
        report.pull_watermark = since;
        let pulled = bounded(
            deadline,
            &cancel,
            retry_with_backoff(&self.options.retry, &cancel, "pull", || {
                relay.fetch_since(since, device_id)
            }),
        )
        .await;

        match pulled {
            Ok(Ok(events)) => {
                report.pulled = events.len();
                self.apply_pulled(&peer, events, deadline, &cancel, &mut report)?;
            }
            Ok(Err(e)) => {
                warn!(%peer, error = %e, "pull failed");
                return Err(e.into());
            }
            Err(interrupted) => mark(&mut report, &interrupted),
        }

        // Push
        report.push_watermark = self.state.lock().store.watermark(&peer, WatermarkKind::Push)?;
        while report.is_complete() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let batch = self.state.lock().store.device_events_after(
                device_id,
                report.push_watermark.as_ref(),
                self.options.push_batch,
            )?;
            let Some(last) = batch.last().map(|e| e.hlc) else {
                break;
            };

            let pushed = bounded(
                deadline,
                &cancel,
                retry_with_backoff(&self.options.retry, &cancel, "push", || {
                    relay.push(device_id, &batch)
                }),
            )
            .await;

            match pushed {
                Ok(Ok(ack)) => {
                    self.state
                        .lock()
                        .store
                        .set_watermark(&peer, WatermarkKind::Push, &last)?;
                    report.pushed += batch.len();
                    report.push_watermark = Some(last);
                    debug!(
                        %peer,
                        events = batch.len(),
                        stored = ?ack.stored,
                        duplicates = ?ack.duplicates,
                        "push acknowledged"
                    );
                }
                Ok(Err(e)) => {
                    warn!(%peer, error = %e, pushed = report.pushed, "push failed");
                    return Err(e.into());
                }
                Err(interrupted) => mark(&mut report, &interrupted),
            }

            if batch.len() < self.options.push_batch {
                break;
            }
        }

        if report.is_complete() {
            self.state.lock().store.set_last_sync(Utc::now())?;
            info!(
                %peer,
                pulled = report.pulled,
                accepted = report.accepted,
                duplicates = report.duplicates,
                quarantined = report.quarantined,
                pushed = report.pushed,
                "sync cycle completed"
            );
        } else {
            warn!(
                %peer,
                timed_out = report.timed_out,
                cancelled = report.cancelled,
                accepted = report.accepted,
                pushed = report.pushed,
                "sync cycle interrupted, progress kept"
            );
        }

        self.notify(SyncNotification::CycleCompleted(report.clone()));
        Ok(SyncOutcome::Completed(report))
    }

    /// Verify and merge pulled events in HLC order, stopping at the deadline.
    ///
    /// The pull watermark advances to the highest event that was accepted or
    /// already known and sorts before the first rejection. Rejected events are
    /// pulled again, so events from a device paired later are not skipped.
    fn apply_pulled(
        &self,
        peer: &str,
        mut events: Vec<Event>,
        deadline: Instant,
        cancel: &CancellationToken,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        sort_for_import(&mut events);

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut outcome = ImportOutcome::default();
        {
            let mut verifier = Verifier::new(&state.trusted, &self.keys, &self.schema);
            for event in events {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break;
                }
                if Instant::now() >= deadline {
                    report.timed_out = true;
                    break;
                }
                let verdict = verifier.check(&mut state.store, &event)?;
                outcome.record(event, verdict);
            }
        }

        self.absorb(state, &outcome)?;

        report.accepted += outcome.accepted.len();
        report.duplicates += outcome.duplicates;
        report.quarantined += outcome.quarantined.len();

        if outcome.resume_at > report.pull_watermark {
            if let Some(hlc) = outcome.resume_at {
                state.store.set_watermark(peer, WatermarkKind::Pull, &hlc)?;
                report.pull_watermark = Some(hlc);
            }
        }
        if let Some(blocked) = outcome.quarantined.iter().map(|q| q.hlc).min() {
            debug!(%peer, %blocked, "pull watermark held before rejected event");
        }
        Ok(())
    }

    /// Fold accepted events into state and record rejections.
    fn absorb(&self, state: &mut State, outcome: &ImportOutcome) -> Result<(), SyncError> {
        let device_id = self.device_id();
        let mut keys = BTreeSet::new();
        let mut own = false;

        for (event, payload) in &outcome.accepted {
            state.builder.observe(event.hlc);
            state.resolver.apply(event, payload.clone());
            if state.store.release_quarantine(&event.op_id)? {
                debug!(op_id = %event.op_id, "previously rejected event accepted");
            }
            own |= event.device_id == device_id;
            keys.insert(event.key());
        }

        for entry in &outcome.quarantined {
            state.store.record_quarantine(entry)?;
            self.notify(SyncNotification::EventQuarantined(entry.clone()));
        }
        if outcome.integrity_failures() > 0 {
            error!(
                failures = outcome.integrity_failures(),
                "events failed integrity checks"
            );
        }

        // Own events arriving from elsewhere move the chain head
        if own && !state.builder.is_halted() {
            state.builder.repair_chain_head(&state.store)?;
        }

        if !keys.is_empty() {
            self.notify(SyncNotification::EventsMerged {
                keys: keys.into_iter().collect(),
                count: outcome.accepted.len(),
            });
        }
        Ok(())
    }
}

/// Rebuild every entity by replaying the log. Returns the number of events replayed.
pub(crate) fn refold(state: &mut State, keys: &KeyStore) -> Result<usize, SyncError> {
    state.resolver.clear();
    let mut replayed = 0;
    for event in state.store.iterate(None) {
        let event = event?;
        match event.decrypt_payload(keys) {
            Ok(payload) => {
                state.resolver.apply(&event, payload);
                replayed += 1;
            }
            Err(e) => warn!(op_id = %event.op_id, error = %e, "stored event not decryptable, skipped"),
        }
    }
    Ok(replayed)
}

async fn bounded<T>(
    deadline: Instant,
    cancel: &CancellationToken,
    request: impl Future<Output = T>,
) -> Result<T, Interrupted> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Interrupted::Cancelled),
        result = tokio::time::timeout_at(deadline, request) => {
            result.map_err(|_| Interrupted::Deadline)
        }
    }
}

fn mark(report: &mut SyncReport, interrupted: &Interrupted) {
    match interrupted {
        Interrupted::Deadline => report.timed_out = true,
        Interrupted::Cancelled => report.cancelled = true,
    }
}
