//! Verification of remote or imported events before they enter the log.
//!
//! Each event is checked, in order, for: duplicate `op_id`, a known signing
//! key, hash integrity, signature, chain continuity, AEAD tag, and payload
//! schema. A failing event is quarantined and its device is treated as
//! untrusted for the rest of the batch, since everything it links to
//! inherits the break. One bad event never aborts the batch.
//!
//! Backup bundles may also carry [`ChainLink`]s for events pruned at their
//! source; a link from a trusted device is bridged when it extends the
//! current chain head, so the events after the gap still verify.

use crate::crypto::{KeyStore, TrustedDevices};
use crate::device::DeviceId;
use crate::error::SyncError;
use crate::event::Event;
use crate::hlc::Timestamp;
use crate::log::{Appended, ChainLink, EventLog};
use crate::payload::SchemaRegistry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};
use uuid::Uuid;

/// Why an event was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineReason {
    /// Recomputed hash differs from the stored one
    HashMismatch,
    /// Signature does not verify against the device key
    BadSignature,
    /// No public key is known for the device
    UnknownDevice,
    /// `prev_hash` does not link to the device's chain head
    ChainBroken,
    /// Follows an earlier rejected event from the same device
    Untrusted,
    /// AEAD tag verification failed
    Undecryptable,
    /// Decrypted payload violates its entity schema
    SchemaViolation,
}

impl QuarantineReason {
    /// Stable snake_case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            QuarantineReason::HashMismatch => "hash_mismatch",
            QuarantineReason::BadSignature => "bad_signature",
            QuarantineReason::UnknownDevice => "unknown_device",
            QuarantineReason::ChainBroken => "chain_broken",
            QuarantineReason::Untrusted => "untrusted",
            QuarantineReason::Undecryptable => "undecryptable",
            QuarantineReason::SchemaViolation => "schema_violation",
        }
    }

    /// Whether this reason breaks the integrity of the device's chain.
    #[must_use]
    pub fn is_integrity_failure(self) -> bool {
        matches!(
            self,
            QuarantineReason::HashMismatch
                | QuarantineReason::BadSignature
                | QuarantineReason::ChainBroken
        )
    }
}

impl fmt::Display for QuarantineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuarantineReason {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "hash_mismatch" => QuarantineReason::HashMismatch,
            "bad_signature" => QuarantineReason::BadSignature,
            "unknown_device" => QuarantineReason::UnknownDevice,
            "chain_broken" => QuarantineReason::ChainBroken,
            "untrusted" => QuarantineReason::Untrusted,
            "undecryptable" => QuarantineReason::Undecryptable,
            "schema_violation" => QuarantineReason::SchemaViolation,
            other => {
                return Err(SyncError::Serialization(format!(
                    "unknown quarantine reason '{other}'"
                )))
            }
        })
    }
}

/// A rejected event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quarantined {
    /// Rejected event id
    pub op_id: Uuid,
    /// Claimed originating device
    pub device_id: DeviceId,
    /// Claimed timestamp
    pub hlc: Timestamp,
    /// Entity type of the event
    pub entity_type: String,
    /// Rejection reason
    pub reason: QuarantineReason,
}

impl Quarantined {
    fn of(event: &Event, reason: QuarantineReason) -> Self {
        Self {
            op_id: event.op_id,
            device_id: event.device_id,
            hlc: event.hlc,
            entity_type: event.entity_type.clone(),
            reason,
        }
    }
}

/// Outcome of checking a single event.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Verified and appended; carries the decrypted payload
    Accepted(Value),
    /// Already in the log or earlier in this batch
    Duplicate,
    /// Rejected and not appended
    Quarantined(QuarantineReason),
}

/// Stateful checker for one batch of incoming events.
#[derive(Debug)]
pub struct Verifier<'a> {
    trusted: &'a TrustedDevices,
    keys: &'a KeyStore,
    schema: &'a SchemaRegistry,
    tainted: HashSet<DeviceId>,
}

impl<'a> Verifier<'a> {
    /// Create a verifier for a new batch.
    #[must_use]
    pub fn new(trusted: &'a TrustedDevices, keys: &'a KeyStore, schema: &'a SchemaRegistry) -> Self {
        Self {
            trusted,
            keys,
            schema,
            tainted: HashSet::new(),
        }
    }

    /// Verify one event and append it to the log if it passes.
    ///
    /// Events of one device must be presented in chain order.
    ///
    /// # Errors
    ///
    /// Returns error only on storage failure; verification failures are
    /// reported as [`Verdict::Quarantined`].
    pub fn check<L: EventLog + ?Sized>(
        &mut self,
        log: &mut L,
        event: &Event,
    ) -> Result<Verdict, SyncError> {
        if log.contains(&event.op_id)? {
            return Ok(Verdict::Duplicate);
        }

        match self.inspect(log, event)? {
            Ok(payload) => match log.append(event) {
                Ok(Appended::Inserted) => Ok(Verdict::Accepted(payload)),
                Ok(Appended::Duplicate) => Ok(Verdict::Duplicate),
                Err(SyncError::ChainIntegrity { .. }) => {
                    Ok(self.reject(event, QuarantineReason::ChainBroken))
                }
                Err(e) => Err(e),
            },
            Err(reason) => Ok(self.reject(event, reason)),
        }
    }

    fn inspect<L: EventLog + ?Sized>(
        &self,
        log: &L,
        event: &Event,
    ) -> Result<Result<Value, QuarantineReason>, SyncError> {
        if self.tainted.contains(&event.device_id) {
            return Ok(Err(QuarantineReason::Untrusted));
        }
        let Some(key) = self.trusted.get(&event.device_id) else {
            return Ok(Err(QuarantineReason::UnknownDevice));
        };
        if !event.verify_hash() {
            return Ok(Err(QuarantineReason::HashMismatch));
        }
        if !event.verify_signature(key) {
            return Ok(Err(QuarantineReason::BadSignature));
        }
        if event.prev_hash != log.head(event.device_id)? {
            return Ok(Err(QuarantineReason::ChainBroken));
        }
        let Ok(payload) = event.decrypt_payload(self.keys) else {
            return Ok(Err(QuarantineReason::Undecryptable));
        };
        if self
            .schema
            .validate(&event.entity_type, event.op, &payload)
            .is_err()
        {
            return Ok(Err(QuarantineReason::SchemaViolation));
        }
        Ok(Ok(payload))
    }

    /// Bridge a pruned link if its device is trusted and it extends the chain.
    ///
    /// Returns whether the link was recorded. A link that does not connect is
    /// skipped; the events after it then fail their own chain check.
    ///
    /// # Errors
    ///
    /// Returns error only on storage failure.
    pub fn bridge<L: EventLog + ?Sized>(
        &mut self,
        log: &mut L,
        link: &ChainLink,
    ) -> Result<bool, SyncError> {
        if self.tainted.contains(&link.device_id) || self.trusted.get(&link.device_id).is_none() {
            return Ok(false);
        }
        match log.bridge(link) {
            Ok(Appended::Inserted) => Ok(true),
            Ok(Appended::Duplicate) => Ok(false),
            Err(SyncError::ChainIntegrity { .. }) => {
                warn!(
                    op_id = %link.op_id,
                    device_id = %link.device_id,
                    "pruned link does not extend the chain, skipped"
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn reject(&mut self, event: &Event, reason: QuarantineReason) -> Verdict {
        self.tainted.insert(event.device_id);
        warn!(
            op_id = %event.op_id,
            device_id = %event.device_id,
            hlc = %event.hlc,
            %reason,
            "event quarantined"
        );
        Verdict::Quarantined(reason)
    }
}

/// Result of [`import_and_verify`].
#[derive(Debug, Default)]
pub struct ImportOutcome {
    /// Appended events with their decrypted payloads, in HLC order
    pub accepted: Vec<(Event, Value)>,
    /// Events already present
    pub duplicates: usize,
    /// Rejected events
    pub quarantined: Vec<Quarantined>,
    /// Highest HLC among accepted events
    pub highest_accepted: Option<Timestamp>,
    /// Pruned links recorded in place of their events
    pub bridged: usize,
    /// Highest accepted or already-known HLC before the first rejection
    pub resume_at: Option<Timestamp>,
    blocked: bool,
}

impl ImportOutcome {
    /// Number of quarantined events that broke a chain.
    #[must_use]
    pub fn integrity_failures(&self) -> usize {
        self.quarantined
            .iter()
            .filter(|q| q.reason.is_integrity_failure())
            .count()
    }

    /// Fold a verdict into the outcome. Verdicts must arrive in HLC order.
    ///
    /// `resume_at` stops moving at the first rejection, so a watermark taken
    /// from it never skips an event that may verify later.
    pub fn record(&mut self, event: Event, verdict: Verdict) {
        match verdict {
            Verdict::Accepted(payload) => {
                self.highest_accepted = self.highest_accepted.max(Some(event.hlc));
                self.advance(event.hlc);
                self.accepted.push((event, payload));
            }
            Verdict::Duplicate => {
                self.duplicates += 1;
                self.advance(event.hlc);
            }
            Verdict::Quarantined(reason) => {
                self.blocked = true;
                self.quarantined.push(Quarantined::of(&event, reason));
            }
        }
    }

    fn advance(&mut self, hlc: Timestamp) {
        if !self.blocked {
            self.resume_at = self.resume_at.max(Some(hlc));
        }
    }
}

/// Order a batch for import: HLC order keeps every device's chain in sequence.
pub fn sort_for_import(events: &mut [Event]) {
    events.sort_by(|a, b| a.hlc.cmp(&b.hlc).then_with(|| a.op_id.cmp(&b.op_id)));
}

/// Verify a batch and append every event that passes.
///
/// # Errors
///
/// Returns error only on storage failure.
pub fn import_and_verify<L: EventLog + ?Sized>(
    log: &mut L,
    trusted: &TrustedDevices,
    keys: &KeyStore,
    schema: &SchemaRegistry,
    events: Vec<Event>,
) -> Result<ImportOutcome, SyncError> {
    import_with_links(log, trusted, keys, schema, events, Vec::new())
}

/// Verify a batch that may contain gaps left by pruning at the source.
///
/// Events and links are processed together in HLC order.
///
/// # Errors
///
/// Returns error only on storage failure.
pub fn import_with_links<L: EventLog + ?Sized>(
    log: &mut L,
    trusted: &TrustedDevices,
    keys: &KeyStore,
    schema: &SchemaRegistry,
    mut events: Vec<Event>,
    mut links: Vec<ChainLink>,
) -> Result<ImportOutcome, SyncError> {
    sort_for_import(&mut events);
    links.sort_by(|a, b| a.hlc.cmp(&b.hlc).then_with(|| a.op_id.cmp(&b.op_id)));
    let mut verifier = Verifier::new(trusted, keys, schema);
    let mut outcome = ImportOutcome::default();
    let mut links = links.into_iter().peekable();

    for event in events {
        while let Some(link) = links.next_if(|l| l.hlc < event.hlc) {
            outcome.bridged += usize::from(verifier.bridge(log, &link)?);
        }
        let verdict = verifier.check(log, &event)?;
        outcome.record(event, verdict);
    }
    for link in links {
        outcome.bridged += usize::from(verifier.bridge(log, &link)?);
    }

    debug!(
        accepted = outcome.accepted.len(),
        duplicates = outcome.duplicates,
        quarantined = outcome.quarantined.len(),
        bridged = outcome.bridged,
        "batch verified"
    );
    Ok(outcome)
}
