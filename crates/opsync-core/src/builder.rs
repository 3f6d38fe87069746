//! Turns local mutations into signed, encrypted, hash-chained events.

use crate::crypto::KeyStore;
use crate::device::DeviceId;
use crate::error::SyncError;
use crate::event::{Event, EventHash, Op};
use crate::hlc::{Hlc, Timestamp};
use crate::log::{Appended, EventLog};
use crate::payload::SchemaRegistry;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Single writer for the local device chain.
///
/// Holds the clock and a cached chain head. The cached head is compared with
/// the log's head on every append; a mismatch means the log changed under us
/// and halts the builder until [`EventBuilder::repair_chain_head`] runs.
#[derive(Debug)]
pub struct EventBuilder {
    clock: Hlc,
    keys: Arc<KeyStore>,
    schema: Arc<SchemaRegistry>,
    head: Option<EventHash>,
    halted: bool,
}

impl EventBuilder {
    /// Create a builder for an empty chain.
    #[must_use]
    pub fn new(keys: Arc<KeyStore>, schema: Arc<SchemaRegistry>, clock: Hlc) -> Self {
        Self {
            clock,
            keys,
            schema,
            head: None,
            halted: false,
        }
    }

    /// Create a builder positioned at the log's current chain head.
    ///
    /// # Errors
    ///
    /// Returns error if the log cannot be read.
    pub fn resume<L: EventLog + ?Sized>(
        keys: Arc<KeyStore>,
        schema: Arc<SchemaRegistry>,
        clock: Hlc,
        log: &L,
    ) -> Result<Self, SyncError> {
        let mut builder = Self::new(keys, schema, clock);
        builder.reload(log)?;
        Ok(builder)
    }

    /// Local device.
    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        self.keys.device_id()
    }

    /// Cached chain head.
    #[must_use]
    pub fn head(&self) -> Option<EventHash> {
        self.head
    }

    /// Whether local writes are refused after a chain integrity failure.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Advance the clock past a remote timestamp.
    pub fn observe(&mut self, remote: Timestamp) {
        self.clock.observe(remote);
    }

    /// Latest timestamp issued or observed.
    #[must_use]
    pub fn current(&self) -> Timestamp {
        self.clock.current()
    }

    /// Build an event for a local mutation and append it to the log.
    ///
    /// Any failure aborts the whole operation; nothing is appended.
    ///
    /// # Errors
    ///
    /// - [`SyncError::LogHalted`] if a previous append failed chain checks
    /// - [`SyncError::Schema`] if the payload is rejected
    /// - [`SyncError::Serialization`] / [`SyncError::Encryption`] on encoding failure
    /// - [`SyncError::ChainIntegrity`] if the log's head differs from the cached one;
    ///   the builder halts
    pub fn create_event<L: EventLog + ?Sized>(
        &mut self,
        log: &mut L,
        entity_type: &str,
        entity_id: &str,
        op: Op,
        payload: &Value,
    ) -> Result<Event, SyncError> {
        if self.halted {
            return Err(SyncError::LogHalted);
        }
        self.schema.validate(entity_type, op, payload)?;

        let device_id = self.device_id();
        let hlc = self.clock.tick();
        let op_id = Event::derive_op_id(device_id, hlc.physical_ms, hlc.logical);

        // serde_json maps are sorted, so this encoding is canonical
        let plaintext = serde_json::to_vec(payload)?;
        let aad = Event::aad(&op_id, entity_type, entity_id);
        let cipher_blob = self.keys.seal(&plaintext, &aad)?;

        let prev_hash = self.head;
        let hash = Event::compute_hash(
            &op_id,
            &hlc,
            device_id,
            entity_type,
            entity_id,
            op,
            &cipher_blob,
            prev_hash.as_ref(),
        );
        let signature = self.keys.sign(hash.as_bytes());

        let event = Event {
            op_id,
            hlc,
            device_id,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            op,
            cipher_blob,
            prev_hash,
            hash,
            signature,
        };

        match log.append(&event) {
            Ok(Appended::Inserted) => {
                self.head = Some(hash);
                debug!(%op_id, %hlc, entity_type, entity_id, %op, "event appended");
                Ok(event)
            }
            Ok(Appended::Duplicate) => {
                // A fresh clock reading can only collide if the log was rewound
                self.halted = true;
                error!(%op_id, "op_id already present in log; halting local writes");
                Err(SyncError::ChainIntegrity {
                    device_id,
                    expected: log.head(device_id)?,
                    found: prev_hash,
                })
            }
            Err(e @ SyncError::ChainIntegrity { .. }) => {
                self.halted = true;
                error!(error = %e, "local chain corrupted; halting local writes");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Re-read the chain head and clock position from the log and resume writes.
    ///
    /// This is the explicit operator step after a chain integrity failure.
    ///
    /// # Errors
    ///
    /// Returns error if the log cannot be read.
    pub fn repair_chain_head<L: EventLog + ?Sized>(
        &mut self,
        log: &L,
    ) -> Result<Option<EventHash>, SyncError> {
        let previous = self.head;
        self.reload(log)?;
        self.halted = false;
        info!(
            device_id = %self.device_id(),
            previous = ?previous,
            head = ?self.head,
            "chain head repaired"
        );
        Ok(self.head)
    }

    fn reload<L: EventLog + ?Sized>(&mut self, log: &L) -> Result<(), SyncError> {
        let device_id = self.device_id();
        self.head = log.head(device_id)?;
        if let Some(latest) = log.latest(device_id)? {
            self.clock.resume(latest);
        }
        Ok(())
    }
}
