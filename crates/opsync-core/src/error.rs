//! Error taxonomy shared by every opsync crate.

use crate::device::DeviceId;
use crate::event::EventHash;

/// Errors raised while building, storing, verifying, or syncing events.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// AEAD sealing failed; nothing was appended.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// AEAD tag verification failed; the plaintext must not be trusted.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Payload could not be serialized or deserialized.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Payload rejected by the schema registry before encryption.
    #[error("payload rejected for entity type '{entity_type}': {reason}")]
    Schema {
        /// Entity type the payload was checked against
        entity_type: String,
        /// Validation failure
        reason: String,
    },

    /// Event `prev_hash` does not match the local chain head.
    #[error("chain integrity violated for {device_id}: expected prev {expected:?}, found {found:?}")]
    ChainIntegrity {
        /// Device whose chain is broken
        device_id: DeviceId,
        /// Chain head held by the log
        expected: Option<EventHash>,
        /// `prev_hash` carried by the rejected event
        found: Option<EventHash>,
    },

    /// Local writes are refused until the chain head is repaired.
    #[error("local log halted after chain integrity failure; repair required")]
    LogHalted,

    /// Signature does not verify against the device's known key.
    #[error("signature verification failed for event {0}")]
    SignatureVerification(String),

    /// Recomputed hash differs from the stored hash.
    #[error("hash mismatch for event {0}")]
    HashMismatch(String),

    /// No public key is known for the device.
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),

    /// Key material is missing, malformed, or cannot be persisted.
    #[error("key material error: {0}")]
    Key(String),

    /// Event log storage failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Transient relay or network failure; retry with backoff.
    #[error("network error: {0}")]
    Network(String),
}

impl SyncError {
    /// Whether the failure is transient and the caller should retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
