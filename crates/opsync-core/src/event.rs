//! Op-log events: immutable, encrypted, hash-chained, and signed.
//!
//! Each device's events form a singly linked chain: `prev_hash` of event *n*
//! equals `hash` of event *n − 1* from the same device. The hash covers every
//! field except `hash` and `signature`; the signature covers the hash.

use crate::crypto::{CipherBlob, EventSignature, KeyStore, PublicKey};
use crate::device::DeviceId;
use crate::error::SyncError;
use crate::hlc::Timestamp;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Namespace for deterministic `op_id` derivation.
const OP_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6f, 0x70, 0x73, 0x79, 0x6e, 0x63, 0x2d, 0x6f, 0x70, 0x2d, 0x6c, 0x6f, 0x67, 0x2d, 0x76, 0x31,
]);

/// Kind of mutation an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    /// Entity created
    Create,
    /// Entity updated
    Update,
    /// Entity deleted
    Delete,
}

impl Op {
    /// Stable tag used in the canonical hash encoding.
    #[must_use]
    pub fn tag(self) -> u8 {
        match self {
            Op::Create => 1,
            Op::Update => 2,
            Op::Delete => 3,
        }
    }

    /// Lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Op::Create => "create",
            Op::Update => "update",
            Op::Delete => "delete",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Op {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Op::Create),
            "update" => Ok(Op::Update),
            "delete" => Ok(Op::Delete),
            other => Err(SyncError::Serialization(format!("unknown op '{other}'"))),
        }
    }
}

/// SHA-256 digest identifying an event.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventHash([u8; 32]);

impl EventHash {
    /// Wrap raw digest bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns error if the slice is not 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SyncError> {
        bytes
            .try_into()
            .map(Self)
            .map_err(|_| SyncError::Serialization(format!("hash must be 32 bytes, got {}", bytes.len())))
    }
}

impl fmt::Display for EventHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for EventHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &hex::encode(self.0)[..12])
    }
}

impl Serialize for EventHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for EventHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        Self::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Key under which entity state is folded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    /// Entity type (selects schema and merge policy)
    pub entity_type: String,
    /// Entity identifier within its type
    pub entity_id: String,
}

impl EntityKey {
    /// Create a new key.
    #[must_use]
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// An immutable op-log event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Deterministic from `(device_id, physical, logical)`
    pub op_id: Uuid,
    /// HLC timestamp at creation
    pub hlc: Timestamp,
    /// Originating device
    pub device_id: DeviceId,
    /// Entity type
    pub entity_type: String,
    /// Entity identifier
    pub entity_id: String,
    /// Mutation kind
    pub op: Op,
    /// Encrypted payload
    pub cipher_blob: CipherBlob,
    /// Hash of the previous event from the same device
    pub prev_hash: Option<EventHash>,
    /// Hash over all fields above
    pub hash: EventHash,
    /// Device signature over `hash`
    pub signature: EventSignature,
}

impl Event {
    /// Derive the globally unique `op_id` for a device and clock reading.
    #[must_use]
    pub fn derive_op_id(device_id: DeviceId, physical_ms: u64, logical: u32) -> Uuid {
        let mut name = Vec::with_capacity(20);
        name.extend_from_slice(device_id.as_bytes());
        name.extend_from_slice(&physical_ms.to_be_bytes());
        name.extend_from_slice(&logical.to_be_bytes());
        Uuid::new_v5(&OP_ID_NAMESPACE, &name)
    }

    /// Associated data binding a cipher blob to its event.
    #[must_use]
    pub fn aad(op_id: &Uuid, entity_type: &str, entity_id: &str) -> Vec<u8> {
        let mut aad = Vec::with_capacity(16 + entity_type.len() + entity_id.len() + 8);
        aad.extend_from_slice(op_id.as_bytes());
        put_bytes(&mut aad, entity_type.as_bytes());
        put_bytes(&mut aad, entity_id.as_bytes());
        aad
    }

    /// Compute the canonical SHA-256 hash of an event's content.
    ///
    /// Every variable-length field is length-prefixed so distinct field
    /// splits can never produce the same input.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn compute_hash(
        op_id: &Uuid,
        hlc: &Timestamp,
        device_id: DeviceId,
        entity_type: &str,
        entity_id: &str,
        op: Op,
        cipher_blob: &CipherBlob,
        prev_hash: Option<&EventHash>,
    ) -> EventHash {
        let mut hasher = Sha256::new();
        hasher.update(op_id.as_bytes());
        hasher.update(hlc.to_bytes());
        hasher.update(device_id.as_bytes());

        let mut buf = Vec::with_capacity(entity_type.len() + entity_id.len() + 8);
        put_bytes(&mut buf, entity_type.as_bytes());
        put_bytes(&mut buf, entity_id.as_bytes());
        hasher.update(&buf);

        hasher.update([op.tag()]);
        hasher.update(cipher_blob.nonce);
        hasher.update((cipher_blob.ciphertext.len() as u64).to_be_bytes());
        hasher.update(&cipher_blob.ciphertext);

        match prev_hash {
            Some(prev) => {
                hasher.update([1u8]);
                hasher.update(prev.as_bytes());
            }
            None => hasher.update([0u8]),
        }

        EventHash(hasher.finalize().into())
    }

    /// Recompute this event's hash from its content.
    #[must_use]
    pub fn recompute_hash(&self) -> EventHash {
        Self::compute_hash(
            &self.op_id,
            &self.hlc,
            self.device_id,
            &self.entity_type,
            &self.entity_id,
            self.op,
            &self.cipher_blob,
            self.prev_hash.as_ref(),
        )
    }

    /// Check the stored hash and the identity fields it depends on.
    ///
    /// Fails if the content was altered, if `op_id` is not the one derived
    /// from the clock reading, or if the clock reading names another device.
    #[must_use]
    pub fn verify_hash(&self) -> bool {
        self.hlc.device_id == self.device_id
            && self.op_id
                == Self::derive_op_id(self.device_id, self.hlc.physical_ms, self.hlc.logical)
            && self.recompute_hash() == self.hash
    }

    /// Check the signature over the hash against a device key.
    #[must_use]
    pub fn verify_signature(&self, key: &PublicKey) -> bool {
        key.verify(self.hash.as_bytes(), &self.signature)
    }

    /// Fold key of the entity this event mutates.
    #[must_use]
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.entity_id.clone())
    }

    /// Verify the AEAD tag and decode the JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Decryption`] if the tag does not verify and
    /// [`SyncError::Serialization`] if the plaintext is not JSON.
    pub fn decrypt_payload(&self, keys: &KeyStore) -> Result<serde_json::Value, SyncError> {
        let aad = Self::aad(&self.op_id, &self.entity_type, &self.entity_id);
        let plaintext = keys.open(&self.cipher_blob, &aad)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}
