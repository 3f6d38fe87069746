//! Device key material and the cryptographic primitives built on it.
//!
//! - Signing: Ed25519 over the event hash
//! - Confidentiality: ChaCha20-Poly1305 with a fresh random nonce per event
//! - Hashing: SHA-256 (see [`crate::event`])
//!
//! The symmetric key is shared by every device in a sync group so that peers
//! can read each other's payloads; the signing key never leaves the device.

use crate::device::DeviceId;
use crate::encoding::{self, base64_array, base64_bytes};
use crate::error::SyncError;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Key size for ChaCha20-Poly1305
pub const GROUP_KEY_SIZE: usize = 32;

/// Nonce size for ChaCha20-Poly1305
pub const NONCE_SIZE: usize = 12;

/// Tag size for ChaCha20-Poly1305
pub const TAG_SIZE: usize = 16;

/// Ciphertext plus the nonce it was sealed with.
///
/// The authentication tag is appended to `ciphertext`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherBlob {
    /// Random per-event nonce
    #[serde(with = "base64_array")]
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext with trailing tag
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Ed25519 signature over an event hash.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EventSignature([u8; 64]);

impl EventSignature {
    /// Wrap raw signature bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Raw signature bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 64] {
        self.0
    }
}

impl fmt::Debug for EventSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventSignature({}..)", hex::encode(&self.0[..6]))
    }
}

impl Serialize for EventSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        base64_array::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for EventSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        base64_array::deserialize(deserializer).map(Self)
    }
}

/// A device's public signing key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Parse from raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not a valid Ed25519 point.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, SyncError> {
        VerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|e| SyncError::Key(format!("invalid public key: {e}")))
    }

    /// Parse from base64 text.
    ///
    /// # Errors
    ///
    /// Returns error if the text is not a base64-encoded Ed25519 key.
    pub fn from_base64(text: &str) -> Result<Self, SyncError> {
        let bytes = encoding::from_base64_array::<32>(text)
            .ok_or_else(|| SyncError::Key("public key must be 32 bytes of base64".to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Base64 text form.
    #[must_use]
    pub fn to_base64(&self) -> String {
        encoding::to_base64(self.0.as_bytes())
    }

    /// Verify a signature over `message`.
    #[must_use]
    pub fn verify(&self, message: &[u8], signature: &EventSignature) -> bool {
        let sig = Signature::from_bytes(&signature.0);
        self.0.verify(message, &sig).is_ok()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

/// Serialized key material, persisted once per device.
///
/// Holds secrets; callers must store it with owner-only permissions.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyMaterial {
    /// Device identifier
    pub device_id: DeviceId,
    /// Ed25519 public key (base64)
    pub signing_public_key: String,
    /// Ed25519 secret key (base64)
    pub signing_private_key: String,
    /// ChaCha20-Poly1305 group key (base64)
    pub symmetric_key: String,
    /// When the identity was created
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("device_id", &self.device_id)
            .field("signing_public_key", &self.signing_public_key)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Loaded key material handle passed explicitly to the builder and verifier.
#[derive(Clone)]
pub struct KeyStore {
    device_id: DeviceId,
    signing_key: SigningKey,
    public_key: PublicKey,
    group_key: [u8; GROUP_KEY_SIZE],
    cipher: ChaCha20Poly1305,
    created_at: DateTime<Utc>,
}

impl KeyStore {
    /// Generate a fresh identity with a new, unshared group key.
    #[must_use]
    pub fn generate(device_id: DeviceId) -> Self {
        let mut group_key = [0u8; GROUP_KEY_SIZE];
        OsRng.fill_bytes(&mut group_key);
        Self::with_group_key(device_id, group_key)
    }

    /// Generate an identity whose device ID derives from `hostname` and the current time.
    #[must_use]
    pub fn generate_for_host(hostname: &str) -> Self {
        let created_at = Utc::now();
        let device_id = DeviceId::derive(hostname, created_at.timestamp_millis());
        let mut keys = Self::generate(device_id);
        keys.created_at = created_at;
        keys
    }

    /// Generate a signing identity that joins an existing group key.
    #[must_use]
    pub fn with_group_key(device_id: DeviceId, group_key: [u8; GROUP_KEY_SIZE]) -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public_key = PublicKey(signing_key.verifying_key());
        Self {
            device_id,
            signing_key,
            public_key,
            cipher: ChaCha20Poly1305::new(Key::from_slice(&group_key)),
            group_key,
            created_at: Utc::now(),
        }
    }

    /// Replace the group key with one shared by an existing device.
    ///
    /// Only meaningful before this device has written any events.
    pub fn join_group(&mut self, group_key: [u8; GROUP_KEY_SIZE]) {
        self.cipher = ChaCha20Poly1305::new(Key::from_slice(&group_key));
        self.group_key = group_key;
    }

    /// Restore from persisted key material.
    ///
    /// # Errors
    ///
    /// Returns error if any key is malformed or the public key does not match
    /// the private key.
    pub fn from_material(material: &KeyMaterial) -> Result<Self, SyncError> {
        let secret = encoding::from_base64_array::<32>(&material.signing_private_key)
            .ok_or_else(|| SyncError::Key("signing key must be 32 bytes of base64".to_string()))?;
        let group_key = encoding::from_base64_array::<GROUP_KEY_SIZE>(&material.symmetric_key)
            .ok_or_else(|| SyncError::Key("symmetric key must be 32 bytes of base64".to_string()))?;

        let signing_key = SigningKey::from_bytes(&secret);
        let public_key = PublicKey(signing_key.verifying_key());
        if public_key.to_base64() != material.signing_public_key.trim() {
            return Err(SyncError::Key(
                "public key does not match signing key".to_string(),
            ));
        }

        Ok(Self {
            device_id: material.device_id,
            signing_key,
            public_key,
            cipher: ChaCha20Poly1305::new(Key::from_slice(&group_key)),
            group_key,
            created_at: material.created_at,
        })
    }

    /// Export for persistence.
    #[must_use]
    pub fn to_material(&self) -> KeyMaterial {
        KeyMaterial {
            device_id: self.device_id,
            signing_public_key: self.public_key.to_base64(),
            signing_private_key: encoding::to_base64(&self.signing_key.to_bytes()),
            symmetric_key: encoding::to_base64(&self.group_key),
            created_at: self.created_at,
        }
    }

    /// This device's identifier.
    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// This device's public signing key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// When this identity was created.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The group key as base64, for pairing another device.
    #[must_use]
    pub fn group_key_export(&self) -> String {
        encoding::to_base64(&self.group_key)
    }

    /// Sign a message (an event hash).
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> EventSignature {
        EventSignature(self.signing_key.sign(message).to_bytes())
    }

    /// Encrypt `plaintext` under a fresh random nonce, binding `aad`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Encryption`] if the cipher rejects the input.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<CipherBlob, SyncError> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| SyncError::Encryption(e.to_string()))?;

        Ok(CipherBlob { nonce, ciphertext })
    }

    /// Verify the tag and decrypt.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Decryption`] if the tag does not verify.
    pub fn open(&self, blob: &CipherBlob, aad: &[u8]) -> Result<Vec<u8>, SyncError> {
        if blob.ciphertext.len() < TAG_SIZE {
            return Err(SyncError::Decryption("ciphertext shorter than tag".to_string()));
        }
        self.cipher
            .decrypt(
                Nonce::from_slice(&blob.nonce),
                Payload {
                    msg: &blob.ciphertext,
                    aad,
                },
            )
            .map_err(|_| SyncError::Decryption("authentication tag mismatch".to_string()))
    }
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStore")
            .field("device_id", &self.device_id)
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Public keys of devices whose events this device accepts.
#[derive(Debug, Clone, Default)]
pub struct TrustedDevices {
    keys: BTreeMap<DeviceId, PublicKey>,
}

impl TrustedDevices {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a directory that trusts the local device.
    #[must_use]
    pub fn with_local(keys: &KeyStore) -> Self {
        let mut trusted = Self::new();
        trusted.insert(keys.device_id(), keys.public_key());
        trusted
    }

    /// Register a device key. Returns the previous key if one was replaced.
    pub fn insert(&mut self, device_id: DeviceId, key: PublicKey) -> Option<PublicKey> {
        self.keys.insert(device_id, key)
    }

    /// Look up a device key.
    #[must_use]
    pub fn get(&self, device_id: &DeviceId) -> Option<&PublicKey> {
        self.keys.get(device_id)
    }

    /// Iterate over trusted devices.
    pub fn iter(&self) -> impl Iterator<Item = (&DeviceId, &PublicKey)> {
        self.keys.iter()
    }

    /// Number of trusted devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no device is trusted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
