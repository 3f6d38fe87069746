//! Relay messages and the export bundle.

use chrono::{DateTime, Utc};
use opsync_core::{ChainLink, DeviceId, Event};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Current [`EventBundle`] format version.
pub const BUNDLE_FORMAT_VERSION: u32 = 1;

/// Body of `GET /sync/since`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullResponse {
    /// Events with `hlc > after`, any origin
    pub events: Vec<Event>,
}

/// Body of `POST /sync/push`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Events to store, idempotent by `op_id` on the relay
    pub events: Vec<Event>,
    /// Pushing device
    pub device_id: DeviceId,
}

impl PushRequest {
    /// Create a push request.
    #[must_use]
    pub fn new(device_id: DeviceId, events: Vec<Event>) -> Self {
        Self { events, device_id }
    }
}

/// Acknowledgment of a push.
///
/// Relays may answer with an empty 2xx body; every field is optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    /// Events newly stored by the relay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored: Option<usize>,
    /// Events the relay already held
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicates: Option<usize>,
}

/// Encoding of a bundle on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleFormat {
    /// Pretty-printed JSON
    Json,
    /// CBOR
    Cbor,
}

impl BundleFormat {
    /// Pick a format from a file extension; anything but `cbor` is JSON.
    #[must_use]
    pub fn from_extension(ext: Option<&str>) -> Self {
        match ext {
            Some(e) if e.eq_ignore_ascii_case("cbor") => BundleFormat::Cbor,
            _ => BundleFormat::Json,
        }
    }

    /// Guess the format of encoded bytes.
    #[must_use]
    pub fn detect(bytes: &[u8]) -> Self {
        match bytes.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'{') => BundleFormat::Json,
            _ => BundleFormat::Cbor,
        }
    }
}

/// Portable export of an event log, used for backups and recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBundle {
    /// Bundle format version
    pub format_version: u32,
    /// Device that produced the export
    pub device_id: DeviceId,
    /// Export time
    pub exported_at: DateTime<Utc>,
    /// Events in HLC order
    pub events: Vec<Event>,
    /// Chain links of events pruned before the export
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<ChainLink>,
}

impl EventBundle {
    /// Create a bundle stamped with the current time.
    #[must_use]
    pub fn new(device_id: DeviceId, events: Vec<Event>) -> Self {
        Self {
            format_version: BUNDLE_FORMAT_VERSION,
            device_id,
            exported_at: Utc::now(),
            events,
            links: Vec::new(),
        }
    }

    /// Attach the links of pruned events.
    #[must_use]
    pub fn with_links(mut self, links: Vec<ChainLink>) -> Self {
        self.links = links;
        self
    }

    /// Encode in the given format.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn encode(&self, format: BundleFormat) -> Result<Vec<u8>, MessageError> {
        match format {
            BundleFormat::Json => serde_json::to_vec_pretty(self)
                .map_err(|e| MessageError::Serialize(e.to_string())),
            BundleFormat::Cbor => to_cbor(self),
        }
    }

    /// Decode a bundle, detecting JSON or CBOR.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not a bundle or the version is unsupported.
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let bundle: Self = match BundleFormat::detect(bytes) {
            BundleFormat::Json => serde_json::from_slice(bytes)
                .map_err(|e| MessageError::Deserialize(e.to_string()))?,
            BundleFormat::Cbor => from_cbor(bytes)?,
        };
        if bundle.format_version > BUNDLE_FORMAT_VERSION {
            return Err(MessageError::UnsupportedVersion(bundle.format_version));
        }
        Ok(bundle)
    }
}

/// Serialize to CBOR bytes.
///
/// # Errors
///
/// Returns error if serialization fails.
pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, MessageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes).map_err(|e| MessageError::Serialize(e.to_string()))?;
    Ok(bytes)
}

/// Deserialize from CBOR bytes.
///
/// # Errors
///
/// Returns error if deserialization fails.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MessageError> {
    ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
    /// Bundle written by a newer version
    #[error("unsupported bundle format version {0}")]
    UnsupportedVersion(u32),
}
