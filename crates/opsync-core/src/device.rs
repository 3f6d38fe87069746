//! Stable device identifiers.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

const PREFIX: &str = "dev-";

/// Stable identifier of a device, rendered as `dev-` followed by 16 hex chars.
///
/// Ordering is bytewise and matches the ordering of the rendered string,
/// which the event log relies on for its `(physical, logical, device)` index.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId([u8; 8]);

impl DeviceId {
    /// Wrap raw identifier bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Raw identifier bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Derive an identifier from the host name and the identity creation time.
    ///
    /// Used when no hardware fingerprint is available.
    #[must_use]
    pub fn derive(hostname: &str, created_at_ms: i64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(hostname.as_bytes());
        hasher.update(created_at_ms.to_be_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        Self(bytes)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{}", hex::encode(self.0))
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Error parsing a [`DeviceId`] from text.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid device id '{0}'")]
pub struct ParseDeviceIdError(String);

impl FromStr for DeviceId {
    type Err = ParseDeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(PREFIX).unwrap_or(s);
        let decoded = hex::decode(raw).map_err(|_| ParseDeviceIdError(s.to_string()))?;
        let bytes: [u8; 8] = decoded
            .try_into()
            .map_err(|_| ParseDeviceIdError(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for DeviceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_is_deterministic() {
        let a = DeviceId::derive("laptop", 1_700_000_000_000);
        let b = DeviceId::derive("laptop", 1_700_000_000_000);
        let c = DeviceId::derive("laptop", 1_700_000_000_001);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn display_parse_roundtrip() {
        let id = DeviceId::from_bytes([0xab, 0xcd, 0, 1, 2, 3, 4, 5]);
        assert_eq!(id.to_string(), "dev-abcd000102030405");
        assert_eq!("dev-abcd000102030405".parse::<DeviceId>().unwrap(), id);
        assert!("dev-xyz".parse::<DeviceId>().is_err());
    }

    #[test]
    fn string_order_matches_byte_order() {
        let low = DeviceId::from_bytes([0x0f; 8]);
        let high = DeviceId::from_bytes([0xa0; 8]);
        assert!(low < high);
        assert!(low.to_string() < high.to_string());
    }
}
