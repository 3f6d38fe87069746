//! Hybrid Logical Clock (HLC) implementation for per-device event ordering.
//!
//! HLC timestamps combine:
//! - Physical wall-clock time (milliseconds)
//! - Logical counter for events at the same physical time
//! - Device ID for deterministic tiebreaking
//!
//! The clock guarantees strictly increasing `(physical, logical)` pairs for a
//! single device, even when the wall clock stalls or steps backwards. It does
//! not track cross-device causality.
//!
//! # References
//!
//! Kulkarni, Demirbas, et al. "Logical Physical Clocks and Consistent Snapshots
//! in Globally Distributed Databases" (2014)

use crate::device::DeviceId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Encoded size of a [`Timestamp`] in bytes.
pub const TIMESTAMP_BYTES: usize = 20;

/// A timestamp combining physical time, logical counter, and device ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Physical wall-clock time in milliseconds since UNIX epoch
    pub physical_ms: u64,
    /// Logical counter for events at the same physical time
    pub logical: u32,
    /// Device that generated the timestamp
    pub device_id: DeviceId,
}

impl Timestamp {
    /// Create a timestamp from its parts.
    #[must_use]
    pub const fn new(physical_ms: u64, logical: u32, device_id: DeviceId) -> Self {
        Self {
            physical_ms,
            logical,
            device_id,
        }
    }

    /// Serialize to bytes for canonical hashing.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; TIMESTAMP_BYTES] {
        let mut bytes = [0u8; TIMESTAMP_BYTES];
        bytes[0..8].copy_from_slice(&self.physical_ms.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.logical.to_be_bytes());
        bytes[12..20].copy_from_slice(self.device_id.as_bytes());
        bytes
    }

    /// Deserialize from bytes.
    ///
    /// # Errors
    ///
    /// Returns error if bytes are insufficient.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TimestampError> {
        let insufficient = || TimestampError::InsufficientBytes {
            expected: TIMESTAMP_BYTES,
            actual: bytes.len(),
        };
        if bytes.len() < TIMESTAMP_BYTES {
            return Err(insufficient());
        }

        let physical_ms = u64::from_be_bytes(bytes[0..8].try_into().map_err(|_| insufficient())?);
        let logical = u32::from_be_bytes(bytes[8..12].try_into().map_err(|_| insufficient())?);
        let device: [u8; 8] = bytes[12..20].try_into().map_err(|_| insufficient())?;

        Ok(Self {
            physical_ms,
            logical,
            device_id: DeviceId::from_bytes(device),
        })
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.physical_ms
            .cmp(&other.physical_ms)
            .then(self.logical.cmp(&other.logical))
            .then(self.device_id.cmp(&other.device_id))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Wire form used in relay queries: `{physical_ms}:{logical}:{device_id}`.
impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.physical_ms, self.logical, self.device_id)
    }
}

impl FromStr for Timestamp {
    type Err = TimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (Some(physical), Some(logical), Some(device)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(TimestampError::Parse(s.to_string()));
        };

        Ok(Self {
            physical_ms: physical
                .parse()
                .map_err(|_| TimestampError::Parse(s.to_string()))?,
            logical: logical
                .parse()
                .map_err(|_| TimestampError::Parse(s.to_string()))?,
            device_id: device
                .parse()
                .map_err(|_| TimestampError::Parse(s.to_string()))?,
        })
    }
}

/// Source of wall-clock time, injectable so tests can drive virtual time.
pub trait WallClock: Send + Sync + fmt::Debug {
    /// Milliseconds since UNIX epoch.
    fn now_ms(&self) -> u64;
}

/// The operating system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now_ms(&self) -> u64 {
        current_time_ms()
    }
}

/// Manually driven clock for tests and simulations.
///
/// Clones share the same underlying time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock reading `start_ms`.
    #[must_use]
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    /// Set the current time. Going backwards is allowed.
    pub fn set(&self, ms: u64) {
        self.now.store(ms, AtomicOrdering::SeqCst);
    }

    /// Advance the current time.
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, AtomicOrdering::SeqCst);
    }
}

impl WallClock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(AtomicOrdering::SeqCst)
    }
}

/// Hybrid Logical Clock state machine.
#[derive(Debug, Clone)]
pub struct Hlc {
    /// Last issued or observed timestamp
    last: Timestamp,
    wall: Arc<dyn WallClock>,
}

impl Hlc {
    /// Create a new HLC for the device, reading the system clock.
    #[must_use]
    pub fn new(device_id: DeviceId) -> Self {
        Self::with_clock(device_id, Arc::new(SystemClock))
    }

    /// Create a new HLC reading the given wall clock.
    #[must_use]
    pub fn with_clock(device_id: DeviceId, wall: Arc<dyn WallClock>) -> Self {
        Self {
            last: Timestamp::new(0, 0, device_id),
            wall,
        }
    }

    /// Get the device ID for this clock.
    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        self.last.device_id
    }

    /// Generate a new timestamp for a local event.
    ///
    /// Guarantees the returned timestamp is greater than any previously
    /// generated, resumed, or observed timestamp.
    pub fn tick(&mut self) -> Timestamp {
        let now_ms = self.wall.now_ms();

        if now_ms > self.last.physical_ms {
            // Wall clock advanced, reset logical counter
            self.last.physical_ms = now_ms;
            self.last.logical = 0;
        } else if self.last.logical == u32::MAX {
            // Counter exhausted within this tick, borrow the next millisecond
            self.last.physical_ms += 1;
            self.last.logical = 0;
        } else {
            self.last.logical += 1;
        }

        self.last
    }

    /// Advance the clock past a timestamp received from another device.
    ///
    /// Later local timestamps sort after everything already observed.
    pub fn observe(&mut self, received: Timestamp) {
        let now_ms = self.wall.now_ms();

        if now_ms > self.last.physical_ms && now_ms > received.physical_ms {
            self.last.physical_ms = now_ms;
            self.last.logical = 0;
        } else if self.last.physical_ms == received.physical_ms {
            self.last.logical = self.last.logical.max(received.logical).saturating_add(1);
        } else if received.physical_ms > self.last.physical_ms {
            self.last.physical_ms = received.physical_ms;
            self.last.logical = received.logical.saturating_add(1);
        } else {
            self.last.logical = self.last.logical.saturating_add(1);
        }
    }

    /// Resume from a timestamp previously issued by this device.
    ///
    /// Used after restart or recovery so the sequence stays strictly increasing.
    pub fn resume(&mut self, issued: Timestamp) {
        if (issued.physical_ms, issued.logical) > (self.last.physical_ms, self.last.logical) {
            self.last.physical_ms = issued.physical_ms;
            self.last.logical = issued.logical;
        }
    }

    /// Get the current timestamp without advancing the clock.
    #[must_use]
    pub fn current(&self) -> Timestamp {
        self.last
    }
}

/// Errors that can occur with timestamp operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TimestampError {
    /// Insufficient bytes for deserialization
    #[error("insufficient bytes: expected {expected}, got {actual}")]
    InsufficientBytes {
        /// Expected byte count
        expected: usize,
        /// Actual byte count
        actual: usize,
    },
    /// Malformed wire string
    #[error("malformed timestamp '{0}'")]
    Parse(String),
}

/// Get current wall clock time in milliseconds since UNIX epoch.
fn current_time_ms() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    u64::try_from(millis).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(n: u8) -> DeviceId {
        DeviceId::from_bytes([n; 8])
    }

    #[test]
    fn hlc_monotonic() {
        let mut hlc = Hlc::new(device(1));

        let t1 = hlc.tick();
        let t2 = hlc.tick();
        let t3 = hlc.tick();

        assert!(t1 < t2);
        assert!(t2 < t3);
    }

    #[test]
    fn logical_counts_within_a_tick_and_resets_after() {
        let wall = ManualClock::new(1_000);
        let mut hlc = Hlc::with_clock(device(1), Arc::new(wall.clone()));

        let stamps: Vec<_> = (0..5).map(|_| hlc.tick()).collect();
        for (i, ts) in stamps.iter().enumerate() {
            assert_eq!(ts.physical_ms, 1_000);
            assert_eq!(ts.logical as usize, i);
        }

        wall.advance(1);
        let next = hlc.tick();
        assert_eq!((next.physical_ms, next.logical), (1_001, 0));
    }

    #[test]
    fn survives_backward_wall_clock_jump() {
        let wall = ManualClock::new(5_000);
        let mut hlc = Hlc::with_clock(device(1), Arc::new(wall.clone()));

        let before = hlc.tick();
        wall.set(4_000);
        let after = hlc.tick();

        assert!(after > before);
        assert_eq!(after.physical_ms, 5_000);
        assert_eq!(after.logical, 1);
    }

    #[test]
    fn many_ticks_strictly_increase() {
        let wall = ManualClock::new(10);
        let mut hlc = Hlc::with_clock(device(3), Arc::new(wall.clone()));
        let mut prev = hlc.tick();
        for i in 0..1_000u64 {
            if i % 7 == 0 {
                wall.advance(1);
            }
            if i % 97 == 0 {
                wall.set(wall.now_ms().saturating_sub(3));
            }
            let next = hlc.tick();
            assert!((next.physical_ms, next.logical) > (prev.physical_ms, prev.logical));
            prev = next;
        }
    }

    #[test]
    fn observe_advances_past_remote() {
        let wall = ManualClock::new(1_000);
        let mut local = Hlc::with_clock(device(1), Arc::new(wall));

        let remote = Timestamp::new(9_000, 4, device(2));
        local.observe(remote);

        let next = local.tick();
        assert!((next.physical_ms, next.logical) > (remote.physical_ms, remote.logical));
    }

    #[test]
    fn resume_never_moves_backwards() {
        let wall = ManualClock::new(100);
        let mut hlc = Hlc::with_clock(device(1), Arc::new(wall));

        hlc.resume(Timestamp::new(500, 3, device(1)));
        hlc.resume(Timestamp::new(200, 9, device(1)));

        let next = hlc.tick();
        assert_eq!((next.physical_ms, next.logical), (500, 4));
    }

    #[test]
    fn timestamp_serialization_roundtrip() {
        let ts = Timestamp::new(1_704_067_200_000, 42, device(7));

        let decoded = Timestamp::from_bytes(&ts.to_bytes()).unwrap();
        assert_eq!(ts, decoded);

        let parsed: Timestamp = ts.to_string().parse().unwrap();
        assert_eq!(ts, parsed);
        assert!("12:x:dev-00".parse::<Timestamp>().is_err());
    }

    #[test]
    fn timestamp_ordering_tiebreaker() {
        let t1 = Timestamp::new(1000, 0, device(1));
        let t2 = Timestamp::new(1000, 0, device(2));

        // Same time and counter, so device_id breaks tie
        assert!(t1 < t2);
    }
}
