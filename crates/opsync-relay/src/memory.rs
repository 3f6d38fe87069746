//! In-process relay with fault injection.

use crate::error::RelayError;
use crate::Relay;
use async_trait::async_trait;
use opsync_core::{DeviceId, Event, Timestamp};
use opsync_proto::PushAck;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Inner {
    events: BTreeMap<(Timestamp, Uuid), Event>,
    index: BTreeMap<Uuid, Timestamp>,
    pull_failures: u32,
    push_failures: u32,
    pulls: u32,
    pushes: u32,
}

/// Relay that keeps events in memory.
///
/// Clones share storage, so several engines can sync through one instance.
#[derive(Debug, Clone)]
pub struct MemoryRelay {
    name: String,
    latency: Option<Duration>,
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl MemoryRelay {
    /// Create an empty relay.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            latency: None,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Delay every request, sharing storage with `self`.
    #[must_use]
    pub fn with_latency(&self, latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..self.clone()
        }
    }

    /// Fail the next `count` pulls with a 503.
    pub fn fail_next_pulls(&self, count: u32) {
        self.inner.lock().pull_failures = count;
    }

    /// Fail the next `count` pushes with a 503.
    pub fn fail_next_pushes(&self, count: u32) {
        self.inner.lock().push_failures = count;
    }

    /// Mutate a stored event in place, simulating a compromised relay.
    ///
    /// Returns `false` if no event has this `op_id`.
    pub fn tamper(&self, op_id: &Uuid, f: impl FnOnce(&mut Event)) -> bool {
        let mut inner = self.inner.lock();
        let Some(hlc) = inner.index.get(op_id).copied() else {
            return false;
        };
        match inner.events.get_mut(&(hlc, *op_id)) {
            Some(event) => {
                f(event);
                true
            }
            None => false,
        }
    }

    /// Store events directly, bypassing the push path.
    pub fn seed(&self, events: impl IntoIterator<Item = Event>) {
        let mut inner = self.inner.lock();
        for event in events {
            Self::store(&mut inner, event);
        }
    }

    /// Every stored event in HLC order.
    #[must_use]
    pub fn all_events(&self) -> Vec<Event> {
        self.inner.lock().events.values().cloned().collect()
    }

    /// Number of stored events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    /// Whether the relay holds no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pull and push requests served so far, failed ones included.
    #[must_use]
    pub fn request_counts(&self) -> (u32, u32) {
        let inner = self.inner.lock();
        (inner.pulls, inner.pushes)
    }

    fn store(inner: &mut Inner, event: Event) -> bool {
        if inner.index.contains_key(&event.op_id) {
            return false;
        }
        inner.index.insert(event.op_id, event.hlc);
        inner.events.insert((event.hlc, event.op_id), event);
        true
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn unavailable() -> RelayError {
        RelayError::ApiError {
            status: 503,
            message: "injected failure".to_string(),
        }
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    fn peer(&self) -> &str {
        &self.name
    }

    async fn fetch_since(
        &self,
        after: Option<Timestamp>,
        _device: DeviceId,
    ) -> Result<Vec<Event>, RelayError> {
        self.delay().await;
        let mut inner = self.inner.lock();
        inner.pulls += 1;
        if inner.pull_failures > 0 {
            inner.pull_failures -= 1;
            return Err(Self::unavailable());
        }

        Ok(inner
            .events
            .values()
            .filter(|e| after.map_or(true, |a| e.hlc > a))
            .cloned()
            .collect())
    }

    async fn push(&self, _device: DeviceId, events: &[Event]) -> Result<PushAck, RelayError> {
        self.delay().await;
        let mut inner = self.inner.lock();
        inner.pushes += 1;
        if inner.push_failures > 0 {
            inner.push_failures -= 1;
            return Err(Self::unavailable());
        }

        let mut stored = 0;
        for event in events {
            if Self::store(&mut inner, event.clone()) {
                stored += 1;
            }
        }
        Ok(PushAck {
            stored: Some(stored),
            duplicates: Some(events.len() - stored),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsync_core::{EventBuilder, Hlc, KeyStore, MemoryLog, Op, SchemaRegistry};
    use serde_json::json;

    fn events(count: usize) -> (DeviceId, Vec<Event>) {
        let keys = Arc::new(KeyStore::generate(DeviceId::from_bytes([3; 8])));
        let device = keys.device_id();
        let mut builder =
            EventBuilder::new(keys, Arc::new(SchemaRegistry::new()), Hlc::new(device));
        let mut log = MemoryLog::new();
        for n in 0..count {
            builder
                .create_event(&mut log, "memory", "m", Op::Update, &json!({"n": n}))
                .unwrap();
        }
        (device, log.events().to_vec())
    }

    #[tokio::test]
    async fn push_is_idempotent_by_op_id() {
        let relay = MemoryRelay::default();
        let (device, events) = events(3);

        let first = relay.push(device, &events).await.unwrap();
        let again = relay.push(device, &events).await.unwrap();

        assert_eq!(first.stored, Some(3));
        assert_eq!(again.duplicates, Some(3));
        assert_eq!(relay.len(), 3);
    }

    #[tokio::test]
    async fn fetch_since_is_exclusive() {
        let relay = MemoryRelay::default();
        let (device, events) = events(4);
        relay.seed(events.clone());

        let newer = relay.fetch_since(Some(events[1].hlc), device).await.unwrap();
        assert_eq!(newer, events[2..].to_vec());
        assert_eq!(relay.fetch_since(None, device).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let relay = MemoryRelay::default();
        let (device, events) = events(1);
        relay.fail_next_pushes(1);

        let err = relay.push(device, &events).await.unwrap_err();
        assert!(err.is_retryable());
        relay.push(device, &events).await.unwrap();
        assert_eq!(relay.request_counts(), (0, 2));
    }

    #[test]
    fn latency_shares_storage() {
        let relay = MemoryRelay::new("relay");
        let slow = relay.with_latency(Duration::from_millis(5));
        let (device, events) = events(2);

        let ack = tokio_test::block_on(slow.push(device, &events)).unwrap();
        assert_eq!(ack.stored, Some(2));
        assert_eq!(relay.len(), 2);
        assert_eq!(relay.request_counts(), (0, 1));
    }

    #[test]
    fn tamper_changes_stored_copy() {
        let relay = MemoryRelay::default();
        let (_, events) = events(1);
        relay.seed(events.clone());

        assert!(relay.tamper(&events[0].op_id, |e| e.cipher_blob.ciphertext[0] ^= 1));
        assert!(!relay.all_events()[0].verify_hash());
        assert!(!relay.tamper(&Uuid::new_v4(), |_| {}));
    }
}
