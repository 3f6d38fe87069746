//! Append-only event log abstraction and an in-memory implementation.

use crate::device::DeviceId;
use crate::error::SyncError;
use crate::event::{Event, EventHash};
use crate::hlc::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

/// Page size used by [`EventCursor`].
pub const DEFAULT_PAGE_SIZE: usize = 256;

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    /// Event stored and chain head advanced
    Inserted,
    /// An event with the same `op_id` was already stored; nothing changed
    Duplicate,
}

/// Position of one event in its device chain, kept after the event itself
/// has been pruned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    /// Originating device
    pub device_id: DeviceId,
    /// Id of the pruned event
    pub op_id: Uuid,
    /// Timestamp of the pruned event
    pub hlc: Timestamp,
    /// Hash of the pruned event
    pub hash: EventHash,
    /// Hash of its predecessor
    pub prev_hash: Option<EventHash>,
}

impl ChainLink {
    /// The link an event occupies.
    #[must_use]
    pub fn of(event: &Event) -> Self {
        Self {
            device_id: event.device_id,
            op_id: event.op_id,
            hlc: event.hlc,
            hash: event.hash,
            prev_hash: event.prev_hash,
        }
    }
}

/// Durable, append-only, per-device hash-chained event storage.
///
/// Implementations must never reorder or mutate stored events.
pub trait EventLog {
    /// Append an event, advancing its device's chain head.
    ///
    /// Appending an `op_id` that is already stored is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ChainIntegrity`] if `event.prev_hash` is not the
    /// current head of the event's device chain.
    fn append(&mut self, event: &Event) -> Result<Appended, SyncError>;

    /// Whether this `op_id` is part of a chain, stored or pruned.
    ///
    /// # Errors
    ///
    /// Returns error on storage failure.
    fn contains(&self, op_id: &Uuid) -> Result<bool, SyncError>;

    /// Hash of the newest event in a device's chain.
    ///
    /// # Errors
    ///
    /// Returns error on storage failure.
    fn head(&self, device_id: DeviceId) -> Result<Option<EventHash>, SyncError>;

    /// Advance a device chain over an event that was pruned at its source.
    ///
    /// Only the link is recorded; no event is stored.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ChainIntegrity`] if `link.prev_hash` is not the
    /// current head of the device chain.
    fn bridge(&mut self, link: &ChainLink) -> Result<Appended, SyncError>;

    /// Links whose events are no longer stored, ordered by HLC.
    ///
    /// # Errors
    ///
    /// Returns error on storage failure.
    fn pruned_links(&self) -> Result<Vec<ChainLink>, SyncError>;

    /// Devices with at least one event in the log.
    ///
    /// # Errors
    ///
    /// Returns error on storage failure.
    fn devices(&self) -> Result<Vec<DeviceId>, SyncError>;

    /// HLC of the newest event in a device's chain.
    ///
    /// # Errors
    ///
    /// Returns error on storage failure.
    fn latest(&self, device_id: DeviceId) -> Result<Option<Timestamp>, SyncError>;

    /// Up to `limit` events with `hlc > since`, ordered by HLC.
    ///
    /// # Errors
    ///
    /// Returns error on storage failure.
    fn page_after(&self, since: Option<&Timestamp>, limit: usize) -> Result<Vec<Event>, SyncError>;

    /// Number of stored events.
    ///
    /// # Errors
    ///
    /// Returns error on storage failure.
    fn len(&self) -> Result<usize, SyncError>;

    /// Whether the log holds no events.
    ///
    /// # Errors
    ///
    /// Returns error on storage failure.
    fn is_empty(&self) -> Result<bool, SyncError> {
        Ok(self.len()? == 0)
    }

    /// Lazily iterate events with `hlc > since`.
    fn iterate(&self, since: Option<Timestamp>) -> EventCursor<'_, Self>
    where
        Self: Sized,
    {
        EventCursor::new(self, since, DEFAULT_PAGE_SIZE)
    }

    /// Every stored event, ordered by HLC.
    ///
    /// # Errors
    ///
    /// Returns error on storage failure.
    fn export_all(&self) -> Result<Vec<Event>, SyncError>
    where
        Self: Sized,
    {
        self.iterate(None).collect()
    }
}

/// Keyset-paginated cursor over a log.
///
/// Restartable from any watermark; yields each event at most once and ends
/// after the newest event present when the final page was read.
pub struct EventCursor<'a, L: EventLog> {
    log: &'a L,
    fetched_to: Option<Timestamp>,
    yielded_to: Option<Timestamp>,
    page: VecDeque<Event>,
    page_size: usize,
    exhausted: bool,
}

impl<'a, L: EventLog> EventCursor<'a, L> {
    /// Create a cursor starting after `since`.
    pub fn new(log: &'a L, since: Option<Timestamp>, page_size: usize) -> Self {
        Self {
            log,
            fetched_to: since,
            yielded_to: since,
            page: VecDeque::new(),
            page_size: page_size.max(1),
            exhausted: false,
        }
    }

    /// Watermark to restart from: the HLC of the last yielded event.
    #[must_use]
    pub fn position(&self) -> Option<Timestamp> {
        self.yielded_to
    }
}

impl<L: EventLog> Iterator for EventCursor<'_, L> {
    type Item = Result<Event, SyncError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.exhausted {
            match self.log.page_after(self.fetched_to.as_ref(), self.page_size) {
                Ok(page) => {
                    if page.len() < self.page_size {
                        self.exhausted = true;
                    }
                    if let Some(last) = page.last() {
                        self.fetched_to = Some(last.hlc);
                    }
                    self.page.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
        let event = self.page.pop_front()?;
        self.yielded_to = Some(event.hlc);
        Some(Ok(event))
    }
}

/// In-memory event log, used by tests and as a scratch log during verification.
#[derive(Debug, Default, Clone)]
pub struct MemoryLog {
    events: Vec<Event>,
    by_op_id: HashMap<Uuid, usize>,
    heads: HashMap<DeviceId, (EventHash, Timestamp)>,
    bridged: Vec<ChainLink>,
    bridged_ids: HashSet<Uuid>,
}

impl MemoryLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored events in append order.
    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    fn check_link(&self, device_id: DeviceId, prev_hash: Option<EventHash>) -> Result<(), SyncError> {
        let head = self.heads.get(&device_id).map(|(hash, _)| *hash);
        if prev_hash == head {
            Ok(())
        } else {
            Err(SyncError::ChainIntegrity {
                device_id,
                expected: head,
                found: prev_hash,
            })
        }
    }
}

impl EventLog for MemoryLog {
    fn append(&mut self, event: &Event) -> Result<Appended, SyncError> {
        if self.contains(&event.op_id)? {
            return Ok(Appended::Duplicate);
        }
        self.check_link(event.device_id, event.prev_hash)?;

        self.by_op_id.insert(event.op_id, self.events.len());
        self.heads.insert(event.device_id, (event.hash, event.hlc));
        self.events.push(event.clone());
        Ok(Appended::Inserted)
    }

    fn contains(&self, op_id: &Uuid) -> Result<bool, SyncError> {
        Ok(self.by_op_id.contains_key(op_id) || self.bridged_ids.contains(op_id))
    }

    fn bridge(&mut self, link: &ChainLink) -> Result<Appended, SyncError> {
        if self.contains(&link.op_id)? {
            return Ok(Appended::Duplicate);
        }
        self.check_link(link.device_id, link.prev_hash)?;

        self.bridged_ids.insert(link.op_id);
        self.heads.insert(link.device_id, (link.hash, link.hlc));
        self.bridged.push(link.clone());
        Ok(Appended::Inserted)
    }

    fn pruned_links(&self) -> Result<Vec<ChainLink>, SyncError> {
        let mut links = self.bridged.clone();
        links.sort_by(|a, b| a.hlc.cmp(&b.hlc));
        Ok(links)
    }

    fn head(&self, device_id: DeviceId) -> Result<Option<EventHash>, SyncError> {
        Ok(self.heads.get(&device_id).map(|(hash, _)| *hash))
    }

    fn devices(&self) -> Result<Vec<DeviceId>, SyncError> {
        let mut devices: Vec<_> = self.heads.keys().copied().collect();
        devices.sort();
        Ok(devices)
    }

    fn latest(&self, device_id: DeviceId) -> Result<Option<Timestamp>, SyncError> {
        Ok(self.heads.get(&device_id).map(|(_, hlc)| *hlc))
    }

    fn page_after(&self, since: Option<&Timestamp>, limit: usize) -> Result<Vec<Event>, SyncError> {
        let mut page: Vec<Event> = self
            .events
            .iter()
            .filter(|e| since.map_or(true, |s| e.hlc > *s))
            .cloned()
            .collect();
        page.sort_by(|a, b| a.hlc.cmp(&b.hlc));
        page.truncate(limit);
        Ok(page)
    }

    fn len(&self) -> Result<usize, SyncError> {
        Ok(self.events.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::EventBuilder;
    use crate::crypto::KeyStore;
    use crate::event::Op;
    use crate::hlc::{Hlc, ManualClock};
    use crate::payload::SchemaRegistry;
    use serde_json::json;
    use std::sync::Arc;

    fn filled_log(count: u64) -> MemoryLog {
        let keys = Arc::new(KeyStore::generate(DeviceId::from_bytes([9; 8])));
        let wall = Arc::new(ManualClock::new(100));
        let clock = Hlc::with_clock(keys.device_id(), wall.clone());
        let mut builder = EventBuilder::new(keys, Arc::new(SchemaRegistry::new()), clock);
        let mut log = MemoryLog::new();
        for n in 0..count {
            wall.advance(1);
            builder
                .create_event(&mut log, "memory", "m", Op::Update, &json!({"n": n}))
                .unwrap();
        }
        log
    }

    #[test]
    fn append_rejects_broken_link() {
        let mut log = filled_log(2);
        let mut stray = log.events()[1].clone();
        stray.op_id = Uuid::new_v4();
        stray.prev_hash = None;

        assert!(matches!(
            log.append(&stray),
            Err(SyncError::ChainIntegrity { expected: Some(_), found: None, .. })
        ));
        assert_eq!(log.len().unwrap(), 2);
    }

    #[test]
    fn duplicate_append_is_noop() {
        let mut log = filled_log(3);
        let again = log.events()[0].clone();
        assert_eq!(log.append(&again).unwrap(), Appended::Duplicate);
        assert_eq!(log.len().unwrap(), 3);
    }

    #[test]
    fn cursor_pages_and_restarts() {
        let log = filled_log(10);
        let mut cursor = EventCursor::new(&log, None, 3);

        let first: Vec<_> = cursor.by_ref().take(4).map(Result::unwrap).collect();
        assert_eq!(first.len(), 4);
        let resume_at = cursor.position();
        assert_eq!(resume_at, Some(first[3].hlc));

        let rest: Vec<_> = EventCursor::new(&log, resume_at, 3)
            .map(Result::unwrap)
            .collect();
        assert_eq!(rest.len(), 6);
        assert!(rest[0].hlc > first[3].hlc);
        assert!(rest.windows(2).all(|w| w[0].hlc < w[1].hlc));
    }

    #[test]
    fn export_all_is_ordered_and_complete() {
        let log = filled_log(300);
        let exported = log.export_all().unwrap();
        assert_eq!(exported.len(), 300);
        assert!(exported.windows(2).all(|w| w[0].hlc < w[1].hlc));
        assert_eq!(log.iterate(Some(exported[299].hlc)).count(), 0);
    }

    #[test]
    fn bridged_link_extends_the_chain() {
        let source = filled_log(3);
        let events = source.events();
        let mut log = MemoryLog::new();

        log.append(&events[0]).unwrap();
        assert!(matches!(
            log.bridge(&ChainLink::of(&events[2])),
            Err(SyncError::ChainIntegrity { .. })
        ));
        assert_eq!(log.bridge(&ChainLink::of(&events[1])).unwrap(), Appended::Inserted);
        assert_eq!(log.bridge(&ChainLink::of(&events[1])).unwrap(), Appended::Duplicate);
        assert!(log.contains(&events[1].op_id).unwrap());
        assert_eq!(log.append(&events[1]).unwrap(), Appended::Duplicate);

        assert_eq!(log.append(&events[2]).unwrap(), Appended::Inserted);
        assert_eq!(log.len().unwrap(), 2);
        assert_eq!(log.pruned_links().unwrap(), vec![ChainLink::of(&events[1])]);
        assert_eq!(log.head(events[2].device_id).unwrap(), Some(events[2].hash));
    }
}
