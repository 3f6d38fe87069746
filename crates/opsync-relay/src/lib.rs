//! # opsync relay
//!
//! The relay is an opaque store-and-forward collaborator. It must return
//! every event with `hlc > after` regardless of origin and must store pushes
//! idempotently by `op_id`; nothing else is assumed about it.
//!
//! - [`HttpRelay`] speaks the HTTP contract
//! - [`MemoryRelay`] keeps events in process, with fault injection for tests

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod error;
pub mod memory;

pub use client::{HttpRelay, RelayClientConfig};
pub use error::RelayError;
pub use memory::MemoryRelay;

use async_trait::async_trait;
use opsync_core::{DeviceId, Event, Timestamp};
use opsync_proto::PushAck;

/// A relay reachable by the sync client.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Stable name of the relay, used to key sync watermarks.
    fn peer(&self) -> &str;

    /// Fetch events with `hlc > after` (all events when `after` is `None`).
    ///
    /// # Errors
    ///
    /// Returns error on network failure or a non-2xx answer.
    async fn fetch_since(
        &self,
        after: Option<Timestamp>,
        device: DeviceId,
    ) -> Result<Vec<Event>, RelayError>;

    /// Store events. Success means every event in the batch is held by the relay.
    ///
    /// # Errors
    ///
    /// Returns error on network failure or a non-2xx answer.
    async fn push(&self, device: DeviceId, events: &[Event]) -> Result<PushAck, RelayError>;
}
