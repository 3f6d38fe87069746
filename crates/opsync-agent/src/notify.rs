//! Sync notifications for subscribers.
//!
//! A broadcast channel replaces callback fan-out: every subscriber gets its
//! own receiver and sees notifications in emission order. Slow subscribers
//! lag and lose the oldest entries instead of blocking the engine.

use crate::sync::SyncReport;
use opsync_core::verify::Quarantined;
use opsync_core::{DeviceId, EntityKey, Timestamp};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Notification channel capacity.
pub const NOTIFY_CAPACITY: usize = 256;

/// Something the engine did that subscribers may care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotification {
    /// A local event was appended
    EventCreated {
        /// Event id
        op_id: Uuid,
        /// Entity written
        key: EntityKey,
        /// Event timestamp
        hlc: Timestamp,
    },
    /// Remote events were merged into entity state
    EventsMerged {
        /// Entities whose state was touched
        keys: Vec<EntityKey>,
        /// Number of events merged
        count: usize,
    },
    /// A remote event failed verification
    EventQuarantined(Quarantined),
    /// A sync cycle finished, possibly partially
    CycleCompleted(SyncReport),
    /// A sync cycle was skipped because one was still running
    CycleSkipped {
        /// Relay the cycle was aimed at
        peer: String,
    },
    /// Local writes halted after a chain integrity failure
    ChainHalted {
        /// Local device
        device_id: DeviceId,
    },
}

/// Sending side of the notification channel.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<SyncNotification>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(NOTIFY_CAPACITY)
    }
}

impl Notifier {
    /// Create a channel holding up to `capacity` undelivered notifications.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// New receiver seeing every notification sent from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.tx.subscribe()
    }

    /// Send to every current subscriber. Without subscribers this is a no-op.
    pub fn send(&self, notification: SyncNotification) {
        let _ = self.tx.send(notification);
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_notifications_in_order() {
        let notifier = Notifier::default();
        let mut rx = notifier.subscribe();

        notifier.send(SyncNotification::CycleSkipped {
            peer: "a".to_string(),
        });
        notifier.send(SyncNotification::CycleSkipped {
            peer: "b".to_string(),
        });

        assert_eq!(
            rx.recv().await.unwrap(),
            SyncNotification::CycleSkipped {
                peer: "a".to_string()
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            SyncNotification::CycleSkipped {
                peer: "b".to_string()
            }
        );
    }

    #[test]
    fn sending_without_subscribers_is_fine() {
        let notifier = Notifier::new(1);
        assert_eq!(notifier.subscriber_count(), 0);
        notifier.send(SyncNotification::ChainHalted {
            device_id: DeviceId::from_bytes([1; 8]),
        });
    }

    #[tokio::test]
    async fn slow_subscriber_lags() {
        let notifier = Notifier::new(2);
        let mut rx = notifier.subscribe();
        for peer in ["a", "b", "c"] {
            notifier.send(SyncNotification::CycleSkipped {
                peer: peer.to_string(),
            });
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(1))
        ));
        assert_eq!(
            rx.recv().await.unwrap(),
            SyncNotification::CycleSkipped {
                peer: "b".to_string()
            }
        );
    }
}
