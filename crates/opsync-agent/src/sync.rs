//! Sync cycle primitives: retry policy, cycle guard, and reports.

use crate::config::SyncConfig;
use opsync_core::Timestamp;
use opsync_relay::RelayError;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Exponential backoff for retryable relay failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts in total, first one included
    pub attempts: u32,
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound for a single delay
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy from the sync configuration.
    #[must_use]
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            base: config.retry_base,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based): `base * 2^retry`, capped.
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Run a relay request, retrying retryable failures with backoff.
///
/// Stops early when `cancel` fires, returning the last error.
///
/// # Errors
///
/// Returns the first non-retryable error, or the last error once attempts
/// are exhausted.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut request: F,
) -> Result<T, RelayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RelayError>>,
{
    let mut retry = 0;
    loop {
        let err = match request().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        retry += 1;
        if !err.is_retryable() || retry >= policy.attempts {
            return Err(err);
        }

        let delay = policy.delay(retry - 1);
        warn!(
            operation,
            error = %err,
            attempt = retry,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "relay request failed, retrying"
        );

        tokio::select! {
            () = cancel.cancelled() => return Err(err),
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// Marks a sync cycle as running for as long as it is held.
#[derive(Debug)]
pub struct CycleGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> CycleGuard<'a> {
    /// Claim the flag, or `None` if a cycle is already running.
    #[must_use]
    pub fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Summary of one sync cycle against one relay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Relay the cycle ran against
    pub peer: String,
    /// Events received from the relay
    pub pulled: usize,
    /// Events verified and appended
    pub accepted: usize,
    /// Events already known
    pub duplicates: usize,
    /// Events rejected by verification
    pub quarantined: usize,
    /// Own events acknowledged by the relay
    pub pushed: usize,
    /// Pull watermark after the cycle
    pub pull_watermark: Option<Timestamp>,
    /// Push watermark after the cycle
    pub push_watermark: Option<Timestamp>,
    /// The deadline expired before the cycle finished
    pub timed_out: bool,
    /// The cycle was cancelled before it finished
    pub cancelled: bool,
}

impl SyncReport {
    pub(crate) fn new(peer: &str) -> Self {
        Self {
            peer: peer.to_string(),
            ..Self::default()
        }
    }

    /// Whether the cycle ran to completion.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.timed_out && !self.cancelled
    }
}

/// Result of asking for a sync cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The cycle ran
    Completed(SyncReport),
    /// Another cycle was still running; nothing was done
    Skipped,
}

impl SyncOutcome {
    /// The report, if the cycle ran.
    #[must_use]
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            SyncOutcome::Skipped => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            base: Duration::from_millis(1),
            max: Duration::from_millis(5),
        }
    }

    fn unavailable() -> RelayError {
        RelayError::ApiError {
            status: 503,
            message: "busy".to_string(),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            attempts: 10,
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(9), Duration::from_secs(1));
        assert_eq!(policy.delay(40), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&fast_policy(3), &CancellationToken::new(), "pull", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(unavailable())
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> =
            retry_with_backoff(&fast_policy(2), &CancellationToken::new(), "push", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(unavailable()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> =
            retry_with_backoff(&fast_policy(5), &CancellationToken::new(), "pull", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RelayError::Parse("bad body".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(RelayError::Parse(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_retrying() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let policy = RetryPolicy {
            attempts: 5,
            base: Duration::from_secs(60),
            max: Duration::from_secs(60),
        };
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&policy, &cancel, "pull", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(unavailable()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn guard_is_exclusive_and_released_on_drop() {
        let flag = AtomicBool::new(false);
        let guard = CycleGuard::try_acquire(&flag).unwrap();
        assert!(CycleGuard::try_acquire(&flag).is_none());
        drop(guard);
        assert!(CycleGuard::try_acquire(&flag).is_some());
    }
}
