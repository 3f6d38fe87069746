//! Relay failures.

use opsync_core::SyncError;

/// Errors that can occur while talking to a relay.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    /// Client initialization failed
    #[error("client init error: {0}")]
    Init(String),
    /// HTTP request failed before a response arrived
    #[error("request error: {0}")]
    Request(String),
    /// Request exceeded the client timeout
    #[error("request timed out")]
    Timeout,
    /// Relay answered with a non-2xx status
    #[error("relay error (status {status}): {message}")]
    ApiError {
        /// HTTP status code
        status: u16,
        /// Response body
        message: String,
    },
    /// Response body could not be decoded
    #[error("parse error: {0}")]
    Parse(String),
}

impl RelayError {
    /// Whether retrying the same request may succeed.
    ///
    /// Every non-2xx answer counts as transient.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::Request(_) | RelayError::Timeout | RelayError::ApiError { .. }
        )
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RelayError::Timeout
        } else if e.is_decode() {
            RelayError::Parse(e.to_string())
        } else {
            RelayError::Request(e.to_string())
        }
    }
}

impl From<RelayError> for SyncError {
    fn from(e: RelayError) -> Self {
        SyncError::Network(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_success_status_is_retryable() {
        let err = RelayError::ApiError {
            status: 503,
            message: "busy".to_string(),
        };
        assert!(err.is_retryable());
        assert!(RelayError::Timeout.is_retryable());
        assert!(!RelayError::Init("bad ca".to_string()).is_retryable());
        assert!(!RelayError::Parse("eof".to_string()).is_retryable());
    }

    #[test]
    fn maps_to_network_error() {
        let err: SyncError = RelayError::Timeout.into();
        assert!(matches!(err, SyncError::Network(_)));
        assert!(err.is_retryable());
    }
}
