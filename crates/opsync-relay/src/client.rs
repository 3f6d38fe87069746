//! HTTP client for the relay sync contract.

use crate::error::RelayError;
use crate::Relay;
use async_trait::async_trait;
use opsync_core::{DeviceId, Event, Timestamp};
use opsync_proto::{PullResponse, PushAck, PushRequest, RelayRoutes};
use reqwest::{Client, RequestBuilder, Response};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Relay HTTP client configuration.
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// Base URL of the relay (e.g., <https://relay.example/api>)
    pub base_url: String,
    /// Request timeout
    pub timeout: Duration,
    /// Optional bearer token for authentication
    pub bearer_token: Option<String>,
    /// Custom CA certificate path for self-signed relay certs (PEM format)
    pub ca_cert_path: Option<PathBuf>,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8787".to_string(),
            timeout: Duration::from_secs(30),
            bearer_token: None,
            ca_cert_path: None,
        }
    }
}

impl RelayClientConfig {
    /// Config for a base URL with default settings.
    #[must_use]
    pub fn for_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }
}

/// Relay reached over HTTP.
pub struct HttpRelay {
    client: Client,
    routes: RelayRoutes,
    peer: String,
    bearer_token: Option<String>,
}

impl HttpRelay {
    /// Create a new relay client.
    ///
    /// # Errors
    ///
    /// Returns error if the URL is invalid, the HTTP client cannot be
    /// created, or the CA certificate cannot be read or parsed.
    pub fn new(config: RelayClientConfig) -> Result<Self, RelayError> {
        let routes = RelayRoutes::new(&config.base_url)
            .map_err(|e| RelayError::Init(format!("invalid relay URL {}: {e}", config.base_url)))?;

        let mut builder = Client::builder().timeout(config.timeout);

        if routes.base().scheme() == "https" {
            builder = builder.use_rustls_tls();

            // Load custom CA certificate if provided (for self-signed certs)
            if let Some(ca_path) = &config.ca_cert_path {
                let ca_cert = fs::read(ca_path).map_err(|e| {
                    RelayError::Init(format!(
                        "failed to read CA certificate {}: {e}",
                        ca_path.display()
                    ))
                })?;
                let cert = reqwest::Certificate::from_pem(&ca_cert).map_err(|e| {
                    RelayError::Init(format!("failed to parse CA certificate: {e}"))
                })?;
                builder = builder.add_root_certificate(cert);
                tracing::debug!(ca_path = %ca_path.display(), "Loaded custom CA certificate");
            }
        }

        let client = builder
            .build()
            .map_err(|e| RelayError::Init(e.to_string()))?;

        Ok(Self {
            client,
            peer: routes.base().to_string(),
            routes,
            bearer_token: config.bearer_token,
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: Response) -> Result<Response, RelayError> {
        if response.status().is_success() {
            return Ok(response);
        }
        Err(RelayError::ApiError {
            status: response.status().as_u16(),
            message: response.text().await.unwrap_or_default(),
        })
    }
}

impl std::fmt::Debug for HttpRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRelay")
            .field("peer", &self.peer)
            .field("authenticated", &self.bearer_token.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Relay for HttpRelay {
    fn peer(&self) -> &str {
        &self.peer
    }

    async fn fetch_since(
        &self,
        after: Option<Timestamp>,
        device: DeviceId,
    ) -> Result<Vec<Event>, RelayError> {
        let url = self.routes.since(after.as_ref(), device);
        tracing::debug!(%url, "GET sync/since");

        let response = self.authorize(self.client.get(url)).send().await?;
        let body: PullResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| RelayError::Parse(e.to_string()))?;
        Ok(body.events)
    }

    async fn push(&self, device: DeviceId, events: &[Event]) -> Result<PushAck, RelayError> {
        let url = self.routes.push();
        tracing::debug!(%url, count = events.len(), "POST sync/push");

        let body = PushRequest::new(device, events.to_vec());
        let response = self
            .authorize(self.client.post(url).json(&body))
            .send()
            .await?;
        let bytes = Self::check(response).await?.bytes().await?;
        Ok(parse_ack(&bytes))
    }
}

/// Any 2xx is an acknowledgment; the body is informational.
fn parse_ack(body: &[u8]) -> PushAck {
    if body.iter().all(u8::is_ascii_whitespace) {
        return PushAck::default();
    }
    serde_json::from_slice(body).unwrap_or_else(|e| {
        tracing::debug!(error = %e, len = body.len(), "ignoring unreadable push ack body");
        PushAck::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default() {
        let config = RelayClientConfig::default();
        assert_eq!(config.base_url, "http://localhost:8787");
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert!(config.bearer_token.is_none());
        assert!(config.ca_cert_path.is_none());
    }

    #[test]
    fn push_ack_body_is_optional() {
        assert_eq!(
            parse_ack(br#"{"stored": 2, "duplicates": 1}"#),
            PushAck {
                stored: Some(2),
                duplicates: Some(1)
            }
        );
        assert_eq!(parse_ack(b""), PushAck::default());
        assert_eq!(parse_ack(b"<html>ok</html>"), PushAck::default());
        assert_eq!(parse_ack(br#"{"stored": "many"}"#), PushAck::default());
    }

    #[test]
    fn client_creation() {
        let relay = HttpRelay::new(RelayClientConfig::for_url("http://relay.local/v1")).unwrap();
        assert_eq!(relay.peer(), "http://relay.local/v1/");
    }

    #[test]
    fn invalid_url_fails_init() {
        let result = HttpRelay::new(RelayClientConfig::for_url("relay without scheme"));
        assert!(matches!(result, Err(RelayError::Init(_))));
    }

    #[test]
    fn client_creation_with_invalid_ca_fails() {
        let config = RelayClientConfig {
            base_url: "https://localhost:8443".to_string(),
            ca_cert_path: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..Default::default()
        };

        let err = HttpRelay::new(config).unwrap_err();
        assert!(err.to_string().contains("client init error"));
    }

    #[tokio::test]
    async fn unreachable_relay_is_retryable() {
        let relay = HttpRelay::new(RelayClientConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            timeout: Duration::from_millis(500),
            ..Default::default()
        })
        .unwrap();

        let err = relay
            .fetch_since(None, DeviceId::from_bytes([1; 8]))
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "{err}");
    }
}
