//! Relay URL scheme.
//!
//! Routes are resolved against the relay base URL, which may carry a path
//! prefix (`https://relay.example/api/` serves `.../api/sync/since`).

use opsync_core::{DeviceId, Timestamp};
use url::Url;

/// Path of the pull endpoint.
pub const SINCE_PATH: &str = "sync/since";
/// Path of the push endpoint.
pub const PUSH_PATH: &str = "sync/push";

/// URL builder for one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRoutes {
    base: Url,
}

impl RelayRoutes {
    /// Create routes for a relay base URL.
    ///
    /// # Errors
    ///
    /// Returns error if the URL is invalid or cannot be a base.
    pub fn new(base: &str) -> Result<Self, url::ParseError> {
        let mut base = Url::parse(base)?;
        if base.cannot_be_a_base() {
            return Err(url::ParseError::RelativeUrlWithCannotBeABaseBase);
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        base.set_query(None);
        base.set_fragment(None);
        Ok(Self { base })
    }

    /// Normalized base URL, also used as the watermark key for this relay.
    #[must_use]
    pub fn base(&self) -> &Url {
        &self.base
    }

    /// `GET` URL for events after a watermark, on behalf of `device`.
    ///
    /// `after` is omitted for a full pull.
    #[must_use]
    pub fn since(&self, after: Option<&Timestamp>, device: DeviceId) -> Url {
        let mut url = self.endpoint(SINCE_PATH);
        {
            let mut query = url.query_pairs_mut();
            if let Some(after) = after {
                query.append_pair("after", &after.to_string());
            }
            query.append_pair("device", &device.to_string());
        }
        url
    }

    /// `POST` URL for pushes.
    #[must_use]
    pub fn push(&self) -> Url {
        self.endpoint(PUSH_PATH)
    }

    fn endpoint(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        let joined = format!("{}{path}", self.base.path());
        url.set_path(&joined);
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn since_url_carries_watermark_and_device() {
        let routes = RelayRoutes::new("https://relay.example").unwrap();
        let device = DeviceId::from_bytes([0xab; 8]);
        let after = Timestamp::new(1_704_067_200_000, 3, device);

        let url = routes.since(Some(&after), device);
        assert_eq!(url.path(), "/sync/since");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("after".to_string(), after.to_string()),
                ("device".to_string(), device.to_string()),
            ]
        );
        assert_eq!(pairs[0].1.parse::<Timestamp>().unwrap(), after);
    }

    #[test]
    fn full_pull_omits_after() {
        let routes = RelayRoutes::new("http://localhost:8080").unwrap();
        let url = routes.since(None, DeviceId::from_bytes([1; 8]));
        assert!(url.query_pairs().all(|(k, _)| k != "after"));
    }

    #[test]
    fn base_path_prefix_is_kept() {
        let routes = RelayRoutes::new("https://relay.example/api?x=1").unwrap();
        assert_eq!(routes.push().as_str(), "https://relay.example/api/sync/push");
        assert_eq!(routes.base().as_str(), "https://relay.example/api/");
    }

    #[test]
    fn rejects_non_base_urls() {
        assert!(RelayRoutes::new("mailto:ops@example.com").is_err());
        assert!(RelayRoutes::new("not a url").is_err());
    }
}
