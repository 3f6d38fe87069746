//! Agent configuration.

use anyhow::{Context, Result};
use opsync_core::merge::DEFAULT_HISTORY_LIMIT;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Directory holding the database and key file by default
    pub data_dir: PathBuf,

    /// `SQLite` database path
    pub db_path: PathBuf,

    /// Device key material file
    pub key_path: PathBuf,

    /// Relay configuration
    pub relay: RelayConfig,

    /// Sync cycle configuration
    pub sync: SyncConfig,

    /// Entries kept by append-only history fields
    pub history_limit: usize,

    /// Ephemeral entity types and their time to live
    pub ephemeral_types: HashMap<String, Duration>,

    /// Interval between TTL pruning runs
    pub prune_interval: Duration,
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Relay base URL; sync is idle without one
    pub url: Option<String>,

    /// Bearer token for authentication
    pub bearer_token: Option<String>,

    /// Custom CA certificate for the relay (PEM)
    pub ca_cert_path: Option<PathBuf>,

    /// Per-request timeout
    pub timeout: Duration,
}

/// Sync cycle configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Whether periodic sync runs
    pub enabled: bool,

    /// Interval between sync cycles
    pub interval: Duration,

    /// Deadline for a whole cycle
    pub deadline: Duration,

    /// Attempts per relay request, first one included
    pub retry_attempts: u32,

    /// Backoff before the first retry; doubles per attempt
    pub retry_base: Duration,

    /// Events per push request
    pub push_batch: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::with_data_dir(PathBuf::from("./opsync-data"))
    }
}

impl AgentConfig {
    /// Default configuration rooted at a data directory.
    #[must_use]
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            db_path: data_dir.join("opsync.db"),
            key_path: data_dir.join("device-key.json"),
            data_dir,
            relay: RelayConfig {
                url: None,
                bearer_token: None,
                ca_cert_path: None,
                timeout: Duration::from_secs(30),
            },
            sync: SyncConfig {
                enabled: true,
                interval: Duration::from_secs(60),
                deadline: Duration::from_secs(30),
                retry_attempts: 3,
                retry_base: Duration::from_millis(500),
                push_batch: 500,
            },
            history_limit: DEFAULT_HISTORY_LIMIT,
            ephemeral_types: HashMap::new(),
            prune_interval: Duration::from_secs(3600),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `OPSYNC_DATA_DIR`: data directory (default `./opsync-data`)
    /// - `OPSYNC_DB_PATH`: `SQLite` database path
    /// - `OPSYNC_KEY_PATH`: key material path
    /// - `OPSYNC_RELAY_URL`: relay base URL
    /// - `OPSYNC_BEARER_TOKEN`: relay bearer token
    /// - `OPSYNC_CA_CERT`: relay CA certificate (PEM)
    /// - `OPSYNC_RELAY_TIMEOUT_SECS`: per-request timeout
    /// - `OPSYNC_SYNC_ENABLED`: `true`/`false`
    /// - `OPSYNC_SYNC_INTERVAL_SECS`, `OPSYNC_SYNC_DEADLINE_SECS`
    /// - `OPSYNC_RETRY_ATTEMPTS`, `OPSYNC_RETRY_BASE_MS`
    /// - `OPSYNC_HISTORY_LIMIT`: entries kept in history fields
    /// - `OPSYNC_EPHEMERAL_TYPES`: JSON object `{"entity_type": ttl_secs}`
    /// - `OPSYNC_PRUNE_INTERVAL_SECS`
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set but malformed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set but malformed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match lookup("OPSYNC_DATA_DIR") {
            Some(dir) => Self::with_data_dir(PathBuf::from(dir)),
            None => Self::default(),
        };

        if let Some(path) = lookup("OPSYNC_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }

        if let Some(path) = lookup("OPSYNC_KEY_PATH") {
            config.key_path = PathBuf::from(path);
        }

        if let Some(url) = lookup("OPSYNC_RELAY_URL") {
            config.relay.url = Some(url);
        }

        if let Some(token) = lookup("OPSYNC_BEARER_TOKEN") {
            config.relay.bearer_token = Some(token);
        }

        if let Some(path) = lookup("OPSYNC_CA_CERT") {
            config.relay.ca_cert_path = Some(PathBuf::from(path));
        }

        if let Some(secs) = lookup("OPSYNC_RELAY_TIMEOUT_SECS") {
            config.relay.timeout = secs_var("OPSYNC_RELAY_TIMEOUT_SECS", &secs)?;
        }

        if let Some(enabled) = lookup("OPSYNC_SYNC_ENABLED") {
            config.sync.enabled = enabled
                .parse()
                .context("Invalid OPSYNC_SYNC_ENABLED (expected true or false)")?;
        }

        if let Some(secs) = lookup("OPSYNC_SYNC_INTERVAL_SECS") {
            config.sync.interval = secs_var("OPSYNC_SYNC_INTERVAL_SECS", &secs)?;
        }

        if let Some(secs) = lookup("OPSYNC_SYNC_DEADLINE_SECS") {
            config.sync.deadline = secs_var("OPSYNC_SYNC_DEADLINE_SECS", &secs)?;
        }

        if let Some(attempts) = lookup("OPSYNC_RETRY_ATTEMPTS") {
            config.sync.retry_attempts = attempts
                .parse()
                .context("Invalid OPSYNC_RETRY_ATTEMPTS")?;
        }

        if let Some(ms) = lookup("OPSYNC_RETRY_BASE_MS") {
            config.sync.retry_base =
                Duration::from_millis(ms.parse().context("Invalid OPSYNC_RETRY_BASE_MS")?);
        }

        if let Some(limit) = lookup("OPSYNC_HISTORY_LIMIT") {
            config.history_limit = limit.parse().context("Invalid OPSYNC_HISTORY_LIMIT")?;
        }

        // Parse ephemeral types from JSON env var
        if let Some(json) = lookup("OPSYNC_EPHEMERAL_TYPES") {
            let ttls: HashMap<String, u64> =
                serde_json::from_str(&json).context("Invalid OPSYNC_EPHEMERAL_TYPES JSON")?;
            config.ephemeral_types = ttls
                .into_iter()
                .map(|(entity_type, secs)| (entity_type, Duration::from_secs(secs)))
                .collect();
        }

        if let Some(secs) = lookup("OPSYNC_PRUNE_INTERVAL_SECS") {
            config.prune_interval = secs_var("OPSYNC_PRUNE_INTERVAL_SECS", &secs)?;
        }

        Ok(config)
    }
}

fn secs_var(name: &str, value: &str) -> Result<Duration> {
    let secs: u64 = value
        .parse()
        .with_context(|| format!("Invalid {name} (expected whole seconds)"))?;
    Ok(Duration::from_secs(secs))
}
