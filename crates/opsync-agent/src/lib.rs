//! # opsync agent
//!
//! The device-side sync engine: a `SQLite` event log, the relay sync client,
//! recovery, and the background loops the daemon runs.
//!
//! ## Architecture
//!
//! - **Writes**: [`SyncEngine::create_sync_event`] builds a signed, encrypted,
//!   chained event, appends it, and folds it into entity state
//! - **Sync**: [`SyncEngine::sync_with`] pulls and verifies remote events,
//!   then pushes unacknowledged local ones, under a deadline
//! - **Recovery**: [`recovery`] rebuilds the log and state from a relay or a
//!   backup bundle
//! - **Background**: [`scheduler`] drives sync cycles and TTL pruning from a
//!   [`scheduler::Ticker`]

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod engine;
pub mod keys;
pub mod notify;
pub mod persistence;
pub mod recovery;
pub mod scheduler;
pub mod sync;

pub use config::AgentConfig;
pub use engine::{EngineOptions, ImportReport, SyncEngine, SyncStatus};
pub use notify::SyncNotification;
pub use persistence::SqliteStore;
pub use recovery::{recover_from_bundle, recover_from_relay, RecoveryReport};
pub use sync::{RetryPolicy, SyncOutcome, SyncReport};
