//! # opsync core
//!
//! Event model, clocks, and merge semantics for opsync.
//!
//! This crate provides:
//! - Hybrid Logical Clock (HLC) for per-device monotonic timestamps
//! - Device keys: Ed25519 signing and ChaCha20-Poly1305 payload encryption
//! - Signed, encrypted, per-device hash-chained events and their builder
//! - The `EventLog` storage trait with an in-memory implementation
//! - Batch verification with per-event quarantine
//! - Field-level conflict resolution that is independent of delivery order

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod builder;
pub mod crypto;
pub mod device;
mod encoding;
pub mod error;
pub mod event;
pub mod hlc;
pub mod log;
pub mod merge;
pub mod payload;
pub mod verify;

pub use builder::EventBuilder;
pub use crypto::{CipherBlob, KeyMaterial, KeyStore, PublicKey, TrustedDevices};
pub use device::DeviceId;
pub use encoding::{from_base64_array, to_base64};
pub use error::SyncError;
pub use event::{EntityKey, Event, EventHash, Op};
pub use hlc::{Hlc, ManualClock, SystemClock, Timestamp, WallClock};
pub use log::{Appended, ChainLink, EventLog, MemoryLog};
pub use merge::{EntityState, FieldRule, MergePolicies, MergePolicy, MergeStats, Mutation, Resolver};
pub use payload::{ConsciousnessState, DecisionRecord, EntityPayload, SchemaRegistry};
pub use verify::{
    import_and_verify, import_with_links, ImportOutcome, QuarantineReason, Quarantined, Verdict,
    Verifier,
};
