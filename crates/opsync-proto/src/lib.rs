//! # opsync protocol
//!
//! Wire messages for the relay HTTP contract and the portable export bundle.
//!
//! ## Relay routes
//!
//! - `GET  {base}/sync/since?after=<hlc>&device=<id>` returns [`PullResponse`]
//! - `POST {base}/sync/push` with [`PushRequest`] returns [`PushAck`]
//!
//! ## Bundles
//!
//! [`EventBundle`] is the backup format read by recovery, as JSON or CBOR.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod messages;
pub mod routes;

pub use messages::{BundleFormat, EventBundle, MessageError, PullResponse, PushAck, PushRequest};
pub use routes::RelayRoutes;
