//! # tether-proto
//!
//! Wire envelope shared by the Tether client and the gateways it talks to.
//!
//! Every frame is a JSON object of the shape
//! `{ "type": string, "payload": { ..., "requestId"?: string }, "timestamp": RFC 3339 }`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod envelope;
pub mod error;

pub use envelope::{Envelope, PING, PONG, REQUEST_ID_FIELD};
pub use error::ProtoError;
