//! Error types for the tether-proto crate.

use thiserror::Error;

/// Errors that can occur while encoding or decoding envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    /// Failed to encode a message.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Failed to decode a message.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// Missing required field.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// The payload is not a JSON object, so no fields can be attached to it.
    #[error("payload must be a JSON object, got {0}")]
    PayloadNotObject(&'static str),
}
