//! Error types for tether-client.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the gateway client.
///
/// `Clone` so the same error can be delivered to every `Error` subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The transport failed to open or closed unexpectedly.
    #[error("transport error: {0}")]
    Transport(String),

    /// No matching reply arrived in time.
    #[error("request {request_id} timed out after {}ms", timeout.as_millis())]
    RequestTimeout {
        /// Correlation id of the request.
        request_id: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// The connection was closed while the request was pending.
    #[error("connection closed")]
    ConnectionClosed,

    /// An operation needed an open connection.
    #[error("not connected")]
    NotConnected,

    /// A request with this correlation id is already pending.
    #[error("duplicate request id: {0}")]
    DuplicateRequestId(String),

    /// Malformed frame or payload.
    #[error("protocol error: {0}")]
    Protocol(#[from] tether_proto::ProtoError),

    /// Reconnection gave up.
    #[error("gave up reconnecting after {attempts} attempts")]
    MaxAttemptsExceeded {
        /// Number of attempts made.
        attempts: u32,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Whether the caller may reasonably retry the same operation.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::RequestTimeout { .. } | Self::NotConnected
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_proto::ProtoError;

    #[test]
    fn test_transport_error_display() {
        let err = ClientError::Transport("connection refused".to_string());
        assert_eq!(err.to_string(), "transport error: connection refused");
    }

    #[test]
    fn test_request_timeout_display() {
        let err = ClientError::RequestTimeout {
            request_id: "ab12cd".to_string(),
            timeout: Duration::from_millis(5000),
        };
        assert_eq!(err.to_string(), "request ab12cd timed out after 5000ms");
    }

    #[test]
    fn test_max_attempts_display() {
        let err = ClientError::MaxAttemptsExceeded { attempts: 10 };
        assert_eq!(err.to_string(), "gave up reconnecting after 10 attempts");
    }

    #[test]
    fn test_protocol_error_conversion() {
        let err: ClientError = ProtoError::Decoding("eof".to_string()).into();
        assert!(matches!(err, ClientError::Protocol(_)));
        assert!(err.to_string().contains("decoding error"));
    }

    #[test]
    fn test_retryable() {
        assert!(ClientError::NotConnected.is_retryable());
        assert!(ClientError::Transport("x".into()).is_retryable());
        assert!(!ClientError::ConnectionClosed.is_retryable());
        assert!(!ClientError::MaxAttemptsExceeded { attempts: 3 }.is_retryable());
        assert!(!ClientError::Config("x".into()).is_retryable());
    }
}
