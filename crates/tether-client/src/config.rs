//! Client configuration.
//!
//! Recognized options, all camelCase in files:
//! - `url`, `authToken`
//! - `heartbeatIntervalMs`, `maxMissedPongs`
//! - `requestTimeoutMs`, `connectTimeoutMs`
//! - `baseReconnectDelayMs`, `maxReconnectDelayMs`, `maxReconnectAttempts`
//! - `outboundBuffer`

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::backoff::BackoffPolicy;
use crate::error::ClientError;
use crate::heartbeat::HeartbeatConfig;
use crate::transport::ConnectTarget;

const fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

const fn default_request_timeout_ms() -> u64 {
    5_000
}

const fn default_base_reconnect_delay_ms() -> u64 {
    1_000
}

const fn default_max_reconnect_delay_ms() -> u64 {
    30_000
}

const fn default_max_reconnect_attempts() -> u32 {
    10
}

const fn default_connect_timeout_ms() -> u64 {
    10_000
}

const fn default_outbound_buffer() -> usize {
    64
}

/// Configuration of a [`crate::ConnectionController`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Gateway WebSocket URL.
    pub url: String,
    /// Bearer token presented when connecting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Interval between heartbeat pings.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Unanswered pings tolerated before the connection is dropped. Unset disables the check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_missed_pongs: Option<u32>,
    /// Default timeout of a correlated request.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Delay before the first reconnect attempt.
    #[serde(default = "default_base_reconnect_delay_ms")]
    pub base_reconnect_delay_ms: u64,
    /// Upper bound on the reconnect delay.
    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,
    /// Consecutive failed reconnects before giving up.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Upper bound on a single open attempt.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Capacity of the outbound frame queue.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl ClientConfig {
    /// Configuration for `url` with every other option at its default.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: None,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_missed_pongs: None,
            request_timeout_ms: default_request_timeout_ms(),
            base_reconnect_delay_ms: default_base_reconnect_delay_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            connect_timeout_ms: default_connect_timeout_ms(),
            outbound_buffer: default_outbound_buffer(),
        }
    }

    /// Set the auth token.
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ClientError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ClientError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ClientError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ClientError> {
        toml::to_string_pretty(self)
            .map_err(|e| ClientError::Config(format!("failed to serialize: {e}")))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.url.is_empty() {
            return Err(ClientError::Config("url cannot be empty".to_string()));
        }

        let parsed =
            Url::parse(&self.url).map_err(|e| ClientError::Config(format!("invalid url: {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(ClientError::Config(
                "url must start with ws:// or wss://".to_string(),
            ));
        }

        if self.auth_token.as_deref().is_some_and(str::is_empty) {
            return Err(ClientError::Config("authToken cannot be empty".to_string()));
        }

        for (name, value) in [
            ("heartbeatIntervalMs", self.heartbeat_interval_ms),
            ("requestTimeoutMs", self.request_timeout_ms),
            ("baseReconnectDelayMs", self.base_reconnect_delay_ms),
            ("connectTimeoutMs", self.connect_timeout_ms),
        ] {
            if value == 0 {
                return Err(ClientError::Config(format!("{name} must be greater than 0")));
            }
        }

        if self.max_reconnect_delay_ms < self.base_reconnect_delay_ms {
            return Err(ClientError::Config(
                "maxReconnectDelayMs must be at least baseReconnectDelayMs".to_string(),
            ));
        }

        if self.max_missed_pongs == Some(0) {
            return Err(ClientError::Config(
                "maxMissedPongs must be greater than 0 when set".to_string(),
            ));
        }

        if self.outbound_buffer == 0 {
            return Err(ClientError::Config(
                "outboundBuffer must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Reconnect backoff derived from this configuration.
    #[must_use]
    pub const fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.base_reconnect_delay_ms),
            Duration::from_millis(self.max_reconnect_delay_ms),
            self.max_reconnect_attempts,
        )
    }

    /// Heartbeat settings derived from this configuration.
    #[must_use]
    pub const fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(self.heartbeat_interval_ms),
            max_missed_pongs: self.max_missed_pongs,
        }
    }

    /// Default request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Target handed to the connector on every attempt.
    #[must_use]
    pub fn connect_target(&self) -> ConnectTarget {
        ConnectTarget {
            url: self.url.clone(),
            auth_token: self.auth_token.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            buffer: self.outbound_buffer,
        }
    }
}
