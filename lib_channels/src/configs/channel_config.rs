use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::connection::ConnectionOptions;
use crate::core::reconnect::{ExponentialBackoff, DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_INTERVAL};

const DEFAULT_MAX_RECONNECT_DELAY_MS: u64 = 60_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error occurred: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid JSON configuration: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// How the delay between reconnect attempts evolves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

/// Connection settings as they appear in a JSON config file.
///
/// ```json
/// { "reconnectIntervalMs": 2000, "maxReconnectAttempts": 10, "backoff": "exponential" }
/// ```
///
/// Missing keys take the defaults of the fixed-interval policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelConfig {
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub backoff: BackoffKind,
    /// Cap for a single delay; only used by `exponential`.
    pub max_reconnect_delay_ms: u64,
    /// Full jitter; only used by `exponential`.
    pub jitter: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inactivity_timeout_ms: Option<u64>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL.as_millis() as u64,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            backoff: BackoffKind::Fixed,
            max_reconnect_delay_ms: DEFAULT_MAX_RECONNECT_DELAY_MS,
            jitter: false,
            heartbeat_interval_ms: None,
            inactivity_timeout_ms: None,
        }
    }
}

impl ChannelConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconnect_interval_ms == 0 {
            return Err(invalid("reconnectIntervalMs", "must be greater than zero"));
        }
        if self.backoff == BackoffKind::Exponential && self.max_reconnect_delay_ms < self.reconnect_interval_ms {
            return Err(invalid(
                "maxReconnectDelayMs",
                format!("must not be below reconnectIntervalMs ({})", self.reconnect_interval_ms),
            ));
        }
        if self.heartbeat_interval_ms == Some(0) {
            return Err(invalid("heartbeatIntervalMs", "must be greater than zero"));
        }
        if self.inactivity_timeout_ms == Some(0) {
            return Err(invalid("inactivityTimeoutMs", "must be greater than zero"));
        }
        Ok(())
    }

    /// Validates and converts into the options `connect` accepts.
    pub fn into_options(self) -> Result<ConnectionOptions, ConfigError> {
        self.validate()?;

        let interval = Duration::from_millis(self.reconnect_interval_ms);
        let mut options = ConnectionOptions::fixed(interval, self.max_reconnect_attempts);

        if self.backoff == BackoffKind::Exponential {
            let mut policy = ExponentialBackoff::new(
                interval,
                Duration::from_millis(self.max_reconnect_delay_ms),
                self.max_reconnect_attempts,
            );
            if self.jitter {
                policy = policy.with_jitter();
            }
            options = options.with_policy(policy);
        }
        if let Some(ms) = self.heartbeat_interval_ms {
            options = options.with_heartbeat(Duration::from_millis(ms));
        }
        if let Some(ms) = self.inactivity_timeout_ms {
            options = options.with_inactivity_timeout(Duration::from_millis(ms));
        }
        Ok(options)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}
