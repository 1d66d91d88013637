//! # Configuration Modules
//!
//! Serde-deserializable settings for channel connections, loadable from a
//! JSON file and convertible into `ConnectionOptions`.

/// Reconnect, heartbeat and watchdog settings for channel connections.
pub mod channel_config;

pub use channel_config::{BackoffKind, ChannelConfig, ConfigError};
