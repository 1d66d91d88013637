//! # lib_channels
//!
//! Real-time connection manager for logical push channels. Every logical
//! channel (an application-chosen id such as `"billing_client"`) owns one
//! dedicated WebSocket connection. Connections are supervised by their own
//! task, reconnect on unexpected closure under a bounded policy, and are
//! addressed only by id through a [`ChannelRegistry`].
//!
//! ```no_run
//! use lib_channels::{ChannelRegistry, ConnectionHandlers, ConnectionOptions};
//!
//! # async fn demo() -> Result<(), lib_channels::ChannelError> {
//! let registry = ChannelRegistry::new();
//! registry.connect(
//!     "billing_client",
//!     "ws://localhost:8080/ws/billing",
//!     ConnectionHandlers::new().on_message(|msg| println!("{}", msg.text())),
//!     ConnectionOptions::default(),
//! )?;
//! registry.send_json("billing_client", &serde_json::json!({"action": "refresh"}))?;
//! registry.disconnect("billing_client")?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod configs;
pub mod core;
pub mod error;
pub mod models;

// --- Public API Re-exports ---
pub use crate::configs::{BackoffKind, ChannelConfig, ConfigError};
pub use crate::core::connection::{Connection, ConnectionHandlers, ConnectionOptions, SubscriptionId};
pub use crate::core::endpoint::{channel_url, parse_channel_url, CHANNEL_BASE_PATH};
pub use crate::core::reconnect::{ExponentialBackoff, FixedInterval, ReconnectPolicy};
pub use crate::core::registry::ChannelRegistry;
pub use crate::core::transport::{CloseInfo, Connector, Frame, TransportEvent, TransportHandle, TungsteniteConnector};
pub use crate::error::{ChannelError, TransportError};
pub use crate::models::{
    ConnectionState, ConnectionStatus, EnvelopeStatus, InboundEnvelope, InboundKind, InboundMessage,
    Notification, OutboundCommand,
};
