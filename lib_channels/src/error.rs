//! # Channel Errors
//!
//! Lookup and send failures are returned synchronously as [`ChannelError`].
//! Socket failures never reach the caller of a registry operation; they are
//! delivered later through the `on_error` callback as a [`TransportError`].

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::models::ConnectionState;

/// Synchronous failures of registry and connection operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// No connection is registered under the requested id.
    #[error("No connection registered for channel '{0}'")]
    ConnectionNotFound(String),

    /// The connection exists but its transport is not `Open`.
    #[error("Channel '{id}' is not open (state: {state})")]
    SendOnNonOpenSocket { id: String, state: ConnectionState },

    #[error("Channel id must not be empty")]
    InvalidChannelId,

    #[error("Invalid WebSocket URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChannelError {
    pub(crate) fn invalid_url(url: &str, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.to_string(),
            reason: reason.into(),
        }
    }
}

/// A failure reported by the underlying socket (connect refused, read or
/// write error). Always delivered asynchronously through `on_error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
    /// Human-readable description from the socket layer.
    pub message: String,
}

impl TransportError {
    /// Creates a transport error from any displayable message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        Self::new(err.to_string())
    }
}
