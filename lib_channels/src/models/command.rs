//! # Outbound Frames
//!
//! Outbound payloads are not constrained by the transport: `send_json`
//! accepts any `Serialize` value. [`OutboundCommand`] is the typed form of
//! the `{"action": .., "payload": ..}` convention most callers follow.

use serde::{Deserialize, Serialize};

/// Conventional client → server command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundCommand<P> {
    pub action: String,
    pub payload: P,
}

impl<P> OutboundCommand<P> {
    pub fn new(action: impl Into<String>, payload: P) -> Self {
        Self {
            action: action.into(),
            payload,
        }
    }
}

/// Application-level keepalive. The server answers with
/// `{"type":"pong","data":{"timestamp":..,"received":..}}`.
#[derive(Debug, Serialize)]
pub(crate) struct HeartbeatPing {
    #[serde(rename = "type")]
    kind: &'static str,
    content: i64,
}

impl HeartbeatPing {
    pub(crate) fn at(unix_seconds: i64) -> Self {
        Self {
            kind: "ping",
            content: unix_seconds,
        }
    }
}
