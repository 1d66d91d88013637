//! # Inbound Envelopes
//!
//! The server pushes three kinds of JSON text frames over a channel:
//!
//! 1. status envelopes, `{"action"?, "step"?, "status"?, "message"}`, used by
//!    step-by-step status reporting flows;
//! 2. notification wrappers, `{"type":"notification","data":..,"timestamp":..}`;
//! 3. `{"type":"pong", ..}` replies to heartbeat pings.
//!
//! Anything else is passed through as generic JSON or, failing that, plain
//! text. Classification never fails; a handler always receives the raw text.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ChannelError;

/// Outcome reported by a status envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeStatus {
    Success,
    Failure,
    Warning,
    Processing,
    Info,
}

/// Structured status message sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EnvelopeStatus>,
    pub message: String,
}

/// Content pushed by a server-side broadcast (user, org or room target).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default)]
    pub data: Value,
    /// Unix seconds at which the server wrapped the content.
    #[serde(default)]
    pub timestamp: i64,
}

/// Classification of one inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundKind {
    Envelope(InboundEnvelope),
    Notification(Notification),
    /// Reply to a heartbeat ping; carries the `data` member.
    Pong(Value),
    /// Valid JSON that matches none of the known shapes.
    Json(Value),
    /// Not JSON at all.
    Text,
}

/// A decoded inbound frame, handed to every subscriber of a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    text: String,
    kind: InboundKind,
}

impl InboundMessage {
    /// Classifies a text frame.
    pub fn decode(text: impl Into<String>) -> Self {
        let text = text.into();
        let kind = match serde_json::from_str::<Value>(&text) {
            Ok(value) => classify(value),
            Err(_) => InboundKind::Text,
        };
        Self { text, kind }
    }

    /// The frame exactly as received.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn kind(&self) -> &InboundKind {
        &self.kind
    }

    pub fn envelope(&self) -> Option<&InboundEnvelope> {
        match &self.kind {
            InboundKind::Envelope(envelope) => Some(envelope),
            _ => None,
        }
    }

    pub fn notification(&self) -> Option<&Notification> {
        match &self.kind {
            InboundKind::Notification(notification) => Some(notification),
            _ => None,
        }
    }

    pub fn is_pong(&self) -> bool {
        matches!(self.kind, InboundKind::Pong(_))
    }

    /// Deserializes the raw frame into a caller-chosen type.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ChannelError> {
        Ok(serde_json::from_str(&self.text)?)
    }
}

fn classify(value: Value) -> InboundKind {
    match value.get("type").and_then(Value::as_str) {
        Some("notification") => {
            if let Ok(notification) = serde_json::from_value::<Notification>(value.clone()) {
                return InboundKind::Notification(notification);
            }
        }
        Some("pong") => {
            return InboundKind::Pong(value.get("data").cloned().unwrap_or(Value::Null));
        }
        _ => {}
    }

    if value.get("message").is_some_and(Value::is_string) {
        if let Ok(envelope) = serde_json::from_value::<InboundEnvelope>(value.clone()) {
            return InboundKind::Envelope(envelope);
        }
    }

    InboundKind::Json(value)
}
