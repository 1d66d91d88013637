//! # Wire and Status Models
//!
//! Data-only types shared by the connection machinery and its consumers:
//!
//! - **`envelope`**: the inbound, server-originated shapes (status envelope,
//!   notification wrapper, pong) and the decoder that classifies a text frame.
//! - **`command`**: the outbound `{action, payload}` convention and the
//!   heartbeat ping frame.
//! - **`status`**: connection lifecycle states and the status snapshot used to
//!   render connection health.

/// Inbound envelopes and the frame classifier.
pub mod envelope;
/// Outbound command and heartbeat frames.
pub mod command;
/// Connection lifecycle state and status snapshots.
pub mod status;

pub use envelope::{EnvelopeStatus, InboundEnvelope, InboundKind, InboundMessage, Notification};
pub use command::OutboundCommand;
pub use status::{ConnectionState, ConnectionStatus};
