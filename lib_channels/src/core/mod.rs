//! # Core Channel Engine
//!
//! This module holds the moving parts of the connection manager. Each logical
//! channel gets its own transport connection; nothing is multiplexed inside a
//! single socket.
//!
//! ## Core Components:
//!
//! - **`registry`**: The keyed collection of connections and the only public
//!   entry point UI collaborators use (`connect`, `disconnect`, `send`,
//!   `receive`, `get`, `has`). At most one connection exists per id.
//!
//! - **`connection`**: One logical channel. A supervisor task owns the current
//!   transport handle and the reconnect timer, drives the lifecycle state
//!   machine and fans inbound messages out to the subscriber list.
//!
//! - **`reconnect`**: Pure policies deciding whether, and after which delay,
//!   an unexpectedly closed connection is re-established.
//!
//! - **`transport`**: The socket seam. A `Connector` hands back a transport
//!   handle immediately and reports `Open`/`Message`/`Error`/`Closed` events
//!   asynchronously, the same contract a browser WebSocket offers.
//!
//! - **`endpoint`**: Derivation and validation of `ws://` / `wss://` URLs.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// A single supervised logical channel.
pub mod connection;
/// Channel URL derivation and validation.
pub mod endpoint;
/// Reconnect decision policies.
pub mod reconnect;
/// The keyed collection of connections.
pub mod registry;
/// Transport trait and the tungstenite-backed implementation.
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

// --- Public API Re-exports ---
pub use connection::{Connection, ConnectionHandlers, ConnectionOptions, SubscriptionId};
pub use reconnect::{ExponentialBackoff, FixedInterval, ReconnectPolicy};
pub use registry::ChannelRegistry;
pub use transport::{Connector, TungsteniteConnector};
