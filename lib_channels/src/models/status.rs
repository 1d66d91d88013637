use serde::Serialize;
use std::fmt;

/// Lifecycle of a single logical channel.
///
/// `Connecting → Open` repeats on every physical (re)connection. An unexpected
/// close moves the connection to `ReconnectScheduled` while the policy still
/// allows retries, otherwise to `Exhausted`. `Closed` is only reached through
/// an explicit disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    /// A transport handle exists and is waiting for its open event.
    Connecting,
    /// The transport is open; sends are accepted.
    Open,
    /// An explicit disconnect is tearing the transport down.
    Closing,
    /// Explicitly disconnected. Terminal.
    Closed,
    /// The transport closed unexpectedly and a reconnect timer is armed.
    ReconnectScheduled,
    /// The reconnect policy gave up. Terminal until a manual reconnect.
    Exhausted,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "Connecting",
            Self::Open => "Open",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
            Self::ReconnectScheduled => "ReconnectScheduled",
            Self::Exhausted => "Exhausted",
        }
    }

    /// `true` for states the supervisor never leaves on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Exhausted)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one connection, for status indicators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub id: String,
    pub url: String,
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
}
