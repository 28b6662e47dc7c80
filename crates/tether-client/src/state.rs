//! Transport-level connection state.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where the provider's connection stands.
///
/// [`Authenticated`](Self::Authenticated) means the server acknowledged the
/// connect frame and assigned a client id. It says nothing about whether the
/// session subscription is confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Socket connect in flight.
    Connecting,
    /// Socket open, connect frame sent, waiting for the acknowledgement.
    Connected,
    /// Server acknowledged the connect frame.
    Authenticated,
    /// Teardown requested.
    Disconnecting,
    /// No socket.
    #[default]
    Disconnected,
}

impl ConnectionState {
    /// Socket is open (acknowledged or not).
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Authenticated)
    }

    /// A connect is in flight or done.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Authenticated)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Authenticated => "AUTHENTICATED",
            Self::Disconnecting => "DISCONNECTING",
            Self::Disconnected => "DISCONNECTED",
        };
        f.write_str(name)
    }
}
