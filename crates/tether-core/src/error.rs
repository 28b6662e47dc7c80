//! Error taxonomy shared by every tether layer.

use std::time::Duration;

/// Errors raised by tether components.
///
/// The type is `Clone` so one failure value can complete both sides of a
/// bound future pair.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TetherError {
    /// Connect attempted without an authenticated API session.
    #[error("Not authenticated: {0}")]
    NotAuthenticated(String),

    /// A deadline elapsed before the operation completed.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// The transport went away while an operation was pending.
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// A remote call answered with a non-success response.
    #[error("Remote call {method} failed: {body}")]
    Remote {
        /// Remote method name.
        method: String,
        /// Raw response body (or a description when there was none).
        body: String,
    },

    /// Programming error. Never retried.
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// Channel-level failure (refused, reset, handshake error).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Frame could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Work was refused before it started (executor shut down, runtime gone).
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Operation was cancelled.
    #[error("Cancelled")]
    Cancelled,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(String),
}

impl TetherError {
    /// Whether retrying the same operation later could plausibly succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Disconnected(_) | Self::Transport(_) | Self::Io(_)
        )
    }

    /// Whether this error reports misuse of an API rather than a runtime condition.
    #[must_use]
    pub const fn is_contract_violation(&self) -> bool {
        matches!(self, Self::ContractViolation(_))
    }

    /// Whether this is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<std::io::Error> for TetherError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result type for tether operations.
pub type TetherResult<T> = Result<T, TetherError>;
