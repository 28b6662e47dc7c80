//! Connection and reconnection configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::DEFAULT_MAX_FRAME_SIZE;

/// Default transport handshake timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(45);

/// Default idle time before a keepalive PING.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(300);

/// Default wait for a PONG before the channel is considered dead.
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(30);

const fn default_connect_timeout_ms() -> u64 {
    45_000
}

const fn default_ping_interval_ms() -> u64 {
    300_000
}

const fn default_pong_timeout_ms() -> u64 {
    30_000
}

const fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

const fn default_true() -> bool {
    true
}

/// Persistent connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Transport handshake timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Idle time before a keepalive PING, in milliseconds.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// Wait for a PONG, in milliseconds.
    #[serde(default = "default_pong_timeout_ms")]
    pub pong_timeout_ms: u64,
    /// Largest frame accepted in either direction.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Run keepalives after connecting.
    #[serde(default = "default_true")]
    pub keepalives: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            pong_timeout_ms: default_pong_timeout_ms(),
            max_frame_size: default_max_frame_size(),
            keepalives: true,
        }
    }
}

impl ConnectionConfig {
    /// Create default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the handshake timeout.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the ping interval.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the pong timeout.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Enable or disable keepalives.
    #[must_use]
    pub const fn with_keepalives(mut self, enabled: bool) -> Self {
        self.keepalives = enabled;
        self
    }

    /// Handshake timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Ping interval.
    #[must_use]
    pub const fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Pong timeout.
    #[must_use]
    pub const fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }
}

const fn default_base_backoff_ms() -> u64 {
    1_000
}

const fn default_max_backoff_ms() -> u64 {
    60_000
}

/// Backoff policy for reconnect attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Base delay for exponential backoff (milliseconds).
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    /// Maximum backoff delay (milliseconds).
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Randomize delays into `[0.5, 1.0]` of the computed value.
    #[serde(default = "default_true")]
    pub jitter_enabled: bool,
    /// Attempts before giving up. `None` retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter_enabled: true,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Create default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set base backoff delay.
    #[must_use]
    pub const fn with_base_backoff_ms(mut self, ms: u64) -> Self {
        self.base_backoff_ms = ms;
        self
    }

    /// Builder: set max backoff delay.
    #[must_use]
    pub const fn with_max_backoff_ms(mut self, ms: u64) -> Self {
        self.max_backoff_ms = ms;
        self
    }

    /// Builder: enable/disable jitter.
    #[must_use]
    pub const fn with_jitter_enabled(mut self, enabled: bool) -> Self {
        self.jitter_enabled = enabled;
        self
    }

    /// Builder: cap the number of attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Backoff delay for a 0-indexed attempt, before jitter.
    #[must_use]
    pub fn compute_backoff_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.min(30);
        let delay = self.base_backoff_ms.saturating_mul(1u64 << exp);
        delay.min(self.max_backoff_ms)
    }

    /// Backoff delay scaled by `jitter_factor` (clamped to `[0, 1]`, mapped to `[0.5, 1.0]`).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn compute_backoff_with_jitter_ms(&self, attempt: u32, jitter_factor: f64) -> u64 {
        let base = self.compute_backoff_ms(attempt);
        if !self.jitter_enabled {
            return base;
        }
        let factor = jitter_factor.clamp(0.0, 1.0).mul_add(0.5, 0.5);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let jittered = (base as f64 * factor) as u64;
        jittered
    }

    /// Randomized delay for a 0-indexed attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_enabled {
            rand::random::<f64>()
        } else {
            1.0
        };
        Duration::from_millis(self.compute_backoff_with_jitter_ms(attempt, jitter))
    }

    /// Whether another attempt is allowed after `attempts` attempts.
    #[must_use]
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts < max)
    }
}
