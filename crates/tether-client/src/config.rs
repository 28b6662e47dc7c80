//! Client configuration, loaded from TOML.
//!
//! ```toml
//! endpoint = "wss://push.example.com/signals"
//! signals_connect_timeout_ms = 30000
//!
//! [api]
//! base_url = "https://api.example.com/"
//! session_key = "..."
//!
//! [settings]
//! path = "/var/lib/tether/settings.json"
//!
//! [connection]
//! ping_interval_ms = 300000
//!
//! [reconnect]
//! base_backoff_ms = 1000
//!
//! [logging]
//! level = "info"
//! json = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_core::{ExecutorConfig, TetherError, TetherResult};
use tether_transport::{ConnectionConfig, ReconnectConfig};

use crate::client::DEFAULT_SIGNALS_CONNECT_TIMEOUT;
use crate::logging::LoggingConfig;

/// Remote API settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL remote calls resolve against.
    pub base_url: String,
    /// API session key, if already established.
    pub session_key: Option<String>,
    /// Per-request timeout in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            session_key: None,
            request_timeout_ms: 30_000,
        }
    }
}

/// Where the session identity is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    /// JSON settings file; in-memory when unset.
    pub path: Option<PathBuf>,
}

/// Executor settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    /// Deadline for work enqueued without one, in milliseconds.
    pub default_timeout_ms: Option<u64>,
}

/// Top-level client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Push channel endpoint (`ws://`, `wss://`, or `tcp://host:port`).
    pub endpoint: String,
    /// Deadline for the connect task and each subscribe round-trip, in milliseconds.
    pub signals_connect_timeout_ms: u64,
    /// Remote API.
    pub api: ApiConfig,
    /// Settings store.
    pub settings: SettingsConfig,
    /// Executor.
    pub executor: ExecutorSection,
    /// Transport connection.
    pub connection: ConnectionConfig,
    /// Reconnection policy.
    pub reconnect: ReconnectConfig,
    /// Logging.
    pub logging: LoggingConfig,
}

impl Default for ClientConfig {
    #[allow(clippy::cast_possible_truncation)]
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            signals_connect_timeout_ms: DEFAULT_SIGNALS_CONNECT_TIMEOUT.as_millis() as u64,
            api: ApiConfig::default(),
            settings: SettingsConfig::default(),
            executor: ExecutorSection::default(),
            connection: ConnectionConfig::default(),
            reconnect: ReconnectConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Parse and validate TOML.
    ///
    /// # Errors
    /// Returns [`TetherError::Config`] for malformed or invalid configuration.
    pub fn from_toml_str(raw: &str) -> TetherResult<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| TetherError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate the TOML file at `path`.
    ///
    /// # Errors
    /// Returns [`TetherError::Io`] if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> TetherResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| TetherError::Io(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    /// Returns [`TetherError::Config`] naming the first offending field.
    pub fn validate(&self) -> TetherResult<()> {
        if self.endpoint.trim().is_empty() {
            return Err(TetherError::Config("endpoint must be set".into()));
        }
        if self.connection.ping_interval_ms == 0 {
            return Err(TetherError::Config(
                "connection.ping_interval_ms must be positive".into(),
            ));
        }
        if self.connection.pong_timeout_ms == 0 {
            return Err(TetherError::Config(
                "connection.pong_timeout_ms must be positive".into(),
            ));
        }
        if self.signals_connect_timeout_ms == 0 {
            return Err(TetherError::Config(
                "signals_connect_timeout_ms must be positive".into(),
            ));
        }
        if self.reconnect.base_backoff_ms > self.reconnect.max_backoff_ms {
            return Err(TetherError::Config(
                "reconnect.base_backoff_ms exceeds reconnect.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }

    /// Connect/subscribe deadline.
    #[must_use]
    pub const fn signals_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.signals_connect_timeout_ms)
    }

    /// Remote API request timeout.
    #[must_use]
    pub const fn api_request_timeout(&self) -> Duration {
        Duration::from_millis(self.api.request_timeout_ms)
    }

    /// Executor configuration.
    #[must_use]
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig::new()
            .with_default_timeout(self.executor.default_timeout_ms.map(Duration::from_millis))
    }
}
