//! Tracing subscriber setup.

use serde::{Deserialize, Serialize};
use tether_core::{TetherError, TetherResult};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset (for example `"info"`
    /// or `"tether_client=debug,info"`).
    pub level: String,
    /// Emit one JSON object per event instead of human-readable lines.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

impl LoggingConfig {
    /// Builder: set the fallback filter directive.
    #[must_use]
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Builder: switch JSON output on or off.
    #[must_use]
    pub const fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Filter from `RUST_LOG`, falling back to [`level`](Self::level).
    ///
    /// # Errors
    /// Returns [`TetherError::Config`] for an unparsable fallback directive.
    pub fn env_filter(&self) -> TetherResult<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.level)
            .map_err(|e| TetherError::Config(format!("invalid log level {:?}: {e}", self.level)))
    }
}

/// Install the global tracing subscriber.
///
/// # Errors
/// Returns [`TetherError::Config`] for a bad filter or when a global
/// subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> TetherResult<()> {
    let filter = config.env_filter()?;
    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        registry
            .with(fmt::layer().json().with_current_span(false).flatten_event(true))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    installed.map_err(|e| TetherError::Config(format!("failed to install tracing subscriber: {e}")))
}
