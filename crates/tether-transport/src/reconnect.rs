//! Reconnection policies.
//!
//! A [`ReconnectStrategy`] is told about every connect result and every
//! disconnect. A caller-initiated disconnect stops the strategy before it is
//! notified, so only network-caused disconnects lead to new attempts.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ReconnectConfig;
use crate::connection::SignalConnection;

/// Decides whether and when to re-open a dropped connection.
pub trait ReconnectStrategy: Send + Sync {
    /// Allow reconnect attempts.
    fn start(&self);

    /// Cancel any scheduled attempt and refuse new ones until restarted.
    fn stop(&self);

    /// Whether attempts are currently allowed.
    fn is_running(&self) -> bool;

    /// Called after every connect attempt settles.
    fn on_connect_result(&self, connection: &SignalConnection, connected: bool);

    /// Called after a channel is torn down.
    fn on_disconnected(&self, connection: &SignalConnection, network: bool);
}

/// Never reconnects.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReconnect;

impl ReconnectStrategy for NoReconnect {
    fn start(&self) {}

    fn stop(&self) {}

    fn is_running(&self) -> bool {
        false
    }

    fn on_connect_result(&self, _connection: &SignalConnection, _connected: bool) {}

    fn on_disconnected(&self, _connection: &SignalConnection, _network: bool) {}
}

/// Reconnects with exponential backoff; the attempt counter resets on success.
pub struct ExponentialBackoffStrategy {
    config: ReconnectConfig,
    running: Arc<AtomicBool>,
    attempts: AtomicU32,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ExponentialBackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExponentialBackoffStrategy")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("attempts", &self.attempts())
            .finish_non_exhaustive()
    }
}

impl ExponentialBackoffStrategy {
    /// Create a stopped strategy.
    #[must_use]
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            attempts: AtomicU32::new(0),
            pending: Mutex::new(None),
        }
    }

    /// Attempts made since the last successful connect.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Backoff configuration.
    #[must_use]
    pub const fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    fn schedule(&self, connection: &SignalConnection) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.config.allows(attempt) {
            warn!(attempts = attempt, "reconnect attempts exhausted, giving up");
            self.running.store(false, Ordering::SeqCst);
            return;
        }

        let delay = self.config.delay_for_attempt(attempt);
        info!(attempt, delay_ms = delay.as_millis(), "scheduling reconnect");
        let weak = connection.downgrade();
        let running = Arc::clone(&self.running);
        let task = connection.runtime().spawn(async move {
            tokio::time::sleep(delay).await;
            if !running.load(Ordering::SeqCst) {
                return;
            }
            let Some(connection) = weak.upgrade() else {
                return;
            };
            if connection.is_connected() || connection.is_connecting() {
                debug!("reconnect not needed, channel already up");
                return;
            }
            if let Err(err) = connection.connect() {
                debug!(error = %err, "reconnect attempt skipped");
            }
        });
        if let Some(previous) = self.pending.lock().replace(task) {
            previous.abort();
        }
    }
}

impl ReconnectStrategy for ExponentialBackoffStrategy {
    fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            debug!("reconnect strategy started");
        }
    }

    fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            debug!("reconnect strategy stopped");
        }
        if let Some(pending) = self.pending.lock().take() {
            pending.abort();
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn on_connect_result(&self, connection: &SignalConnection, connected: bool) {
        if connected {
            self.attempts.store(0, Ordering::SeqCst);
        } else {
            self.schedule(connection);
        }
    }

    fn on_disconnected(&self, connection: &SignalConnection, network: bool) {
        if network {
            self.schedule(connection);
        }
    }
}

impl Drop for ExponentialBackoffStrategy {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.get_mut().take() {
            pending.abort();
        }
    }
}
