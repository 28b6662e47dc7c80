//! Keyed deadline timers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::{EventBus, TetherError, TetherResult};

/// Opaque id of one enqueued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Raises an expiry event for a key at or after its deadline.
pub trait Scheduler: Send + Sync {
    /// Arm (or re-arm) the timer for `id`.
    fn schedule(&self, id: RequestId, deadline: Instant);

    /// Disarm the timer for `id`. Returns whether a timer was armed.
    fn cancel(&self, id: RequestId) -> bool;

    /// Bus on which expired ids are published.
    fn expirations(&self) -> &EventBus<RequestId>;

    /// Disarm everything and refuse further scheduling.
    fn shutdown(&self);
}

/// [`Scheduler`] backed by one tokio sleep per armed key.
pub struct TimerScheduler {
    shared: Arc<TimerShared>,
}

struct TimerShared {
    runtime: Handle,
    timers: Mutex<HashMap<RequestId, JoinHandle<()>>>,
    expirations: EventBus<RequestId>,
    shut_down: AtomicBool,
}

impl TimerScheduler {
    /// Create a scheduler on the current tokio runtime.
    ///
    /// # Errors
    /// Returns [`TetherError::Rejected`] when called outside a runtime.
    pub fn new() -> TetherResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| TetherError::Rejected(format!("no tokio runtime: {e}")))?;
        Ok(Self::with_handle(runtime))
    }

    /// Create a scheduler that spawns its timers on `runtime`.
    #[must_use]
    pub fn with_handle(runtime: Handle) -> Self {
        Self {
            shared: Arc::new(TimerShared {
                runtime,
                timers: Mutex::new(HashMap::new()),
                expirations: EventBus::new(),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Number of armed timers.
    #[must_use]
    pub fn armed(&self) -> usize {
        self.shared.timers.lock().len()
    }
}

impl fmt::Debug for TimerScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerScheduler")
            .field("armed", &self.armed())
            .field("shut_down", &self.shared.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

impl Scheduler for TimerScheduler {
    fn schedule(&self, id: RequestId, deadline: Instant) {
        if self.shared.shut_down.load(Ordering::Acquire) {
            debug!(request_id = %id, "scheduler shut down, ignoring timer");
            return;
        }
        let weak = Arc::downgrade(&self.shared);
        // The map lock is held across spawn so the timer task cannot remove
        // its entry before it is inserted.
        let mut timers = self.shared.timers.lock();
        let handle = self.shared.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            shared.timers.lock().remove(&id);
            if !shared.shut_down.load(Ordering::Acquire) {
                shared.expirations.publish(&id);
            }
        });
        if let Some(previous) = timers.insert(id, handle) {
            previous.abort();
        }
    }

    fn cancel(&self, id: RequestId) -> bool {
        let removed = self.shared.timers.lock().remove(&id);
        removed.is_some_and(|handle| {
            handle.abort();
            true
        })
    }

    fn expirations(&self) -> &EventBus<RequestId> {
        &self.shared.expirations
    }

    fn shutdown(&self) {
        self.shared.shut_down.store(true, Ordering::Release);
        for (_, handle) in self.shared.timers.lock().drain() {
            handle.abort();
        }
    }
}

impl Drop for TimerShared {
    fn drop(&mut self) {
        for (_, handle) in self.timers.get_mut().drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Flow;
    use std::time::Duration;

    fn collect(scheduler: &TimerScheduler) -> Arc<Mutex<Vec<RequestId>>> {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        scheduler.expirations().subscribe(move |id| {
            sink.lock().push(*id);
            Flow::Continue
        });
        fired
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_deadline() {
        let scheduler = TimerScheduler::new().unwrap();
        let fired = collect(&scheduler);
        let id = RequestId::new();
        scheduler.schedule(id, Instant::now() + Duration::from_secs(5));
        assert_eq!(scheduler.armed(), 1);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(fired.lock().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*fired.lock(), vec![id]);
        assert_eq!(scheduler.armed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_suppresses_expiry() {
        let scheduler = TimerScheduler::new().unwrap();
        let fired = collect(&scheduler);
        let id = RequestId::new();
        scheduler.schedule(id, Instant::now() + Duration::from_secs(1));
        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(fired.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_replaces_deadline() {
        let scheduler = TimerScheduler::new().unwrap();
        let fired = collect(&scheduler);
        let id = RequestId::new();
        scheduler.schedule(id, Instant::now() + Duration::from_secs(1));
        scheduler.schedule(id, Instant::now() + Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(fired.lock().is_empty());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_disarms_and_refuses() {
        let scheduler = TimerScheduler::new().unwrap();
        let fired = collect(&scheduler);
        scheduler.schedule(RequestId::new(), Instant::now() + Duration::from_secs(1));
        scheduler.shutdown();
        scheduler.schedule(RequestId::new(), Instant::now() + Duration::from_secs(1));
        assert_eq!(scheduler.armed(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(fired.lock().is_empty());
    }

    #[test]
    fn new_outside_runtime_is_rejected() {
        assert!(matches!(
            TimerScheduler::new(),
            Err(TetherError::Rejected(_))
        ));
    }
}
