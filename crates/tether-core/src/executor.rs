//! Deadline-aware task execution.
//!
//! [`TaskExecutor::enqueue`] runs a unit of async work on the runtime (never on
//! the caller's task) and returns a parent [`ObservableFuture`]. The work
//! produces its own inner future; parent and inner are then kept in sync in
//! both directions. When a deadline is set, the [`Scheduler`] races the work:
//! on expiry the inner future is failed with [`TetherError::Timeout`] if it
//! exists yet, otherwise the parent is.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    Flow, ObservableFuture, RequestId, Scheduler, SubscriptionId, TetherError, TetherResult,
    TimerScheduler, sync_state,
};

/// Executor configuration.
#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    /// Deadline applied when `enqueue` is called without one.
    pub default_timeout: Option<Duration>,
}

impl ExecutorConfig {
    /// Create configuration with no default timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default timeout.
    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }
}

type FailFn = Box<dyn Fn(TetherError) + Send>;

struct ScheduledRequest {
    deadline: Instant,
    timeout: Duration,
    fail_parent: FailFn,
    fail_inner: Option<FailFn>,
}

struct ExecutorShared {
    config: ExecutorConfig,
    runtime: Handle,
    scheduler: Arc<dyn Scheduler>,
    owns_scheduler: bool,
    pending: Mutex<HashMap<RequestId, ScheduledRequest>>,
    expiry_subscription: Mutex<Option<SubscriptionId>>,
    shut_down: AtomicBool,
}

/// Runs async work with an optional per-request deadline.
///
/// Cheap to clone; clones share the pending set and scheduler.
#[derive(Clone)]
pub struct TaskExecutor {
    shared: Arc<ExecutorShared>,
}

impl fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("config", &self.shared.config)
            .field("pending", &self.pending_count())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl TaskExecutor {
    /// Create an executor with its own [`TimerScheduler`] on the current runtime.
    ///
    /// # Errors
    /// Returns [`TetherError::Rejected`] when called outside a tokio runtime.
    pub fn new(config: ExecutorConfig) -> TetherResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| TetherError::Rejected(format!("no tokio runtime: {e}")))?;
        let scheduler = Arc::new(TimerScheduler::with_handle(runtime.clone()));
        Ok(Self::build(config, runtime, scheduler, true))
    }

    /// Create an executor around an externally owned scheduler.
    #[must_use]
    pub fn with_scheduler(
        config: ExecutorConfig,
        runtime: Handle,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self::build(config, runtime, scheduler, false)
    }

    fn build(
        config: ExecutorConfig,
        runtime: Handle,
        scheduler: Arc<dyn Scheduler>,
        owns_scheduler: bool,
    ) -> Self {
        let shared = Arc::new(ExecutorShared {
            config,
            runtime,
            scheduler,
            owns_scheduler,
            pending: Mutex::new(HashMap::new()),
            expiry_subscription: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });
        let weak = Arc::downgrade(&shared);
        let subscription = shared.scheduler.expirations().subscribe(move |id| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_expired(*id);
            }
            Flow::Continue
        });
        *shared.expiry_subscription.lock() = Some(subscription);
        Self { shared }
    }

    /// Enqueue `work` with an optional deadline.
    ///
    /// `work` runs on the runtime and yields the inner future the request is
    /// tracked by. An error from `work` fails the returned future. When the
    /// executor refuses the work, an already-failed future is returned.
    pub fn enqueue<T, W, Fut>(&self, work: W, timeout: Option<Duration>) -> ObservableFuture<T>
    where
        T: Clone + Send + 'static,
        W: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TetherResult<ObservableFuture<T>>> + Send + 'static,
    {
        let shared = &self.shared;
        if shared.shut_down.load(Ordering::Acquire) {
            return ObservableFuture::failed(TetherError::Rejected(
                "executor is shut down".into(),
            ));
        }

        let request_id = RequestId::new();
        let parent = ObservableFuture::new();

        if let Some(timeout) = timeout.or(shared.config.default_timeout) {
            let deadline = Instant::now() + timeout;
            let target = parent.clone();
            shared.pending.lock().insert(
                request_id,
                ScheduledRequest {
                    deadline,
                    timeout,
                    fail_parent: Box::new(move |err| {
                        target.set_failure(err);
                    }),
                    fail_inner: None,
                },
            );
            shared.scheduler.schedule(request_id, deadline);

            let weak = Arc::downgrade(shared);
            parent.add_observer(move |_| {
                if let Some(shared) = weak.upgrade() {
                    shared.forget(request_id);
                }
            });
        }

        debug!(request_id = %request_id, timeout_ms = ?timeout.map(|t| t.as_millis()), "request enqueued");
        let weak = Arc::downgrade(shared);
        let task_parent = parent.clone();
        shared
            .runtime
            .spawn(run_request(weak, request_id, task_parent, work));
        parent
    }

    /// Number of requests with an armed deadline.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }

    /// Refuse new work and drop every pending deadline.
    ///
    /// Work already running is not interrupted.
    pub fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let ids: Vec<RequestId> = self.shared.pending.lock().drain().map(|(id, _)| id).collect();
        for id in &ids {
            self.shared.scheduler.cancel(*id);
        }
        if let Some(subscription) = self.shared.expiry_subscription.lock().take() {
            self.shared.scheduler.expirations().unsubscribe(subscription);
        }
        if self.shared.owns_scheduler {
            self.shared.scheduler.shutdown();
        }
        debug!(dropped = ids.len(), "executor shut down");
    }
}

impl ExecutorShared {
    fn forget(&self, id: RequestId) {
        if self.pending.lock().remove(&id).is_some() {
            self.scheduler.cancel(id);
        }
    }

    fn attach_inner<T: Clone + Send + 'static>(&self, id: RequestId, inner: &ObservableFuture<T>) {
        if let Some(request) = self.pending.lock().get_mut(&id) {
            let target = inner.clone();
            request.fail_inner = Some(Box::new(move |err| {
                target.set_failure(err);
            }));
        }
    }

    fn handle_expired(&self, id: RequestId) {
        if self.shut_down.load(Ordering::Acquire) {
            return;
        }
        let request = {
            let mut pending = self.pending.lock();
            let Some(request) = pending.get(&id) else {
                debug!(request_id = %id, "expired request already finished");
                return;
            };
            if request.deadline > Instant::now() {
                let deadline = request.deadline;
                drop(pending);
                self.scheduler.schedule(id, deadline);
                return;
            }
            pending.remove(&id)
        };
        let Some(request) = request else {
            return;
        };

        warn!(
            request_id = %id,
            timeout_ms = request.timeout.as_millis(),
            "request deadline elapsed"
        );
        let err = TetherError::Timeout(request.timeout);
        match request.fail_inner {
            Some(fail_inner) => fail_inner(err),
            None => (request.fail_parent)(err),
        }
    }
}

async fn run_request<T, W, Fut>(
    shared: Weak<ExecutorShared>,
    id: RequestId,
    parent: ObservableFuture<T>,
    work: W,
) where
    T: Clone + Send + 'static,
    W: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = TetherResult<ObservableFuture<T>>> + Send + 'static,
{
    if parent.is_done() {
        debug!(request_id = %id, "request finished before it started");
        return;
    }

    let inner = match tokio::spawn(async move { work().await }).await {
        Ok(Ok(inner)) => inner,
        Ok(Err(err)) => {
            debug!(request_id = %id, error = %err, "request work failed");
            parent.set_failure(err);
            return;
        }
        Err(join_err) => {
            warn!(request_id = %id, error = %join_err, "request work aborted");
            parent.set_failure(TetherError::Rejected(format!("work aborted: {join_err}")));
            return;
        }
    };

    // Either side may resolve concurrently on another thread, so sync in both
    // directions now and again from observers.
    sync_state(&parent, &inner);
    sync_state(&inner, &parent);
    if !parent.is_done() || !inner.is_done() {
        let upward = parent.clone();
        inner.add_observer(move |inner| {
            sync_state(inner, &upward);
        });
        let downward = inner.clone();
        parent.add_observer(move |parent| {
            sync_state(parent, &downward);
        });
    }
    if parent.is_done() || inner.is_done() {
        return;
    }
    if let Some(shared) = shared.upgrade() {
        shared.attach_inner(id, &inner);
    }
}
