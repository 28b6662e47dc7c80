//! Single-assignment observable futures.
//!
//! An [`ObservableFuture`] is a shared handle to a result cell that moves from
//! pending to exactly one terminal [`Outcome`]. Observers run once, in
//! registration order, on whichever thread completes the cell. A future may
//! bind one nested future; after binding, an outcome on either side is copied
//! to the other exactly once.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::{TetherError, TetherResult};

static NEXT_FUTURE_ID: AtomicU64 = AtomicU64::new(1);

/// Terminal state of an [`ObservableFuture`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// Completed with a value.
    Success(T),
    /// Completed with an error.
    Failure(TetherError),
    /// Cancelled before a value or error was set.
    Cancelled,
}

impl<T> Outcome<T> {
    /// Check if this is a success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Check if this is a failure.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// Check if this is a cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Convert into a `Result`, mapping cancellation to [`TetherError::Cancelled`].
    ///
    /// # Errors
    /// Returns the failure cause, or `Cancelled`.
    pub fn into_result(self) -> TetherResult<T> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(err) => Err(err),
            Self::Cancelled => Err(TetherError::Cancelled),
        }
    }

    /// Map the success value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Success(value) => Outcome::Success(f(value)),
            Self::Failure(err) => Outcome::Failure(err),
            Self::Cancelled => Outcome::Cancelled,
        }
    }
}

type Observer<T> = Box<dyn FnOnce(&ObservableFuture<T>) + Send>;

struct Cell<T> {
    outcome: Option<Outcome<T>>,
    observers: Vec<Observer<T>>,
    nested: Option<ObservableFuture<T>>,
    nested_synced: bool,
}

struct Shared<T> {
    id: u64,
    cell: Mutex<Cell<T>>,
}

/// Shared handle to a single-assignment result cell.
///
/// Cloning the handle does not clone the cell.
pub struct ObservableFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ObservableFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for ObservableFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cell = self.shared.cell.lock();
        let state = match &cell.outcome {
            None => "pending",
            Some(Outcome::Success(_)) => "success",
            Some(Outcome::Failure(_)) => "failure",
            Some(Outcome::Cancelled) => "cancelled",
        };
        f.debug_struct("ObservableFuture")
            .field("id", &self.shared.id)
            .field("state", &state)
            .field("observers", &cell.observers.len())
            .field("nested", &cell.nested.as_ref().map(ObservableFuture::id))
            .finish()
    }
}

/// Non-owning reference to an [`ObservableFuture`].
pub struct WeakFuture<T> {
    shared: Weak<Shared<T>>,
}

impl<T> Clone for WeakFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<T> WeakFuture<T> {
    /// Upgrade to a strong handle if the cell is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<ObservableFuture<T>> {
        self.shared.upgrade().map(|shared| ObservableFuture { shared })
    }
}

impl<T> ObservableFuture<T> {
    /// Process-unique id, useful for log correlation.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Whether two handles point at the same cell.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Create a non-owning reference.
    #[must_use]
    pub fn downgrade(&self) -> WeakFuture<T> {
        WeakFuture {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Whether a terminal outcome has been set.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.shared.cell.lock().outcome.is_some()
    }

    /// Whether the future completed successfully.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.shared.cell.lock().outcome, Some(Outcome::Success(_)))
    }

    /// Whether the future failed.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self.shared.cell.lock().outcome, Some(Outcome::Failure(_)))
    }

    /// Whether the future was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.shared.cell.lock().outcome, Some(Outcome::Cancelled))
    }

    /// The failure cause, if the future failed.
    #[must_use]
    pub fn cause(&self) -> Option<TetherError> {
        match &self.shared.cell.lock().outcome {
            Some(Outcome::Failure(err)) => Some(err.clone()),
            _ => None,
        }
    }
}

impl<T: Clone + Send + 'static> ObservableFuture<T> {
    /// Create a pending future.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                id: NEXT_FUTURE_ID.fetch_add(1, Ordering::Relaxed),
                cell: Mutex::new(Cell {
                    outcome: None,
                    observers: Vec::new(),
                    nested: None,
                    nested_synced: false,
                }),
            }),
        }
    }

    /// Create a future that has already succeeded.
    #[must_use]
    pub fn succeeded(value: T) -> Self {
        let future = Self::new();
        future.set_success(value);
        future
    }

    /// Create a future that has already failed.
    #[must_use]
    pub fn failed(err: TetherError) -> Self {
        let future = Self::new();
        future.set_failure(err);
        future
    }

    /// Create a future that is already cancelled.
    #[must_use]
    pub fn cancelled() -> Self {
        let future = Self::new();
        future.cancel();
        future
    }

    /// The terminal outcome, if any.
    #[must_use]
    pub fn outcome(&self) -> Option<Outcome<T>> {
        self.shared.cell.lock().outcome.clone()
    }

    /// The success value, if the future succeeded.
    #[must_use]
    pub fn result(&self) -> Option<T> {
        match &self.shared.cell.lock().outcome {
            Some(Outcome::Success(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Complete with a value. Returns `false` if already terminal.
    pub fn set_success(&self, value: T) -> bool {
        self.complete(Outcome::Success(value))
    }

    /// Complete with an error. Returns `false` if already terminal.
    pub fn set_failure(&self, err: TetherError) -> bool {
        self.complete(Outcome::Failure(err))
    }

    /// Cancel. Returns `false` if already terminal.
    pub fn cancel(&self) -> bool {
        self.complete(Outcome::Cancelled)
    }

    /// Apply `outcome` if the future is still pending.
    ///
    /// Observers run after the cell lock is released. When a nested future is
    /// bound and the initial sync has finished, the same outcome is then
    /// applied to it.
    pub fn complete(&self, outcome: Outcome<T>) -> bool {
        let (observers, nested) = {
            let mut cell = self.shared.cell.lock();
            if cell.outcome.is_some() {
                return false;
            }
            cell.outcome = Some(outcome.clone());
            let nested = if cell.nested_synced {
                cell.nested.clone()
            } else {
                None
            };
            (std::mem::take(&mut cell.observers), nested)
        };

        trace!(future_id = self.shared.id, observers = observers.len(), "future completed");
        for observer in observers {
            observer(self);
        }
        if let Some(nested) = nested {
            nested.complete(outcome);
        }
        true
    }

    /// Register `observer` to run once the future is terminal.
    ///
    /// Runs immediately on the calling thread when the future is already done.
    pub fn add_observer(&self, observer: impl FnOnce(&Self) + Send + 'static) {
        {
            let mut cell = self.shared.cell.lock();
            if cell.outcome.is_none() {
                cell.observers.push(Box::new(observer));
                return;
            }
        }
        observer(self);
    }

    /// Bind `child` as this future's nested future.
    ///
    /// Whichever side is already terminal is copied onto the other right away.
    /// Afterwards an outcome set on either side propagates to the other.
    ///
    /// # Errors
    /// Returns [`TetherError::ContractViolation`] if a nested future is already
    /// bound or `child` is this future.
    pub fn bind_nested(&self, child: &Self) -> TetherResult<()> {
        if self.ptr_eq(child) {
            return Err(TetherError::ContractViolation(
                "a future cannot be nested inside itself".into(),
            ));
        }
        {
            let mut cell = self.shared.cell.lock();
            if let Some(existing) = &cell.nested {
                return Err(TetherError::ContractViolation(format!(
                    "future {} already has nested future {}",
                    self.shared.id,
                    existing.id()
                )));
            }
            cell.nested = Some(child.clone());
        }

        sync_state(child, self);
        sync_state(self, child);

        let parent = self.downgrade();
        child.add_observer(move |child| {
            if let Some(parent) = parent.upgrade() {
                sync_state(child, &parent);
            }
        });

        let settled = {
            let mut cell = self.shared.cell.lock();
            cell.nested_synced = true;
            cell.outcome.clone()
        };
        // Covers an outcome that landed between the initial sync and the flag.
        if let Some(outcome) = settled {
            child.complete(outcome);
        }
        Ok(())
    }

    /// The bound nested future, if any.
    #[must_use]
    pub fn nested(&self) -> Option<Self> {
        self.shared.cell.lock().nested.clone()
    }

    /// Derive a future whose success value is `f` applied to this one's.
    #[must_use]
    pub fn map<U, F>(&self, f: F) -> ObservableFuture<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let mapped = ObservableFuture::new();
        let target = mapped.clone();
        self.add_observer(move |source| {
            if let Some(outcome) = source.outcome() {
                target.complete(outcome.map(f));
            }
        });
        mapped
    }

    /// Wait for the terminal outcome.
    pub async fn wait(&self) -> Outcome<T> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.add_observer(move |future| {
            if let Some(outcome) = future.outcome() {
                let _ = tx.send(outcome);
            }
        });
        rx.await.unwrap_or(Outcome::Cancelled)
    }
}

impl<T: Clone + Send + 'static> Default for ObservableFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy `source`'s terminal outcome onto `dest`, if `source` is done.
///
/// Returns whether `dest` changed.
pub fn sync_state<T: Clone + Send + 'static>(
    source: &ObservableFuture<T>,
    dest: &ObservableFuture<T>,
) -> bool {
    source
        .outcome()
        .is_some_and(|outcome| dest.complete(outcome))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
