//! Publish/subscribe event bus with self-detaching listeners.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, ReentrantMutex, RwLock};

/// What a listener wants after handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep receiving events.
    Continue,
    /// Unsubscribe. No later event is delivered to this listener.
    Detach,
}

/// Identifies one subscription on one [`EventBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type Listener<E> = dyn Fn(&E) -> Flow + Send + Sync;

struct Entry<E> {
    id: u64,
    active: AtomicBool,
    // Held across the listener call so a detach is decided before the next delivery.
    delivery: ReentrantMutex<()>,
    listener: Box<Listener<E>>,
}

/// Fan-out of events of type `E` to registered listeners.
///
/// Listeners run on the publishing thread, outside the bus lock, so a
/// listener may subscribe, unsubscribe, or publish again. Deliveries to one
/// listener are serialized: a listener returning [`Flow::Detach`] sees no
/// further event, even with concurrent publishers.
pub struct EventBus<E> {
    next_id: AtomicU64,
    entries: RwLock<Vec<Arc<Entry<E>>>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Vec::new()),
        }
    }
}

impl<E: 'static> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.len())
            .finish()
    }
}

impl<E: 'static> EventBus<E> {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener.
    pub fn subscribe(&self, listener: impl Fn(&E) -> Flow + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.write().push(Arc::new(Entry {
            id,
            active: AtomicBool::new(true),
            delivery: ReentrantMutex::new(()),
            listener: Box::new(listener),
        }));
        SubscriptionId(id)
    }

    /// Register a listener that handles at most one event.
    pub fn subscribe_once(&self, listener: impl FnOnce(&E) + Send + 'static) -> SubscriptionId {
        let slot = Mutex::new(Some(listener));
        self.subscribe(move |event| {
            if let Some(listener) = slot.lock().take() {
                listener(event);
            }
            Flow::Detach
        })
    }

    /// Remove a listener. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.write();
        let Some(index) = entries.iter().position(|entry| entry.id == id.0) else {
            return false;
        };
        let entry = entries.remove(index);
        entry.active.store(false, Ordering::Release);
        true
    }

    /// Deliver `event` to every active listener. Returns the delivery count.
    pub fn publish(&self, event: &E) -> usize {
        let snapshot: Vec<Arc<Entry<E>>> = self.entries.read().clone();
        let mut delivered = 0;
        for entry in snapshot {
            let _delivery = entry.delivery.lock();
            if !entry.active.load(Ordering::Acquire) {
                continue;
            }
            delivered += 1;
            if (entry.listener)(event) == Flow::Detach
                && entry.active.swap(false, Ordering::AcqRel)
            {
                self.entries.write().retain(|e| e.id != entry.id);
            }
        }
        delivered
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no listener is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Remove every listener.
    pub fn clear(&self) {
        for entry in self.entries.write().drain(..) {
            entry.active.store(false, Ordering::Release);
        }
    }
}
