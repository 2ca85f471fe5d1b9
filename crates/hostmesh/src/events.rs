//! # Event fan-out
//!
//! Observer registration with ordered, asynchronous delivery. Emitting only
//! enqueues; a single dispatcher task per bus drains the queue and invokes
//! handlers, so the emitter (a ping loop, or code holding the registry lock)
//! never runs user code and events arrive in the order they were produced.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use parking_lot::RwLock;
use tokio::sync::mpsc;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Token returned by `subscribe`, used to unsubscribe. Unique per process.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A list of handlers of type `H`, usually a `dyn Fn`.
pub(crate) struct Handlers<H: ?Sized> {
    entries: RwLock<Vec<(SubscriptionId, Arc<H>)>>,
}

impl<H: ?Sized> Handlers<H> {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, handler: Arc<H>) -> SubscriptionId {
        let id = SubscriptionId(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push((id, handler));
        id
    }

    pub(crate) fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    /// Clones the current handler list so callbacks run without the lock.
    pub(crate) fn snapshot(&self) -> Vec<Arc<H>> {
        self.entries.read().iter().map(|(_, h)| h.clone()).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }
}

/// Ordered asynchronous event stream of `T`.
///
/// Must be created inside a Tokio runtime: construction spawns the dispatcher
/// task, which exits once the bus is dropped and the queue is drained.
pub struct EventBus<T: Clone + Send + 'static> {
    handlers: Arc<Handlers<dyn Fn(T) + Send + Sync>>,
    tx: mpsc::UnboundedSender<T>,
}

impl<T: Clone + Send + 'static> EventBus<T> {
    pub fn new() -> Self {
        let handlers = Arc::new(Handlers::<dyn Fn(T) + Send + Sync>::new());
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();

        let pump_handlers = handlers.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for handler in pump_handlers.snapshot() {
                    handler(event.clone());
                }
            }
        });

        Self { handlers, tx }
    }

    pub fn subscribe(&self, handler: impl Fn(T) + Send + Sync + 'static) -> SubscriptionId {
        self.handlers.add(Arc::new(handler))
    }

    /// Returns whether a handler was removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.handlers.remove(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }

    /// Queues `event` for delivery. Never blocks and never runs handlers inline.
    pub fn emit(&self, event: T) {
        // The receiver only goes away with the runtime.
        let _ = self.tx.send(event);
    }
}

impl<T: Clone + Send + 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}
