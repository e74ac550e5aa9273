//! Snapshot observer registry
//!
//! Fan-out notification to registered listeners each time a new snapshot is
//! published. Delivery is synchronous and in subscription order; a listener
//! that panics is isolated so the remaining listeners still get the update
//! and the coordinator itself is unaffected.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

use crate::snapshot::RegisterSnapshot;

/// Receives every successfully published snapshot
pub trait SnapshotListener: Send + Sync {
    fn on_snapshot(&self, snapshot: &Arc<RegisterSnapshot>);
}

impl<F> SnapshotListener for F
where
    F: Fn(&Arc<RegisterSnapshot>) + Send + Sync,
{
    fn on_snapshot(&self, snapshot: &Arc<RegisterSnapshot>) {
        self(snapshot)
    }
}

/// Opaque handle identifying one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

/// Listener bookkeeping with ordered, panic-isolated delivery
#[derive(Default)]
pub struct ObserverRegistry {
    listeners: Mutex<Vec<(u64, Arc<dyn SnapshotListener>)>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; notified in subscription order from now on
    pub fn subscribe<L>(&self, listener: L) -> SubscriptionHandle
    where
        L: SnapshotListener + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().push((id, Arc::new(listener)));
        SubscriptionHandle(id)
    }

    /// Remove a subscription; returns false when the handle is unknown
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != handle.0);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    /// Deliver a newly published snapshot to every listener, exactly once each
    pub fn notify(&self, snapshot: &Arc<RegisterSnapshot>) {
        // Clone the listener list so delivery happens outside the lock and a
        // listener may subscribe/unsubscribe reentrantly.
        let listeners: Vec<(u64, Arc<dyn SnapshotListener>)> = self.listeners.lock().clone();
        for (id, listener) in listeners {
            let result = catch_unwind(AssertUnwindSafe(|| listener.on_snapshot(snapshot)));
            if result.is_err() {
                error!("Snapshot listener {} panicked; continuing delivery", id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{RegisterImage, SnapshotStore};
    use parking_lot::Mutex as PlMutex;

    fn snapshot() -> Arc<RegisterSnapshot> {
        SnapshotStore::new().publish(RegisterImage::default())
    }

    #[test]
    fn test_delivery_in_subscription_order() {
        let registry = ObserverRegistry::new();
        let order = Arc::new(PlMutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            registry.subscribe(move |_: &Arc<RegisterSnapshot>| {
                order.lock().push(tag);
            });
        }

        registry.notify(&snapshot());
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let registry = ObserverRegistry::new();
        let count = Arc::new(AtomicU64::new(0));

        let counter = Arc::clone(&count);
        let handle = registry.subscribe(move |_: &Arc<RegisterSnapshot>| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        registry.notify(&snapshot());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(registry.unsubscribe(handle));
        assert!(!registry.unsubscribe(handle));

        registry.notify(&snapshot());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let registry = ObserverRegistry::new();
        let count = Arc::new(AtomicU64::new(0));

        registry.subscribe(|_: &Arc<RegisterSnapshot>| {
            panic!("listener failure");
        });
        let counter = Arc::clone(&count);
        registry.subscribe(move |_: &Arc<RegisterSnapshot>| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        registry.notify(&snapshot());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
