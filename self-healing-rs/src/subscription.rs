//! Listener registry with opaque cancellation handles.
//!
//! Listeners are kept in registration order. Removal goes through the
//! handle's key; there is no index search over the listener list.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Slots<T> = Mutex<BTreeMap<u64, Arc<T>>>;

/// Ordered set of listeners of type `T`
pub struct SubscriberSet<T: ?Sized> {
    next_id: AtomicU64,
    slots: Arc<Slots<T>>,
}

impl<T: ?Sized> Default for SubscriberSet<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            slots: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }
}

impl<T: ?Sized + Send + Sync + 'static> SubscriberSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener and returns the handle that removes it
    pub fn subscribe(&self, listener: Arc<T>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, listener);

        let weak: Weak<Slots<T>> = Arc::downgrade(&self.slots);
        Subscription {
            id,
            cancel: Some(Box::new(move |id| {
                if let Some(slots) = weak.upgrade() {
                    slots.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
                }
            })),
        }
    }

    /// Listeners in registration order, cloned out so callers never hold
    /// the lock while invoking them
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by `subscribe`; `unsubscribe` is idempotent.
///
/// Dropping the handle does not remove the listener.
pub struct Subscription {
    id: u64,
    cancel: Option<Box<dyn FnOnce(u64) + Send + Sync>>,
}

impl Subscription {
    /// Removes the listener. Calling this more than once is harmless.
    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel(self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Listener = dyn Fn() -> u32 + Send + Sync;

    #[test]
    fn test_snapshot_preserves_registration_order() {
        let set: SubscriberSet<Listener> = SubscriberSet::new();
        let _a = set.subscribe(Arc::new(|| 1));
        let _b = set.subscribe(Arc::new(|| 2));
        let _c = set.subscribe(Arc::new(|| 3));

        let order: Vec<u32> = set.snapshot().iter().map(|l| l()).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_unsubscribe_twice_is_harmless() {
        let set: SubscriberSet<Listener> = SubscriberSet::new();
        let mut first = set.subscribe(Arc::new(|| 1));
        let _second = set.subscribe(Arc::new(|| 2));

        first.unsubscribe();
        first.unsubscribe();

        assert!(!first.is_active());
        assert_eq!(set.len(), 1);
        assert_eq!(set.snapshot()[0](), 2);
    }

    #[test]
    fn test_unsubscribe_after_set_dropped() {
        let set: SubscriberSet<Listener> = SubscriberSet::new();
        let mut handle = set.subscribe(Arc::new(|| 1));
        drop(set);
        handle.unsubscribe();
        assert!(!handle.is_active());
    }

    #[test]
    fn test_dropping_handle_keeps_listener() {
        let set: SubscriberSet<Listener> = SubscriberSet::new();
        drop(set.subscribe(Arc::new(|| 9)));
        assert_eq!(set.len(), 1);
    }
}
