//! Callback registries whose registrations are undone by dropping the
//! returned [`Subscription`].

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// An ordered set of callbacks for events of type `T`.
pub struct Listeners<T> {
    inner: Arc<ListenerSet<T>>,
}

struct ListenerSet<T> {
    callbacks: RwLock<BTreeMap<u64, Callback<T>>>,
    next_id: AtomicU64,
}

trait Detach: Send + Sync {
    fn detach(&self, id: u64);
}

impl<T: 'static> Detach for ListenerSet<T> {
    fn detach(&self, id: u64) {
        self.callbacks.write().remove(&id);
    }
}

impl<T: 'static> Listeners<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ListenerSet {
                callbacks: RwLock::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn add<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.callbacks.write().insert(id, Arc::new(callback));
        let set: Arc<dyn Detach> = self.inner.clone();
        Subscription {
            id,
            set: Some(Arc::downgrade(&set)),
        }
    }

    /// Invoke every callback registered at the time of the call, in
    /// registration order. Callbacks may add or drop subscriptions freely.
    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Callback<T>> = self.inner.callbacks.read().values().cloned().collect();
        for callback in snapshot {
            callback(event);
        }
    }

    pub fn clear(&self) {
        self.inner.callbacks.write().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.callbacks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Handle to a registered callback. Dropping it (or calling
/// [`Subscription::unsubscribe`]) removes the callback.
#[must_use = "dropping a Subscription removes its callback immediately"]
pub struct Subscription {
    id: u64,
    set: Option<Weak<dyn Detach>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(set) = self.set.take().and_then(|weak| weak.upgrade()) {
            set.detach(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("attached", &self.set.is_some())
            .finish()
    }
}
