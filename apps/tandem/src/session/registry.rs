use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

use crate::signaling::ConnectionKey;

pub type SessionHandle<S> = Arc<AsyncMutex<S>>;

/// Connection key to negotiation session, at most one per key.
///
/// Lookups and inserts happen under a synchronous lock, so two callers racing
/// on the same key always end up with the same entry. Each entry carries its
/// own async mutex; holding it serializes work on that key.
pub struct PeerRegistry<S> {
    entries: Mutex<HashMap<ConnectionKey, SessionHandle<S>>>,
}

impl<S> PeerRegistry<S> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the entry for `key`, creating it with `factory` if absent. The
    /// flag reports whether `factory` ran.
    pub fn get_or_create<F>(&self, key: &ConnectionKey, factory: F) -> (SessionHandle<S>, bool)
    where
        F: FnOnce() -> S,
    {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(key) {
            return (Arc::clone(existing), false);
        }
        let handle = Arc::new(AsyncMutex::new(factory()));
        entries.insert(key.clone(), Arc::clone(&handle));
        (handle, true)
    }

    pub fn get(&self, key: &ConnectionKey) -> Option<SessionHandle<S>> {
        self.entries.lock().get(key).cloned()
    }

    /// Detach the entry; the caller owns its teardown.
    pub fn remove(&self, key: &ConnectionKey) -> Option<SessionHandle<S>> {
        self.entries.lock().remove(key)
    }

    pub fn contains(&self, key: &ConnectionKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn entries(&self) -> Vec<(ConnectionKey, SessionHandle<S>)> {
        self.entries
            .lock()
            .iter()
            .map(|(key, handle)| (key.clone(), Arc::clone(handle)))
            .collect()
    }

    pub fn drain(&self) -> Vec<(ConnectionKey, SessionHandle<S>)> {
        self.entries.lock().drain().collect()
    }

    /// Visit every entry while the registry is locked. `f` must not call
    /// back into the registry.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&ConnectionKey, &SessionHandle<S>),
    {
        for (key, handle) in self.entries.lock().iter() {
            f(key, handle);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S> Default for PeerRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
