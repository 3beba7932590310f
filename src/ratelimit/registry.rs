//! Keyed registry of per-key limiter state.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

/// Shared handle to the state of a single key.
///
/// Each handle carries its own lock, so admission checks on different keys
/// never contend with each other.
pub type Handle<T> = Arc<Mutex<T>>;

/// Owns the mapping from key to limiter state.
///
/// Entries are created lazily on first use. The map is sharded and each shard
/// is guarded by a reader/writer lock: lookups of existing keys only take a
/// read lock, and only the first use of a key takes the write lock of its
/// shard. Creation goes through the shard's entry API, so two callers racing
/// on a new key always end up sharing one instance.
pub struct Registry<T> {
    entries: DashMap<String, Handle<T>>,
}

impl<T> Registry<T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Return the handle for `key`, creating it with `init` if absent.
    pub fn get_or_create(&self, key: &str, init: impl FnOnce() -> T) -> Handle<T> {
        if let Some(entry) = self.entries.get(key) {
            return Arc::clone(entry.value());
        }

        let entry = self.entries.entry(key.to_string()).or_insert_with(|| {
            debug!(key = %key, "Creating limiter state");
            Arc::new(Mutex::new(init()))
        });
        Arc::clone(entry.value())
    }

    /// Return the handle for `key` without creating it.
    pub fn get(&self, key: &str) -> Option<Handle<T>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Drop the state for `key`. Outstanding handles stay usable but are no
    /// longer reachable through the registry.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop all state.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}
