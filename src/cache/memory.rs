//! In-process LRU tier

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

/// Fixed-capacity LRU map guarded by a mutex
///
/// Both reads and writes mark an entry as most recently used, so eviction
/// always removes the least recently accessed key.
pub struct MemoryCache<V> {
    entries: Mutex<LruCache<String, V>>,
}

impl<V: Clone> MemoryCache<V> {
    /// Create a cache holding at most `capacity` entries (minimum one)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.entries.lock().get(key).cloned()
    }

    pub fn put(&self, key: &str, value: V) {
        self.entries.lock().put(key.to_string(), value);
    }

    pub fn remove(&self, key: &str) {
        self.entries.lock().pop(key);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }
}
