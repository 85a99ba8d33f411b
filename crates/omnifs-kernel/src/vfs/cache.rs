//! Small bounded caches owned by backend adapters.
//!
//! Entries are evicted least-recently-used first once the cache is full.
//! Adapters invalidate entries explicitly on every mutation of the cached
//! path; nothing here expires on its own.

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::Mutex;

/// Default capacity for path-keyed caches.
pub const DEFAULT_CAPACITY: usize = 256;

struct Slot<V> {
    value: V,
    last_access: u64,
}

struct Inner<K, V> {
    map: HashMap<K, Slot<V>>,
    tick: u64,
}

/// LRU map guarded by one mutex. No lock is held beyond a single call.
pub struct BoundedCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> BoundedCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                tick: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        inner.map.get_mut(key).map(|slot| {
            slot.last_access = tick;
            slot.value.clone()
        })
    }

    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        if !inner.map.contains_key(&key) {
            while inner.map.len() >= self.capacity {
                let oldest = inner
                    .map
                    .iter()
                    .min_by_key(|(_, slot)| slot.last_access)
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(k) => {
                        inner.map.remove(&k);
                    }
                    None => break,
                }
            }
        }
        inner.map.insert(
            key,
            Slot {
                value,
                last_access: tick,
            },
        );
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().map.remove(key).map(|slot| slot.value)
    }

    /// Remove and return an entry. Used for one-shot caches where a value
    /// is only good for the next lookup.
    pub fn take(&self, key: &K) -> Option<V> {
        self.remove(key)
    }

    /// Drop every entry whose key matches.
    pub fn remove_where(&self, mut predicate: impl FnMut(&K) -> bool) {
        self.inner.lock().map.retain(|k, _| !predicate(k));
    }

    pub fn clear(&self) {
        self.inner.lock().map.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> std::fmt::Debug for BoundedCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedCache")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = BoundedCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.get(&"a"), Some(1));
        cache.insert("c", 3);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[test]
    fn test_reinsert_does_not_evict() {
        let cache = BoundedCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("a", 10);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a"), Some(10));
        assert_eq!(cache.get(&"b"), Some(2));
    }

    #[test]
    fn test_take_is_one_shot() {
        let cache = BoundedCache::new(4);
        cache.insert("dir", vec!["x"]);
        assert_eq!(cache.take(&"dir"), Some(vec!["x"]));
        assert_eq!(cache.take(&"dir"), None);
    }

    #[test]
    fn test_remove_where() {
        let cache = BoundedCache::new(8);
        cache.insert("/a".to_string(), 1);
        cache.insert("/a/b".to_string(), 2);
        cache.insert("/c".to_string(), 3);
        cache.remove_where(|k| k.starts_with("/a"));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&"/c".to_string()).is_some());
    }
}
