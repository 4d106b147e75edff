//! Bounded, access-ordered caches for derived artifact data.
//!
//! Capacities are small on purpose. Plaintext and encrypted script bytes can
//! each run to megabytes, and only a handful of scripts are hot at any time;
//! eviction drops the least recently *touched* entry, where both reads and
//! writes count as touches.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use parking_lot::Mutex;

/// Access-ordered LRU map. Not thread safe on its own; see [`SharedLru`].
#[derive(Debug)]
pub struct LruCache<K, V> {
    capacity: usize,
    map: HashMap<K, V>,
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "lru capacity must be nonzero");
        Self {
            capacity,
            map: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Looks up `key`, promoting it to most recently used on a hit.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let value = self.map.get(key).cloned()?;
        self.touch(key);
        Some(value)
    }

    /// Inserts `key`, evicting the least recently used entry if the cache is
    /// at capacity and `key` is new.
    pub fn insert(&mut self, key: K, value: V) {
        if self.map.insert(key.clone(), value).is_some() {
            self.touch(&key);
            return;
        }
        if self.map.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
        self.order.push_back(key);
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }

    fn touch(&mut self, key: &K) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
            self.order.push_back(key.clone());
        }
    }
}

/// Thread-safe LRU with a get-or-compute entry point.
#[derive(Debug)]
pub struct SharedLru<K, V> {
    inner: Mutex<LruCache<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> SharedLru<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().get(key)
    }

    pub fn insert(&self, key: K, value: V) {
        self.inner.lock().insert(key, value);
    }

    /// Returns the cached value for `key`, computing and inserting it on a
    /// miss. The fill closure runs outside the lock, so it may do blocking
    /// work; two racing callers can both compute, and the later insert wins.
    pub fn get_or_try_insert_with<E>(
        &self,
        key: K,
        fill: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        if let Some(hit) = self.inner.lock().get(&key) {
            return Ok(hit);
        }
        let value = fill()?;
        self.inner.lock().insert(key, value.clone());
        Ok(value)
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
}
