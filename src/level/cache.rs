use std::{
    num::NonZeroUsize,
    sync::atomic::{AtomicU64, Ordering},
};

use lru::LruCache;
use parking_lot::Mutex;

use crate::Lookup;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub len: usize,
}

/// Remembers resolved point lookups against one level, evicting the least
/// recently used once `capacity` is reached. Only point lookups fill it.
pub struct LookupCache<T> {
    // `None` when the capacity is zero.
    inner: Option<Mutex<LruCache<String, Lookup<T>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
}

impl<T> std::fmt::Debug for LookupCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupCache")
            .field("stats", &self.stats())
            .finish()
    }
}

impl<T: Clone> LookupCache<T> {
    pub fn new(capacity: usize) -> Self {
        LookupCache {
            inner: NonZeroUsize::new(capacity).map(|c| Mutex::new(LruCache::new(c))),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
        }
    }

    pub fn try_get(&self, key: &str) -> Option<Lookup<T>> {
        let found = self
            .inner
            .as_ref()
            .and_then(|inner| inner.lock().get(key).cloned());
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    pub fn add(&self, key: String, result: Lookup<T>) {
        if let Some(inner) = &self.inner {
            inner.lock().put(key, result);
            self.inserts.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl<T> LookupCache<T> {
    pub fn len(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.lock().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            len: self.len(),
        }
    }
}
