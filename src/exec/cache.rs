//! Fingerprint-keyed, single-flight, compute-once result cache.
//!
//! At most one producer computes a given fingerprint per cache lifetime;
//! everyone else either reuses the stored value or blocks until the
//! producer publishes it. The producer handle unlocks on drop, so a
//! producer that fails before storing releases the entry instead of
//! deadlocking its waiters; one of them retries and takes over.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

enum EntryState<V> {
    /// A producer is computing the value.
    Locked,
    Filled(V),
}

struct CacheMap<V> {
    entries: HashMap<String, EntryState<V>>,
    /// Bumped by `clear`. Producer handles are stamped with the epoch they
    /// locked under; a handle from an earlier epoch can neither store its
    /// value nor evict an entry relocked since.
    epoch: u64,
}

struct CacheInner<V> {
    map: Mutex<CacheMap<V>>,
    cond: Condvar,
}

/// Single-flight cache for derived artifacts, keyed by fingerprint.
pub struct ResultCache<V: Clone> {
    inner: Arc<CacheInner<V>>,
    persistent: bool,
    generation: Mutex<i32>,
}

impl<V: Clone> ResultCache<V> {
    pub fn new() -> Self {
        Self::with_persistence(false)
    }

    /// A persistent cache survives generation changes.
    pub fn with_persistence(persistent: bool) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                map: Mutex::new(CacheMap {
                    entries: HashMap::new(),
                    epoch: 0,
                }),
                cond: Condvar::new(),
            }),
            persistent,
            generation: Mutex::new(-1),
        }
    }

    /// Look up `key`, locking it for production when absent.
    ///
    /// Returns `Some(handle)` when this caller is the producer; the caller
    /// must finish with [`ResultCache::store_and_unlock`]. Returns `None`
    /// with `out` filled when the value was (or became) available. A caller
    /// hitting a locked entry blocks until the producer stores or gives up.
    pub fn get_or_lock(&self, key: &str, out: &mut Option<V>) -> Option<CacheHandle<V>> {
        let mut map = self.inner.map.lock();
        loop {
            match map.entries.get(key) {
                None => {
                    let epoch = map.epoch;
                    map.entries.insert(key.to_string(), EntryState::Locked);
                    return Some(CacheHandle {
                        inner: self.inner.clone(),
                        key: key.to_string(),
                        epoch,
                        stored: false,
                    });
                }
                Some(EntryState::Filled(value)) => {
                    *out = Some(value.clone());
                    return None;
                }
                Some(EntryState::Locked) => {
                    self.inner.cond.wait(&mut map);
                }
            }
        }
    }

    /// Publish the produced value and wake pending readers.
    ///
    /// A value produced under an epoch that `clear` has since retired is
    /// discarded; the producer ran against state that no longer exists.
    pub fn store_and_unlock(&self, mut handle: CacheHandle<V>, value: V) {
        debug_assert!(Arc::ptr_eq(&self.inner, &handle.inner));
        let mut map = self.inner.map.lock();
        handle.stored = true;
        if map.epoch == handle.epoch {
            map.entries.insert(handle.key.clone(), EntryState::Filled(value));
        } else {
            tracing::debug!("discarding stale cache value for {}", handle.key);
        }
        drop(map);
        self.inner.cond.notify_all();
    }

    /// Begin a new execution generation, clearing unless persistent.
    pub fn start_generation(&self, generation: i32) {
        let mut current = self.generation.lock();
        if *current == generation {
            return;
        }
        *current = generation;
        if !self.persistent {
            self.clear();
        }
    }

    pub fn clear(&self) {
        let mut map = self.inner.map.lock();
        map.entries.clear();
        map.epoch += 1;
        drop(map);
        self.inner.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.map.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for ResultCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer-side lock on one cache entry.
///
/// Dropping the handle without storing removes the entry so a waiting
/// consumer can retry as the new producer.
pub struct CacheHandle<V> {
    inner: Arc<CacheInner<V>>,
    key: String,
    epoch: u64,
    stored: bool,
}

impl<V> Drop for CacheHandle<V> {
    fn drop(&mut self) {
        if !self.stored {
            let mut map = self.inner.map.lock();
            // After a clear, the entry this handle locked is gone; the key
            // may be relocked by a fresh producer that must not be evicted.
            if map.epoch == self.epoch {
                map.entries.remove(&self.key);
            }
            drop(map);
            self.inner.cond.notify_all();
            tracing::debug!("cache entry {} released without a value", self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn second_lookup_reuses_value() {
        let cache = ResultCache::new();
        let mut out = None;
        let handle = cache.get_or_lock("grid-0", &mut out).unwrap();
        cache.store_and_unlock(handle, 42);

        let mut out = None;
        assert!(cache.get_or_lock("grid-0", &mut out).is_none());
        assert_eq!(out, Some(42));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn concurrent_callers_single_flight() {
        let cache = Arc::new(ResultCache::new());
        let producers = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let producers = producers.clone();
            handles.push(std::thread::spawn(move || {
                let mut out = None;
                match cache.get_or_lock("surface", &mut out) {
                    Some(handle) => {
                        producers.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(20));
                        cache.store_and_unlock(handle, 7);
                        7
                    }
                    None => out.unwrap(),
                }
            }));
        }

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 7);
        }
        assert_eq!(producers.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn dropped_producer_hands_over() {
        let cache = Arc::new(ResultCache::new());

        let mut out = None;
        let abandoned = cache.get_or_lock("iso", &mut out).unwrap();

        let waiter = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                let mut out = None;
                match cache.get_or_lock("iso", &mut out) {
                    Some(handle) => {
                        cache.store_and_unlock(handle, 99);
                        99
                    }
                    None => out.unwrap(),
                }
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        // Producer fails without storing; the waiter takes over.
        drop(abandoned);
        assert_eq!(waiter.join().unwrap(), 99);
    }

    #[test]
    fn generation_change_clears_unless_persistent() {
        let cache = ResultCache::new();
        let mut out = None;
        let handle = cache.get_or_lock("k", &mut out).unwrap();
        cache.store_and_unlock(handle, 1);

        cache.start_generation(1);
        assert!(cache.is_empty());

        let persistent = ResultCache::with_persistence(true);
        let mut out = None;
        let handle = persistent.get_or_lock("k", &mut out).unwrap();
        persistent.store_and_unlock(handle, 1);
        persistent.start_generation(1);
        assert_eq!(persistent.len(), 1);

        // Re-announcing the same generation is a no-op.
        cache.start_generation(1);
    }

    #[test]
    fn stale_producer_cannot_repopulate_after_clear() {
        let cache = ResultCache::new();
        let mut out = None;
        let handle = cache.get_or_lock("slice", &mut out).unwrap();

        cache.start_generation(1);
        cache.store_and_unlock(handle, 5);
        assert!(cache.is_empty());

        // The next lookup under the new generation produces fresh.
        let mut out = None;
        let handle = cache.get_or_lock("slice", &mut out).unwrap();
        cache.store_and_unlock(handle, 6);
        let mut out = None;
        assert!(cache.get_or_lock("slice", &mut out).is_none());
        assert_eq!(out, Some(6));
    }

    #[test]
    fn stale_drop_does_not_evict_a_fresh_lock() {
        let cache = ResultCache::new();
        let mut out = None;
        let stale = cache.get_or_lock("grid", &mut out).unwrap();

        cache.clear();
        let mut out = None;
        let fresh = cache.get_or_lock("grid", &mut out).unwrap();

        // The abandoned pre-clear producer must not release the new lock.
        drop(stale);
        assert_eq!(cache.len(), 1);

        cache.store_and_unlock(fresh, 3);
        let mut out = None;
        assert!(cache.get_or_lock("grid", &mut out).is_none());
        assert_eq!(out, Some(3));
    }
}
