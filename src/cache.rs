//! Content-addressed memoization of analysis results and feature vectors.
//!
//! Keys combine the model-set fingerprint with a blake3 hash of the input, so entries
//! computed against an older model set can never be served after the models change.
//! Entries expire after their TTL; when the cache is full the entry closest to expiry is
//! evicted.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::trace;

/// What a cached value was computed from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// [`crate::model::ModelRegistry::fingerprint`] of the models that produced the value.
    pub fingerprint: String,
    /// blake3 hash of the encoded input bytes (or of the samples for raw-array requests).
    pub content: blake3::Hash,
}

impl CacheKey {
    pub fn new(fingerprint: impl Into<String>, content: blake3::Hash) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            content,
        }
    }
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// A bounded TTL map safe to share between threads.
pub struct TtlCache<V> {
    capacity: usize,
    entries: Mutex<HashMap<CacheKey, Entry<V>>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The map stays consistent across a panicking holder, so a poisoned lock is recovered.
    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, Entry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let mut entries = self.lock();
        let now = Instant::now();
        match entries.get(key) {
            Some(e) if e.expires_at > now => Some(e.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert or replace `key`. A zero TTL or zero capacity disables caching, and a TTL too
    /// large to represent as an expiry instant skips the insert.
    pub fn put(&self, key: CacheKey, value: V, ttl: Duration) {
        if ttl.is_zero() || self.capacity == 0 {
            return;
        }
        let now = Instant::now();
        let Some(expires_at) = now.checked_add(ttl) else {
            trace!(?ttl, "cache ttl overflows the clock; not caching");
            return;
        };
        let mut entries = self.lock();

        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            entries.retain(|_, e| e.expires_at > now);
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.expires_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest.filter(|_| entries.len() >= self.capacity) {
                trace!("evicting cache entry");
                entries.remove(&oldest);
            }
        }

        entries.insert(key, Entry { value, expires_at });
    }

    pub fn invalidate_all(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(fingerprint: &str, content: &[u8]) -> CacheKey {
        CacheKey::new(fingerprint, blake3::hash(content))
    }

    #[test]
    fn hit_within_ttl() {
        let cache = TtlCache::new(4);
        cache.put(key("m1", b"audio"), 7, Duration::from_secs(60));
        assert_eq!(cache.get(&key("m1", b"audio")), Some(7));
    }

    #[test]
    fn fingerprint_is_part_of_the_key() {
        let cache = TtlCache::new(4);
        cache.put(key("m1", b"audio"), 7, Duration::from_secs(60));
        assert_eq!(cache.get(&key("m2", b"audio")), None);
    }

    #[test]
    fn expired_entries_are_not_served() {
        let cache = TtlCache::new(4);
        cache.put(key("m", b"a"), 1, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&key("m", b"a")), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_evicts_the_entry_closest_to_expiry() {
        let cache = TtlCache::new(2);
        cache.put(key("m", b"short"), 1, Duration::from_secs(10));
        cache.put(key("m", b"long"), 2, Duration::from_secs(100));
        cache.put(key("m", b"new"), 3, Duration::from_secs(50));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&key("m", b"short")), None);
        assert_eq!(cache.get(&key("m", b"long")), Some(2));
    }

    #[test]
    fn unrepresentable_ttl_is_not_cached() {
        let cache = TtlCache::new(2);
        cache.put(key("m", b"a"), 1, Duration::from_secs(u64::MAX));
        assert!(cache.is_empty());
        assert_eq!(cache.get(&key("m", b"a")), None);
    }

    #[test]
    fn a_poisoned_lock_keeps_serving() {
        let cache = std::sync::Arc::new(TtlCache::new(2));
        cache.put(key("m", b"a"), 1, Duration::from_secs(10));

        let held = std::sync::Arc::clone(&cache);
        let joined = std::thread::spawn(move || {
            let _guard = held.entries.lock();
            panic!("poison the cache lock");
        })
        .join();
        assert!(joined.is_err());
        assert!(cache.entries.is_poisoned());

        assert_eq!(cache.get(&key("m", b"a")), Some(1));
        cache.put(key("m", b"b"), 2, Duration::from_secs(10));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn invalidate_all_clears() {
        let cache = TtlCache::new(2);
        cache.put(key("m", b"a"), 1, Duration::from_secs(10));
        cache.invalidate_all();
        assert!(cache.is_empty());
    }
}
