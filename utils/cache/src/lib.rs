use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;
use std::time::Instant;

use lru::LruCache;

/// A recency-evicted cache that can be shared between tasks.
///
/// The lock is a plain mutex: every critical section is a single map
/// operation, so it is never held across an await point.
pub struct BlockingLruCache<K, V> {
    inner: Mutex<LruCache<K, V>>,
}

impl<K, V> BlockingLruCache<K, V>
where
    K: Hash + Eq,
    V: Clone,
{
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.lock().get(key).cloned()
    }

    pub fn insert(&self, key: K, value: V) {
        self.lock().put(key, value);
    }

    /// Splits `keys` into cached hits and the keys that still need fetching.
    pub fn partition<'a, I>(&self, keys: I) -> (Vec<(K, V)>, Vec<K>)
    where
        I: IntoIterator<Item = &'a K>,
        K: Clone + 'a,
    {
        let mut guard = self.lock();
        let mut hits = Vec::new();
        let mut misses = Vec::new();
        for key in keys {
            match guard.get(key) {
                Some(value) => hits.push((key.clone(), value.clone())),
                None => misses.push(key.clone()),
            }
        }
        (hits, misses)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<K, V>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct TtlEntry<V> {
    value: V,
    stored_at: Instant,
}

/// Cache whose entries expire a fixed time after insertion.
pub struct TtlCache<K, V> {
    ttl: Duration,
    max_entries: usize,
    inner: Mutex<HashMap<K, TtlEntry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get_at(key, Instant::now())
    }

    pub fn insert(&self, key: K, value: V) {
        self.insert_at(key, value, Instant::now());
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn get_at<Q>(&self, key: &Q, now: Instant) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut guard = self.lock();
        let fresh = guard
            .get(key)
            .map(|entry| now.saturating_duration_since(entry.stored_at) <= self.ttl)?;
        if fresh {
            guard.get(key).map(|entry| entry.value.clone())
        } else {
            guard.remove(key);
            None
        }
    }

    fn insert_at(&self, key: K, value: V, now: Instant) {
        let ttl = self.ttl;
        let mut guard = self.lock();
        guard.retain(|_, entry| now.saturating_duration_since(entry.stored_at) <= ttl);
        if guard.len() >= self.max_entries
            && !guard.contains_key(&key)
            && let Some(oldest) = guard
                .iter()
                .min_by_key(|(_, entry)| entry.stored_at)
                .map(|(k, _)| k.clone())
        {
            guard.remove(&oldest);
        }
        guard.insert(
            key,
            TtlEntry {
                value,
                stored_at: now,
            },
        );
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, TtlEntry<V>>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
