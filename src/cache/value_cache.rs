//! TTL + LRU cache of table values keyed by key bytes.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Statistics for cache performance monitoring.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Total number of cache lookups
    pub lookups: u64,
    /// Number of cache hits
    pub hits: u64,
    /// Number of cache misses, expired entries included
    pub misses: u64,
    /// Number of insertions
    pub insertions: u64,
    /// Number of entries evicted for capacity
    pub evictions: u64,
    /// Number of entries dropped because their TTL elapsed
    pub expirations: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }

    /// Reset all statistics to zero
    pub fn reset(&mut self) {
        *self = CacheStats::default();
    }
}

#[derive(Debug)]
struct CachedValue {
    value: Bytes,
    expires_at: Instant,
    /// Matches the newest queue entry of this key.
    generation: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<Vec<u8>, CachedValue>,
    /// Recency order, oldest at the front. Entries whose generation no
    /// longer matches the map are stale and skipped on eviction.
    lru_queue: VecDeque<(Vec<u8>, u64)>,
    size: usize,
    next_generation: u64,
}

impl CacheState {
    fn touch(&mut self, key: &[u8]) {
        let generation = self.next_generation;
        self.next_generation += 1;
        if let Some(entry) = self.entries.get_mut(key) {
            entry.generation = generation;
            self.lru_queue.push_back((key.to_vec(), generation));
        }
        self.compact_queue();
    }

    fn remove(&mut self, key: &[u8]) -> Option<CachedValue> {
        let entry = self.entries.remove(key)?;
        self.size -= entry.value.len();
        Some(entry)
    }

    /// Evicts the least recently used live entry.
    fn evict_one(&mut self) -> bool {
        while let Some((key, generation)) = self.lru_queue.pop_front() {
            let live = self.entries.get(&key).is_some_and(|e| e.generation == generation);
            if live {
                self.remove(&key);
                return true;
            }
        }
        false
    }

    fn compact_queue(&mut self) {
        if self.lru_queue.len() > 2 * self.entries.len() + 64 {
            let entries = &self.entries;
            self.lru_queue
                .retain(|(key, generation)| entries.get(key).is_some_and(|e| e.generation == *generation));
        }
    }
}

/// Thread-safe value cache with a time-to-live and a byte capacity.
///
/// # Example
///
/// ```
/// use drhdb::cache::ValueCache;
/// use std::time::Duration;
///
/// let cache = ValueCache::new(1024, Duration::from_secs(10));
/// cache.insert(b"key", b"value");
/// assert_eq!(cache.get(b"key").as_deref(), Some(&b"value"[..]));
/// cache.invalidate(b"key");
/// assert!(cache.get(b"key").is_none());
/// ```
#[derive(Debug)]
pub struct ValueCache {
    capacity: usize,
    ttl: Duration,
    state: Mutex<CacheState>,
    stats: RwLock<CacheStats>,
}

impl ValueCache {
    /// Creates a cache holding at most `capacity` bytes of values, each for
    /// at most `ttl`. A zero capacity disables caching.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            state: Mutex::new(CacheState::default()),
            stats: RwLock::new(CacheStats::default()),
        }
    }

    /// Returns the cached value of `key` if present and not expired.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.stats.write().lookups += 1;
        if self.capacity == 0 {
            self.stats.write().misses += 1;
            return None;
        }

        let mut state = self.state.lock();
        let now = Instant::now();
        let (value, expired) = match state.entries.get(key) {
            Some(entry) if entry.expires_at > now => (Some(entry.value.clone()), false),
            Some(_) => (None, true),
            None => (None, false),
        };
        if expired {
            state.remove(key);
        } else if value.is_some() {
            state.touch(key);
        }
        drop(state);

        let mut stats = self.stats.write();
        match value {
            Some(_) => stats.hits += 1,
            None => {
                stats.misses += 1;
                if expired {
                    stats.expirations += 1;
                }
            }
        }
        value
    }

    /// Caches `value` for `key`, evicting least recently used entries to
    /// make room. Values larger than the capacity are not cached.
    pub fn insert(&self, key: &[u8], value: &[u8]) {
        if self.capacity == 0 || value.len() > self.capacity {
            return;
        }

        let mut evicted = 0;
        let mut state = self.state.lock();
        state.remove(key);
        while state.size + value.len() > self.capacity {
            if !state.evict_one() {
                break;
            }
            evicted += 1;
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        state.entries.insert(
            key.to_vec(),
            CachedValue {
                value: Bytes::copy_from_slice(value),
                expires_at: Instant::now() + self.ttl,
                generation,
            },
        );
        state.lru_queue.push_back((key.to_vec(), generation));
        state.size += value.len();
        state.compact_queue();
        drop(state);

        let mut stats = self.stats.write();
        stats.insertions += 1;
        stats.evictions += evicted;
    }

    /// Drops the cached value of `key`.
    pub fn invalidate(&self, key: &[u8]) {
        self.state.lock().remove(key);
    }

    /// Get current cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.stats.read().clone()
    }

    /// Reset cache statistics to zero.
    pub fn reset_stats(&self) {
        self.stats.write().reset();
    }

    /// Clear all entries from the cache.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.lru_queue.clear();
        state.size = 0;
    }

    /// Get the current size of cached values in bytes.
    pub fn size(&self) -> usize {
        self.state.lock().size
    }

    /// Get the cache capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the number of entries in the cache.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
