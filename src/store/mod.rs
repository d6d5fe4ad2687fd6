//! Sharded in-memory counter store.
//!
//! Counters live in a fixed number of shards, each guarded by its own mutex.
//! Locking the shard that owns a key gives the caller exclusive access to
//! that key for the duration of one evaluation: concurrent requests for the
//! same key serialize, requests for keys in other shards proceed in
//! parallel. The guard must never be held across an await point; algorithm
//! bodies are pure integer arithmetic so the hold time is tiny.
//!
//! The cache is bounded. Under pressure only entries whose reset time has
//! already passed may be evicted; if a full shard holds nothing expired the
//! write fails with [`StoreError::AtCapacity`] rather than silently dropping
//! a live counter.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

use crate::types::Counter;

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The owning shard is full and every entry in it is still live.
    #[error("counter cache at capacity ({capacity} entries per shard) with no expired entry to evict")]
    AtCapacity {
        /// Per-shard entry bound that was hit.
        capacity: usize,
    },
}

#[derive(Debug)]
struct CacheEntry {
    counter: Counter,
    /// Unix ms after which this entry is eligible for eviction.
    expires_at: i64,
    /// Access tick for LRU ordering within the shard.
    last_access: u64,
}

#[derive(Debug, Default)]
struct Shard {
    entries: HashMap<String, CacheEntry>,
    tick: u64,
}

impl Shard {
    /// Evict the least recently used expired entry. Returns `false` when
    /// nothing in the shard has expired.
    fn evict_one_expired(&mut self, now_ms: i64) -> bool {
        let victim = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now_ms)
            .min_by_key(|(_, e)| e.last_access)
            .map(|(k, _)| k.clone());

        match victim {
            Some(key) => {
                self.entries.remove(&key);
                true
            }
            None => false,
        }
    }
}

/// Bounded, sharded mapping from counter key to counter state.
#[derive(Debug)]
pub struct CounterStore {
    shards: Vec<Mutex<Shard>>,
    shard_capacity: usize,
}

impl CounterStore {
    /// Create a store bounded at roughly `capacity` entries spread over
    /// `shards` shards.
    #[must_use]
    pub fn new(capacity: usize, shards: usize) -> Self {
        let shards = shards.max(1);
        let shard_capacity = capacity.div_ceil(shards).max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(Shard::default())).collect(),
            shard_capacity,
        }
    }

    /// Lock the shard owning `key`, granting exclusive access to it.
    pub fn guard(&self, key: &str) -> StoreGuard<'_> {
        let idx = self.shard_index(key);
        StoreGuard {
            shard: self.shards[idx].lock().expect("store shard lock poisoned"),
            capacity: self.shard_capacity,
        }
    }

    /// Snapshot of every `(key, counter)` pair across all shards.
    ///
    /// Shards are locked one at a time; the result is not a point-in-time
    /// view of the whole store.
    #[must_use]
    pub fn each(&self) -> Vec<(String, Counter)> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock().expect("store shard lock poisoned");
            out.extend(
                shard
                    .entries
                    .iter()
                    .map(|(k, e)| (k.clone(), e.counter.clone())),
            );
        }
        out
    }

    /// Drop every entry whose reset time has passed. Returns the number of
    /// entries removed.
    pub fn reap_expired(&self, now_ms: i64) -> usize {
        let mut reaped = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().expect("store shard lock poisoned");
            let before = shard.entries.len();
            shard.entries.retain(|_, e| e.expires_at > now_ms);
            reaped += before - shard.entries.len();
        }
        reaped
    }

    /// Number of cached counters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().expect("store shard lock poisoned").entries.len())
            .sum()
    }

    /// Returns `true` when no counters are cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard_index(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }
}

/// Exclusive access to one shard, scoped to a single counter evaluation.
pub struct StoreGuard<'a> {
    shard: MutexGuard<'a, Shard>,
    capacity: usize,
}

impl StoreGuard<'_> {
    /// Fetch the counter for `key`, marking it recently used.
    pub fn get(&mut self, key: &str) -> Option<&Counter> {
        self.shard.tick += 1;
        let tick = self.shard.tick;
        match self.shard.entries.get_mut(key) {
            Some(entry) => {
                entry.last_access = tick;
                Some(&entry.counter)
            }
            None => None,
        }
    }

    /// Insert or replace the counter for `key`.
    ///
    /// `expires_at` is the unix ms after which the entry may be evicted.
    ///
    /// # Errors
    ///
    /// [`StoreError::AtCapacity`] when the shard is full and holds no
    /// expired entry to make room with.
    pub fn put(
        &mut self,
        key: &str,
        counter: Counter,
        expires_at: i64,
        now_ms: i64,
    ) -> StoreResult<()> {
        self.shard.tick += 1;
        let tick = self.shard.tick;

        if let Some(entry) = self.shard.entries.get_mut(key) {
            entry.counter = counter;
            entry.expires_at = expires_at;
            entry.last_access = tick;
            return Ok(());
        }

        if self.shard.entries.len() >= self.capacity && !self.shard.evict_one_expired(now_ms) {
            return Err(StoreError::AtCapacity {
                capacity: self.capacity,
            });
        }

        self.shard.entries.insert(
            key.to_string(),
            CacheEntry {
                counter,
                expires_at,
                last_access: tick,
            },
        );
        Ok(())
    }

    /// Remove the counter for `key`, returning it if present.
    pub fn remove(&mut self, key: &str) -> Option<Counter> {
        self.shard.entries.remove(key).map(|e| e.counter)
    }
}
