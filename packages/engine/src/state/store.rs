// packages/engine/src/state/store.rs
//! Bounded, concurrently accessed, LRU-evicting keyed tables
//!
//! Every piece of cross-hook state lives in a [`KeyedStore`]. Point operations
//! are atomic per key; there are no multi-key transactions. A store may drop
//! any entry under capacity pressure, so callers must treat a miss as "no
//! redirection in effect" rather than as an error.
//!
//! # Layout
//!
//! ```text
//! LruStore (capacity C, N shards)
//! ├─ hash(key) & (N-1) ──► Shard 0: Mutex<LruCache>  (≈ C/N entries)
//! ├─                   ──► Shard 1: Mutex<LruCache>
//! └─                   ──► Shard N-1
//! ```
//!
//! Recency is tracked per shard. With a single shard the store is an exact
//! LRU of capacity C.

use ahash::RandomState;
use lru::LruCache;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::hash::{BuildHasher, Hash};
use std::num::NonZeroUsize;
use thiserror::Error;
use tracing::trace;

/// Write semantics for [`KeyedStore::update`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateFlag {
    /// Insert or overwrite
    Any,

    /// Insert only if the key is absent
    NoExist,

    /// Overwrite only if the key is present
    Exist,
}

/// Table operation failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("key already exists")]
    KeyExists,

    #[error("key not found")]
    NotFound,

    /// The backing table refused the write (capacity or contention)
    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Keyed table shared between hooks
pub trait KeyedStore<K, V>: Send + Sync {
    /// Read a value, refreshing its recency
    fn lookup(&self, key: &K) -> Option<V>;

    /// Read a value without touching recency
    fn peek(&self, key: &K) -> Option<V>;

    /// Write a value under the given semantics
    fn update(&self, key: K, value: V, flag: UpdateFlag) -> Result<(), StoreError>;

    /// Remove a value
    fn delete(&self, key: &K) -> Result<(), StoreError>;

    /// Number of live entries
    fn len(&self) -> usize;

    /// Maximum number of live entries
    fn capacity(&self) -> usize;

    /// Table name used in logs and metrics
    fn name(&self) -> &'static str;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sharded LRU table
pub struct LruStore<K, V> {
    name: &'static str,
    shards: Box<[Mutex<LruCache<K, V>>]>,
    hasher: RandomState,
    capacity: usize,
}

impl<K, V> LruStore<K, V>
where
    K: Hash + Eq + Clone + Debug,
{
    /// Create a single-shard (exact LRU) table
    pub fn new(name: &'static str, capacity: NonZeroUsize) -> Self {
        Self::with_shards(name, capacity, 1)
    }

    /// Create a table split across `shards` locks
    ///
    /// `shards` is rounded up to a power of two and capped at `capacity`.
    pub fn with_shards(name: &'static str, capacity: NonZeroUsize, shards: usize) -> Self {
        let total = capacity.get();
        // Largest power of two not above `total`
        let ceiling = 1usize << (usize::BITS - 1 - total.leading_zeros());
        let count = match shards.max(1).checked_next_power_of_two() {
            Some(count) if count <= ceiling => count,
            _ => ceiling,
        };

        let base = total / count;
        let remainder = total % count;

        let shards = (0..count)
            .map(|i| {
                let cap = base + usize::from(i < remainder);
                // base >= 1 because count <= total
                Mutex::new(LruCache::new(
                    NonZeroUsize::new(cap).unwrap_or(NonZeroUsize::MIN),
                ))
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            name,
            shards,
            hasher: RandomState::new(),
            capacity: total,
        }
    }

    /// Number of shards
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, key: &K) -> &Mutex<LruCache<K, V>> {
        let hash = self.hasher.hash_one(key) as usize;
        &self.shards[hash & (self.shards.len() - 1)]
    }

    fn record_eviction(&self, evicted: &K) {
        trace!(table = self.name, key = ?evicted, "Evicted least recently used entry");
        metrics::counter!("netredir_store_evictions_total", "table" => self.name).increment(1);
    }
}

impl<K, V> KeyedStore<K, V> for LruStore<K, V>
where
    K: Hash + Eq + Clone + Debug + Send,
    V: Clone + Send,
{
    fn lookup(&self, key: &K) -> Option<V> {
        self.shard(key).lock().get(key).cloned()
    }

    fn peek(&self, key: &K) -> Option<V> {
        self.shard(key).lock().peek(key).cloned()
    }

    fn update(&self, key: K, value: V, flag: UpdateFlag) -> Result<(), StoreError> {
        let mut shard = self.shard(&key).lock();
        let present = shard.contains(&key);

        match (flag, present) {
            (UpdateFlag::NoExist, true) => return Err(StoreError::KeyExists),
            (UpdateFlag::Exist, false) => return Err(StoreError::NotFound),
            _ => {}
        }

        if present {
            shard.put(key, value);
        } else if let Some((evicted, _)) = shard.push(key, value) {
            drop(shard);
            self.record_eviction(&evicted);
        }

        Ok(())
    }

    fn delete(&self, key: &K) -> Result<(), StoreError> {
        self.shard(key)
            .lock()
            .pop(key)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
