//! Sharded cache router.
//!
//! A [`ShardedLruCache`] is a fixed array of `2^k` independent shards, each
//! behind its own mutex, padded to a cache line so neighboring shard locks
//! never share one. Every operation routes by the *high* bits of the
//! caller-supplied hash — bucket selection inside a shard's table uses the
//! low bits, so the two stay independent — and the router itself holds no
//! entry state beyond a small parameter snapshot.
//!
//! ## Architecture
//!
//! ```text
//!                    hash (u32)
//!                    ┌─────────┬────────────────────┐
//!                    │ high k  │ low bits           │
//!                    └────┬────┴─────────┬──────────┘
//!                         │              └──► bucket = hash & (len-1)
//!                         ▼
//!   shards: Box<[CachePadded<LruShard>; 2^k]>
//!   ┌──────────┬──────────┬──────────┬──────────┐
//!   │ shard 0  │ shard 1  │  …       │ shard N  │   per-shard capacity =
//!   │ mutex    │ mutex    │          │ mutex    │   ceil(total / 2^k)
//!   └──────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Aggregate reads (`usage`, `pinned_usage`, `stats`) visit shards one at a
//! time; they are exact per shard and approximate across the whole cache
//! under concurrent writers, which is the only meaningful guarantee a
//! sharded design can give.
//!
//! ## Example
//!
//! ```
//! use blockcache::hash::key_fingerprint;
//! use blockcache::{Priority, ShardedLruCache};
//!
//! let cache: ShardedLruCache<Vec<u8>> = ShardedLruCache::with_capacity(1 << 20);
//!
//! let key = b"table/7/block/42";
//! let hash = key_fingerprint(key);
//! cache.insert(key, hash, vec![0u8; 4096], 4096, None, Priority::Low);
//!
//! let handle = cache.lookup(key, hash).expect("resident");
//! assert_eq!(handle.value().len(), 4096);
//! cache.release(handle);
//! ```

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::entry::{CacheHandle, DeleterFn, Priority};
use crate::error::{CacheFull, ConfigError};
use crate::shard::LruShard;
use crate::stats::CacheStats;

struct RouterState {
    capacity: usize,
    strict_capacity_limit: bool,
}

/// Sharded two-pool LRU cache with byte-charge accounting and pinning.
///
/// Entries are keyed by `(key bytes, 32-bit hash)`; the hash is supplied by
/// the caller on every operation (see [`crate::hash::key_fingerprint`] for
/// the stock choice) and must be stable for a given key. Handles returned by
/// [`lookup`](Self::lookup) and [`insert_pinned`](Self::insert_pinned) pin
/// their entry until [`release`](Self::release)d; a dropped-but-unreleased
/// handle pins its entry forever.
pub struct ShardedLruCache<T> {
    shards: Box<[CachePadded<LruShard<T>>]>,
    shard_bits: u32,
    state: Mutex<RouterState>,
}

impl<T> ShardedLruCache<T> {
    /// Builds a cache with default parameters: shard count derived from
    /// capacity, non-strict limit, no high-priority pool.
    ///
    /// Use [`LruCacheBuilder`](crate::builder::LruCacheBuilder) to configure
    /// the rest.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(capacity, crate::builder::default_shard_bits(capacity), false, 0.0)
    }

    /// Assembles the shard array. Parameters are pre-validated by the
    /// builder: `shard_bits < 20`, ratio within `[0, 1]`.
    pub(crate) fn new(
        capacity: usize,
        shard_bits: u32,
        strict_capacity_limit: bool,
        high_pri_pool_ratio: f64,
    ) -> Self {
        let num_shards = 1usize << shard_bits;
        let per_shard = capacity.div_ceil(num_shards);
        let shards = (0..num_shards)
            .map(|_| {
                CachePadded::new(LruShard::new(
                    per_shard,
                    strict_capacity_limit,
                    high_pri_pool_ratio,
                ))
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            shard_bits,
            state: Mutex::new(RouterState {
                capacity,
                strict_capacity_limit,
            }),
        }
    }

    #[inline]
    fn shard(&self, hash: u32) -> &LruShard<T> {
        let index = if self.shard_bits == 0 {
            0
        } else {
            (hash >> (32 - self.shard_bits)) as usize
        };
        &self.shards[index]
    }

    /// Number of shards the keyspace is split across.
    #[inline]
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Total configured charge budget.
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Whether pinned inserts are refused rather than allowed to exceed
    /// capacity.
    pub fn strict_capacity_limit(&self) -> bool {
        self.state.lock().strict_capacity_limit
    }

    /// Admits an entry owned solely by the cache. Never fails: when no room
    /// can be reclaimed the entry is freed immediately, as if inserted and
    /// instantly evicted.
    pub fn insert(
        &self,
        key: &[u8],
        hash: u32,
        value: T,
        charge: usize,
        deleter: Option<DeleterFn<T>>,
        priority: Priority,
    ) {
        self.shard(hash).insert(key, hash, value, charge, deleter, priority);
    }

    /// Admits an entry and pins it, returning a handle.
    ///
    /// Fails with [`CacheFull`] only under a strict capacity limit when
    /// pinned usage plus `charge` cannot fit after eviction; the value rides
    /// back in the error and its deleter is not invoked.
    pub fn insert_pinned(
        &self,
        key: &[u8],
        hash: u32,
        value: T,
        charge: usize,
        deleter: Option<DeleterFn<T>>,
        priority: Priority,
    ) -> Result<CacheHandle<T>, CacheFull<T>> {
        self.shard(hash)
            .insert_pinned(key, hash, value, charge, deleter, priority)
    }

    /// Finds and pins the entry for `(key, hash)`.
    pub fn lookup(&self, key: &[u8], hash: u32) -> Option<CacheHandle<T>> {
        self.shard(hash).lookup(key, hash)
    }

    /// Adds a reference to a pinned entry, returning a second handle that
    /// must also be released.
    pub fn ref_handle(&self, handle: &CacheHandle<T>) -> CacheHandle<T> {
        self.shard(handle.hash()).ref_handle(handle)
    }

    /// Gives back one reference. Returns `true` when this was the last
    /// reference and the entry was freed.
    pub fn release(&self, handle: CacheHandle<T>) -> bool {
        self.release_with(handle, false)
    }

    /// [`release`](Self::release) with an explicit erase request: when the
    /// release leaves no other reference, the entry is dropped from the
    /// cache instead of returning to the LRU list.
    pub fn release_with(&self, handle: CacheHandle<T>, force_erase: bool) -> bool {
        self.shard(handle.hash()).release(handle, force_erase)
    }

    /// Removes the mapping for `(key, hash)`. Pinned entries lose residency
    /// immediately but are freed by their final release.
    pub fn erase(&self, key: &[u8], hash: u32) {
        self.shard(hash).erase(key, hash);
    }

    /// Drains every evictable entry from every shard. Pinned entries stay.
    pub fn erase_unref_entries(&self) {
        for shard in self.shards.iter() {
            shard.erase_unref_entries();
        }
    }

    /// Re-budgets the cache, splitting the new capacity evenly and evicting
    /// each shard down toward its slice.
    pub fn set_capacity(&self, capacity: usize) {
        // The router lock orders concurrent re-budgets; shards re-lock
        // individually.
        let mut state = self.state.lock();
        state.capacity = capacity;
        let per_shard = capacity.div_ceil(self.shards.len());
        for shard in self.shards.iter() {
            shard.set_capacity(per_shard);
        }
    }

    /// Toggles the strict capacity limit on every shard.
    pub fn set_strict_capacity_limit(&self, strict: bool) {
        let mut state = self.state.lock();
        state.strict_capacity_limit = strict;
        for shard in self.shards.iter() {
            shard.set_strict_capacity_limit(strict);
        }
    }

    /// Re-budgets the high-priority pool on every shard, demoting entries
    /// down to the new boundary.
    pub fn set_high_pri_pool_ratio(&self, ratio: f64) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&ratio) {
            return Err(ConfigError::new(format!(
                "high_pri_pool_ratio must be in [0, 1], got {ratio}"
            )));
        }
        for shard in self.shards.iter() {
            shard.set_high_pri_pool_ratio(ratio);
        }
        Ok(())
    }

    /// Fraction of each shard's capacity reserved for the high-pri pool.
    pub fn high_pri_pool_ratio(&self) -> f64 {
        self.shards[0].high_pri_pool_ratio()
    }

    /// Total charge of in-cache entries, pinned and unpinned, across shards.
    pub fn usage(&self) -> usize {
        self.shards.iter().map(|shard| shard.usage()).sum()
    }

    /// Total charge of pinned entries across shards.
    pub fn pinned_usage(&self) -> usize {
        self.shards.iter().map(|shard| shard.pinned_usage()).sum()
    }

    /// Counter snapshot summed over shards.
    pub fn stats(&self) -> CacheStats {
        let mut total = CacheStats::default();
        for shard in self.shards.iter() {
            total.accumulate(shard.stats());
        }
        total
    }

    /// Runs `f(&value, charge)` over every in-cache entry, one shard lock at
    /// a time.
    pub fn apply_to_all(&self, mut f: impl FnMut(&T, usize)) {
        for shard in self.shards.iter() {
            shard.apply_to_all(&mut f);
        }
    }

    /// Leaks the whole cache for fast shutdown: no shard is destroyed and no
    /// deleter runs. Outstanding handles stay readable forever.
    pub fn disown_data(self) {
        std::mem::forget(self);
    }

    /// Number of entries sitting on LRU lists across shards.
    #[cfg(any(test, debug_assertions))]
    pub fn lru_len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lru_len()).sum()
    }
}

impl<T> std::fmt::Debug for ShardedLruCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedLruCache")
            .field("num_shards", &self.num_shards())
            .field("capacity", &self.capacity())
            .field("usage", &self.usage())
            .field("pinned_usage", &self.pinned_usage())
            .finish_non_exhaustive()
    }
}
