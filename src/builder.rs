//! Cache builder and parameter validation.
//!
//! The builder is the one fallible seam of the crate: shard count and pool
//! ratio are caller-configurable and checked in
//! [`try_build`](LruCacheBuilder::try_build), so every cache that exists has
//! valid parameters and no operation needs to re-validate them.
//!
//! ## Example
//!
//! ```rust
//! use blockcache::builder::LruCacheBuilder;
//!
//! let cache = LruCacheBuilder::new(64 << 20)
//!     .num_shard_bits(4)
//!     .strict_capacity_limit(true)
//!     .high_pri_pool_ratio(0.5)
//!     .try_build::<Vec<u8>>()
//!     .expect("valid parameters");
//! assert_eq!(cache.num_shards(), 16);
//! ```

use crate::cache::ShardedLruCache;
use crate::error::ConfigError;

/// Smallest capacity slice worth its own shard (and mutex).
const MIN_SHARD_SIZE: usize = 512 * 1024;

/// Derives a shard-bit count from capacity: one shard per 512 KiB, capped at
/// 6 bits (64 shards).
pub(crate) fn default_shard_bits(capacity: usize) -> u32 {
    let mut bits = 0u32;
    let mut shards = capacity / MIN_SHARD_SIZE;
    loop {
        shards >>= 1;
        if shards == 0 {
            return bits;
        }
        bits += 1;
        if bits >= 6 {
            return bits;
        }
    }
}

/// Configures and validates a [`ShardedLruCache`].
#[derive(Debug, Clone)]
pub struct LruCacheBuilder {
    capacity: usize,
    num_shard_bits: i32,
    strict_capacity_limit: bool,
    high_pri_pool_ratio: f64,
}

impl LruCacheBuilder {
    /// Starts a builder for a cache with the given total charge budget.
    ///
    /// Defaults: shard bits derived from capacity, non-strict limit, no
    /// high-priority pool.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            num_shard_bits: -1,
            strict_capacity_limit: false,
            high_pri_pool_ratio: 0.0,
        }
    }

    /// Sets log2 of the shard count. Negative keeps the capacity-derived
    /// default; values of 20 or more are rejected by `try_build`.
    pub fn num_shard_bits(mut self, bits: i32) -> Self {
        self.num_shard_bits = bits;
        self
    }

    /// Refuse pinned inserts that would push pinned usage over capacity,
    /// instead of letting usage grow past the budget.
    pub fn strict_capacity_limit(mut self, strict: bool) -> Self {
        self.strict_capacity_limit = strict;
        self
    }

    /// Fraction of each shard's capacity reserved for high-priority
    /// entries. Must be within `[0, 1]`.
    pub fn high_pri_pool_ratio(mut self, ratio: f64) -> Self {
        self.high_pri_pool_ratio = ratio;
        self
    }

    /// Validates the parameters and builds the cache.
    pub fn try_build<T>(&self) -> Result<ShardedLruCache<T>, ConfigError> {
        if self.num_shard_bits >= 20 {
            return Err(ConfigError::new(format!(
                "num_shard_bits must be < 20, got {}",
                self.num_shard_bits
            )));
        }
        if !(0.0..=1.0).contains(&self.high_pri_pool_ratio) {
            return Err(ConfigError::new(format!(
                "high_pri_pool_ratio must be in [0, 1], got {}",
                self.high_pri_pool_ratio
            )));
        }
        let shard_bits = if self.num_shard_bits < 0 {
            default_shard_bits(self.capacity)
        } else {
            self.num_shard_bits as u32
        };
        Ok(ShardedLruCache::new(
            self.capacity,
            shard_bits,
            self.strict_capacity_limit,
            self.high_pri_pool_ratio,
        ))
    }
}
