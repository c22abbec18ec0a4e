//! Operation counters.
//!
//! Each shard keeps plain counters inside its mutex (external synchronization
//! makes atomic cells unnecessary); [`CacheStats`] is the point-in-time sum
//! across shards. Counters are observational only and never feed back into
//! eviction decisions.

/// Per-shard counters, mutated only under the shard mutex.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ShardStats {
    pub(crate) hits: u64,
    pub(crate) misses: u64,
    pub(crate) inserts: u64,
    pub(crate) evictions: u64,
}

/// Aggregated counter snapshot across every shard.
///
/// Taken shard by shard, so concurrent mutators may be partially reflected;
/// each individual counter is still exact.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that found a resident entry.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Entries admitted into a shard (silent drops and strict-mode refusals
    /// are not counted).
    pub inserts: u64,
    /// Entries removed by capacity pressure (explicit erases are not
    /// counted).
    pub evictions: u64,
}

impl CacheStats {
    pub(crate) fn accumulate(&mut self, shard: ShardStats) {
        self.hits += shard.hits;
        self.misses += shard.misses;
        self.inserts += shard.inserts;
        self.evictions += shard.evictions;
    }

    /// Hit fraction over all lookups, `None` before the first lookup.
    pub fn hit_ratio(&self) -> Option<f64> {
        let lookups = self.hits + self.misses;
        (lookups > 0).then(|| self.hits as f64 / lookups as f64)
    }
}
