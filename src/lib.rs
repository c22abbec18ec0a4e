//! blockcache: sharded in-memory LRU cache for storage-engine blocks.
//!
//! Entries carry an opaque value payload and a byte charge; the cache keeps
//! total charge within a configured budget with two-tier (high/low priority)
//! LRU eviction, while entries pinned by outstanding handles stay resident
//! even past the budget. See `DESIGN.md` for internal architecture and
//! invariants.
//!
//! ```
//! use blockcache::hash::key_fingerprint;
//! use blockcache::{Priority, ShardedLruCache};
//!
//! let cache: ShardedLruCache<Vec<u8>> = ShardedLruCache::with_capacity(8 << 20);
//! let hash = key_fingerprint(b"block/1");
//! cache.insert(b"block/1", hash, vec![1, 2, 3], 3, None, Priority::Low);
//!
//! let handle = cache.lookup(b"block/1", hash).expect("resident");
//! assert_eq!(handle.value(), &[1, 2, 3]);
//! cache.release(handle);
//! ```

pub mod builder;
pub mod cache;
pub mod error;
pub mod hash;
pub mod stats;

mod entry;
mod shard;
mod table;

pub use cache::ShardedLruCache;
pub use entry::{CacheHandle, DeleterFn, Priority};
pub use error::{CacheFull, ConfigError};
pub use stats::CacheStats;
