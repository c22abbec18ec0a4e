//! Error types for the blockcache library.
//!
//! ## Key Components
//!
//! - [`ConfigError`]: Returned when cache configuration parameters are invalid
//!   (e.g. too many shard bits, out-of-range pool ratios).
//! - [`CacheFull`]: Returned by pinned inserts under a strict capacity limit
//!   when admitting the entry would push pinned usage over capacity. Carries
//!   the rejected value back to the caller; the entry's deleter is not run.
//!
//! ## Example Usage
//!
//! ```
//! use blockcache::builder::LruCacheBuilder;
//! use blockcache::error::ConfigError;
//! use blockcache::ShardedLruCache;
//!
//! // Fallible factory for user-configurable parameters
//! let cache: Result<ShardedLruCache<String>, ConfigError> =
//!     LruCacheBuilder::new(1 << 20).num_shard_bits(4).try_build();
//! assert!(cache.is_ok());
//!
//! // Invalid ratio is caught without panicking
//! let bad = LruCacheBuilder::new(1 << 20)
//!     .high_pri_pool_ratio(2.0)
//!     .try_build::<String>();
//! assert!(bad.is_err());
//! ```

use std::fmt;

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Error returned when cache configuration parameters are invalid.
///
/// Produced by [`LruCacheBuilder::try_build`](crate::builder::LruCacheBuilder::try_build).
/// Carries a human-readable description of which parameter failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(String);

impl ConfigError {
    /// Creates a new `ConfigError` with the given description.
    #[inline]
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    /// Returns the error description.
    #[inline]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// CacheFull
// ---------------------------------------------------------------------------

/// Error returned when a pinned insert is refused under a strict capacity
/// limit.
///
/// Admission was refused because pinned usage plus the new charge would
/// exceed capacity and no unpinned entry was left to reclaim. The rejected
/// value is handed back so the caller can proceed without caching; the
/// deleter supplied with the insert is never invoked for it.
pub struct CacheFull<T>(pub T);

impl<T> CacheFull<T> {
    /// Consumes the error and returns the rejected value.
    #[inline]
    pub fn into_value(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for CacheFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CacheFull(..)")
    }
}

impl<T> fmt::Display for CacheFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("insert refused: pinned usage would exceed strict capacity limit")
    }
}

impl<T> std::error::Error for CacheFull<T> {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- ConfigError ------------------------------------------------------

    #[test]
    fn config_display_shows_message() {
        let err = ConfigError::new("num_shard_bits must be < 20");
        assert_eq!(err.to_string(), "num_shard_bits must be < 20");
    }

    #[test]
    fn config_debug_includes_message() {
        let err = ConfigError::new("bad ratio");
        let dbg = format!("{:?}", err);
        assert!(dbg.contains("bad ratio"));
    }

    #[test]
    fn config_message_accessor() {
        let err = ConfigError::new("test");
        assert_eq!(err.message(), "test");
    }

    #[test]
    fn config_clone_and_eq() {
        let a = ConfigError::new("x");
        let b = a.clone();
        assert_eq!(a, b);
    }

    #[test]
    fn config_implements_std_error() {
        fn assert_error<T: std::error::Error>() {}
        assert_error::<ConfigError>();
    }

    // -- CacheFull --------------------------------------------------------

    #[test]
    fn cache_full_returns_value() {
        let err = CacheFull(vec![1u8, 2, 3]);
        assert_eq!(err.into_value(), vec![1, 2, 3]);
    }

    #[test]
    fn cache_full_display_mentions_strict_limit() {
        let err = CacheFull(0u64);
        assert!(err.to_string().contains("strict capacity limit"));
    }

    #[test]
    fn cache_full_debug_hides_payload() {
        let err = CacheFull("secret");
        assert_eq!(format!("{:?}", err), "CacheFull(..)");
    }

    #[test]
    fn cache_full_implements_std_error() {
        fn assert_error<T: std::error::Error>() {}
        assert_error::<CacheFull<u64>>();
    }
}
