//! Default 32-bit key fingerprint.
//!
//! The cache itself never hashes keys: every operation takes the 32-bit
//! fingerprint alongside the key bytes, the router consumes its high bits and
//! the handle table its low bits. This helper is the stock fingerprint for
//! callers that have no hash of their own.

use std::hash::Hasher;

use rustc_hash::FxHasher;

/// Hashes key bytes to the 32-bit fingerprint the cache operates on.
///
/// Folds an `FxHasher` digest so that both halves of the 64-bit hash reach
/// the 32-bit result; shard routing uses the top bits and bucket selection
/// the bottom bits, so neither half may be dropped.
///
/// # Example
///
/// ```
/// use blockcache::hash::key_fingerprint;
///
/// let h = key_fingerprint(b"block/00042");
/// assert_eq!(h, key_fingerprint(b"block/00042"));
/// assert_ne!(h, key_fingerprint(b"block/00043"));
/// ```
#[inline]
pub fn key_fingerprint(key: &[u8]) -> u32 {
    let mut hasher = FxHasher::default();
    hasher.write(key);
    let h = hasher.finish();
    (h ^ (h >> 32)) as u32
}
