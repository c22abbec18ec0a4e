//! Cache entry record and the opaque pinned handle.
//!
//! An entry is one heap-allocated record holding the key bytes, the caller's
//! value payload, accounting metadata, and two sets of intrusive links: a
//! singly-linked hash-bucket chain (`next_hash`) and doubly-linked LRU links
//! (`prev`/`next`) that are only valid while the entry sits on a pool list.
//!
//! ## Architecture
//!
//! ```text
//!   LruEntry<T> (Box-allocated, linked by NonNull)
//!   ┌───────────┬──────────────────────────────────────────────┐
//!   │ next_hash │ bucket chain within the handle table         │
//!   │ prev/next │ LRU pool links (valid only while evictable)  │
//!   │ value     │ caller payload, owned by the entry           │
//!   │ deleter   │ fn(&[u8], &mut T), run once on free          │
//!   │ charge    │ byte weight summed into shard usage          │
//!   │ key       │ owned key bytes                              │
//!   │ hash      │ caller-supplied 32-bit fingerprint           │
//!   │ refs      │ 1 = cache only (evictable), ≥2 = pinned      │
//!   │ flags     │ IN_CACHE | IS_HIGH_PRI | IN_HIGH_PRI_POOL    │
//!   │           │ | HAS_HIT                                    │
//!   └───────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Lifecycle: allocated before the shard lock is taken, freed only when
//! `refs == 0` and `IN_CACHE` is clear, always outside the shard lock. The
//! deleter (if any) runs exactly once, immediately before the record and its
//! payload drop.

use std::fmt;
use std::ptr::NonNull;

/// Per-entry destruction callback, invoked with the key bytes and the value
/// right before the record's storage is released.
pub type DeleterFn<T> = fn(key: &[u8], value: &mut T);

/// Insertion priority of an entry.
///
/// `High` admits the entry directly into the high-priority pool (when a pool
/// is configured); `Low` entries are only promoted after their first lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Place in the high-priority pool on first listing.
    High,
    /// Place in the low-priority pool until the entry records a hit.
    Low,
}

const IN_CACHE: u8 = 1 << 0;
const IS_HIGH_PRI: u8 = 1 << 1;
const IN_HIGH_PRI_POOL: u8 = 1 << 2;
const HAS_HIT: u8 = 1 << 3;

/// One cache record. Pointers first for a compact hot prefix.
#[repr(C)]
pub(crate) struct LruEntry<T> {
    pub(crate) next_hash: Option<NonNull<LruEntry<T>>>,
    pub(crate) prev: Option<NonNull<LruEntry<T>>>,
    pub(crate) next: Option<NonNull<LruEntry<T>>>,
    pub(crate) value: T,
    pub(crate) deleter: Option<DeleterFn<T>>,
    pub(crate) charge: usize,
    pub(crate) key: Box<[u8]>,
    pub(crate) hash: u32,
    pub(crate) refs: u32,
    flags: u8,
}

impl<T> LruEntry<T> {
    /// Allocates a fresh record and leaks it as a raw pointer.
    ///
    /// `refs` is 1 when only the cache will hold it, 2 when a pinned handle
    /// is also being returned. The entry starts `IN_CACHE` with no hit.
    pub(crate) fn alloc(
        key: &[u8],
        hash: u32,
        value: T,
        charge: usize,
        deleter: Option<DeleterFn<T>>,
        priority: Priority,
        refs: u32,
    ) -> NonNull<LruEntry<T>> {
        let mut entry = Box::new(LruEntry {
            next_hash: None,
            prev: None,
            next: None,
            value,
            deleter,
            charge,
            key: key.into(),
            hash,
            refs,
            flags: IN_CACHE,
        });
        entry.set_priority(priority);
        // Box never returns null.
        unsafe { NonNull::new_unchecked(Box::into_raw(entry)) }
    }

    /// Frees a record: runs the deleter once, then drops the payload and the
    /// key storage.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from [`LruEntry::alloc`], must not be reachable
    /// from any table, list, or handle, and must not be freed again.
    pub(crate) unsafe fn free(ptr: NonNull<LruEntry<T>>) {
        let mut entry = Box::from_raw(ptr.as_ptr());
        debug_assert_eq!(entry.refs, 0);
        debug_assert!(!entry.in_cache());
        if let Some(deleter) = entry.deleter {
            deleter(&entry.key, &mut entry.value);
        }
    }

    /// Reclaims a record without running the deleter, handing the payload
    /// back. Used when a strict-mode insert is refused and the caller keeps
    /// ownership of the value.
    ///
    /// # Safety
    ///
    /// Same reachability requirements as [`LruEntry::free`].
    pub(crate) unsafe fn into_value(ptr: NonNull<LruEntry<T>>) -> T {
        let entry = Box::from_raw(ptr.as_ptr());
        entry.value
    }

    #[inline]
    pub(crate) fn key(&self) -> &[u8] {
        &self.key
    }

    #[inline]
    pub(crate) fn in_cache(&self) -> bool {
        self.flags & IN_CACHE != 0
    }

    #[inline]
    pub(crate) fn set_in_cache(&mut self, in_cache: bool) {
        if in_cache {
            self.flags |= IN_CACHE;
        } else {
            self.flags &= !IN_CACHE;
        }
    }

    #[inline]
    pub(crate) fn is_high_pri(&self) -> bool {
        self.flags & IS_HIGH_PRI != 0
    }

    #[inline]
    pub(crate) fn set_priority(&mut self, priority: Priority) {
        match priority {
            Priority::High => self.flags |= IS_HIGH_PRI,
            Priority::Low => self.flags &= !IS_HIGH_PRI,
        }
    }

    #[inline]
    pub(crate) fn in_high_pri_pool(&self) -> bool {
        self.flags & IN_HIGH_PRI_POOL != 0
    }

    #[inline]
    pub(crate) fn set_in_high_pri_pool(&mut self, in_pool: bool) {
        if in_pool {
            self.flags |= IN_HIGH_PRI_POOL;
        } else {
            self.flags &= !IN_HIGH_PRI_POOL;
        }
    }

    #[inline]
    pub(crate) fn has_hit(&self) -> bool {
        self.flags & HAS_HIT != 0
    }

    /// Sticky: set on any lookup, never cleared for the entry's lifetime.
    #[inline]
    pub(crate) fn set_hit(&mut self) {
        self.flags |= HAS_HIT;
    }
}

/// Opaque token granting pinned access to a cache entry.
///
/// While a handle exists, the entry's storage stays valid and the entry is
/// immune to eviction — even if it is erased or displaced from the cache in
/// the meantime. A handle must be given back via
/// [`ShardedLruCache::release`](crate::cache::ShardedLruCache::release);
/// dropping one without releasing it pins the entry forever (its charge stays
/// in usage and its storage is never freed).
///
/// Handles compare by identity, not by key: two lookups of the same key yield
/// tokens for the same entry only while that entry stays resident.
pub struct CacheHandle<T> {
    entry: NonNull<LruEntry<T>>,
}

// SAFETY: a handle is a counted reference to an immutable-for-readers entry,
// so moving or sharing it across threads is sound exactly when sharing &T is:
// T must be Send + Sync. The refcount itself is only mutated under the shard
// mutex.
unsafe impl<T: Send + Sync> Send for CacheHandle<T> {}
unsafe impl<T: Send + Sync> Sync for CacheHandle<T> {}

impl<T> CacheHandle<T> {
    #[inline]
    pub(crate) fn from_entry(entry: NonNull<LruEntry<T>>) -> Self {
        Self { entry }
    }

    #[inline]
    pub(crate) fn into_entry(self) -> NonNull<LruEntry<T>> {
        self.entry
    }

    #[inline]
    pub(crate) fn entry(&self) -> NonNull<LruEntry<T>> {
        self.entry
    }

    /// Returns the pinned value.
    #[inline]
    pub fn value(&self) -> &T {
        // SAFETY: the handle holds a reference count, so the entry outlives
        // the handle; value is never mutated while reachable from a handle.
        unsafe { &self.entry.as_ref().value }
    }

    /// Returns the entry's byte charge.
    #[inline]
    pub fn charge(&self) -> usize {
        unsafe { self.entry.as_ref().charge }
    }

    /// Returns the entry's 32-bit key fingerprint.
    #[inline]
    pub fn hash(&self) -> u32 {
        unsafe { self.entry.as_ref().hash }
    }

    /// Returns the entry's key bytes.
    #[inline]
    pub fn key(&self) -> &[u8] {
        unsafe { self.entry.as_ref().key() }
    }
}

impl<T> fmt::Debug for CacheHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheHandle")
            .field("hash", &self.hash())
            .field("charge", &self.charge())
            .finish_non_exhaustive()
    }
}
