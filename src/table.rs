//! Open-chained hash table over cache entry records.
//!
//! Buckets are a power-of-two array of chain heads; entries with the same
//! `hash & (len - 1)` form a singly-linked chain through their `next_hash`
//! pointer. Matching is exact on `(hash, key bytes)` — the full 32-bit
//! fingerprint is compared before the key so chains of colliding buckets
//! stay cheap to walk.
//!
//! ## Architecture
//!
//! ```text
//!   buckets: Box<[Option<NonNull<LruEntry>>]>   (len = 2^n)
//!
//!   index:  0      1        2       3
//!          [ ]   [e_a]    [ ]    [e_c]
//!                  │               │
//!                  ▼ next_hash     ▼
//!                [e_b]           None
//!                  │
//!                  ▼
//!                None
//! ```
//!
//! The table stores pointers only — entry ownership stays with the shard,
//! which frees records through its deferred scratch list. Growth doubles the
//! bucket array (from 16) whenever the entry count exceeds the bucket count,
//! keeping average chain length at or below one; each cache entry is large,
//! so short chains are worth the resize churn.

use std::ptr::NonNull;

use crate::entry::LruEntry;

type Chain<T> = Option<NonNull<LruEntry<T>>>;

pub(crate) struct HandleTable<T> {
    buckets: Box<[Chain<T>]>,
    elems: u32,
}

impl<T> HandleTable<T> {
    pub(crate) fn new() -> Self {
        Self {
            buckets: vec![None; 16].into_boxed_slice(),
            elems: 0,
        }
    }

    /// Returns the number of entries chained into the table.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.elems as usize
    }

    /// Finds the entry matching `(hash, key)` exactly. No side effects.
    pub(crate) fn lookup(&self, key: &[u8], hash: u32) -> Option<NonNull<LruEntry<T>>> {
        let mut cur = self.buckets[hash as usize & (self.buckets.len() - 1)];
        while let Some(e) = cur {
            let entry = unsafe { e.as_ref() };
            if entry.hash == hash && entry.key() == key {
                return Some(e);
            }
            cur = entry.next_hash;
        }
        None
    }

    /// Links `e` into its bucket. If an entry with the same `(hash, key)` is
    /// already chained, `e` is spliced into its position and the displaced
    /// entry is returned for the caller to dispose of.
    pub(crate) fn insert(&mut self, mut e: NonNull<LruEntry<T>>) -> Option<NonNull<LruEntry<T>>> {
        unsafe {
            let slot = self.find_slot(e.as_ref().key(), e.as_ref().hash);
            let old = *slot;
            e.as_mut().next_hash = match old {
                Some(o) => o.as_ref().next_hash,
                None => None,
            };
            *slot = Some(e);
            if old.is_none() {
                self.elems += 1;
                if self.elems as usize > self.buckets.len() {
                    self.grow();
                }
            }
            old
        }
    }

    /// Unlinks `e` from its bucket chain by identity.
    ///
    /// Equivalent to `remove(e.key, e.hash)` for a chained entry, but never
    /// re-borrows the entry's key bytes during the chain walk, so callers
    /// may hold the entry mutably across the call.
    pub(crate) fn remove_entry(&mut self, e: NonNull<LruEntry<T>>) {
        unsafe {
            let hash = (*e.as_ptr()).hash;
            let mut slot: *mut Chain<T> = &mut self.buckets[hash as usize & (self.buckets.len() - 1)];
            while let Some(cur) = *slot {
                if cur == e {
                    *slot = (*cur.as_ptr()).next_hash;
                    self.elems -= 1;
                    return;
                }
                slot = &mut (*cur.as_ptr()).next_hash;
            }
            debug_assert!(false, "entry not chained in its bucket");
        }
    }

    /// Unlinks and returns the entry matching `(hash, key)`, if chained.
    pub(crate) fn remove(&mut self, key: &[u8], hash: u32) -> Option<NonNull<LruEntry<T>>> {
        unsafe {
            let slot = self.find_slot(key, hash);
            let old = *slot;
            if let Some(o) = old {
                *slot = o.as_ref().next_hash;
                self.elems -= 1;
            }
            old
        }
    }

    /// Visits every chained entry. The next link is read before `f` runs, so
    /// `f` may unlink or free the entry it is handed.
    pub(crate) fn for_each(&self, mut f: impl FnMut(NonNull<LruEntry<T>>)) {
        for &head in self.buckets.iter() {
            let mut cur = head;
            while let Some(e) = cur {
                cur = unsafe { e.as_ref().next_hash };
                f(e);
            }
        }
    }

    /// Returns the link slot that either points at the matching entry or is
    /// the terminating `None` of its chain. Writing through the slot splices
    /// the chain in place.
    unsafe fn find_slot(&mut self, key: &[u8], hash: u32) -> *mut Chain<T> {
        let idx = hash as usize & (self.buckets.len() - 1);
        let mut slot: *mut Chain<T> = &mut self.buckets[idx];
        while let Some(e) = *slot {
            let entry = &mut *e.as_ptr();
            if entry.hash == hash && entry.key() == key {
                break;
            }
            slot = &mut entry.next_hash;
        }
        slot
    }

    /// Rebuilds the bucket array at the smallest power of two (at least 16)
    /// that keeps `elems * 1.5` within it, relinking every chain.
    fn grow(&mut self) {
        let mut new_len = 16usize;
        while new_len * 2 < self.elems as usize * 3 {
            new_len *= 2;
        }
        let mut new_buckets = vec![None; new_len].into_boxed_slice();
        let mut moved = 0u32;
        for &head in self.buckets.iter() {
            let mut cur = head;
            while let Some(mut e) = cur {
                unsafe {
                    cur = e.as_ref().next_hash;
                    let idx = e.as_ref().hash as usize & (new_len - 1);
                    e.as_mut().next_hash = new_buckets[idx];
                    new_buckets[idx] = Some(e);
                }
                moved += 1;
            }
        }
        debug_assert_eq!(moved, self.elems);
        self.buckets = new_buckets;
    }

    #[cfg(any(test, debug_assertions))]
    pub(crate) fn debug_validate_invariants(&self) {
        assert!(self.buckets.len().is_power_of_two());
        let mask = self.buckets.len() - 1;
        let mut count = 0u32;
        for (idx, &head) in self.buckets.iter().enumerate() {
            let mut cur = head;
            while let Some(e) = cur {
                let entry = unsafe { e.as_ref() };
                assert_eq!(entry.hash as usize & mask, idx);
                count += 1;
                assert!(count <= self.elems, "cycle detected in bucket chain");
                cur = entry.next_hash;
            }
        }
        assert_eq!(count, self.elems);
    }
}
