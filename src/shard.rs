//! Per-shard cache state machine.
//!
//! A shard composes four structures under one mutex: the chained handle
//! table, a two-pool intrusive LRU list, per-entry reference counts, and the
//! capacity accountant. Every public operation keeps all four in agreement
//! inside a single short critical section and defers destructor work (entry
//! deleters and record frees) to after the lock is released.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  LruShard<T>  =  Mutex<ShardState<T>>                                │
//! │                                                                      │
//! │  table: HandleTable          reaches every in-cache entry            │
//! │                                                                      │
//! │  LRU pools (refs == 1 entries only)                                  │
//! │                                                                      │
//! │   LOW POOL                         HIGH-PRI POOL                     │
//! │   head (warm)        tail (cold)   head (hot)         tail (warm)    │
//! │    ▼                   ▼            ▼                   ▼            │
//! │   [e_l1] ◄──► … ◄──► [e_l0]        [e_h2] ◄──► … ◄──► [e_h0]         │
//! │                        │                                │            │
//! │                        │ evict first                    │ demote to  │
//! │                        ▼                                ▼ low head   │
//! │                                                                      │
//! │  counters: usage ≥ lru_usage ≥ high_pri_pool_usage                   │
//! │  pinned (refs ≥ 2) entries: in table, on neither pool                │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The two pools realize one logical LRU order: eviction drains the low
//! pool's cold tail first and only then the high pool's tail, and demotion
//! moves the high pool's coldest entry to the low pool's warm head whenever
//! `high_pri_pool_usage` exceeds its budget. Entries are placed at the high
//! head when they were inserted `Priority::High` or have recorded a hit (and
//! a pool is configured), at the low head otherwise.
//!
//! ## Key invariants
//!
//! - An entry is on a pool list iff it is in the table with `refs == 1`.
//! - `usage` is the charge of every entry admitted and not yet fully
//!   released: an entry erased while pinned stays in `usage` until its last
//!   handle is released.
//! - After any operation returns, `usage <= capacity` unless pinned entries
//!   alone exceed capacity (the pools are then fully drained).
//! - Records are freed exactly once, with `refs == 0` and out of the table,
//!   strictly outside the mutex.

use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::entry::{CacheHandle, DeleterFn, LruEntry, Priority};
use crate::error::CacheFull;
use crate::stats::ShardStats;
use crate::table::HandleTable;

type EntryPtr<T> = NonNull<LruEntry<T>>;

/// Drops one reference. Returns `true` when the count reached zero.
#[inline]
unsafe fn unref<T>(e: EntryPtr<T>) -> bool {
    let entry = &mut *e.as_ptr();
    debug_assert!(entry.refs > 0);
    entry.refs -= 1;
    entry.refs == 0
}

pub(crate) struct LruShard<T> {
    state: Mutex<ShardState<T>>,
}

// SAFETY: all entry pointers inside a shard are reachable only through this
// shard's mutex or through handles the shard itself issued. Sending or
// sharing the shard therefore moves/shares `T` values and hands out `&T`
// across threads, which is sound exactly for `T: Send + Sync`.
unsafe impl<T: Send + Sync> Send for LruShard<T> {}
unsafe impl<T: Send + Sync> Sync for LruShard<T> {}

struct ShardState<T> {
    capacity: usize,
    strict_capacity_limit: bool,
    high_pri_pool_ratio: f64,
    high_pri_pool_capacity: usize,

    table: HandleTable<T>,

    /// Low pool: head = warm boundary, tail = coldest entry (first victim).
    low_head: Option<EntryPtr<T>>,
    low_tail: Option<EntryPtr<T>>,
    /// High-pri pool: head = hottest entry, tail = demotion boundary.
    high_head: Option<EntryPtr<T>>,
    high_tail: Option<EntryPtr<T>>,

    usage: usize,
    lru_usage: usize,
    high_pri_pool_usage: usize,

    stats: ShardStats,
}

impl<T> LruShard<T> {
    pub(crate) fn new(capacity: usize, strict_capacity_limit: bool, high_pri_pool_ratio: f64) -> Self {
        Self {
            state: Mutex::new(ShardState {
                capacity,
                strict_capacity_limit,
                high_pri_pool_ratio,
                high_pri_pool_capacity: (capacity as f64 * high_pri_pool_ratio) as usize,
                table: HandleTable::new(),
                low_head: None,
                low_tail: None,
                high_head: None,
                high_tail: None,
                usage: 0,
                lru_usage: 0,
                high_pri_pool_usage: 0,
                stats: ShardStats::default(),
            }),
        }
    }

    /// Finds and pins the entry for `(key, hash)`.
    ///
    /// A found entry leaves the LRU list (if it was evictable), gains a
    /// reference, and records its sticky hit bit. Lookups never evict.
    pub(crate) fn lookup(&self, key: &[u8], hash: u32) -> Option<CacheHandle<T>> {
        let mut state = self.state.lock();
        match state.table.lookup(key, hash) {
            Some(e) => unsafe {
                debug_assert!(e.as_ref().in_cache());
                if e.as_ref().refs == 1 {
                    state.lru_remove(e);
                }
                let entry = &mut *e.as_ptr();
                entry.refs += 1;
                entry.set_hit();
                state.stats.hits += 1;
                Some(CacheHandle::from_entry(e))
            },
            None => {
                state.stats.misses += 1;
                None
            }
        }
    }

    /// Adds a reference to an already-pinned entry, returning a second
    /// handle that must also be released.
    pub(crate) fn ref_handle(&self, handle: &CacheHandle<T>) -> CacheHandle<T> {
        let e = handle.entry();
        let mut state = self.state.lock();
        unsafe {
            if e.as_ref().in_cache() && e.as_ref().refs == 1 {
                state.lru_remove(e);
            }
            (*e.as_ptr()).refs += 1;
        }
        CacheHandle::from_entry(e)
    }

    /// Gives back one reference. Returns `true` when this was the last one
    /// and the entry was freed.
    ///
    /// When the release leaves the entry evictable while `usage > capacity`
    /// (or `force_erase` is set), the entry is erased instead of re-listed:
    /// over-capacity acts as a one-shot purge signal on every release, which
    /// can starve entries under oscillating load but bounds usage as soon as
    /// pins drain.
    pub(crate) fn release(&self, handle: CacheHandle<T>, force_erase: bool) -> bool {
        let e = handle.into_entry();
        let mut last_reference;
        {
            let mut state = self.state.lock();
            unsafe {
                last_reference = unref(e);
                if last_reference {
                    // Last handle for an entry already erased or displaced.
                    state.usage -= e.as_ref().charge;
                }
                if e.as_ref().refs == 1 && e.as_ref().in_cache() {
                    if state.usage > state.capacity || force_erase {
                        // Over capacity means eviction already drained the
                        // pools; nothing else is reclaimable.
                        debug_assert!(
                            state.usage <= state.capacity
                                || (state.low_tail.is_none() && state.high_tail.is_none())
                        );
                        state.table.remove_entry(e);
                        let entry = &mut *e.as_ptr();
                        entry.set_in_cache(false);
                        entry.refs = 0;
                        state.usage -= entry.charge;
                        last_reference = true;
                    } else {
                        state.lru_insert(e);
                    }
                }
            }
        }
        if last_reference {
            unsafe { LruEntry::free(e) };
        }
        last_reference
    }

    /// Admits an entry owned solely by the cache.
    ///
    /// Never fails: when pinned usage leaves no room even after eviction,
    /// the entry is treated as inserted and instantly evicted — it is freed
    /// immediately (deleter runs once) and a later lookup misses.
    pub(crate) fn insert(
        &self,
        key: &[u8],
        hash: u32,
        value: T,
        charge: usize,
        deleter: Option<DeleterFn<T>>,
        priority: Priority,
    ) {
        let e = LruEntry::alloc(key, hash, value, charge, deleter, priority, 1);
        let _admitted = self.insert_entry(e, false);
        debug_assert!(_admitted.is_ok());
    }

    /// Admits an entry and returns a pinned handle to it.
    ///
    /// Under a strict capacity limit, admission is refused with
    /// [`CacheFull`] when pinned usage plus `charge` would exceed capacity
    /// after eviction; the value is handed back and the deleter never runs.
    pub(crate) fn insert_pinned(
        &self,
        key: &[u8],
        hash: u32,
        value: T,
        charge: usize,
        deleter: Option<DeleterFn<T>>,
        priority: Priority,
    ) -> Result<CacheHandle<T>, CacheFull<T>> {
        let e = LruEntry::alloc(key, hash, value, charge, deleter, priority, 2);
        self.insert_entry(e, true).map(|entry| {
            let entry = entry.expect("pinned insert returns its entry");
            CacheHandle::from_entry(entry)
        })
    }

    /// Shared admission path. The record is already allocated; the lock is
    /// taken only for table/list/accounting work and every doomed record is
    /// freed after it drops.
    fn insert_entry(
        &self,
        e: EntryPtr<T>,
        want_handle: bool,
    ) -> Result<Option<EntryPtr<T>>, CacheFull<T>> {
        let mut scratch: Vec<EntryPtr<T>> = Vec::new();
        let result;
        {
            let mut state = self.state.lock();
            let charge = unsafe { e.as_ref().charge };

            state.evict_from_lru(charge, &mut scratch);

            if state.usage - state.lru_usage + charge > state.capacity
                && (state.strict_capacity_limit || !want_handle)
            {
                if want_handle {
                    // The caller keeps ownership; the record never entered
                    // the table so its deleter must not run.
                    let value = unsafe { LruEntry::into_value(e) };
                    result = Err(CacheFull(value));
                } else {
                    // Inserted-then-instantly-evicted: report success, free
                    // the record through the regular scratch path.
                    unsafe {
                        let entry = &mut *e.as_ptr();
                        entry.set_in_cache(false);
                        entry.refs = 0;
                    }
                    scratch.push(e);
                    result = Ok(None);
                }
            } else {
                unsafe {
                    if let Some(old) = state.table.insert(e) {
                        (*old.as_ptr()).set_in_cache(false);
                        if unref(old) {
                            state.usage -= (*old.as_ptr()).charge;
                            state.lru_remove(old);
                            scratch.push(old);
                        }
                        // A still-pinned displaced entry keeps its charge in
                        // usage until its last handle is released.
                    }
                    state.usage += charge;
                    state.stats.inserts += 1;
                    if want_handle {
                        result = Ok(Some(e));
                    } else {
                        state.lru_insert(e);
                        result = Ok(None);
                    }
                }
                #[cfg(debug_assertions)]
                state.debug_validate_invariants();
            }
        }
        for victim in scratch {
            unsafe { LruEntry::free(victim) };
        }
        result
    }

    /// Removes the mapping for `(key, hash)`.
    ///
    /// An unpinned entry is freed; a pinned one only loses its table
    /// presence and `IN_CACHE` bit, so the final release frees it.
    pub(crate) fn erase(&self, key: &[u8], hash: u32) {
        let mut doomed = None;
        {
            let mut state = self.state.lock();
            if let Some(e) = state.table.remove(key, hash) {
                unsafe {
                    if unref(e) {
                        if e.as_ref().in_cache() {
                            state.lru_remove(e);
                        }
                        state.usage -= e.as_ref().charge;
                        doomed = Some(e);
                    }
                    (*e.as_ptr()).set_in_cache(false);
                }
            }
        }
        if let Some(e) = doomed {
            unsafe { LruEntry::free(e) };
        }
    }

    /// Drains every evictable entry. Pinned entries are untouched.
    pub(crate) fn erase_unref_entries(&self) {
        let mut scratch = Vec::new();
        {
            let mut state = self.state.lock();
            while let Some(victim) = state.low_tail.or(state.high_tail) {
                unsafe {
                    debug_assert!(victim.as_ref().in_cache());
                    debug_assert_eq!(victim.as_ref().refs, 1);
                    state.lru_remove(victim);
                    state.table.remove_entry(victim);
                    let entry = &mut *victim.as_ptr();
                    entry.set_in_cache(false);
                    entry.refs = 0;
                    state.usage -= entry.charge;
                }
                scratch.push(victim);
            }
        }
        for e in scratch {
            unsafe { LruEntry::free(e) };
        }
    }

    /// Applies the new capacity and immediately evicts down toward it.
    /// Pinned entries can keep usage above a shrunken capacity.
    pub(crate) fn set_capacity(&self, capacity: usize) {
        let mut scratch = Vec::new();
        {
            let mut state = self.state.lock();
            state.capacity = capacity;
            state.high_pri_pool_capacity = (capacity as f64 * state.high_pri_pool_ratio) as usize;
            unsafe {
                state.maintain_pool_size();
            }
            state.evict_from_lru(0, &mut scratch);
        }
        for e in scratch {
            unsafe { LruEntry::free(e) };
        }
    }

    pub(crate) fn set_strict_capacity_limit(&self, strict: bool) {
        self.state.lock().strict_capacity_limit = strict;
    }

    /// Updates the pool ratio and demotes entries down to the new boundary.
    pub(crate) fn set_high_pri_pool_ratio(&self, ratio: f64) {
        let mut state = self.state.lock();
        state.high_pri_pool_ratio = ratio;
        state.high_pri_pool_capacity = (state.capacity as f64 * ratio) as usize;
        unsafe {
            state.maintain_pool_size();
        }
    }

    pub(crate) fn high_pri_pool_ratio(&self) -> f64 {
        self.state.lock().high_pri_pool_ratio
    }

    pub(crate) fn usage(&self) -> usize {
        self.state.lock().usage
    }

    pub(crate) fn pinned_usage(&self) -> usize {
        let state = self.state.lock();
        debug_assert!(state.usage >= state.lru_usage);
        state.usage - state.lru_usage
    }

    pub(crate) fn stats(&self) -> ShardStats {
        self.state.lock().stats
    }

    /// Runs `f(&value, charge)` over every in-cache entry, under the lock.
    pub(crate) fn apply_to_all(&self, mut f: impl FnMut(&T, usize)) {
        let state = self.state.lock();
        state.table.for_each(|e| unsafe {
            let entry = e.as_ref();
            f(&entry.value, entry.charge);
        });
    }

    /// Number of entries currently sitting on the LRU pools.
    #[cfg(any(test, debug_assertions))]
    pub(crate) fn lru_len(&self) -> usize {
        let state = self.state.lock();
        let mut n = 0;
        for head in [state.low_head, state.high_head] {
            let mut cur = head;
            while let Some(e) = cur {
                n += 1;
                cur = unsafe { e.as_ref().next };
            }
        }
        n
    }

    #[cfg(test)]
    pub(crate) fn validate(&self) {
        self.state.lock().debug_validate_invariants();
    }

    #[cfg(test)]
    pub(crate) fn high_pri_pool_usage(&self) -> usize {
        self.state.lock().high_pri_pool_usage
    }
}

impl<T> Drop for LruShard<T> {
    /// Frees every entry only the cache still references. Entries pinned by
    /// outstanding handles are leaked: their storage may still be read
    /// through those handles and there is no cache left to release into.
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let mut doomed = Vec::new();
        state.table.for_each(|e| {
            if unsafe { e.as_ref().refs } == 1 {
                doomed.push(e);
            }
        });
        for e in doomed {
            unsafe {
                let entry = &mut *e.as_ptr();
                entry.refs = 0;
                entry.set_in_cache(false);
                LruEntry::free(e);
            }
        }
    }
}

impl<T> ShardState<T> {
    /// Detaches `e` from whichever pool its flag names. Pure unlink, no
    /// accounting.
    unsafe fn detach(&mut self, e: EntryPtr<T>) {
        let (prev, next, in_high) = {
            let entry = e.as_ref();
            (entry.prev, entry.next, entry.in_high_pri_pool())
        };
        let (head, tail) = if in_high {
            (&mut self.high_head, &mut self.high_tail)
        } else {
            (&mut self.low_head, &mut self.low_tail)
        };
        match prev {
            Some(p) => (*p.as_ptr()).next = next,
            None => {
                debug_assert_eq!(*head, Some(e));
                *head = next;
            }
        }
        match next {
            Some(n) => (*n.as_ptr()).prev = prev,
            None => {
                debug_assert_eq!(*tail, Some(e));
                *tail = prev;
            }
        }
        let entry = &mut *e.as_ptr();
        entry.prev = None;
        entry.next = None;
    }

    /// Links `e` at the low pool's warm head and clears its pool flag.
    unsafe fn attach_low_head(&mut self, e: EntryPtr<T>) {
        let entry = &mut *e.as_ptr();
        entry.prev = None;
        entry.next = self.low_head;
        entry.set_in_high_pri_pool(false);
        match self.low_head {
            Some(h) => (*h.as_ptr()).prev = Some(e),
            None => self.low_tail = Some(e),
        }
        self.low_head = Some(e);
    }

    /// Links `e` at the high pool's hot head and sets its pool flag.
    unsafe fn attach_high_head(&mut self, e: EntryPtr<T>) {
        let entry = &mut *e.as_ptr();
        entry.prev = None;
        entry.next = self.high_head;
        entry.set_in_high_pri_pool(true);
        match self.high_head {
            Some(h) => (*h.as_ptr()).prev = Some(e),
            None => self.high_tail = Some(e),
        }
        self.high_head = Some(e);
    }

    /// Takes `e` off the LRU list and out of `lru_usage` (and the pool
    /// budget when it sat in the high-pri pool).
    unsafe fn lru_remove(&mut self, e: EntryPtr<T>) {
        let (charge, in_high) = {
            let entry = e.as_ref();
            (entry.charge, entry.in_high_pri_pool())
        };
        self.detach(e);
        debug_assert!(self.lru_usage >= charge);
        self.lru_usage -= charge;
        if in_high {
            debug_assert!(self.high_pri_pool_usage >= charge);
            self.high_pri_pool_usage -= charge;
        }
    }

    /// Lists an entry transitioning to evictable.
    ///
    /// High-priority placement needs a configured pool and either
    /// insert-time priority or a recorded hit; everything else enters at the
    /// low pool's warm head.
    unsafe fn lru_insert(&mut self, e: EntryPtr<T>) {
        let entry = e.as_ref();
        debug_assert!(entry.prev.is_none());
        debug_assert!(entry.next.is_none());
        let charge = entry.charge;
        if self.high_pri_pool_ratio > 0.0 && (entry.is_high_pri() || entry.has_hit()) {
            self.attach_high_head(e);
            self.high_pri_pool_usage += charge;
            self.maintain_pool_size();
        } else {
            self.attach_low_head(e);
        }
        self.lru_usage += charge;
    }

    /// Demotes the high pool's coldest entries into the low pool until the
    /// pool budget holds again.
    unsafe fn maintain_pool_size(&mut self) {
        while self.high_pri_pool_usage > self.high_pri_pool_capacity {
            let victim = match self.high_tail {
                Some(v) => v,
                None => {
                    debug_assert!(false, "high-pri pool usage outlived its entries");
                    break;
                }
            };
            self.detach(victim);
            let entry = &mut *victim.as_ptr();
            entry.set_in_high_pri_pool(false);
            debug_assert!(self.high_pri_pool_usage >= entry.charge);
            self.high_pri_pool_usage -= entry.charge;
            self.attach_low_head(victim);
        }
    }

    /// Frees room for `extra_charge` by popping cold entries until usage
    /// fits or the pools run dry. Victims leave the table and the accounting
    /// here; their storage is freed by the caller after unlock.
    fn evict_from_lru(&mut self, extra_charge: usize, scratch: &mut Vec<EntryPtr<T>>) {
        while self.usage + extra_charge > self.capacity {
            let victim = match self.low_tail.or(self.high_tail) {
                Some(v) => v,
                None => break,
            };
            unsafe {
                debug_assert!(victim.as_ref().in_cache());
                debug_assert_eq!(victim.as_ref().refs, 1);
                self.lru_remove(victim);
                self.table.remove_entry(victim);
                let entry = &mut *victim.as_ptr();
                entry.set_in_cache(false);
                entry.refs = 0;
                self.usage -= entry.charge;
            }
            self.stats.evictions += 1;
            scratch.push(victim);
        }
    }

    #[cfg(any(test, debug_assertions))]
    fn debug_validate_invariants(&self) {
        self.table.debug_validate_invariants();

        let mut listed = 0usize;
        let mut lru_total = 0usize;
        let mut high_total = 0usize;

        for (head, tail, expect_high) in [
            (self.low_head, self.low_tail, false),
            (self.high_head, self.high_tail, true),
        ] {
            let mut prev = None;
            let mut cur = head;
            while let Some(e) = cur {
                let entry = unsafe { e.as_ref() };
                assert_eq!(entry.prev, prev);
                assert_eq!(entry.in_high_pri_pool(), expect_high);
                assert!(entry.in_cache());
                assert_eq!(entry.refs, 1);
                assert_eq!(self.table.lookup(entry.key(), entry.hash), Some(e));
                lru_total += entry.charge;
                if expect_high {
                    high_total += entry.charge;
                }
                listed += 1;
                assert!(listed <= self.table.len(), "cycle detected in LRU pool");
                prev = cur;
                cur = entry.next;
            }
            assert_eq!(tail, prev);
        }

        assert_eq!(self.lru_usage, lru_total);
        assert_eq!(self.high_pri_pool_usage, high_total);
        assert!(self.lru_usage <= self.usage);
        assert!(self.high_pri_pool_usage <= self.high_pri_pool_capacity);
    }
}
