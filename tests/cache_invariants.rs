// ==============================================
// END-TO-END BEHAVIORAL TESTS (integration)
// ==============================================
//
// Exercises the public cache API: residency, eviction order, pinning,
// admission policy, the two-pool discipline, accounting, and deleter
// lifecycles. Single-shard caches make eviction order deterministic; the
// router module carries its own multi-shard coverage and a section below
// checks cross-shard aggregation.

use std::sync::atomic::{AtomicUsize, Ordering};

use blockcache::builder::LruCacheBuilder;
use blockcache::hash::key_fingerprint;
use blockcache::{CacheHandle, Priority, ShardedLruCache};

fn h(key: &str) -> u32 {
    key_fingerprint(key.as_bytes())
}

/// Single-shard cache: one global LRU order, deterministic scenarios.
fn single_shard(capacity: usize, strict: bool, ratio: f64) -> ShardedLruCache<String> {
    LruCacheBuilder::new(capacity)
        .num_shard_bits(0)
        .strict_capacity_limit(strict)
        .high_pri_pool_ratio(ratio)
        .try_build()
        .expect("valid parameters")
}

fn insert(cache: &ShardedLruCache<String>, key: &str, charge: usize) {
    cache.insert(
        key.as_bytes(),
        h(key),
        format!("value-{key}"),
        charge,
        None,
        Priority::Low,
    );
}

fn pin(cache: &ShardedLruCache<String>, key: &str, charge: usize) -> CacheHandle<String> {
    cache
        .insert_pinned(
            key.as_bytes(),
            h(key),
            format!("value-{key}"),
            charge,
            None,
            Priority::Low,
        )
        .expect("admission")
}

fn resident(cache: &ShardedLruCache<String>, key: &str) -> bool {
    match cache.lookup(key.as_bytes(), h(key)) {
        Some(handle) => {
            cache.release(handle);
            true
        }
        None => false,
    }
}

// ==============================================
// Residency and LRU order
// ==============================================

mod residency {
    use super::*;

    #[test]
    fn third_insert_evicts_the_coldest() {
        // capacity 100: A(40), B(40), C(40) evicts A; usage settles at 80.
        let cache = single_shard(100, false, 0.0);
        insert(&cache, "a", 40);
        insert(&cache, "b", 40);
        insert(&cache, "c", 40);

        assert!(!resident(&cache, "a"));
        assert!(resident(&cache, "b"));
        assert!(resident(&cache, "c"));
        assert_eq!(cache.usage(), 80);
    }

    #[test]
    fn lookup_and_release_refresh_recency() {
        let cache = single_shard(4, false, 0.0);
        for key in ["a", "b", "c", "d"] {
            insert(&cache, key, 1);
        }
        assert!(resident(&cache, "a"));
        assert!(resident(&cache, "b"));

        insert(&cache, "e", 1);
        insert(&cache, "f", 1);
        // c and d were the coldest after a and b were touched.
        assert!(!resident(&cache, "c"));
        assert!(!resident(&cache, "d"));
        assert!(resident(&cache, "a"));
        assert!(resident(&cache, "b"));
    }

    #[test]
    fn lookup_returns_the_inserted_value_until_erase() {
        let cache = single_shard(100, false, 0.0);
        insert(&cache, "k", 10);

        let handle = cache.lookup(b"k", h("k")).expect("resident");
        assert_eq!(handle.value(), "value-k");
        assert_eq!(handle.charge(), 10);
        assert_eq!(handle.key(), b"k");
        cache.release(handle);

        cache.erase(b"k", h("k"));
        assert!(cache.lookup(b"k", h("k")).is_none());
    }

    #[test]
    fn reinserting_a_key_replaces_its_value() {
        let cache = single_shard(100, false, 0.0);
        insert(&cache, "k", 10);
        cache.insert(b"k", h("k"), "replacement".into(), 15, None, Priority::Low);

        let handle = cache.lookup(b"k", h("k")).expect("resident");
        assert_eq!(handle.value(), "replacement");
        cache.release(handle);
        assert_eq!(cache.usage(), 15);
    }
}

// ==============================================
// Pinning
// ==============================================

mod pinning {
    use super::*;

    #[test]
    fn pinned_entry_survives_insert_pressure() {
        // capacity 100: pinned A(40) stays while B/C drain from the LRU to
        // make room; usage ends at A + D = 80.
        let cache = single_shard(100, false, 0.0);
        let ha = pin(&cache, "a", 40);
        insert(&cache, "b", 40);
        insert(&cache, "c", 40);
        insert(&cache, "d", 40);

        assert_eq!(ha.value(), "value-a");
        assert!(!resident(&cache, "b"));
        assert!(!resident(&cache, "c"));
        assert!(resident(&cache, "d"));
        assert_eq!(cache.usage(), 80);
        assert_eq!(cache.pinned_usage(), 40);
        cache.release(ha);
    }

    #[test]
    fn handle_stays_valid_across_erase() {
        let cache = single_shard(100, false, 0.0);
        let handle = pin(&cache, "a", 10);

        cache.erase(b"a", h("a"));
        assert!(cache.lookup(b"a", h("a")).is_none());
        // The charge stays accounted until the final release.
        assert_eq!(handle.value(), "value-a");
        assert_eq!(cache.usage(), 10);

        assert!(cache.release(handle));
        assert_eq!(cache.usage(), 0);
    }

    #[test]
    fn pins_alone_can_exceed_capacity() {
        let cache = single_shard(50, false, 0.0);
        let ha = pin(&cache, "a", 40);
        let hb = pin(&cache, "b", 40);
        assert_eq!(cache.usage(), 80);
        assert_eq!(cache.pinned_usage(), 80);

        // Release while over budget erases rather than re-listing.
        assert!(cache.release(ha));
        assert!(!resident(&cache, "a"));
        assert!(!cache.release(hb));
        assert!(resident(&cache, "b"));
        assert_eq!(cache.usage(), 40);
    }

    #[test]
    fn ref_handle_adds_an_independent_pin() {
        let cache = single_shard(100, false, 0.0);
        let first = pin(&cache, "a", 10);
        let second = cache.ref_handle(&first);

        assert!(!cache.release(first));
        assert_eq!(cache.pinned_usage(), 10);
        assert_eq!(second.value(), "value-a");

        assert!(!cache.release(second));
        assert_eq!(cache.pinned_usage(), 0);
        assert!(resident(&cache, "a"));
    }

    #[test]
    fn release_with_force_erase_drops_the_entry() {
        let cache = single_shard(100, false, 0.0);
        let handle = pin(&cache, "a", 10);
        assert!(cache.release_with(handle, true));
        assert!(!resident(&cache, "a"));
        assert_eq!(cache.usage(), 0);
    }
}

// ==============================================
// Admission policy
// ==============================================

mod admission {
    use super::*;

    #[test]
    fn strict_mode_refuses_pinned_insert_and_returns_the_value() {
        // capacity 50, A(40) pinned: a pinned B(30) cannot fit.
        let cache = single_shard(50, true, 0.0);
        let ha = pin(&cache, "a", 40);

        let err = cache
            .insert_pinned(b"b", h("b"), "payload".into(), 30, None, Priority::Low)
            .unwrap_err();
        assert_eq!(err.into_value(), "payload");
        assert_eq!(cache.usage(), 40);
        cache.release(ha);
    }

    #[test]
    fn handle_free_insert_without_room_is_dropped_with_one_deleter_call() {
        static DELETED: AtomicUsize = AtomicUsize::new(0);
        fn deleter(key: &[u8], _: &mut String) {
            assert_eq!(key, b"b");
            DELETED.fetch_add(1, Ordering::SeqCst);
        }

        // capacity 50, A(40) pinned, non-strict: B(30) reports success but
        // is freed immediately.
        let cache = single_shard(50, false, 0.0);
        let ha = pin(&cache, "a", 40);
        cache.insert(b"b", h("b"), "v".into(), 30, Some(deleter), Priority::Low);

        assert!(!resident(&cache, "b"));
        assert_eq!(cache.usage(), 40);
        assert_eq!(DELETED.load(Ordering::SeqCst), 1);
        cache.release(ha);
    }

    #[test]
    fn non_strict_pinned_insert_overshoots_instead_of_failing() {
        let cache = single_shard(50, false, 0.0);
        let ha = pin(&cache, "a", 40);
        let hb = cache
            .insert_pinned(b"b", h("b"), "v".into(), 30, None, Priority::Low)
            .expect("non-strict admission");
        assert_eq!(cache.usage(), 70);
        cache.release(ha);
        cache.release(hb);
    }
}

// ==============================================
// Two-pool discipline
// ==============================================

mod priority_pools {
    use super::*;

    fn insert_high(cache: &ShardedLruCache<String>, key: &str, charge: usize) {
        cache.insert(
            key.as_bytes(),
            h(key),
            format!("value-{key}"),
            charge,
            None,
            Priority::High,
        );
    }

    #[test]
    fn fifth_high_pri_insert_demotes_and_evicts_the_coldest() {
        // ratio 0.5, capacity 100: four HIGH entries of 25 fill the cache
        // with a 50-charge pool; the fifth evicts the oldest entirely.
        let cache = single_shard(100, false, 0.5);
        for key in ["h1", "h2", "h3", "h4"] {
            insert_high(&cache, key, 25);
        }
        assert_eq!(cache.usage(), 100);

        insert_high(&cache, "h5", 25);
        assert!(!resident(&cache, "h1"));
        for key in ["h2", "h3", "h4", "h5"] {
            assert!(resident(&cache, key));
        }
        assert_eq!(cache.usage(), 100);
    }

    #[test]
    fn demoted_high_pri_entries_stay_resident() {
        // Pool budget 25: the second HIGH insert pushes the first across
        // the boundary, not out of the cache.
        let cache = single_shard(100, false, 0.25);
        insert_high(&cache, "h1", 25);
        insert_high(&cache, "h2", 25);
        assert!(resident(&cache, "h1"));
        assert!(resident(&cache, "h2"));
        assert_eq!(cache.usage(), 50);
    }

    #[test]
    fn low_pri_churn_cannot_flush_a_promoted_entry() {
        // A LOW entry promotes on its first hit and then outlives low-pool
        // churn that would have evicted it under pure LRU.
        let cache = single_shard(100, false, 0.5);
        insert(&cache, "hot", 20);
        assert!(resident(&cache, "hot"));

        for i in 0..6 {
            insert(&cache, &format!("scan-{i}"), 40);
        }
        assert!(resident(&cache, "hot"));
        assert!(!resident(&cache, "scan-0"));
    }

    #[test]
    fn without_a_pool_priority_is_ignored() {
        let cache = single_shard(2, false, 0.0);
        insert_high(&cache, "high", 1);
        insert(&cache, "x", 1);
        insert(&cache, "y", 1);
        // Pure LRU: the HIGH entry was the coldest and is gone.
        assert!(!resident(&cache, "high"));
    }

    #[test]
    fn ratio_updates_apply_to_a_live_cache() {
        let cache = single_shard(100, false, 0.5);
        insert_high(&cache, "h1", 20);
        insert_high(&cache, "h2", 20);
        assert!(cache.set_high_pri_pool_ratio(0.1).is_ok());
        assert!(cache.set_high_pri_pool_ratio(-0.5).is_err());
        // Demotion keeps both resident.
        assert!(resident(&cache, "h1"));
        assert!(resident(&cache, "h2"));
    }
}

// ==============================================
// Capacity management
// ==============================================

mod capacity {
    use super::*;

    #[test]
    fn shrinking_capacity_evicts_down() {
        let cache = single_shard(100, false, 0.0);
        insert(&cache, "a", 40);
        insert(&cache, "b", 40);
        cache.set_capacity(50);
        assert_eq!(cache.capacity(), 50);
        assert!(!resident(&cache, "a"));
        assert!(resident(&cache, "b"));
    }

    #[test]
    fn pinned_usage_ignores_a_shrunken_budget() {
        let cache = single_shard(100, false, 0.0);
        let ha = pin(&cache, "a", 60);
        cache.set_capacity(10);
        assert_eq!(cache.usage(), 60);
        // The release itself observes over-capacity and erases.
        assert!(cache.release(ha));
        assert_eq!(cache.usage(), 0);
    }

    #[test]
    fn erase_unref_entries_spares_pins() {
        let cache = single_shard(100, false, 0.0);
        let handle = pin(&cache, "pinned", 10);
        insert(&cache, "x", 10);
        insert(&cache, "y", 10);

        cache.erase_unref_entries();
        assert_eq!(cache.usage(), 10);
        assert!(!resident(&cache, "x"));
        assert_eq!(handle.value(), "value-pinned");
        cache.release(handle);
    }

    #[test]
    fn strict_limit_can_be_toggled_at_runtime() {
        let cache = single_shard(50, false, 0.0);
        let ha = pin(&cache, "a", 40);
        cache.set_strict_capacity_limit(true);
        assert!(cache
            .insert_pinned(b"b", h("b"), "v".into(), 30, None, Priority::Low)
            .is_err());
        cache.set_strict_capacity_limit(false);
        let hb = cache
            .insert_pinned(b"b", h("b"), "v".into(), 30, None, Priority::Low)
            .expect("limit lifted");
        cache.release(ha);
        cache.release(hb);
    }
}

// ==============================================
// Deleter lifecycle
// ==============================================

mod deleters {
    use super::*;

    #[test]
    fn deleter_runs_exactly_once_after_the_last_release() {
        static DELETED: AtomicUsize = AtomicUsize::new(0);
        fn deleter(_: &[u8], _: &mut String) {
            DELETED.fetch_add(1, Ordering::SeqCst);
        }

        let cache = single_shard(100, false, 0.0);
        let first = cache
            .insert_pinned(b"a", h("a"), "v".into(), 10, Some(deleter), Priority::Low)
            .unwrap();
        let second = cache.ref_handle(&first);

        cache.erase(b"a", h("a"));
        assert_eq!(DELETED.load(Ordering::SeqCst), 0);
        assert!(!cache.release(first));
        assert_eq!(DELETED.load(Ordering::SeqCst), 0);
        assert!(cache.release(second));
        assert_eq!(DELETED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn every_inserted_entry_is_deleted_exactly_once_by_drop() {
        static DELETED: AtomicUsize = AtomicUsize::new(0);
        fn deleter(_: &[u8], _: &mut String) {
            DELETED.fetch_add(1, Ordering::SeqCst);
        }

        {
            let cache = single_shard(5, false, 0.0);
            for i in 0..20 {
                let key = format!("k{i}");
                cache.insert(key.as_bytes(), h(&key), "v".into(), 1, Some(deleter), Priority::Low);
            }
            // 15 already evicted, 5 still resident.
            assert_eq!(DELETED.load(Ordering::SeqCst), 15);
        }
        assert_eq!(DELETED.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn disown_data_leaks_instead_of_deleting() {
        static DELETED: AtomicUsize = AtomicUsize::new(0);
        fn deleter(_: &[u8], _: &mut String) {
            DELETED.fetch_add(1, Ordering::SeqCst);
        }

        let cache = single_shard(100, false, 0.0);
        cache.insert(b"a", h("a"), "v".into(), 10, Some(deleter), Priority::Low);
        cache.disown_data();
        assert_eq!(DELETED.load(Ordering::SeqCst), 0);
    }
}

// ==============================================
// Router aggregation and accounting
// ==============================================

mod router {
    use super::*;

    #[test]
    fn shards_split_the_keyspace_and_the_budget() {
        let cache: ShardedLruCache<String> = LruCacheBuilder::new(1000)
            .num_shard_bits(2)
            .try_build()
            .expect("valid parameters");
        assert_eq!(cache.num_shards(), 4);

        for i in 0..200 {
            let key = format!("block/{i}");
            cache.insert(key.as_bytes(), h(&key), "v".into(), 1, None, Priority::Low);
        }
        // 200 unit charges against 4 shards of 250 each: nothing evicts.
        assert_eq!(cache.usage(), 200);
        for i in 0..200 {
            assert!(resident(&cache, &format!("block/{i}")));
        }
    }

    #[test]
    fn usage_matches_the_sum_of_resident_charges() {
        // Roomy budget: even a fully skewed shard holds every charge.
        let cache: ShardedLruCache<String> = LruCacheBuilder::new(100_000)
            .num_shard_bits(3)
            .try_build()
            .expect("valid parameters");
        for i in 0..100usize {
            let key = format!("k{i}");
            cache.insert(key.as_bytes(), h(&key), "v".into(), i + 1, None, Priority::Low);
        }

        let mut total = 0usize;
        let mut count = 0usize;
        cache.apply_to_all(|_, charge| {
            total += charge;
            count += 1;
        });
        assert_eq!(count, 100);
        assert_eq!(total, cache.usage());
        assert_eq!(cache.pinned_usage(), 0);
    }

    #[test]
    fn stats_reflect_hits_misses_and_evictions() {
        let cache = single_shard(3, false, 0.0);
        for key in ["a", "b", "c", "d"] {
            insert(&cache, key, 1);
        }
        assert!(resident(&cache, "d"));
        assert!(!resident(&cache, "a"));

        let stats = cache.stats();
        assert_eq!(stats.inserts, 4);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_ratio(), Some(0.5));
    }
}
