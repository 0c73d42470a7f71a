//! Tests for the entry cache: lifecycle, eviction, and concurrency.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::cache::{AccessMode, EntryCache};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::types::{Attribute, Entry, EntryId, NormalizedDn};

// ========== Test Helpers ==========

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn test_ndn(rdn: &str) -> NormalizedDn {
    NormalizedDn::from(format!("cn={},dc=example,dc=com", rdn.to_lowercase()).as_str())
}

fn test_entry(id: u64, rdn: &str) -> Entry {
    Entry::new(
        EntryId::new(id),
        format!("cn={rdn},dc=Example,dc=Com"),
        test_ndn(rdn),
    )
    .with_attributes(vec![Attribute::new("cn", vec![rdn.to_string()])])
}

fn new_cache(max_entries: usize) -> EntryCache {
    EntryCache::new(CacheConfig { max_entries }).expect("valid config")
}

/// Insert an entry, publish it, and return the borrow: the normal add flow.
fn add_ready(cache: &EntryCache, id: u64, rdn: &str) {
    let guard = cache
        .add(test_entry(id, rdn), AccessMode::Read)
        .expect("add succeeds");
    guard.commit();
}

// ========== Construction ==========

#[test]
fn new_rejects_zero_max_entries() {
    assert!(matches!(
        EntryCache::new(CacheConfig { max_entries: 0 }),
        Err(CacheError::Config { .. })
    ));
}

// ========== Add / Commit / Return ==========

#[test]
fn add_commit_return_publishes_entry() {
    let cache = new_cache(2);
    add_ready(&cache, 1, "alpha");

    assert_eq!(cache.len(), 1);
    assert!(cache.contains_id(EntryId::new(1)));
    assert!(cache.contains_dn(&test_ndn("alpha")));

    let guard = cache
        .find_by_id(EntryId::new(1), AccessMode::Read)
        .expect("published entry is found");
    assert_eq!(guard.id(), EntryId::new(1));
    assert_eq!(guard.ndn(), &test_ndn("alpha"));
    drop(guard);
    cache.assert_invariants();
}

#[test]
fn find_by_id_returns_same_entry_across_borrows() {
    let cache = new_cache(4);
    add_ready(&cache, 1, "alpha");

    let first = cache
        .find_by_id(EntryId::new(1), AccessMode::Write)
        .expect("found");
    let dn = first.dn().to_string();
    drop(first);

    let second = cache
        .find_by_id(EntryId::new(1), AccessMode::Read)
        .expect("found again");
    assert_eq!(second.dn(), dn);
}

#[test]
fn add_duplicate_returns_payload_to_caller() {
    let cache = new_cache(4);
    add_ready(&cache, 1, "alpha");

    let err = cache
        .add(test_entry(1, "alpha"), AccessMode::Read)
        .expect_err("duplicate rejected");
    assert!(matches!(err.kind, CacheError::Duplicate { .. }));
    assert_eq!(err.entry.id(), EntryId::new(1));
    assert_eq!(cache.len(), 1);
    cache.assert_invariants();
}

#[test]
fn add_duplicate_id_rolls_back_dn_insertion() {
    let cache = new_cache(4);
    add_ready(&cache, 1, "alpha");

    // Fresh DN, occupied id: the dn index insertion must be undone.
    let err = cache
        .add(test_entry(1, "zeta"), AccessMode::Read)
        .expect_err("duplicate id rejected");
    assert!(matches!(err.kind, CacheError::Duplicate { .. }));
    assert!(!cache.contains_dn(&test_ndn("zeta")));
    assert_eq!(cache.len(), 1);
    cache.assert_invariants();
}

#[test]
fn abandoned_add_reclaims_payload() {
    let cache = new_cache(4);
    let guard = cache
        .add(test_entry(9, "orphan"), AccessMode::Write)
        .expect("add succeeds");

    // No commit: abandoning removes the record and hands the payload back.
    let entry = guard.abandon().expect("payload reclaimed");
    assert_eq!(entry.id(), EntryId::new(9));
    assert!(cache.is_empty());
    assert!(!cache.contains_id(EntryId::new(9)));
    cache.assert_invariants();
}

#[test]
fn dropped_uncommitted_add_leaves_no_record() {
    let cache = new_cache(4);
    let guard = cache
        .add(test_entry(9, "orphan"), AccessMode::Read)
        .expect("add succeeds");
    // A plain drop abandons too. The cache never frees a payload it does
    // not own; with no caller left to receive it, ownership destroys it.
    // abandon() is the path that hands the payload back.
    drop(guard);

    assert!(cache.is_empty());
    assert!(cache.find_by_dn(&test_ndn("orphan")).is_none());
    cache.assert_invariants();
}

// ========== LRU Eviction ==========

#[test]
fn eviction_removes_least_recently_used() {
    let cache = new_cache(2);
    add_ready(&cache, 1, "a");
    assert_eq!(cache.len(), 1);

    add_ready(&cache, 2, "b");
    add_ready(&cache, 3, "c");

    // A was the LRU tail when C pushed the cache over its bound.
    assert!(!cache.contains_id(EntryId::new(1)));
    assert!(cache.contains_id(EntryId::new(2)));
    assert!(cache.contains_id(EntryId::new(3)));
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.metrics().evictions.load(std::sync::atomic::Ordering::Relaxed), 1);
    cache.assert_invariants();
}

#[test]
fn pinned_record_is_not_evicted() {
    let cache = new_cache(2);
    add_ready(&cache, 2, "b");
    add_ready(&cache, 3, "c");

    let pinned = cache
        .find_by_id(EntryId::new(2), AccessMode::Read)
        .expect("found");
    add_ready(&cache, 4, "d");

    // B is pinned; C was the unpinned tail.
    assert!(cache.contains_id(EntryId::new(2)));
    assert!(!cache.contains_id(EntryId::new(3)));
    assert!(cache.contains_id(EntryId::new(4)));
    assert_eq!(cache.len(), 2);
    drop(pinned);
    cache.assert_invariants();
}

#[test]
fn parole_pass_spares_pinned_tail() {
    let cache = new_cache(2);
    add_ready(&cache, 1, "a");
    add_ready(&cache, 2, "b");

    let pinned = cache
        .find_by_id(EntryId::new(2), AccessMode::Read)
        .expect("found");
    // Touch 1 so the pinned record sits at the tail.
    assert_eq!(cache.find_by_dn(&test_ndn("a")), Some(EntryId::new(1)));

    add_ready(&cache, 3, "c");

    // The scan paroled pinned 2 to the head and evicted unpinned 1 instead.
    assert!(cache.contains_id(EntryId::new(2)));
    assert!(!cache.contains_id(EntryId::new(1)));
    assert_eq!(cache.lru_entry_ids(), vec![EntryId::new(2), EntryId::new(3)]);
    drop(pinned);
    cache.assert_invariants();
}

#[test]
fn fully_pinned_cache_exceeds_bound_without_blocking() {
    let cache = new_cache(2);
    add_ready(&cache, 1, "a");
    add_ready(&cache, 2, "b");

    let g1 = cache.find_by_id(EntryId::new(1), AccessMode::Read).unwrap();
    let g2 = cache.find_by_id(EntryId::new(2), AccessMode::Read).unwrap();
    let g3 = cache
        .add(test_entry(3, "c"), AccessMode::Read)
        .expect("insertion succeeds with every record pinned");

    assert_eq!(cache.len(), 3);
    cache.assert_invariants();

    g3.commit();
    drop(g3);
    drop(g2);
    drop(g1);

    // The next insertion brings the cache back within bounds.
    add_ready(&cache, 4, "d");
    assert_eq!(cache.len(), 2);
    cache.assert_invariants();
}

#[test]
fn find_by_dn_refreshes_recency() {
    let cache = new_cache(2);
    add_ready(&cache, 1, "a");
    add_ready(&cache, 2, "b");

    assert_eq!(cache.find_by_dn(&test_ndn("a")), Some(EntryId::new(1)));
    add_ready(&cache, 3, "c");

    assert!(cache.contains_id(EntryId::new(1)));
    assert!(!cache.contains_id(EntryId::new(2)));
}

#[test]
fn dn_resolution_is_a_hint_not_a_pin() {
    let cache = new_cache(2);
    add_ready(&cache, 1, "a");
    let id = cache.find_by_dn(&test_ndn("a")).expect("resolved");

    // The resolved entry can be evicted before the caller pins it.
    add_ready(&cache, 2, "b");
    add_ready(&cache, 3, "c");
    add_ready(&cache, 4, "d");
    assert!(cache.find_by_id(id, AccessMode::Read).is_none());
}

// ========== Delete / Update ==========

#[test]
fn delete_removes_entry_while_borrow_outstanding() {
    let cache = new_cache(4);
    add_ready(&cache, 5, "victim");

    let guard = cache
        .find_by_id(EntryId::new(5), AccessMode::Write)
        .expect("found");
    cache.delete(&guard).expect("deleted");

    // Unlinked immediately; freed when the borrow returns.
    assert!(cache.is_empty());
    assert!(!cache.contains_id(EntryId::new(5)));
    assert_eq!(guard.id(), EntryId::new(5), "borrow still readable");
    cache.assert_invariants();

    drop(guard);
    assert!(cache.find_by_id(EntryId::new(5), AccessMode::Read).is_none());
    cache.assert_invariants();
}

#[test]
fn delete_twice_reports_not_found() {
    let cache = new_cache(4);
    add_ready(&cache, 5, "victim");

    let guard = cache
        .find_by_id(EntryId::new(5), AccessMode::Read)
        .expect("found");
    cache.delete(&guard).expect("deleted");
    assert_eq!(cache.delete(&guard), Err(CacheError::NotFound));
}

#[test]
fn update_reinserts_deleted_entry_under_new_dn() {
    let cache = new_cache(4);
    add_ready(&cache, 7, "before");

    let mut guard = cache
        .find_by_id(EntryId::new(7), AccessMode::Write)
        .expect("found");
    cache.delete(&guard).expect("deleted");

    guard
        .entry_mut()
        .expect("write borrow")
        .set_dn("cn=After,dc=Example,dc=Com", test_ndn("after"));
    cache.update(&guard).expect("re-inserted");
    guard.commit();
    drop(guard);

    assert_eq!(cache.find_by_dn(&test_ndn("after")), Some(EntryId::new(7)));
    assert!(cache.find_by_dn(&test_ndn("before")).is_none());
    assert_eq!(cache.len(), 1);
    cache.assert_invariants();
}

#[test]
fn update_rejects_occupied_dn() {
    let cache = new_cache(4);
    add_ready(&cache, 1, "shared");

    let guard = cache
        .find_by_id(EntryId::new(1), AccessMode::Write)
        .expect("found");
    cache.delete(&guard).expect("deleted");

    // The old DN is free again, and someone else takes it.
    add_ready(&cache, 2, "shared");

    assert!(matches!(
        cache.update(&guard),
        Err(CacheError::Duplicate { .. })
    ));
    drop(guard);
    assert_eq!(cache.len(), 1);
    cache.assert_invariants();
}

#[test]
fn update_rejects_occupied_id_and_rolls_back_dn() {
    let cache = new_cache(4);
    add_ready(&cache, 1, "first");

    let guard = cache
        .find_by_id(EntryId::new(1), AccessMode::Write)
        .expect("found");
    cache.delete(&guard).expect("deleted");

    // The id is re-used by a different DN before the update lands.
    add_ready(&cache, 1, "second");

    assert!(matches!(
        cache.update(&guard),
        Err(CacheError::Duplicate { .. })
    ));
    // The rolled-back update must not leave the old DN indexed.
    assert!(!cache.contains_dn(&test_ndn("first")));
    drop(guard);
    cache.assert_invariants();
}

// ========== Release All ==========

#[test]
fn release_all_keeps_pinned_records() {
    let cache = new_cache(4);
    add_ready(&cache, 1, "a");
    add_ready(&cache, 2, "b");

    let pinned = cache
        .find_by_id(EntryId::new(1), AccessMode::Read)
        .expect("found");
    assert_eq!(cache.release_all(), 1);
    assert!(cache.contains_id(EntryId::new(1)));
    assert!(!cache.contains_id(EntryId::new(2)));
    cache.assert_invariants();

    drop(pinned);
    assert_eq!(cache.release_all(), 0);
    assert!(cache.is_empty());
}

// ========== Metrics ==========

#[test]
fn metrics_count_hits_misses_and_evictions() {
    use std::sync::atomic::Ordering;

    let cache = new_cache(2);
    add_ready(&cache, 1, "a");

    assert!(cache.find_by_id(EntryId::new(1), AccessMode::Read).is_some());
    assert!(cache.find_by_id(EntryId::new(42), AccessMode::Read).is_none());
    assert!(cache.find_by_dn(&test_ndn("a")).is_some());
    assert!(cache.find_by_dn(&test_ndn("ghost")).is_none());

    add_ready(&cache, 2, "b");
    add_ready(&cache, 3, "c");

    let metrics = cache.metrics();
    assert_eq!(metrics.hits.load(Ordering::Relaxed), 2);
    assert_eq!(metrics.misses.load(Ordering::Relaxed), 2);
    assert_eq!(metrics.evictions.load(Ordering::Relaxed), 1);
    assert!((metrics.hit_rate() - 0.5).abs() < f32::EPSILON);
}

// ========== Guard API ==========

#[test]
fn read_borrow_denies_mutable_access() {
    let cache = new_cache(4);
    add_ready(&cache, 1, "a");

    let mut read = cache
        .find_by_id(EntryId::new(1), AccessMode::Read)
        .expect("found");
    assert_eq!(read.mode(), AccessMode::Read);
    assert!(read.entry_mut().is_none());
    drop(read);

    let mut write = cache
        .find_by_id(EntryId::new(1), AccessMode::Write)
        .expect("found");
    write
        .entry_mut()
        .expect("write borrow")
        .attributes_mut()
        .push(Attribute::new("description", vec!["updated".to_string()]));
    drop(write);

    let read = cache
        .find_by_id(EntryId::new(1), AccessMode::Read)
        .expect("found");
    assert_eq!(read.attributes().len(), 2, "cn plus the pushed description");
}

#[test]
fn concurrent_read_borrows_share_the_entry() {
    let cache = new_cache(4);
    add_ready(&cache, 1, "a");

    let first = cache.find_by_id(EntryId::new(1), AccessMode::Read).unwrap();
    let second = cache.find_by_id(EntryId::new(1), AccessMode::Read).unwrap();
    assert_eq!(first.id(), second.id());
    drop(first);
    drop(second);
    cache.assert_invariants();
}

// ========== Concurrency ==========

/// A lookup racing with a creation spins until the producer publishes.
#[test]
fn lookup_waits_for_creating_entry_to_publish() {
    init_tracing();
    let cache = new_cache(8);
    let producer_guard = cache
        .add(test_entry(11, "pending"), AccessMode::Write)
        .expect("add succeeds");

    let (tx, rx) = mpsc::channel();
    let seeker = {
        let cache = cache.clone();
        let ndn = test_ndn("pending");
        thread::spawn(move || {
            let resolved = cache.find_by_dn(&ndn);
            tx.send(resolved).expect("main thread alive");
        })
    };

    // The record is in `Creating` state: the seeker must not resolve it.
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    producer_guard.commit();
    drop(producer_guard);

    let resolved = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("seeker finishes after publication");
    assert_eq!(resolved, Some(EntryId::new(11)));
    seeker.join().expect("seeker thread");
}

/// A read borrow racing with a held write borrow retries instead of
/// deadlocking on the per-entry lock.
#[test]
fn lookup_retries_while_write_borrow_is_held() {
    init_tracing();
    let cache = new_cache(8);
    add_ready(&cache, 12, "busy");

    let writer = cache
        .find_by_id(EntryId::new(12), AccessMode::Write)
        .expect("found");

    let (tx, rx) = mpsc::channel();
    let reader = {
        let cache = cache.clone();
        thread::spawn(move || {
            let found = cache
                .find_by_id(EntryId::new(12), AccessMode::Read)
                .map(|guard| guard.id());
            tx.send(found).expect("main thread alive");
        })
    };

    // The writer still holds the per-entry lock: the reader must keep
    // retrying rather than complete or deadlock.
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    drop(writer);

    let found = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("reader finishes after the writer returns");
    assert_eq!(found, Some(EntryId::new(12)));
    reader.join().expect("reader thread");
}

/// Mixed operations from several threads leave every invariant intact.
#[test]
fn stress_mixed_operations_keep_invariants() {
    init_tracing();
    let cache = new_cache(8);

    let mut handles = Vec::new();
    for t in 0..4u64 {
        let cache = cache.clone();
        handles.push(thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(0xD1CE + t);
            for i in 0..500u32 {
                let raw = rng.gen_range(1..=24u64);
                let id = EntryId::new(raw);
                let rdn = format!("node-{raw}");
                match rng.gen_range(0..5) {
                    0 => {
                        // Insert; losing the race to another thread is fine.
                        match cache.add(test_entry(raw, &rdn), AccessMode::Write) {
                            Ok(guard) => {
                                guard.commit();
                                drop(guard);
                            }
                            Err(err) => drop(err.entry),
                        }
                    }
                    1 => {
                        if let Some(guard) = cache.find_by_id(id, AccessMode::Read) {
                            assert_eq!(guard.id(), id);
                        }
                    }
                    2 => {
                        if let Some(mut guard) = cache.find_by_id(id, AccessMode::Write) {
                            if let Some(entry) = guard.entry_mut() {
                                entry
                                    .attributes_mut()
                                    .push(Attribute::new("touched", vec![i.to_string()]));
                            }
                        }
                    }
                    3 => {
                        let _ = cache.find_by_dn(&test_ndn(&rdn));
                    }
                    _ => {
                        if let Some(guard) = cache.find_by_id(id, AccessMode::Write) {
                            let _ = cache.delete(&guard);
                        }
                    }
                }
            }
        }));
    }
    for handle in handles {
        handle.join().expect("worker thread");
    }

    cache.assert_invariants();
    assert_eq!(cache.release_all(), 0);
    assert!(cache.is_empty());
}
