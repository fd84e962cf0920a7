#![forbid(unsafe_code)]
#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
//! End-to-end accounting scenarios.
//!
//! Scenarios tested:
//! 1. Concurrent `mark_key` deltas on one bucket sum order-independently.
//! 2. Device with 100 buckets, first_bucket 10: 90 available, 85 after
//!    five metadata buckets.
//! 3. Reserving 100 sectors with 50 available fails; NOFAIL overdrafts.
//! 4. Generation 5 pointer goes stale when its bucket is invalidated.
//! 5. Matched reserve/release pairs from many threads balance to zero.
//! 6. GC reuse cycle: fill, unmark, sweep, reclaim, allocate.

use lfs_buckets::config::SpaceConfig;
use lfs_buckets::mark::saturating_apply;
use lfs_buckets::usage::{SectorClass, SizeClass};
use lfs_buckets::{BucketSpace, GcPolicy, MarkContext, ReservationFlags};
use lfs_error::LfsError;
use lfs_types::{
    Bkey, BucketDataType, BucketGen, BucketNumber, DeviceIdx, Extent, ExtentPtr, JournalSeq, MemberInfo,
    ReplicaTargets,
};
use proptest::prelude::*;
use std::sync::{Arc, Barrier};

fn single_device(nbuckets: u64, first_bucket: u64, bucket_size: u32) -> BucketSpace {
    BucketSpace::new(
        SpaceConfig::default(),
        ReplicaTargets::default(),
        vec![MemberInfo::new(nbuckets, first_bucket, bucket_size)],
    )
    .unwrap()
}

fn extent_at(bucket: u64, bucket_size: u32, generation: u8) -> Bkey {
    Bkey::Extent(Extent {
        ptrs: vec![ExtentPtr {
            dev: DeviceIdx(0),
            offset: bucket * u64::from(bucket_size),
            generation: BucketGen(generation),
            cached: false,
        }],
        compression: None,
    })
}

// ---------------------------------------------------------------------------
// Scenario 1: concurrent deltas
// ---------------------------------------------------------------------------

#[test]
fn concurrent_marks_on_one_bucket_sum_exactly() {
    let space = Arc::new(single_device(16, 1, 4096));
    let key = Arc::new(extent_at(3, 4096, 0));
    let threads = 8;
    let per_thread = 500;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let space = Arc::clone(&space);
            let key = Arc::clone(&key);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                for i in 0..per_thread {
                    // Odd threads add 3 and take 1 back; even threads add 2.
                    if t % 2 == 1 {
                        space.mark_key(&key, 3, false).unwrap();
                        space.mark_key(&key, -1, false).unwrap();
                    } else {
                        space.mark_key(&key, 2, false).unwrap();
                    }
                    if i % 100 == 0 {
                        std::thread::yield_now();
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let expected = (threads * per_thread * 2) as i64;
    let mark = space.device(DeviceIdx(0)).unwrap().bucket(BucketNumber(3)).unwrap().mark();
    assert_eq!(i64::from(mark.dirty_sectors()), expected);
    assert_eq!(space.usage().get(SizeClass::Compressed, SectorClass::Dirty), expected);
    assert!(!space.gc_needed());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn delta_order_does_not_matter_below_ceiling(
        deltas in proptest::collection::vec(0_i64..200, 1..40),
        seed in any::<u64>(),
    ) {
        let space = single_device(4, 1, 1 << 16);
        let key = extent_at(2, 1 << 16, 0);

        // Apply every delta, then remove them in a shuffled order.
        let mut order: Vec<usize> = (0..deltas.len()).collect();
        let mut state = seed | 1;
        for i in (1..order.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            order.swap(i, (state % (i as u64 + 1)) as usize);
        }

        for d in &deltas {
            space.mark_key(&key, *d, false).unwrap();
        }
        let total: i64 = deltas.iter().sum();
        let max = space.config().gc_max_sectors_used;
        let dev = space.device(DeviceIdx(0)).unwrap();
        let mark = dev.bucket(BucketNumber(2)).unwrap().mark();
        prop_assert_eq!(mark.dirty_sectors(), saturating_apply(0, total, max).0);

        if total <= i64::from(max) {
            for i in order {
                space.mark_key(&key, -deltas[i], false).unwrap();
            }
            let mark = dev.bucket(BucketNumber(2)).unwrap().mark();
            prop_assert_eq!(mark.dirty_sectors(), 0);
            prop_assert_eq!(space.usage().get(SizeClass::Compressed, SectorClass::Dirty), 0);
        }
    }
}

// ---------------------------------------------------------------------------
// Scenario 2: available buckets
// ---------------------------------------------------------------------------

#[test]
fn available_buckets_after_metadata_marking() {
    let space = single_device(100, 10, 8);
    let dev = space.device(DeviceIdx(0)).unwrap();
    assert_eq!(dev.buckets_available(), 90);

    for b in 20..25 {
        dev.mark_metadata_bucket(BucketNumber(b), BucketDataType::Btree, true)
            .unwrap();
    }
    assert_eq!(dev.buckets_available(), 85);
    assert_eq!(dev.buckets_free(), 85);
}

// ---------------------------------------------------------------------------
// Scenario 3: capacity exhaustion and NOFAIL
// ---------------------------------------------------------------------------

#[test]
fn reserve_beyond_capacity() {
    // 10 usable buckets of 5 sectors.
    let space = single_device(11, 1, 5);
    assert_eq!(space.capacity(), 50);

    let err = space.disk_reservation_get(100, ReservationFlags::NONE).unwrap_err();
    assert!(matches!(err, LfsError::NoSpace));
    assert!(!err.is_fatal());
    assert_eq!(space.usage().online_reserved, 0);

    let res = space.disk_reservation_get(100, ReservationFlags::NOFAIL).unwrap();
    assert_eq!(space.usage().online_reserved, 100);
    assert!(space.sectors_used_unclamped() > space.capacity());

    // Over budget: even a small request is refused until space comes back.
    assert!(space.disk_reservation_get(1, ReservationFlags::NONE).is_err());

    space.disk_reservation_put(res);
    assert_eq!(space.usage().online_reserved, 0);
    assert_eq!(space.recalc_sectors_available(), 50);
    let small = space.disk_reservation_get(1, ReservationFlags::NONE).unwrap();
    space.disk_reservation_put(small);
}

// ---------------------------------------------------------------------------
// Scenario 4: staleness
// ---------------------------------------------------------------------------

#[test]
fn pointer_goes_stale_on_invalidate() {
    let space = single_device(32, 1, 8);
    let dev = space.device(DeviceIdx(0)).unwrap();
    dev.bucket(BucketNumber(7))
        .unwrap()
        .update(|m| m.with_generation(BucketGen(5)));

    let ptr = ExtentPtr {
        dev: DeviceIdx(0),
        offset: 7 * 8,
        generation: BucketGen(5),
        cached: false,
    };
    assert!(!space.bucket_stale(&ptr).unwrap());

    dev.invalidate_bucket(BucketNumber(7)).unwrap();
    assert_eq!(dev.bucket(BucketNumber(7)).unwrap().mark().generation(), BucketGen(6));
    assert!(space.bucket_stale(&ptr).unwrap());

    // Marks through the stale pointer no longer reach the bucket.
    let key = Bkey::Extent(Extent {
        ptrs: vec![ptr],
        compression: None,
    });
    let out = space.mark_key(&key, 8, false).unwrap();
    assert_eq!(out.stale, 1);
    assert_eq!(dev.bucket(BucketNumber(7)).unwrap().mark().dirty_sectors(), 0);
}

#[test]
fn generation_distance_of_128_is_corruption() {
    let space = single_device(8, 1, 8);
    let dev = space.device(DeviceIdx(0)).unwrap();
    dev.bucket(BucketNumber(2))
        .unwrap()
        .update(|m| m.with_generation(BucketGen(130)));
    let ptr = ExtentPtr {
        dev: DeviceIdx(0),
        offset: 16,
        generation: BucketGen(2),
        cached: false,
    };
    let err = space.bucket_stale(&ptr).unwrap_err();
    assert!(matches!(err, LfsError::Corruption { device: 0, bucket: 2, .. }));
    assert!(err.is_fatal());
}

// ---------------------------------------------------------------------------
// Scenario 5: reservation balance
// ---------------------------------------------------------------------------

#[test]
fn matched_reserve_release_balances_under_contention() {
    let space = Arc::new(single_device(1025, 1, 8));
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let space = Arc::clone(&space);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                let mut refused = 0_u32;
                for i in 0..2_000_u64 {
                    let want = 1 + (i + t as u64) % 97;
                    match space.disk_reservation_get(want, ReservationFlags::NONE) {
                        Ok(res) => {
                            assert_eq!(res.sectors(), want);
                            space.disk_reservation_put(res);
                        }
                        Err(LfsError::NoSpace) => refused += 1,
                        Err(other) => panic!("unexpected error: {other}"),
                    }
                    if i % 64 == 0 {
                        space.recalc_sectors_available();
                    }
                }
                refused
            })
        })
        .collect();
    let refused: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();

    // At most 8 * 97 sectors are ever held at once.
    assert_eq!(refused, 0);
    assert_eq!(space.usage().online_reserved, 0);
    assert_eq!(space.recalc_sectors_available(), space.capacity());
}

#[test]
fn admitted_reservations_never_exceed_capacity() {
    let space = Arc::new(single_device(101, 1, 8));
    let threads = 6;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let space = Arc::clone(&space);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                let mut held = Vec::new();
                while let Ok(res) = space.disk_reservation_get(7, ReservationFlags::NONE) {
                    held.push(res);
                }
                held
            })
        })
        .collect();
    let held: Vec<_> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();

    let total: u64 = held.iter().map(|r| r.sectors()).sum();
    assert!(total <= space.capacity());
    assert_eq!(space.usage().online_reserved as u64, total);
    for res in held {
        space.disk_reservation_put(res);
    }
    assert_eq!(space.usage().online_reserved, 0);
}

// ---------------------------------------------------------------------------
// Scenario 6: GC reuse cycle
// ---------------------------------------------------------------------------

#[test]
fn gc_reuse_cycle() {
    let space = single_device(9, 1, 16);
    let dev = space.device(DeviceIdx(0)).unwrap();

    // Fill buckets 1..=8 with one key each, journaled at seq 10 + b.
    let keys: Vec<_> = (1..=8).map(|b| extent_at(b, 16, 0)).collect();
    for (i, key) in keys.iter().enumerate() {
        let mut res = space.disk_reservation_get(16, ReservationFlags::NONE).unwrap();
        space
            .mark_key_with(
                key,
                16,
                MarkContext {
                    journal_seq: Some(JournalSeq(10 + i as u64)),
                    reservation: Some(&mut res),
                    ..MarkContext::default()
                },
            )
            .unwrap();
        assert_eq!(res.sectors(), 0);
        space.disk_reservation_put(res);
    }
    assert_eq!(dev.buckets_available(), 0);
    assert!(space.disk_reservation_get(1, ReservationFlags::NONE).is_err());

    // Overwrite frees the even buckets; the unmark is journaled at seq 30.
    for key in keys.iter().skip(1).step_by(2) {
        space
            .mark_key_with(
                key,
                -16,
                MarkContext {
                    journal_seq: Some(JournalSeq(30)),
                    ..MarkContext::default()
                },
            )
            .unwrap();
    }
    assert_eq!(dev.buckets_available(), 4);

    let live: Vec<_> = keys.iter().step_by(2).map(|k| (k, 16_i64, false)).collect();
    space.gc_sweep(live).unwrap();
    assert_eq!(space.sectors_available(), space.capacity() - 64);

    assert_eq!(space.find_reclaim_candidates(DeviceIdx(0), GcPolicy::LeastUsed).unwrap(), 4);
    assert_eq!(space.invalidate_candidates(DeviceIdx(0)).unwrap(), 4);
    assert_eq!(space.refill_free_list(DeviceIdx(0), 29).unwrap(), 0);
    assert_eq!(space.refill_free_list(DeviceIdx(0), 30).unwrap(), 4);

    let b = space.pop_free_bucket(DeviceIdx(0)).unwrap().unwrap();
    assert_eq!(b.0 % 2, 0);
    let mark = dev.bucket(b).unwrap().mark();
    assert!(mark.owned_by_allocator());
    assert_eq!(mark.generation(), BucketGen(1));
    // The old pointer into the reused bucket is now stale.
    let Bkey::Extent(old) = &keys[usize::try_from(b.0 - 1).unwrap()] else {
        unreachable!()
    };
    assert!(space.bucket_stale(&old.ptrs[0]).unwrap());
}
