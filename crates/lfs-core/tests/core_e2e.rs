#![forbid(unsafe_code)]
//! End-to-end scenarios for the integrated core.
//!
//! Scenarios tested:
//! 1. A bucket emptied by a journaled delete is reused only after the
//!    journal has committed past the delete.
//! 2. Configuration loaded from a JSON file formats a working filesystem.
//! 3. Entries written to a device image are scanned back, replayed and the
//!    journal resumes numbering after them.
//! 4. Concurrent journaled key updates keep usage consistent.
//! 5. GC recounts a bucket the allocator handed out exactly once.
//! 6. A crash after recovery, before the replayed keys were written back,
//!    replays them again.
//! 7. Generation corruption found while marking turns the core read-only.

use lfs_buckets::ReservationFlags;
use lfs_buckets::usage::{SectorClass, SizeClass};
use lfs_core::{CoreFs, FileJournalWriter, LfsConfig, read_journal};
use lfs_error::LfsError;
use lfs_journal::{JournalConfig, MemWriter, plan_replay};
use lfs_types::{Bkey, BtreeId, BucketDataType, BucketGen, BucketNumber, DeviceIdx, Extent, ExtentPtr, MemberInfo};
use std::sync::{Arc, Barrier};

const BUCKET: u32 = 16;

fn config(nbuckets: u64) -> LfsConfig {
    LfsConfig {
        journal: JournalConfig {
            entry_size_max: 2048,
            ..JournalConfig::default()
        },
        members: vec![MemberInfo::new(nbuckets, 1, BUCKET)],
        journal_buckets: 4,
        ..LfsConfig::default()
    }
}

fn extent_at(sector: u64, generation: u8) -> Bkey {
    Bkey::Extent(Extent {
        ptrs: vec![ExtentPtr {
            dev: DeviceIdx(0),
            offset: sector,
            generation: BucketGen(generation),
            cached: false,
        }],
        compression: None,
    })
}

fn extent_in(bucket: u64) -> Bkey {
    extent_at(bucket * u64::from(BUCKET), 0)
}

fn image(nbuckets: u64) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dev0.img");
    std::fs::write(&path, vec![0_u8; (nbuckets * u64::from(BUCKET) * 512) as usize]).unwrap();
    (dir, path)
}

// ---------------------------------------------------------------------------
// Scenario 1: reuse waits on journal commit
// ---------------------------------------------------------------------------

#[test]
fn emptied_bucket_reused_after_commit() {
    // Data buckets are 5, 6 and 7; 5 and 6 stay dirty.
    let fs = CoreFs::format(&config(8), MemWriter::new()).unwrap();
    let s1 = fs.journal_key(BtreeId::Extents, &extent_in(5), 4, false, None).unwrap();
    fs.journal_key(BtreeId::Extents, &extent_in(6), 4, false, None).unwrap();
    fs.journal_key(BtreeId::Extents, &extent_in(7), 4, false, None).unwrap();
    fs.journal().flush().unwrap();

    // The insert into bucket 7 is still pinned, so the delete cannot be
    // trusted to survive a crash without replaying from seq 1.
    let s2 = fs.journal_key(BtreeId::Extents, &extent_in(7), -4, false, None).unwrap();
    assert!(s2 > s1);
    fs.node_flushed(s1).unwrap();
    fs.node_flushed(s1).unwrap();
    fs.node_flushed(s2).unwrap();
    // One pin on s1 left: replay would still start at s1.
    assert!(matches!(fs.allocate_bucket(DeviceIdx(0)), Err(LfsError::NoSpace)));
    let dev = fs.space().device(DeviceIdx(0)).unwrap();
    assert_eq!(dev.free_inc_len(), 1);

    fs.node_flushed(s1).unwrap();
    let nr = fs.allocate_bucket(DeviceIdx(0)).unwrap();
    assert_eq!(nr, BucketNumber(7));
    let mark = dev.bucket(nr).unwrap().mark();
    assert_eq!(mark.generation(), BucketGen(1));
    assert!(mark.owned_by_allocator());
    assert!(fs.journal().last_seq_ondisk() >= s2);

    // A pointer carrying the old generation is now stale.
    assert!(fs.space().bucket_stale(&ExtentPtr {
        dev: DeviceIdx(0),
        offset: 7 * u64::from(BUCKET),
        generation: BucketGen(0),
        cached: false,
    })
    .unwrap());
}

// ---------------------------------------------------------------------------
// Scenario 2: JSON configuration
// ---------------------------------------------------------------------------

#[test]
fn json_file_config_formats() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lfs.json");
    std::fs::write(
        &path,
        r#"{
            "members": [
                {"nbuckets": 64, "first_bucket": 1, "bucket_size": 32},
                {"nbuckets": 64, "first_bucket": 1, "bucket_size": 32, "has_metadata": false}
            ],
            "replicas": {"data": 2, "metadata": 1},
            "journal": {"entry_size_max": 8192, "write_delay_ms": 10},
            "space": {"reserve_overhead_shift": 6},
            "journal_buckets": 6
        }"#,
    )
    .unwrap();

    let cfg = LfsConfig::from_json_file(&path).unwrap();
    assert_eq!(cfg.journal.write_delay_ms, 10);
    assert_eq!(cfg.journal.reclaim_delay_ms, JournalConfig::default().reclaim_delay_ms);
    assert_eq!(cfg.space.reserve_overhead_shift, 6);

    let fs = CoreFs::format(&cfg, MemWriter::new()).unwrap();
    let stats = fs.stats();
    assert_eq!(stats.devices.len(), 2);
    assert_eq!(stats.devices[0].buckets_meta, 6);
    assert_eq!(stats.devices[1].buckets_meta, 0);
    assert_eq!(stats.journal.seq_ondisk, 0);
    let json = serde_json::to_string(&stats).unwrap();
    assert!(json.contains("\"journal\""));

    let mut bad = cfg;
    bad.journal_device = 1;
    assert!(matches!(CoreFs::format(&bad, MemWriter::new()), Err(LfsError::InvalidConfig(_))));
}

// ---------------------------------------------------------------------------
// Scenario 3: file-backed journal, recovery
// ---------------------------------------------------------------------------

#[test]
fn image_journal_recovers_and_resumes() {
    let cfg = config(32);
    let (_dir, path) = image(32);

    let keys = [extent_in(10), extent_in(11), extent_at(12 * u64::from(BUCKET) + 3, 0)];
    let ring = {
        let fs = CoreFs::format(&cfg, FileJournalWriter::open(&path, BUCKET).unwrap()).unwrap();
        for key in &keys {
            let seq = fs.journal_key(BtreeId::Extents, key, 2, false, None).unwrap();
            fs.journal().flush().unwrap();
            fs.node_flushed(seq).unwrap();
        }
        // Blacklist a seq the journal has not reached yet, as for a node
        // written by an entry that was lost.
        let ahead = fs.journal().seq() + 2;
        assert!(fs
            .journal()
            .seq_should_ignore(ahead, BtreeId::Extents, lfs_types::Bpos::new(1, 0))
            .unwrap());
        fs.journal().flush_meta().unwrap();
        assert!(fs.journal().writer().stats().writes >= 4);
        fs.journal().ring()
    };

    let writer = FileJournalWriter::open(&path, BUCKET).unwrap();
    let found = read_journal(writer.file(), &ring).unwrap();
    assert!(found.len() >= 4);
    let newest = found.iter().map(|(_, j)| j.seq).max().unwrap();

    let (fs, plan) = CoreFs::recover(&cfg, writer, found).unwrap();
    assert!(plan.is_complete());
    assert_eq!(plan.start_seq, newest + 1);
    assert!(!plan.blacklisted.is_empty());

    // Entries behind last_seq were dropped; every replayed key is one we wrote.
    let decoded = plan.decoded().unwrap();
    for (_, entry) in &decoded {
        for key in &entry.keys {
            assert!(keys.contains(key));
        }
    }

    // Usage is recounted from the live keys, not from the journal.
    fs.gc_sweep(keys.iter().map(|k| (k, 2_i64, false))).unwrap();
    let dev = fs.space().device(DeviceIdx(0)).unwrap();
    assert_eq!(dev.bucket(BucketNumber(10)).unwrap().mark().dirty_sectors(), 2);
    assert_eq!(dev.bucket(BucketNumber(1)).unwrap().mark().data_type(), BucketDataType::Journal);
    fs.replay_done(&plan).unwrap();

    let seq = fs.journal_key(BtreeId::Inodes, &Bkey::Reservation { nr_replicas: 1 }, 8, false, None).unwrap();
    assert_eq!(seq, plan.start_seq);
    fs.journal().flush().unwrap();
    fs.node_flushed(seq).unwrap();
}

// ---------------------------------------------------------------------------
// Scenario 4: concurrent journaled updates
// ---------------------------------------------------------------------------

#[test]
fn concurrent_journal_keys_balance() {
    let fs = Arc::new(CoreFs::format(&config(64), Arc::new(MemWriter::new())).unwrap());
    let threads = 4_u64;
    let per_thread = 200_u64;
    let barrier = Arc::new(Barrier::new(threads as usize));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let fs = Arc::clone(&fs);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                let key = extent_in(10 + t);
                for i in 0..per_thread {
                    let delta = if i % 2 == 0 { 3 } else { -3 };
                    let seq = fs.journal_key(BtreeId::Extents, &key, delta, false, None).unwrap();
                    fs.node_flushed(seq).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    fs.journal().flush().unwrap();

    let dev = fs.space().device(DeviceIdx(0)).unwrap();
    for t in 0..threads {
        assert_eq!(dev.bucket(BucketNumber(10 + t)).unwrap().mark().dirty_sectors(), 0);
    }
    assert_eq!(dev.usage().sectors_dirty, 0);
    let stats = fs.journal().stats();
    assert_eq!(stats.pinned_seqs, 0);
    let keys: usize = fs
        .journal()
        .writer()
        .jsets()
        .iter()
        .map(|j| j.entries().unwrap().iter().map(|e| e.keys.len()).sum::<usize>())
        .sum();
    assert_eq!(keys as u64, threads * per_thread);
}

// ---------------------------------------------------------------------------
// Scenario 5: GC over allocator-owned buckets
// ---------------------------------------------------------------------------

#[test]
fn gc_recounts_allocated_bucket_once() {
    let fs = CoreFs::format(&config(16), MemWriter::new()).unwrap();
    let dev = fs.space().device(DeviceIdx(0)).unwrap();
    let nr = fs.allocate_bucket(DeviceIdx(0)).unwrap();
    let generation = dev.bucket(nr).unwrap().mark().generation();
    let key = extent_at(nr.0 * u64::from(BUCKET), generation.0);
    let seq = fs.journal_key(BtreeId::Extents, &key, 8, false, None).unwrap();
    fs.journal().flush().unwrap();
    fs.node_flushed(seq).unwrap();

    for _ in 0..3 {
        fs.gc_sweep([(&key, 8_i64, false)]).unwrap();
        assert_eq!(dev.bucket(nr).unwrap().mark().dirty_sectors(), 8);
        assert_eq!(dev.usage().sectors_dirty, 8);
        assert_eq!(fs.stats().usage.get(SizeClass::Compressed, SectorClass::Dirty), 8);
    }
    assert!(dev.bucket(nr).unwrap().mark().owned_by_allocator());

    fs.release_bucket(DeviceIdx(0), nr).unwrap();
    fs.gc_sweep([(&key, 8_i64, false)]).unwrap();
    let mark = dev.bucket(nr).unwrap().mark();
    assert!(!mark.owned_by_allocator());
    assert_eq!(mark.dirty_sectors(), 8);
}

// ---------------------------------------------------------------------------
// Scenario 6: crash, recover, write, crash
// ---------------------------------------------------------------------------

#[test]
fn second_crash_replays_unflushed_keys_again() {
    let cfg = config(32);
    let (_dir, path) = image(32);
    let first = [extent_in(10), extent_in(11)];
    let ring = {
        let fs = CoreFs::format(&cfg, FileJournalWriter::open(&path, BUCKET).unwrap()).unwrap();
        for key in &first {
            fs.journal_key(BtreeId::Extents, key, 2, false, None).unwrap();
            fs.journal().flush().unwrap();
        }
        // Crash with neither btree node written.
        fs.journal().ring()
    };

    let writer = FileJournalWriter::open(&path, BUCKET).unwrap();
    let found = read_journal(writer.file(), &ring).unwrap();
    let (fs, plan) = CoreFs::recover(&cfg, writer, found).unwrap();
    assert_eq!((plan.last_seq, plan.start_seq, plan.entries.len()), (1, 3, 2));

    let third = extent_in(12);
    let seq = fs.journal_key(BtreeId::Extents, &third, 2, false, None).unwrap();
    assert_eq!(seq, 3);
    fs.journal().flush().unwrap();
    assert_eq!(fs.journal().last_seq_ondisk(), plan.last_seq);
    drop(fs);

    // Second crash: the replayed keys never reached a btree node either.
    let writer = FileJournalWriter::open(&path, BUCKET).unwrap();
    let found = read_journal(writer.file(), &ring).unwrap();
    let (fs, plan) = CoreFs::recover(&cfg, writer, found).unwrap();
    assert!(plan.is_complete());
    assert_eq!(plan.last_seq, 1);
    let keys: Vec<Bkey> = plan.decoded().unwrap().into_iter().flat_map(|(_, e)| e.keys).collect();
    assert_eq!(keys, vec![first[0].clone(), first[1].clone(), third]);

    // Written back now: the next entry moves the replay start past them.
    fs.replay_done(&plan).unwrap();
    fs.journal().flush_meta().unwrap();
    assert_eq!(fs.journal().seq_ondisk(), 4);
    assert_eq!(fs.journal().last_seq_ondisk(), 4);
    let found = read_journal(fs.journal().writer().file(), &ring).unwrap();
    let plan = plan_replay(found.into_iter().map(|(_, j)| j));
    assert_eq!(plan.entries.iter().map(|j| j.seq).collect::<Vec<_>>(), vec![4]);
}

// ---------------------------------------------------------------------------
// Scenario 7: read-only after corruption
// ---------------------------------------------------------------------------

#[test]
fn generation_corruption_turns_read_only() {
    let fs = CoreFs::format(&config(16), MemWriter::new()).unwrap();
    let mut res = fs.disk_reservation_get(4, ReservationFlags::NONE).unwrap();

    // Bucket 10 is at generation 0; a pointer 128 generations away is
    // neither live nor stale.
    let bad = extent_at(10 * u64::from(BUCKET), 128);
    let err = fs.journal_key(BtreeId::Extents, &bad, 4, false, None).unwrap_err();
    assert!(matches!(err, LfsError::Corruption { .. }));
    assert!(fs.is_read_only());
    assert!(fs.stats().read_only);

    assert!(matches!(
        fs.journal_key(BtreeId::Extents, &extent_in(11), 4, false, None),
        Err(LfsError::ReadOnly)
    ));
    assert!(matches!(fs.allocate_bucket(DeviceIdx(0)), Err(LfsError::ReadOnly)));
    assert!(matches!(
        fs.disk_reservation_get(1, ReservationFlags::NONE),
        Err(LfsError::ReadOnly)
    ));
    assert!(matches!(
        fs.disk_reservation_add(&mut res, 1, ReservationFlags::NONE),
        Err(LfsError::ReadOnly)
    ));
    let dev = fs.space().device(DeviceIdx(0)).unwrap();
    assert_eq!(dev.bucket(BucketNumber(11)).unwrap().mark().dirty_sectors(), 0);

    // What was reserved can still be handed back, and what was journaled
    // still reaches disk.
    fs.disk_reservation_put(res);
    fs.journal().flush().unwrap();
}
