//! Garbage collection: recount, reclaim-candidate selection and free lists.
//!
//! A pass ([`BucketSpace::gc_begin`] .. [`GcPass::finish`]) holds the GC lock
//! exclusively, zeroes the sector counts GC is about to recompute, re-marks
//! every live key and then recalculates the reservation budget. It also
//! rebuilds each device's `oldest_gens` table, which is what makes the
//! "most stale" policy meaningful.
//!
//! Bucket reuse runs in three steps per device:
//!
//! 1. [`BucketSpace::find_reclaim_candidates`] scans available buckets into
//!    the bounded heap.
//! 2. [`BucketSpace::invalidate_candidates`] bumps their generation and
//!    queues them on `free_inc`.
//! 3. [`BucketSpace::refill_free_list`] moves buckets whose last journal
//!    update is on disk from `free_inc` to `free`, where
//!    [`BucketSpace::pop_free_bucket`] hands them out.

use crate::heap::HeapOrder;
use crate::usage::{SectorClass, SizeClass};
use crate::{BucketSpace, MarkOutcome};
use lfs_error::Result;
use lfs_types::{Bkey, BucketDataType, BucketNumber, DeviceIdx};
use parking_lot::RwLockWriteGuard;
use serde::Serialize;
use tracing::{debug, info, trace};

/// Which buckets to reclaim first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GcPolicy {
    /// Fewest sectors in use: cheapest to reclaim.
    #[default]
    LeastUsed,
    /// Largest distance between the bucket's generation and the oldest
    /// pointer into it: reclaiming these keeps generations inside the
    /// wraparound window.
    MostStale,
}

impl GcPolicy {
    fn order(self) -> HeapOrder {
        match self {
            Self::LeastUsed => HeapOrder::KeepLowest,
            Self::MostStale => HeapOrder::KeepHighest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct GcStats {
    pub buckets_scanned: u64,
    pub keys_marked: u64,
    pub ptrs_stale: u64,
}

/// An in-progress GC pass. Holds the GC lock exclusively until finished or
/// dropped.
#[must_use = "a GC pass blocks key marking until finished"]
pub struct GcPass<'a> {
    space: &'a BucketSpace,
    _lock: RwLockWriteGuard<'a, ()>,
    stats: GcStats,
}

impl std::fmt::Debug for GcPass<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcPass").field("stats", &self.stats).finish_non_exhaustive()
    }
}

impl GcPass<'_> {
    /// Re-mark one live key.
    pub fn mark_key(&mut self, key: &Bkey, sectors: i64, metadata: bool) -> Result<MarkOutcome> {
        let out = self.space.gc_mark_key(key, sectors, metadata)?;
        self.stats.keys_marked += 1;
        self.stats.ptrs_stale += u64::from(out.stale);
        Ok(out)
    }

    /// Recalculate the reservation budget, clear the saturation flag and
    /// release the GC lock.
    pub fn finish(self) -> GcStats {
        self.space.clear_gc_needed();
        let available = {
            let _recalc = self.space.recalc_lock.lock();
            self.space.recalc_locked()
        };
        info!(
            target: "lfs::gc",
            buckets_scanned = self.stats.buckets_scanned,
            keys_marked = self.stats.keys_marked,
            ptrs_stale = self.stats.ptrs_stale,
            available,
            "gc_pass_done"
        );
        self.stats
    }
}

impl BucketSpace {
    /// Start a GC pass.
    ///
    /// Waits for in-flight key marking, then zeroes sector counts of every
    /// data or btree bucket and resets the filesystem counters GC
    /// recomputes. Buckets the allocator owns are zeroed too and stay owned:
    /// keys written into them are part of the live set. Journal and
    /// superblock buckets are not derived from keys and keep their marks.
    pub fn gc_begin(&self) -> GcPass<'_> {
        let lock = self.gc_lock.write();
        let mut stats = GcStats::default();

        for dev in &self.devices {
            for (nr, bucket) in dev.usable_buckets() {
                let (_, new) = bucket.update(|m| {
                    if !matches!(
                        m.data_type(),
                        BucketDataType::Unused | BucketDataType::Data | BucketDataType::Btree
                    ) {
                        return m;
                    }
                    m.with_dirty_sectors(0)
                        .with_cached_sectors(0)
                        .with_data_type(BucketDataType::Unused)
                });
                dev.reset_oldest_gen(nr, new.generation());
                stats.buckets_scanned += 1;
            }
        }
        self.usage.reset_for_gc();

        debug!(target: "lfs::gc", buckets = stats.buckets_scanned, "gc_pass_begin");
        GcPass {
            space: self,
            _lock: lock,
            stats,
        }
    }

    /// Run a whole pass over `live`: `(key, sectors, metadata)` for every key
    /// currently referenced by the btrees.
    pub fn gc_sweep<'k, I>(&self, live: I) -> Result<GcStats>
    where
        I: IntoIterator<Item = (&'k Bkey, i64, bool)>,
    {
        let mut pass = self.gc_begin();
        for (key, sectors, metadata) in live {
            pass.mark_key(key, sectors, metadata)?;
        }
        Ok(pass.finish())
    }

    /// Refill `dev`'s candidate heap. Returns the number of candidates.
    pub fn find_reclaim_candidates(&self, dev: DeviceIdx, policy: GcPolicy) -> Result<usize> {
        let device = self.device(dev)?;
        let mut heap = device.heap.lock();
        heap.reset(policy.order());

        for (nr, bucket) in device.usable_buckets() {
            let m = bucket.mark();
            if !m.is_available() {
                continue;
            }
            let score = match policy {
                GcPolicy::LeastUsed => u64::from(m.sectors_used()),
                GcPolicy::MostStale => u64::from(device.bucket_gc_gen(nr)),
            };
            heap.push(nr, score);
        }

        debug!(
            target: "lfs::gc",
            device = dev.0,
            ?policy,
            candidates = heap.len(),
            "reclaim_candidates"
        );
        Ok(heap.len())
    }

    /// Invalidate heap candidates, best first, until `free_inc` is full.
    ///
    /// A candidate that stopped being available since the scan is skipped.
    /// Cached sectors in an invalidated bucket are gone; the filesystem
    /// cached counter drops with them. Returns the number invalidated.
    pub fn invalidate_candidates(&self, dev: DeviceIdx) -> Result<usize> {
        let device = self.device(dev)?;
        let candidates = device.heap.lock().drain_best_first();
        let mut free_inc = device.free_inc.lock();
        let mut invalidated = 0;

        for entry in candidates {
            if free_inc.len() >= self.config.free_list_capacity {
                break;
            }
            let bucket = device.bucket(entry.bucket)?;
            let result = bucket.try_update(|m| if m.is_available() { Ok(m.invalidated()) } else { Err(()) });
            let Ok((old, new)) = result else {
                trace!(target: "lfs::gc", device = dev.0, bucket = entry.bucket.0, "candidate_raced");
                continue;
            };
            let cached = i64::from(old.cached_sectors());
            self.usage.add(SizeClass::Compressed, SectorClass::Cached, -cached);
            free_inc.push_back(entry.bucket);
            invalidated += 1;
            trace!(
                target: "lfs::gc",
                device = dev.0,
                bucket = entry.bucket.0,
                new_gen = new.generation().0,
                "bucket_invalidate"
            );
        }

        debug!(target: "lfs::gc", device = dev.0, invalidated, "invalidate_candidates");
        Ok(invalidated)
    }

    /// Move invalidated buckets whose last journal update is on disk onto the
    /// ready free list. Returns the number moved.
    pub fn refill_free_list(&self, dev: DeviceIdx, last_seq_ondisk: u16) -> Result<usize> {
        let device = self.device(dev)?;
        let mut free_inc = device.free_inc.lock();
        let mut free = device.free.lock();
        let mut moved = 0;
        let mut waiting = std::collections::VecDeque::with_capacity(free_inc.len());

        while let Some(nr) = free_inc.pop_front() {
            let ready = free.len() < self.config.free_list_capacity
                && device
                    .bucket(nr)
                    .is_ok_and(|b| !b.mark().needs_journal_commit(last_seq_ondisk));
            if ready {
                free.push_back(nr);
                moved += 1;
            } else {
                waiting.push_back(nr);
            }
        }
        *free_inc = waiting;

        trace!(
            target: "lfs::gc",
            device = dev.0,
            moved,
            waiting = free_inc.len(),
            last_seq_ondisk,
            "free_list_refill"
        );
        Ok(moved)
    }

    /// Take one bucket from `dev`'s ready free list.
    pub fn pop_free_bucket(&self, dev: DeviceIdx) -> Result<Option<BucketNumber>> {
        let device = self.device(dev)?;
        let Some(nr) = device.free.lock().pop_front() else {
            return Ok(None);
        };
        device.mark_alloc_bucket(nr, true)?;
        trace!(target: "lfs::gc", device = dev.0, bucket = nr.0, "bucket_pop");
        Ok(Some(nr))
    }
}
