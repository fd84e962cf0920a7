//! Per-device bucket array, usage reduction and bucket state transitions.

use crate::config::SpaceConfig;
use crate::heap::{BucketHeap, HeapOrder};
use crate::mark::{Bucket, BucketMark, gen_after};
use lfs_error::{LfsError, Result};
use lfs_types::{BucketDataType, BucketGen, BucketNumber, DeviceIdx, ExtentPtr, MemberInfo};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{debug, trace};

/// Bucket counts and sector totals for one device.
///
/// Each bucket lands in at most one bucket class, checked in this order:
/// owned by the allocator, metadata, dirty, cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DevUsage {
    pub buckets_alloc: u64,
    pub buckets_meta: u64,
    pub buckets_dirty: u64,
    pub buckets_cached: u64,
    pub sectors_dirty: u64,
    pub sectors_cached: u64,
    pub sectors_meta: u64,
}

impl DevUsage {
    fn account(&mut self, m: BucketMark) {
        let dirty = u64::from(m.dirty_sectors());
        let cached = u64::from(m.cached_sectors());
        if m.data_type().is_metadata() {
            self.sectors_meta += dirty;
        } else {
            self.sectors_dirty += dirty;
        }
        self.sectors_cached += cached;

        if m.owned_by_allocator() {
            self.buckets_alloc += 1;
        } else if m.data_type().is_metadata() {
            self.buckets_meta += 1;
        } else if dirty > 0 {
            self.buckets_dirty += 1;
        } else if cached > 0 {
            self.buckets_cached += 1;
        }
    }
}

/// One member device: its bucket marks plus allocator-side state.
#[derive(Debug)]
pub struct Device {
    idx: DeviceIdx,
    info: MemberInfo,
    buckets: Box<[Bucket]>,
    /// Oldest pointer generation seen per bucket by the last GC sweep.
    oldest_gens: Box<[AtomicU8]>,
    /// Invalidated buckets ready to hand out.
    pub(crate) free: Mutex<VecDeque<BucketNumber>>,
    /// Invalidated buckets still waiting for their last journal update to
    /// reach disk.
    pub(crate) free_inc: Mutex<VecDeque<BucketNumber>>,
    pub(crate) heap: Mutex<BucketHeap>,
}

impl Device {
    pub fn new(idx: DeviceIdx, info: MemberInfo, config: &SpaceConfig) -> Result<Self> {
        if info.bucket_size == 0 {
            return Err(LfsError::InvalidConfig(format!(
                "device {}: bucket_size must be non-zero",
                idx.0
            )));
        }
        if info.first_bucket >= info.nbuckets {
            return Err(LfsError::InvalidConfig(format!(
                "device {}: first_bucket {} must be below nbuckets {}",
                idx.0, info.first_bucket, info.nbuckets
            )));
        }
        let n = usize::try_from(info.nbuckets).map_err(|_| {
            LfsError::InvalidConfig(format!("device {}: nbuckets overflows usize", idx.0))
        })?;

        let buckets = (0..n).map(|_| Bucket::default()).collect();
        let oldest_gens = (0..n).map(|_| AtomicU8::new(0)).collect();

        debug!(
            target: "lfs::buckets",
            device = idx.0,
            nbuckets = info.nbuckets,
            first_bucket = info.first_bucket,
            bucket_size = info.bucket_size,
            "device_attach"
        );

        Ok(Self {
            idx,
            info,
            buckets,
            oldest_gens,
            free: Mutex::new(VecDeque::with_capacity(config.free_list_capacity)),
            free_inc: Mutex::new(VecDeque::with_capacity(config.free_list_capacity)),
            heap: Mutex::new(BucketHeap::new(config.gc_heap_capacity, HeapOrder::KeepLowest)),
        })
    }

    #[must_use]
    pub fn idx(&self) -> DeviceIdx {
        self.idx
    }

    #[must_use]
    pub fn info(&self) -> &MemberInfo {
        &self.info
    }

    /// Bucket holding device sector `sector`.
    #[must_use]
    pub fn sector_to_bucket(&self, sector: u64) -> BucketNumber {
        BucketNumber(sector / u64::from(self.info.bucket_size))
    }

    pub fn bucket(&self, nr: BucketNumber) -> Result<&Bucket> {
        usize::try_from(nr.0)
            .ok()
            .and_then(|i| self.buckets.get(i))
            .ok_or_else(|| LfsError::Corruption {
                device: self.idx.0,
                bucket: nr.0,
                detail: format!("bucket beyond device end ({} buckets)", self.info.nbuckets),
            })
    }

    pub fn ptr_bucket(&self, ptr: &ExtentPtr) -> Result<(BucketNumber, &Bucket)> {
        let nr = self.sector_to_bucket(ptr.offset);
        Ok((nr, self.bucket(nr)?))
    }

    /// Iterate over the allocatable bucket range.
    pub fn usable_buckets(&self) -> impl Iterator<Item = (BucketNumber, &Bucket)> {
        let first = usize::try_from(self.info.first_bucket).unwrap_or(usize::MAX);
        self.buckets
            .iter()
            .enumerate()
            .skip(first)
            .map(|(i, b)| (BucketNumber(i as u64), b))
    }

    /// Sum the live marks of every usable bucket.
    ///
    /// Linear in bucket count and not a snapshot: buckets are read at
    /// different instants, which is fine for admission heuristics.
    #[must_use]
    pub fn usage(&self) -> DevUsage {
        let mut usage = DevUsage::default();
        for (_, b) in self.usable_buckets() {
            usage.account(b.mark());
        }
        usage
    }

    /// `nbuckets − first_bucket − (dirty + alloc + meta)`, floored at zero.
    #[must_use]
    pub fn buckets_available_with(&self, usage: &DevUsage) -> u64 {
        self.info
            .nbuckets
            .saturating_sub(self.info.first_bucket)
            .saturating_sub(usage.buckets_dirty)
            .saturating_sub(usage.buckets_alloc)
            .saturating_sub(usage.buckets_meta)
    }

    #[must_use]
    pub fn buckets_available(&self) -> u64 {
        self.buckets_available_with(&self.usage())
    }

    /// Available buckets plus those already sitting on the free lists.
    #[must_use]
    pub fn buckets_free(&self) -> u64 {
        let free = self.free.lock().len();
        let free_inc = self.free_inc.lock().len();
        self.buckets_available() + (free + free_inc) as u64
    }

    /// Reclaim distance: how many generations the oldest pointer into this
    /// bucket lags behind the bucket.
    #[must_use]
    pub fn bucket_gc_gen(&self, nr: BucketNumber) -> u8 {
        let Ok(b) = self.bucket(nr) else { return 0 };
        let oldest = self.oldest_gen(nr);
        b.mark().generation().distance_after(oldest)
    }

    #[must_use]
    pub fn oldest_gen(&self, nr: BucketNumber) -> BucketGen {
        usize::try_from(nr.0)
            .ok()
            .and_then(|i| self.oldest_gens.get(i))
            .map_or(BucketGen(0), |g| BucketGen(g.load(Ordering::Relaxed)))
    }

    pub(crate) fn reset_oldest_gen(&self, nr: BucketNumber, generation: BucketGen) {
        if let Some(g) = usize::try_from(nr.0).ok().and_then(|i| self.oldest_gens.get(i)) {
            g.store(generation.0, Ordering::Relaxed);
        }
    }

    /// Lower the bucket's oldest generation to `ptr_gen` if the pointer is
    /// older than anything seen so far this sweep.
    pub(crate) fn note_ptr_gen(&self, nr: BucketNumber, ptr_gen: BucketGen) {
        let Some(g) = usize::try_from(nr.0).ok().and_then(|i| self.oldest_gens.get(i)) else {
            return;
        };
        let _ = g.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
            (BucketGen(cur).distance_after(ptr_gen) > 0
                && BucketGen(cur).distance_after(ptr_gen) < BucketGen::STALE_WINDOW)
                .then_some(ptr_gen.0)
        });
    }

    /// Whether `ptr` points at a bucket that has since been invalidated.
    ///
    /// A generation distance outside the valid window is corruption.
    pub fn ptr_stale(&self, ptr: &ExtentPtr) -> Result<bool> {
        let (nr, b) = self.ptr_bucket(ptr)?;
        let current = b.mark().generation();
        gen_after(current, ptr.generation)
            .map(|d| d > 0)
            .map_err(|distance| self.gen_corruption(nr, current, ptr.generation, distance))
    }

    pub(crate) fn gen_corruption(
        &self,
        nr: BucketNumber,
        current: BucketGen,
        ptr_gen: BucketGen,
        distance: u8,
    ) -> LfsError {
        tracing::error!(
            target: "lfs::buckets",
            device = self.idx.0,
            bucket = nr.0,
            bucket_gen = current.0,
            ptr_gen = ptr_gen.0,
            distance,
            "gen_distance_out_of_range"
        );
        LfsError::Corruption {
            device: self.idx.0,
            bucket: nr.0,
            detail: format!(
                "pointer gen {} is {distance} behind bucket gen {}",
                ptr_gen.0, current.0
            ),
        }
    }

    /// Bump the generation and hand the bucket to the allocator.
    ///
    /// This is the only transition that advances the generation: every
    /// pointer into the bucket becomes stale.
    pub fn invalidate_bucket(&self, nr: BucketNumber) -> Result<BucketMark> {
        let (old, new) = self.bucket(nr)?.update(BucketMark::invalidated);
        trace!(
            target: "lfs::buckets",
            device = self.idx.0,
            bucket = nr.0,
            old_gen = old.generation().0,
            new_gen = new.generation().0,
            "bucket_invalidate"
        );
        Ok(old)
    }

    /// Return a bucket to the unowned, empty state without touching its
    /// generation.
    pub fn mark_free_bucket(&self, nr: BucketNumber) -> Result<BucketMark> {
        let (old, _) = self.bucket(nr)?.update(|m| {
            m.with_owned_by_allocator(false)
                .with_data_type(BucketDataType::Unused)
                .with_dirty_sectors(0)
                .with_cached_sectors(0)
        });
        trace!(target: "lfs::buckets", device = self.idx.0, bucket = nr.0, "bucket_mark_free");
        Ok(old)
    }

    /// Set or clear allocator ownership.
    pub fn mark_alloc_bucket(&self, nr: BucketNumber, owned_by_allocator: bool) -> Result<BucketMark> {
        let (old, _) = self
            .bucket(nr)?
            .update(|m| m.with_owned_by_allocator(owned_by_allocator));
        trace!(
            target: "lfs::buckets",
            device = self.idx.0,
            bucket = nr.0,
            owned_by_allocator,
            "bucket_mark_alloc"
        );
        Ok(old)
    }

    /// Dedicate a bucket to metadata (journal, superblock, btree).
    ///
    /// Unless `may_make_unavailable` is set, the bucket must not currently be
    /// counted as available: taking an available bucket silently would shrink
    /// capacity underneath outstanding reservations.
    pub fn mark_metadata_bucket(
        &self,
        nr: BucketNumber,
        data_type: BucketDataType,
        may_make_unavailable: bool,
    ) -> Result<BucketMark> {
        if !data_type.is_metadata() {
            return Err(LfsError::Invariant(format!(
                "mark_metadata_bucket with non-metadata type {data_type:?}"
            )));
        }
        let bucket = self.bucket(nr)?;
        let (old, _) = bucket
            .try_update(|m| {
                if !may_make_unavailable && m.is_available() {
                    return Err(m);
                }
                Ok(m.with_data_type(data_type).with_owned_by_allocator(false))
            })
            .map_err(|m| {
                LfsError::Invariant(format!(
                    "device {} bucket {}: metadata marking would consume available bucket ({m:?})",
                    self.idx.0, nr.0
                ))
            })?;
        trace!(
            target: "lfs::buckets",
            device = self.idx.0,
            bucket = nr.0,
            ?data_type,
            "bucket_mark_metadata"
        );
        Ok(old)
    }

    /// Exclude a bucket from allocation (e.g. after a media error).
    pub fn set_nouse(&self, nr: BucketNumber, nouse: bool) -> Result<BucketMark> {
        Ok(self.bucket(nr)?.update(|m| m.with_nouse(nouse)).0)
    }

    #[must_use]
    pub fn free_list_len(&self) -> usize {
        self.free.lock().len()
    }

    #[must_use]
    pub fn free_inc_len(&self) -> usize {
        self.free_inc.lock().len()
    }
}
