#![forbid(unsafe_code)]
//! Bucket accounting for a copy-on-write, log-structured filesystem.
//!
//! Devices are split into fixed-size buckets. Each bucket carries a packed
//! 64-bit mark (generation, data type, sector counts, journal tag) updated
//! lock-free by compare-and-swap. Everything else is derived from the marks:
//!
//! 1. **Marks**: [`mark::Bucket`], the single source of truth per bucket.
//! 2. **Usage**: per-device [`device::DevUsage`] summed from marks, and the
//!    filesystem-wide [`usage::FsUsageCounters`] maintained by [`BucketSpace::mark_key`].
//! 3. **Reservations**: [`reservation::DiskReservation`] admission against
//!    capacity before writes are issued.
//! 4. **GC**: recount, reclaim-candidate selection over a bounded
//!    [`heap::BucketHeap`], invalidation and free-list refill.
//!
//! ## Locking
//!
//! Marks, usage counters and the available-sectors budget are atomics. The
//! GC lock (`RwLock<()>`) is taken shared by key marking and by the
//! reservation slow path, and exclusively by a GC pass, so a recount never
//! interleaves with incremental marking. The recalculation lock serializes
//! budget recomputation.

pub mod config;
pub mod device;
pub mod gc;
pub mod heap;
pub mod mark;
pub mod reservation;
pub mod usage;

use config::SpaceConfig;
use device::Device;
use lfs_error::{LfsError, Result};
use lfs_types::{
    atomic, Bkey, BucketDataType, DeviceIdx, ExtentPtr, JournalSeq, MemberInfo, ReplicaTargets, MAX_DEVICES,
};
use mark::{gen_after, saturating_apply};
use parking_lot::{Mutex, RwLock};
use reservation::{as_signed, DiskReservation};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, trace, warn};
use usage::{FsUsage, FsUsageCounters, SectorClass, SizeClass};

pub use gc::{GcPass, GcPolicy, GcStats};
pub use reservation::ReservationFlags;

// ── Marking context ─────────────────────────────────────────────────────────

/// Extra inputs to [`BucketSpace::mark_key_with`].
#[derive(Debug, Default)]
pub struct MarkContext<'a> {
    /// Pointers are btree nodes rather than data.
    pub metadata: bool,
    /// Journal entry carrying the update; recorded in the low 16 bits of
    /// each touched bucket's mark.
    pub journal_seq: Option<JournalSeq>,
    /// Reservation that pays for newly written sectors.
    pub reservation: Option<&'a mut DiskReservation>,
}

/// Outcome of marking one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MarkOutcome {
    /// Pointers whose bucket was updated.
    pub marked: u32,
    /// Pointers skipped because their bucket has been reused.
    pub stale: u32,
    /// A bucket count clamped at the saturation ceiling.
    pub saturated: bool,
}

// ── Filesystem-wide state ───────────────────────────────────────────────────

/// All devices plus filesystem-wide usage and the reservation budget.
#[derive(Debug)]
pub struct BucketSpace {
    config: SpaceConfig,
    replicas: ReplicaTargets,
    devices: Vec<Device>,
    usage: FsUsageCounters,
    /// Sectors in the usable range of online data devices.
    capacity: u64,
    /// Cached admission budget, consumed by CAS on the reservation fast path.
    sectors_available: AtomicU64,
    recalc_lock: Mutex<()>,
    gc_lock: RwLock<()>,
    gc_needed: AtomicBool,
}

impl BucketSpace {
    /// Build in-memory state for `members`, indexed by position.
    pub fn new(config: SpaceConfig, replicas: ReplicaTargets, members: Vec<MemberInfo>) -> Result<Self> {
        config.validate()?;
        if members.is_empty() || members.len() > MAX_DEVICES {
            return Err(LfsError::InvalidConfig(format!(
                "member count must be in 1..={MAX_DEVICES}, got {}",
                members.len()
            )));
        }
        if replicas.data == 0 || replicas.metadata == 0 {
            return Err(LfsError::InvalidConfig("replica targets must be non-zero".to_owned()));
        }

        let mut devices = Vec::with_capacity(members.len());
        for (i, info) in members.into_iter().enumerate() {
            let idx = DeviceIdx(u16::try_from(i).map_err(|_| LfsError::InvalidConfig("too many members".to_owned()))?);
            devices.push(Device::new(idx, info, &config)?);
        }
        let capacity = devices
            .iter()
            .filter(|d| d.info().is_online() && d.info().has_data)
            .map(|d| d.info().usable_sectors())
            .sum();

        let space = Self {
            config,
            replicas,
            devices,
            usage: FsUsageCounters::default(),
            capacity,
            sectors_available: AtomicU64::new(0),
            recalc_lock: Mutex::new(()),
            gc_lock: RwLock::new(()),
            gc_needed: AtomicBool::new(false),
        };
        space.recalc_sectors_available();
        info!(
            target: "lfs::buckets",
            devices = space.devices.len(),
            capacity,
            "bucket_space_init"
        );
        Ok(space)
    }

    #[must_use]
    pub fn config(&self) -> &SpaceConfig {
        &self.config
    }

    #[must_use]
    pub fn replicas(&self) -> ReplicaTargets {
        self.replicas
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    pub fn device(&self, idx: DeviceIdx) -> Result<&Device> {
        self.devices
            .get(usize::from(idx.0))
            .ok_or_else(|| LfsError::NotFound(format!("device {}", idx.0)))
    }

    #[must_use]
    pub fn usage(&self) -> FsUsage {
        self.usage.read()
    }

    /// A bucket count saturated since the last GC pass; accounting is
    /// approximate until the next recount.
    #[must_use]
    pub fn gc_needed(&self) -> bool {
        self.gc_needed.load(Ordering::Acquire)
    }

    // ── Key marking ─────────────────────────────────────────────────────────

    /// Apply `sectors` (negative when pointers are dropped) to every bucket
    /// `key` points into.
    pub fn mark_key(&self, key: &Bkey, sectors: i64, metadata: bool) -> Result<MarkOutcome> {
        self.mark_key_with(
            key,
            sectors,
            MarkContext {
                metadata,
                ..MarkContext::default()
            },
        )
    }

    /// [`Self::mark_key`] with a journal tag and/or a reservation.
    ///
    /// Newly written dirty or metadata sectors are paid for out of the
    /// reservation. Sectors it does not cover come out of the cached budget.
    pub fn mark_key_with(&self, key: &Bkey, sectors: i64, ctx: MarkContext<'_>) -> Result<MarkOutcome> {
        let _gc = self.gc_lock.read();
        self.mark_key_locked(key, sectors, ctx, false)
    }

    /// Mark a live key during a GC pass. The caller holds the GC lock.
    pub(crate) fn gc_mark_key(&self, key: &Bkey, sectors: i64, metadata: bool) -> Result<MarkOutcome> {
        self.mark_key_locked(
            key,
            sectors,
            MarkContext {
                metadata,
                ..MarkContext::default()
            },
            true,
        )
    }

    fn mark_key_locked(&self, key: &Bkey, sectors: i64, ctx: MarkContext<'_>, gc: bool) -> Result<MarkOutcome> {
        let mut outcome = MarkOutcome::default();
        let consumed = match key {
            Bkey::Deleted => 0,
            Bkey::Reservation { nr_replicas } => {
                let delta = sectors.saturating_mul(i64::from(*nr_replicas));
                self.usage.add_persistent_reserved(delta);
                delta
            }
            Bkey::Extent(extent) => {
                let mut consumed = 0_i64;
                for ptr in &extent.ptrs {
                    let disk_sectors = extent
                        .compression
                        .map_or(sectors, |c| c.disk_sectors(sectors));
                    let class = if ctx.metadata {
                        SectorClass::Meta
                    } else if ptr.cached {
                        SectorClass::Cached
                    } else {
                        SectorClass::Dirty
                    };
                    if !self.mark_pointer(ptr, disk_sectors, class, ctx.journal_seq, gc, &mut outcome)? {
                        continue;
                    }
                    self.usage.add(SizeClass::Compressed, class, disk_sectors);
                    self.usage.add(SizeClass::Uncompressed, class, sectors);
                    if class != SectorClass::Cached {
                        consumed = consumed.saturating_add(disk_sectors);
                    }
                }
                consumed
            }
        };

        if !gc && consumed > 0 {
            let consumed = consumed.unsigned_abs();
            let covered = ctx.reservation.map_or(0, |res| res.consume(consumed));
            if covered > 0 {
                self.usage.add_online_reserved(-as_signed(covered));
            }
            let uncovered = consumed - covered;
            if uncovered > 0 {
                atomic::update(&self.sectors_available, |avail| avail.saturating_sub(uncovered));
            }
        }

        if outcome.saturated && !self.gc_needed.swap(true, Ordering::AcqRel) {
            warn!(
                target: "lfs::buckets",
                ceiling = self.config.gc_max_sectors_used,
                "bucket_sectors_saturated"
            );
        }
        Ok(outcome)
    }

    /// Apply one pointer's delta to its bucket. Returns `false` for a stale
    /// pointer, which leaves the bucket untouched.
    fn mark_pointer(
        &self,
        ptr: &ExtentPtr,
        disk_sectors: i64,
        class: SectorClass,
        journal_seq: Option<JournalSeq>,
        gc: bool,
        outcome: &mut MarkOutcome,
    ) -> Result<bool> {
        let dev = self.device(ptr.dev)?;
        let (nr, bucket) = dev.ptr_bucket(ptr)?;
        if gc {
            dev.note_ptr_gen(nr, ptr.generation);
        }

        let max = self.config.gc_max_sectors_used;
        let mut saturated = false;
        let result = bucket.try_update(|m| {
            match gen_after(m.generation(), ptr.generation) {
                Ok(0) => {}
                Ok(_) => return Err(None),
                Err(distance) => return Err(Some((m, distance))),
            }
            let mut new = m;
            if class == SectorClass::Cached {
                let (v, sat) = saturating_apply(m.cached_sectors(), disk_sectors, max);
                new = new.with_cached_sectors(v);
                saturated = sat;
            } else {
                let (v, sat) = saturating_apply(m.dirty_sectors(), disk_sectors, max);
                new = new.with_dirty_sectors(v);
                saturated = sat;
                new = new.with_data_type(if class == SectorClass::Meta {
                    BucketDataType::Btree
                } else {
                    BucketDataType::Data
                });
            }
            if let Some(seq) = journal_seq {
                new = new.with_journal_seq(Some(seq.tag()));
            }
            Ok(new)
        });

        match result {
            Ok((old, new)) => {
                trace!(
                    target: "lfs::buckets",
                    device = ptr.dev.0,
                    bucket = nr.0,
                    delta = disk_sectors,
                    dirty = new.dirty_sectors(),
                    cached = new.cached_sectors(),
                    old_dirty = old.dirty_sectors(),
                    "bucket_mark"
                );
                outcome.marked += 1;
                outcome.saturated |= saturated;
                Ok(true)
            }
            Err(None) => {
                outcome.stale += 1;
                trace!(target: "lfs::buckets", device = ptr.dev.0, bucket = nr.0, "stale_ptr_skip");
                Ok(false)
            }
            Err(Some((m, distance))) => Err(dev.gen_corruption(nr, m.generation(), ptr.generation, distance)),
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    /// Whether `ptr` refers to a bucket that has been reused since the
    /// pointer was written. Corruption when the distance is out of range.
    pub fn bucket_stale(&self, ptr: &ExtentPtr) -> Result<bool> {
        self.device(ptr.dev)?.ptr_stale(ptr)
    }

    /// Whether `key` has enough live, non-cached copies on devices allowed
    /// to hold its class of data.
    #[must_use]
    pub fn key_replicas_sufficient(&self, key: &Bkey, metadata: bool) -> bool {
        let want = self.replicas.for_class(metadata);
        match key {
            Bkey::Deleted => true,
            Bkey::Reservation { nr_replicas } => *nr_replicas >= want,
            Bkey::Extent(extent) => {
                let have = extent
                    .ptrs
                    .iter()
                    .filter(|p| !p.cached)
                    .filter(|p| {
                        self.device(p.dev).is_ok_and(|d| {
                            let info = d.info();
                            info.is_online() && if metadata { info.has_metadata } else { info.has_data }
                        })
                    })
                    .count();
                have >= usize::from(want)
            }
        }
    }

    /// Available buckets summed over all online devices, in sectors.
    #[must_use]
    pub fn sectors_in_available_buckets(&self) -> u64 {
        self.devices
            .iter()
            .filter(|d| d.info().is_online())
            .map(|d| d.buckets_available().saturating_mul(u64::from(d.info().bucket_size)))
            .sum()
    }

    pub(crate) fn clear_gc_needed(&self) {
        if self.gc_needed.swap(false, Ordering::AcqRel) {
            debug!(target: "lfs::gc", "gc_needed_cleared");
        }
    }
}
