//! Disk reservations: admission of sector writes against capacity.
//!
//! A reservation is taken before a write is issued and consumed by
//! [`BucketSpace::mark_key_with`] once the write lands. Admission runs
//! against a cached `sectors_available` budget:
//!
//! - fast path: compare-and-swap the requested sectors off the budget;
//! - slow path: under the recalculation lock, recompute
//!   `capacity − sectors_used` from the usage counters and retry once.
//!
//! `sectors_used` inflates reserved sectors by `reserved >> shift` (1/128 by
//! default) to leave headroom for metadata write amplification.

use crate::BucketSpace;
use lfs_error::{LfsError, Result};
use lfs_types::atomic;
use parking_lot::RwLockReadGuard;
use std::fmt;
use std::sync::atomic::Ordering;
use tracing::{debug, trace, warn};

/// Reservation request flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReservationFlags(pub u32);

impl ReservationFlags {
    pub const NONE: Self = Self(0);
    /// Admit even when capacity is short. Only for callers that have
    /// independently guaranteed space, such as operations that free space.
    pub const NOFAIL: Self = Self(1 << 0);
    /// Size the reservation with the metadata replica target.
    pub const METADATA: Self = Self(1 << 1);
    /// Caller already holds the GC lock.
    pub const GC_LOCK_HELD: Self = Self(1 << 2);
    /// Caller holds btree node locks: the GC lock may only be try-locked,
    /// and failure is reported as [`LfsError::Restart`].
    pub const BTREE_LOCKS_HELD: Self = Self(1 << 3);

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) == flag.0 && flag.0 != 0
    }
}

impl std::ops::BitOr for ReservationFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Sectors admitted against capacity and not yet consumed or released.
///
/// Not `Clone`: each handle is released exactly once, by value, through
/// [`BucketSpace::disk_reservation_put`].
#[must_use = "disk reservations must be released with disk_reservation_put"]
#[derive(PartialEq, Eq)]
pub struct DiskReservation {
    pub(crate) sectors: u64,
    pub(crate) nr_replicas: u8,
}

impl fmt::Debug for DiskReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskReservation")
            .field("sectors", &self.sectors)
            .field("nr_replicas", &self.nr_replicas)
            .finish()
    }
}

impl DiskReservation {
    /// Sectors still held, already multiplied by the replica count.
    #[must_use]
    pub fn sectors(&self) -> u64 {
        self.sectors
    }

    #[must_use]
    pub fn nr_replicas(&self) -> u8 {
        self.nr_replicas
    }

    /// Take up to `wanted` sectors out of the reservation, returning how many
    /// were actually covered.
    pub(crate) fn consume(&mut self, wanted: u64) -> u64 {
        let taken = wanted.min(self.sectors);
        self.sectors -= taken;
        taken
    }
}

impl BucketSpace {
    /// Sectors in use as seen by admission control, clamped to capacity.
    #[must_use]
    pub fn sectors_used(&self) -> u64 {
        self.sectors_used_unclamped().min(self.capacity)
    }

    /// Sectors in use without the capacity clamp. Exceeds capacity only after
    /// NOFAIL overdraft.
    #[must_use]
    pub fn sectors_used_unclamped(&self) -> u64 {
        let usage = self.usage.read();
        usage
            .allocated_sectors()
            .saturating_add(self.config.with_overhead(usage.reserved()))
    }

    /// Current cached admission budget.
    #[must_use]
    pub fn sectors_available(&self) -> u64 {
        self.sectors_available.load(Ordering::Acquire)
    }

    /// Recompute the cached budget from the usage counters.
    pub fn recalc_sectors_available(&self) -> u64 {
        let _recalc = self.recalc_lock.lock();
        self.recalc_locked()
    }

    pub(crate) fn recalc_locked(&self) -> u64 {
        let available = self.drain_and_measure();
        self.sectors_available.store(available, Ordering::Release);
        trace!(target: "lfs::reservation", available, "sectors_available_recalc");
        available
    }

    /// Reserve `sectors` (per replica) for a future write.
    pub fn disk_reservation_get(&self, sectors: u64, flags: ReservationFlags) -> Result<DiskReservation> {
        let mut res = DiskReservation {
            sectors: 0,
            nr_replicas: self.replicas.for_class(flags.contains(ReservationFlags::METADATA)),
        };
        if sectors > 0 {
            self.disk_reservation_add(&mut res, sectors, flags)?;
        }
        Ok(res)
    }

    /// Grow an existing reservation by `sectors` per replica.
    ///
    /// On failure the reservation is unchanged.
    pub fn disk_reservation_add(
        &self,
        res: &mut DiskReservation,
        sectors: u64,
        flags: ReservationFlags,
    ) -> Result<()> {
        let sectors = sectors.saturating_mul(u64::from(res.nr_replicas.max(1)));

        // Publish the reservation before taking budget, so a concurrent
        // recalculation that drains the budget already counts it.
        self.usage.add_online_reserved(as_signed(sectors));
        let fast = atomic::try_update(&self.sectors_available, |avail| avail.checked_sub(sectors).ok_or(()));
        if fast.is_ok() {
            res.sectors += sectors;
            trace!(target: "lfs::reservation", sectors, "reserve_fast");
            return Ok(());
        }
        self.usage.add_online_reserved(-as_signed(sectors));

        let _gc = self.gc_read_for(flags)?;
        let _recalc = self.recalc_lock.lock();
        let available = self.drain_and_measure();

        if sectors <= available {
            self.sectors_available.store(available - sectors, Ordering::Release);
            self.grant(res, sectors);
            debug!(target: "lfs::reservation", sectors, available, "reserve_slow");
            Ok(())
        } else if flags.contains(ReservationFlags::NOFAIL) {
            self.sectors_available.store(0, Ordering::Release);
            self.grant(res, sectors);
            warn!(
                target: "lfs::reservation",
                sectors,
                available,
                overdraft = sectors - available,
                "reserve_nofail_overdraft"
            );
            Ok(())
        } else {
            self.sectors_available.store(available, Ordering::Release);
            debug!(target: "lfs::reservation", sectors, available, "reserve_enospc");
            Err(LfsError::NoSpace)
        }
    }

    /// Release whatever the reservation still holds.
    pub fn disk_reservation_put(&self, res: DiskReservation) {
        if res.sectors > 0 {
            self.usage.add_online_reserved(-as_signed(res.sectors));
            trace!(target: "lfs::reservation", sectors = res.sectors, "reserve_put");
        }
    }

    /// Zero the cached budget, then measure what is really available.
    ///
    /// Draining first means a fast-path reservation either took budget before
    /// the drain (and is already in the usage counters) or sees an empty
    /// budget and falls through to the slow path. Caller holds the
    /// recalculation lock.
    fn drain_and_measure(&self) -> u64 {
        self.sectors_available.store(0, Ordering::Release);
        self.capacity - self.sectors_used()
    }

    fn grant(&self, res: &mut DiskReservation, sectors: u64) {
        res.sectors += sectors;
        self.usage.add_online_reserved(as_signed(sectors));
    }

    /// Take the GC lock shared unless the caller already holds it.
    fn gc_read_for(&self, flags: ReservationFlags) -> Result<Option<RwLockReadGuard<'_, ()>>> {
        if flags.contains(ReservationFlags::GC_LOCK_HELD) {
            Ok(None)
        } else if flags.contains(ReservationFlags::BTREE_LOCKS_HELD) {
            self.gc_lock.try_read().map(Some).ok_or(LfsError::Restart)
        } else {
            Ok(Some(self.gc_lock.read()))
        }
    }
}

pub(crate) fn as_signed(sectors: u64) -> i64 {
    i64::try_from(sectors).unwrap_or(i64::MAX)
}
