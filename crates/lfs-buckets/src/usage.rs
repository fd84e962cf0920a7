//! Filesystem-wide sector counters.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};

/// Whether a sector count is measured on disk or before compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    Compressed = 0,
    Uncompressed = 1,
}

/// What the sectors hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorClass {
    Meta = 0,
    Dirty = 1,
    Cached = 2,
}

/// Point-in-time (per counter) copy of [`FsUsageCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FsUsage {
    /// Indexed `[SizeClass][SectorClass]`.
    pub sectors: [[i64; 3]; 2],
    /// Sectors held by reservation keys on disk.
    pub persistent_reserved: i64,
    /// Sectors held by outstanding in-memory disk reservations.
    pub online_reserved: i64,
}

impl FsUsage {
    #[must_use]
    pub fn get(&self, size: SizeClass, class: SectorClass) -> i64 {
        self.sectors[size as usize][class as usize]
    }

    #[must_use]
    pub fn reserved(&self) -> u64 {
        u64::try_from(self.persistent_reserved.saturating_add(self.online_reserved)).unwrap_or(0)
    }

    /// Compressed metadata and dirty sectors plus all reserved sectors,
    /// without the overhead margin or the capacity clamp.
    #[must_use]
    pub fn allocated_sectors(&self) -> u64 {
        let live = self
            .get(SizeClass::Compressed, SectorClass::Meta)
            .saturating_add(self.get(SizeClass::Compressed, SectorClass::Dirty));
        u64::try_from(live).unwrap_or(0)
    }
}

/// Live counters. Reads sum atomics one at a time and are not a snapshot.
#[derive(Debug, Default)]
pub struct FsUsageCounters {
    sectors: [[AtomicI64; 3]; 2],
    persistent_reserved: AtomicI64,
    online_reserved: AtomicI64,
}

impl FsUsageCounters {
    pub fn add(&self, size: SizeClass, class: SectorClass, delta: i64) {
        if delta != 0 {
            self.sectors[size as usize][class as usize].fetch_add(delta, Ordering::AcqRel);
        }
    }

    pub fn add_persistent_reserved(&self, delta: i64) {
        self.persistent_reserved.fetch_add(delta, Ordering::AcqRel);
    }

    pub fn add_online_reserved(&self, delta: i64) {
        self.online_reserved.fetch_add(delta, Ordering::AcqRel);
    }

    #[must_use]
    pub fn online_reserved(&self) -> i64 {
        self.online_reserved.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn read(&self) -> FsUsage {
        let mut out = FsUsage::default();
        for (row, counters) in out.sectors.iter_mut().zip(&self.sectors) {
            for (slot, c) in row.iter_mut().zip(counters) {
                *slot = c.load(Ordering::Acquire);
            }
        }
        out.persistent_reserved = self.persistent_reserved.load(Ordering::Acquire);
        out.online_reserved = self.online_reserved.load(Ordering::Acquire);
        out
    }

    /// Zero the per-class counters and the persistent reservation ahead of a
    /// GC recount. Online reservations belong to live handles and survive.
    pub(crate) fn reset_for_gc(&self) {
        for row in &self.sectors {
            for c in row {
                c.store(0, Ordering::Release);
            }
        }
        self.persistent_reserved.store(0, Ordering::Release);
    }
}
