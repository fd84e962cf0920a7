//! Packed per-bucket state word.
//!
//! Layout of the 64-bit mark:
//!
//! | Bits | Field |
//! |------|-------|
//! | 0..8 | generation |
//! | 8..11 | data type |
//! | 11 | owned by allocator |
//! | 12 | journal seq valid |
//! | 13 | nouse |
//! | 16..32 | dirty sectors |
//! | 32..48 | cached sectors |
//! | 48..64 | journal seq (low 16 bits) |
//!
//! All mutation goes through [`Bucket::update`], a compare-and-swap retry
//! loop; transforms must be pure functions of the old mark.

use lfs_types::atomic;
use lfs_types::{BucketDataType, BucketGen};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

const GEN_MASK: u64 = 0xff;
const DATA_TYPE_SHIFT: u32 = 8;
const DATA_TYPE_MASK: u64 = 0x7;
const OWNED_BIT: u64 = 1 << 11;
const JOURNAL_SEQ_VALID_BIT: u64 = 1 << 12;
const NOUSE_BIT: u64 = 1 << 13;
const DIRTY_SHIFT: u32 = 16;
const CACHED_SHIFT: u32 = 32;
const JOURNAL_SEQ_SHIFT: u32 = 48;
const U16_MASK: u64 = 0xffff;

/// Snapshot of one bucket's mark.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BucketMark(u64);

impl fmt::Debug for BucketMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketMark")
            .field("gen", &self.generation().0)
            .field("data_type", &self.data_type())
            .field("owned", &self.owned_by_allocator())
            .field("dirty", &self.dirty_sectors())
            .field("cached", &self.cached_sectors())
            .field("journal_seq", &self.journal_seq())
            .field("nouse", &self.nouse())
            .finish()
    }
}

#[expect(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
impl BucketMark {
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn generation(self) -> BucketGen {
        BucketGen((self.0 & GEN_MASK) as u8)
    }

    #[must_use]
    pub fn data_type(self) -> BucketDataType {
        BucketDataType::from_bits(((self.0 >> DATA_TYPE_SHIFT) & DATA_TYPE_MASK) as u8)
    }

    #[must_use]
    pub fn owned_by_allocator(self) -> bool {
        self.0 & OWNED_BIT != 0
    }

    #[must_use]
    pub fn nouse(self) -> bool {
        self.0 & NOUSE_BIT != 0
    }

    #[must_use]
    pub fn dirty_sectors(self) -> u16 {
        ((self.0 >> DIRTY_SHIFT) & U16_MASK) as u16
    }

    #[must_use]
    pub fn cached_sectors(self) -> u16 {
        ((self.0 >> CACHED_SHIFT) & U16_MASK) as u16
    }

    /// Low 16 bits of the newest journal seq that touched this bucket, if any.
    #[must_use]
    pub fn journal_seq(self) -> Option<u16> {
        (self.0 & JOURNAL_SEQ_VALID_BIT != 0).then(|| ((self.0 >> JOURNAL_SEQ_SHIFT) & U16_MASK) as u16)
    }

    #[must_use]
    pub fn with_generation(self, generation: BucketGen) -> Self {
        Self((self.0 & !GEN_MASK) | u64::from(generation.0))
    }

    #[must_use]
    pub fn with_data_type(self, data_type: BucketDataType) -> Self {
        Self(
            (self.0 & !(DATA_TYPE_MASK << DATA_TYPE_SHIFT))
                | u64::from(data_type.bits()) << DATA_TYPE_SHIFT,
        )
    }

    #[must_use]
    pub fn with_owned_by_allocator(self, owned: bool) -> Self {
        Self::set_bit(self, OWNED_BIT, owned)
    }

    #[must_use]
    pub fn with_nouse(self, nouse: bool) -> Self {
        Self::set_bit(self, NOUSE_BIT, nouse)
    }

    #[must_use]
    pub fn with_dirty_sectors(self, sectors: u16) -> Self {
        Self((self.0 & !(U16_MASK << DIRTY_SHIFT)) | u64::from(sectors) << DIRTY_SHIFT)
    }

    #[must_use]
    pub fn with_cached_sectors(self, sectors: u16) -> Self {
        Self((self.0 & !(U16_MASK << CACHED_SHIFT)) | u64::from(sectors) << CACHED_SHIFT)
    }

    #[must_use]
    pub fn with_journal_seq(self, tag: Option<u16>) -> Self {
        let cleared = self.0 & !(U16_MASK << JOURNAL_SEQ_SHIFT) & !JOURNAL_SEQ_VALID_BIT;
        match tag {
            Some(seq) => Self(cleared | JOURNAL_SEQ_VALID_BIT | u64::from(seq) << JOURNAL_SEQ_SHIFT),
            None => Self(cleared),
        }
    }

    fn set_bit(self, bit: u64, on: bool) -> Self {
        if on { Self(self.0 | bit) } else { Self(self.0 & !bit) }
    }

    /// The mark after invalidation: next generation, owned by the allocator,
    /// empty. The journal tag is kept so the allocator can tell when the
    /// update that emptied the bucket reached disk.
    #[must_use]
    pub fn invalidated(self) -> Self {
        self.with_generation(self.generation().next())
            .with_owned_by_allocator(true)
            .with_data_type(BucketDataType::Unused)
            .with_dirty_sectors(0)
            .with_cached_sectors(0)
    }

    /// Dirty plus cached sectors.
    #[must_use]
    pub fn sectors_used(self) -> u32 {
        u32::from(self.dirty_sectors()) + u32::from(self.cached_sectors())
    }

    /// A bucket the allocator may invalidate and reuse: not already owned,
    /// holding no dirty data or metadata, and not administratively excluded.
    #[must_use]
    pub fn is_available(self) -> bool {
        !self.owned_by_allocator()
            && matches!(self.data_type(), BucketDataType::Unused | BucketDataType::Data)
            && self.dirty_sectors() == 0
            && !self.nouse()
    }

    /// Whether the last update touching this bucket is newer than
    /// `last_seq_ondisk`, compared with 16-bit wraparound.
    #[must_use]
    pub fn needs_journal_commit(self, last_seq_ondisk: u16) -> bool {
        self.journal_seq()
            .is_some_and(|seq| (seq.wrapping_sub(last_seq_ondisk) as i16) > 0)
    }
}

/// Distance by which `current` is ahead of `ptr_gen`.
///
/// Distances at or beyond [`BucketGen::STALE_WINDOW`] cannot occur while GC
/// keeps up with reuse; they are reported as `Err(distance)` so callers can
/// escalate to a corruption fault instead of guessing.
pub fn gen_after(current: BucketGen, ptr_gen: BucketGen) -> Result<u8, u8> {
    let distance = current.distance_after(ptr_gen);
    if distance >= BucketGen::STALE_WINDOW {
        Err(distance)
    } else {
        Ok(distance)
    }
}

/// Add a signed delta to a sector count, clamping at zero and at `max`.
///
/// Returns the new count and whether the upper clamp kicked in.
#[must_use]
pub fn saturating_apply(current: u16, delta: i64, max: u16) -> (u16, bool) {
    let sum = i64::from(current).saturating_add(delta);
    if sum > i64::from(max) {
        (max, true)
    } else if sum < 0 {
        (0, false)
    } else {
        #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let v = sum as u16;
        (v, false)
    }
}

/// One allocation unit's atomically updated mark.
#[derive(Default)]
pub struct Bucket {
    mark: AtomicU64,
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.mark().fmt(f)
    }
}

impl Bucket {
    #[must_use]
    pub fn new(mark: BucketMark) -> Self {
        Self {
            mark: AtomicU64::new(mark.raw()),
        }
    }

    /// Current mark. Concurrent updates may land immediately after.
    #[must_use]
    pub fn mark(&self) -> BucketMark {
        BucketMark(self.mark.load(Ordering::Acquire))
    }

    /// Replace the mark with `transform(old)`, retrying on contention.
    ///
    /// Returns `(old, new)` for the attempt that won.
    pub fn update<F>(&self, mut transform: F) -> (BucketMark, BucketMark)
    where
        F: FnMut(BucketMark) -> BucketMark,
    {
        let (old, new) = atomic::update(&self.mark, |raw| transform(BucketMark(raw)).0);
        (BucketMark(old), BucketMark(new))
    }

    /// Like [`Self::update`], but the transform may decline by returning `Err`,
    /// in which case the mark is left unchanged.
    pub fn try_update<F, E>(&self, mut transform: F) -> Result<(BucketMark, BucketMark), E>
    where
        F: FnMut(BucketMark) -> Result<BucketMark, E>,
    {
        let (old, new) = atomic::try_update(&self.mark, |raw| transform(BucketMark(raw)).map(|m| m.0))?;
        Ok((BucketMark(old), BucketMark(new)))
    }

    /// Whether a pointer written at `ptr_gen` is stale against this bucket.
    ///
    /// `Err(distance)` means the distance is outside the valid window.
    pub fn is_stale(&self, ptr_gen: BucketGen) -> Result<bool, u8> {
        gen_after(self.mark().generation(), ptr_gen).map(|d| d > 0)
    }
}
