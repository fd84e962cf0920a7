//! Bucket accounting wired to the metadata journal.
//!
//! Every key update is journaled before it is accounted: the journal seq of
//! the entry carrying it is recorded in each touched bucket's mark, and the
//! seq stays pinned until the caller reports the btree node flushed. The
//! allocator hands out an emptied bucket only once `last_seq_ondisk` has
//! passed the update that emptied it, so a crash can never replay a key
//! pointing into a bucket that was already reused.
//!
//! A fatal error (corruption, a halted journal, a broken invariant) from
//! marking or journaling switches the core to read-only for good: every
//! later update, allocation and reservation fails with
//! [`LfsError::ReadOnly`].

use crate::config::LfsConfig;
use lfs_buckets::device::DevUsage;
use lfs_buckets::reservation::DiskReservation;
use lfs_buckets::usage::FsUsage;
use lfs_buckets::{BucketSpace, GcPolicy, GcStats, MarkContext, ReservationFlags};
use lfs_error::{LfsError, Result};
use lfs_journal::jset::keys_entry_words;
use lfs_journal::{
    Journal, JournalLocation, JournalRing, JournalStats, JournalWriter, Jset, ReplayPlan, WriteTimer,
    plan_replay, spawn_write_timer,
};
use lfs_types::{Bkey, BtreeId, BucketDataType, BucketNumber, DeviceIdx, JournalSeq};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, trace, warn};

/// Point-in-time view of the whole core, serializable for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CoreStats {
    pub usage: FsUsage,
    pub capacity: u64,
    pub sectors_available: u64,
    pub devices: Vec<DevUsage>,
    pub journal: JournalStats,
    pub gc_needed: bool,
    pub read_only: bool,
}

#[derive(Debug)]
pub struct CoreFs<W: JournalWriter> {
    space: BucketSpace,
    journal: Arc<Journal<W>>,
    gc_policy: GcPolicy,
    read_only: AtomicBool,
}

impl<W: JournalWriter> CoreFs<W> {
    /// Set up a fresh filesystem: reserve the journal buckets and start the
    /// journal at seq 1.
    pub fn format(config: &LfsConfig, writer: W) -> Result<Self> {
        let (space, ring) = Self::build(config)?;
        let journal = Journal::new(config.journal, ring, writer)?;
        info!(
            target: "lfs::core",
            devices = config.members.len(),
            journal_device = config.journal_device,
            journal_buckets = config.journal_buckets,
            "core_format"
        );
        Ok(Self::assemble(space, journal))
    }

    /// Reopen from the entries found in the journal ring.
    ///
    /// The new journal appends after the newest entry and keeps every ring
    /// bucket replay may still need. Replayed entries stay pinned until
    /// [`Self::replay_done`]; until then new entries keep recording the
    /// replay start, so a second crash replays them again. Bucket usage is
    /// not derived from the journal: the caller applies
    /// [`ReplayPlan::decoded`] to its btrees and then recounts with
    /// [`Self::gc_sweep`].
    pub fn recover(
        config: &LfsConfig,
        writer: W,
        found: Vec<(JournalLocation, Jset)>,
    ) -> Result<(Self, ReplayPlan)> {
        let (space, mut ring) = Self::build(config)?;
        let written: Vec<(JournalLocation, u64)> = found.iter().map(|(loc, j)| (*loc, j.seq)).collect();
        let plan = plan_replay(found.into_iter().map(|(_, j)| j));
        ring.restore(written, plan.last_seq);
        let journal = Journal::from_replay(config.journal, ring, writer, &plan)?;
        info!(
            target: "lfs::core",
            entries = plan.entries.len(),
            blacklisted = plan.blacklisted.len(),
            missing = plan.missing.len(),
            start_seq = plan.start_seq,
            "core_recover"
        );
        Ok((Self::assemble(space, journal), plan))
    }

    fn assemble(space: BucketSpace, journal: Journal<W>) -> Self {
        Self {
            space,
            journal: Arc::new(journal),
            gc_policy: GcPolicy::default(),
            read_only: AtomicBool::new(false),
        }
    }

    fn build(config: &LfsConfig) -> Result<(BucketSpace, JournalRing)> {
        config.validate()?;
        let space = BucketSpace::new(config.space, config.replicas, config.members.clone())?;
        let dev = DeviceIdx(config.journal_device);
        let device = space.device(dev)?;
        let first = device.info().first_bucket;
        let buckets: Vec<BucketNumber> = (first..first + config.journal_buckets).map(BucketNumber).collect();
        for &nr in &buckets {
            device.mark_metadata_bucket(nr, BucketDataType::Journal, true)?;
        }
        space.recalc_sectors_available();
        let ring = JournalRing::new(dev, buckets, device.info().bucket_size)?;
        Ok((space, ring))
    }

    #[must_use]
    pub fn space(&self) -> &BucketSpace {
        &self.space
    }

    #[must_use]
    pub fn journal(&self) -> &Arc<Journal<W>> {
        &self.journal
    }

    #[must_use]
    pub fn gc_policy(&self) -> GcPolicy {
        self.gc_policy
    }

    pub fn set_gc_policy(&mut self, policy: GcPolicy) {
        self.gc_policy = policy;
    }

    /// Set once a fatal error has been seen; never cleared.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    fn check_writable(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(LfsError::ReadOnly);
        }
        Ok(())
    }

    /// Pass `err` through, going read-only first if it is fatal.
    fn escalate(&self, err: LfsError) -> LfsError {
        if err.is_fatal() && !self.read_only.swap(true, Ordering::AcqRel) {
            error!(target: "lfs::core", error = %err, "core_read_only");
        }
        err
    }

    // ── Reservations ────────────────────────────────────────────────────

    /// Reserve `sectors` for a future write. Refused once read-only.
    pub fn disk_reservation_get(&self, sectors: u64, flags: ReservationFlags) -> Result<DiskReservation> {
        self.check_writable()?;
        self.space.disk_reservation_get(sectors, flags)
    }

    pub fn disk_reservation_add(
        &self,
        res: &mut DiskReservation,
        sectors: u64,
        flags: ReservationFlags,
    ) -> Result<()> {
        self.check_writable()?;
        self.space.disk_reservation_add(res, sectors, flags)
    }

    /// Return what is left of `res`. Allowed while read-only.
    pub fn disk_reservation_put(&self, res: DiskReservation) {
        self.space.disk_reservation_put(res);
    }

    // ── Journaled updates ───────────────────────────────────────────────

    /// Journal `key` in `btree_id` and account `sectors` against its
    /// pointers. Returns the journal seq, pinned on behalf of the dirty btree
    /// node; release it with [`Self::node_flushed`].
    ///
    /// If marking fails the reserved words are left as padding and nothing
    /// is pinned.
    pub fn journal_key(
        &self,
        btree_id: BtreeId,
        key: &Bkey,
        sectors: i64,
        metadata: bool,
        reservation: Option<&mut DiskReservation>,
    ) -> Result<u64> {
        self.check_writable()?;
        if !key.is_encodable() {
            return Err(LfsError::Invariant(format!(
                "key with more than {} pointers cannot be journaled",
                Bkey::MAX_PTRS
            )));
        }
        let keys = std::slice::from_ref(key);
        let u64s = u32::try_from(keys_entry_words(keys))
            .map_err(|_| LfsError::Invariant("key too large to journal".to_owned()))?;
        let mut res = self.journal.res_get(u64s).map_err(|e| self.escalate(e))?;
        let seq = res.seq();

        let marked = self.space.mark_key_with(
            key,
            sectors,
            MarkContext {
                metadata,
                journal_seq: Some(JournalSeq(seq)),
                reservation,
            },
        );
        let outcome = match marked {
            Ok(outcome) => outcome,
            Err(e) => {
                self.journal.res_put(res);
                return Err(self.escalate(e));
            }
        };
        let pinned = self
            .journal
            .add_keys(&mut res, btree_id, 0, keys)
            .and_then(|()| self.journal.pin_add(seq));
        self.journal.res_put(res);
        pinned.map_err(|e| self.escalate(e))?;

        debug!(
            target: "lfs::core",
            seq,
            ?btree_id,
            sectors,
            marked = outcome.marked,
            stale = outcome.stale,
            "key_journaled"
        );
        Ok(seq)
    }

    /// The btree node holding updates from `seq` has been written.
    pub fn node_flushed(&self, seq: u64) -> Result<()> {
        self.journal.pin_drop(seq)
    }

    /// Every update in `plan` is now in written btree nodes: release the
    /// replayed entries so the journal can move past them.
    pub fn replay_done(&self, plan: &ReplayPlan) -> Result<()> {
        self.journal.replay_done(plan)
    }

    /// Recount bucket usage from the live keys, e.g. after replay.
    pub fn gc_sweep<'k, I>(&self, live: I) -> Result<GcStats>
    where
        I: IntoIterator<Item = (&'k Bkey, i64, bool)>,
    {
        self.space.gc_sweep(live).map_err(|e| self.escalate(e))
    }

    // ── Allocation ──────────────────────────────────────────────────────

    fn refill(&self, dev: DeviceIdx) -> Result<Option<BucketNumber>> {
        let tag = JournalSeq(self.journal.last_seq_ondisk()).tag();
        self.space.refill_free_list(dev, tag)?;
        self.space.pop_free_bucket(dev)
    }

    /// Take a bucket for writing on `dev`.
    ///
    /// Tries, in order: the ready free list; invalidated buckets whose last
    /// update is on disk; a fresh round of reclaim candidates; and finally a
    /// journal write so `last_seq_ondisk` catches up with flushed nodes.
    pub fn allocate_bucket(&self, dev: DeviceIdx) -> Result<BucketNumber> {
        self.check_writable()?;
        if let Some(nr) = self.space.pop_free_bucket(dev)? {
            return Ok(nr);
        }
        if let Some(nr) = self.refill(dev)? {
            return Ok(nr);
        }

        let candidates = self.space.find_reclaim_candidates(dev, self.gc_policy)?;
        let invalidated = self.space.invalidate_candidates(dev)?;
        debug!(target: "lfs::core", device = dev.0, candidates, invalidated, "allocator_reclaim");
        if let Some(nr) = self.refill(dev)? {
            return Ok(nr);
        }

        let waiting = self.space.device(dev)?.free_inc_len();
        if waiting > 0 {
            debug!(
                target: "lfs::core",
                device = dev.0,
                waiting,
                last_seq_ondisk = self.journal.last_seq_ondisk(),
                "allocator_wait_journal"
            );
            self.journal.flush_meta().map_err(|e| self.escalate(e))?;
            if let Some(nr) = self.refill(dev)? {
                return Ok(nr);
            }
        }

        warn!(target: "lfs::core", device = dev.0, waiting, "allocator_no_space");
        Err(LfsError::NoSpace)
    }

    /// Hand a bucket from [`Self::allocate_bucket`] back once the writer is
    /// done with it. Its sectors stay accounted to the keys written into it;
    /// an empty bucket becomes available again.
    pub fn release_bucket(&self, dev: DeviceIdx, nr: BucketNumber) -> Result<()> {
        let old = self.space.device(dev)?.mark_alloc_bucket(nr, false)?;
        if !old.owned_by_allocator() {
            return Err(LfsError::Invariant(format!(
                "release of bucket {} on device {} not owned by the allocator",
                nr.0, dev.0
            )));
        }
        trace!(target: "lfs::core", device = dev.0, bucket = nr.0, "bucket_release");
        Ok(())
    }

    // ── Reporting ───────────────────────────────────────────────────────

    #[must_use]
    pub fn stats(&self) -> CoreStats {
        CoreStats {
            usage: self.space.usage(),
            capacity: self.space.capacity(),
            sectors_available: self.space.sectors_available(),
            devices: self.space.devices().map(lfs_buckets::device::Device::usage).collect(),
            journal: self.journal.stats(),
            gc_needed: self.space.gc_needed(),
            read_only: self.is_read_only(),
        }
    }
}

impl<W: JournalWriter + 'static> CoreFs<W> {
    /// Start the background writer that flushes entries left dirty too long.
    pub fn start_write_timer(&self) -> Result<WriteTimer> {
        spawn_write_timer(Arc::clone(&self.journal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lfs_buckets::ReservationFlags;
    use lfs_journal::{JournalConfig, MemWriter};
    use lfs_types::{BucketGen, Extent, ExtentPtr, MemberInfo};

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

    fn extent_in(bucket: u64, generation: u8) -> Bkey {
        Bkey::Extent(Extent {
            ptrs: vec![ExtentPtr {
                dev: DeviceIdx(0),
                offset: bucket * u64::from(BUCKET),
                generation: BucketGen(generation),
                cached: false,
            }],
            compression: None,
        })
    }

    #[test]
    fn format_reserves_journal_buckets() {
        let fs = CoreFs::format(&config(32), MemWriter::new()).unwrap();
        let dev = fs.space().device(DeviceIdx(0)).unwrap();
        for nr in 1..5 {
            assert_eq!(dev.bucket(BucketNumber(nr)).unwrap().mark().data_type(), BucketDataType::Journal);
        }
        assert_eq!(dev.bucket(BucketNumber(5)).unwrap().mark().data_type(), BucketDataType::Unused);
        assert_eq!(dev.usage().buckets_meta, 4);
        assert_eq!(fs.journal().ring().buckets().len(), 4);
    }

    #[test]
    fn journal_key_marks_with_seq_and_pins() {
        let fs = CoreFs::format(&config(32), MemWriter::new()).unwrap();
        let key = extent_in(8, 0);
        let seq = fs.journal_key(BtreeId::Extents, &key, 4, false, None).unwrap();
        assert_eq!(seq, 1);

        let mark = fs.space().device(DeviceIdx(0)).unwrap().bucket(BucketNumber(8)).unwrap().mark();
        assert_eq!(mark.dirty_sectors(), 4);
        assert_eq!(mark.journal_seq(), Some(1));

        fs.journal().flush().unwrap();
        let written = fs.journal().writer().jsets();
        assert_eq!(written[0].entries().unwrap()[0].keys, vec![key]);
        assert_eq!(fs.journal().last_seq_ondisk(), 1);
        fs.node_flushed(seq).unwrap();
        assert!(matches!(fs.node_flushed(seq), Err(LfsError::Invariant(_))));
    }

    #[test]
    fn journal_key_consumes_reservation() {
        let fs = CoreFs::format(&config(32), MemWriter::new()).unwrap();
        let mut res = fs.disk_reservation_get(8, ReservationFlags::NONE).unwrap();
        fs.journal_key(BtreeId::Extents, &extent_in(9, 0), 8, false, Some(&mut res)).unwrap();
        assert_eq!(res.sectors(), 0);
        fs.disk_reservation_put(res);
    }

    #[test]
    fn failed_mark_pins_nothing() {
        let fs = CoreFs::format(&config(32), MemWriter::new()).unwrap();
        let bad = Bkey::Extent(Extent {
            ptrs: vec![ExtentPtr {
                dev: DeviceIdx(3),
                offset: 0,
                generation: BucketGen(0),
                cached: false,
            }],
            compression: None,
        });
        assert!(fs.journal_key(BtreeId::Extents, &bad, 4, false, None).is_err());
        // A missing device is the caller's mistake, not damage.
        assert!(!fs.is_read_only());
        assert_eq!(fs.journal().stats().pinned_seqs, 1);
        fs.journal().flush().unwrap();
        assert_eq!(fs.journal().writer().len(), 1);
        assert!(fs.journal().writer().jsets()[0].entries().unwrap().is_empty());
    }

    #[test]
    fn oversized_key_is_refused_before_marking() {
        let fs = CoreFs::format(&config(32), MemWriter::new()).unwrap();
        let wide = Bkey::Extent(Extent {
            ptrs: vec![
                ExtentPtr {
                    dev: DeviceIdx(0),
                    offset: 8 * u64::from(BUCKET),
                    generation: BucketGen(0),
                    cached: true,
                };
                Bkey::MAX_PTRS + 1
            ],
            compression: None,
        });
        assert!(matches!(
            fs.journal_key(BtreeId::Extents, &wide, 1, false, None),
            Err(LfsError::Invariant(_))
        ));
        let mark = fs.space().device(DeviceIdx(0)).unwrap().bucket(BucketNumber(8)).unwrap().mark();
        assert_eq!(mark.cached_sectors(), 0);
        assert_eq!(fs.journal().seq(), 0);
    }

    #[test]
    fn release_requires_ownership() {
        let fs = CoreFs::format(&config(16), MemWriter::new()).unwrap();
        let nr = fs.allocate_bucket(DeviceIdx(0)).unwrap();
        fs.release_bucket(DeviceIdx(0), nr).unwrap();
        let dev = fs.space().device(DeviceIdx(0)).unwrap();
        assert!(dev.bucket(nr).unwrap().mark().is_available());
        assert!(matches!(fs.release_bucket(DeviceIdx(0), nr), Err(LfsError::Invariant(_))));
    }

    #[test]
    fn allocation_skips_journal_buckets() {
        let fs = CoreFs::format(&config(16), MemWriter::new()).unwrap();
        let mut got = Vec::new();
        while let Ok(nr) = fs.allocate_bucket(DeviceIdx(0)) {
            got.push(nr.0);
        }
        got.sort_unstable();
        assert_eq!(got, (5..16).collect::<Vec<_>>());
    }
}
