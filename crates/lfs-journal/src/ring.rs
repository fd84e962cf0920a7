//! Ring of journal buckets on one device.
//!
//! Buckets `last_idx..=cur_idx` (wrapping) hold entries replay may still
//! need. Entries are appended to `cur_idx`; when one does not fit, the ring
//! advances to the next bucket, which must not be `last_idx`. Reclaim moves
//! `last_idx` forward past buckets whose newest entry is older than the
//! oldest seq replay could still start from.

use lfs_error::{LfsError, Result};
use lfs_types::{BucketNumber, DeviceIdx};
use serde::Serialize;

/// Where a journal entry is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct JournalLocation {
    pub dev: DeviceIdx,
    pub bucket: BucketNumber,
    /// Position of the bucket in the ring.
    pub ring_idx: usize,
    /// Sector offset within the bucket.
    pub offset: u32,
    pub sectors: u32,
}

#[derive(Debug, Clone)]
pub struct JournalRing {
    dev: DeviceIdx,
    buckets: Vec<BucketNumber>,
    /// Newest seq written to each bucket, 0 if none.
    bucket_seq: Vec<u64>,
    bucket_sectors: u32,
    cur_idx: usize,
    last_idx: usize,
    /// Sectors left in `cur_idx`.
    sectors_free: u32,
}

impl JournalRing {
    pub fn new(dev: DeviceIdx, buckets: Vec<BucketNumber>, bucket_sectors: u32) -> Result<Self> {
        if buckets.len() < 2 {
            return Err(LfsError::InvalidConfig(format!(
                "journal needs at least 2 buckets, got {}",
                buckets.len()
            )));
        }
        if bucket_sectors == 0 {
            return Err(LfsError::InvalidConfig("journal bucket size must be non-zero".to_owned()));
        }
        let n = buckets.len();
        Ok(Self {
            dev,
            buckets,
            bucket_seq: vec![0; n],
            bucket_sectors,
            cur_idx: 0,
            last_idx: 0,
            sectors_free: bucket_sectors,
        })
    }

    #[must_use]
    pub fn dev(&self) -> DeviceIdx {
        self.dev
    }

    #[must_use]
    pub fn buckets(&self) -> &[BucketNumber] {
        &self.buckets
    }

    #[must_use]
    pub fn bucket_sectors(&self) -> u32 {
        self.bucket_sectors
    }

    #[must_use]
    pub fn cur_idx(&self) -> usize {
        self.cur_idx
    }

    #[must_use]
    pub fn last_idx(&self) -> usize {
        self.last_idx
    }

    #[must_use]
    pub fn bucket_seq(&self, idx: usize) -> Option<u64> {
        self.bucket_seq.get(idx).copied()
    }

    /// Buckets that can still be advanced into.
    #[must_use]
    pub fn spare_buckets(&self) -> usize {
        let n = self.buckets.len();
        (self.last_idx + n - self.cur_idx - 1) % n
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.spare_buckets() == 0
    }

    /// Largest entry, in sectors, that fits once an already-closed entry of
    /// `pending` sectors has been placed, leaving `reserve` spare buckets
    /// untouched.
    #[must_use]
    pub fn space_for_next_entry(&self, pending: u32, reserve: usize) -> u32 {
        let mut free = self.sectors_free;
        let mut spare = self.spare_buckets().saturating_sub(reserve);
        if pending > 0 {
            if free >= pending {
                free -= pending;
            } else if spare > 0 {
                spare -= 1;
                free = self.bucket_sectors.saturating_sub(pending);
            } else {
                return 0;
            }
        }
        if spare > 0 { free.max(self.bucket_sectors) } else { free }
    }

    /// Claim space for an entry of `sectors` with sequence number `seq`.
    pub fn place(&mut self, sectors: u32, seq: u64) -> Option<JournalLocation> {
        if sectors == 0 || sectors > self.bucket_sectors {
            return None;
        }
        if self.sectors_free < sectors {
            if self.is_full() {
                return None;
            }
            self.cur_idx = (self.cur_idx + 1) % self.buckets.len();
            self.sectors_free = self.bucket_sectors;
            self.bucket_seq[self.cur_idx] = 0;
        }
        let loc = JournalLocation {
            dev: self.dev,
            bucket: self.buckets[self.cur_idx],
            ring_idx: self.cur_idx,
            offset: self.bucket_sectors - self.sectors_free,
            sectors,
        };
        self.sectors_free -= sectors;
        self.bucket_seq[self.cur_idx] = self.bucket_seq[self.cur_idx].max(seq);
        Some(loc)
    }

    /// Pick up after a remount from the entries found on disk, given as
    /// `(location, seq)`, and the `last_seq` replay started from.
    ///
    /// Writing continues after the newest entry, in its bucket. Every bucket
    /// behind it that still holds entries replay may need stays in use.
    pub fn restore(&mut self, written: impl IntoIterator<Item = (JournalLocation, u64)>, last_seq: u64) {
        let n = self.buckets.len();
        let mut end = vec![0_u32; n];
        let mut newest: Option<(u64, usize)> = None;
        for (loc, seq) in written {
            let idx = loc.ring_idx;
            if idx >= n || self.buckets[idx] != loc.bucket {
                continue;
            }
            self.bucket_seq[idx] = self.bucket_seq[idx].max(seq);
            end[idx] = end[idx].max(loc.offset + loc.sectors);
            if newest.is_none_or(|(s, _)| seq > s) {
                newest = Some((seq, idx));
            }
        }
        let Some((_, cur)) = newest else {
            return;
        };
        self.cur_idx = cur;
        self.sectors_free = self.bucket_sectors.saturating_sub(end[cur]);

        // Walk back over buckets written in earlier passes of the ring.
        let mut last = cur;
        for _ in 1..n {
            let prev = (last + n - 1) % n;
            if self.bucket_seq[prev] == 0 || self.bucket_seq[prev] > self.bucket_seq[last] {
                break;
            }
            last = prev;
        }
        self.last_idx = last;
        self.reclaim(last_seq);
    }

    /// Release buckets whose entries are all older than `oldest_seq`.
    /// Returns the number of buckets released.
    pub fn reclaim(&mut self, oldest_seq: u64) -> usize {
        let n = self.buckets.len();
        let mut freed = 0;
        while self.last_idx != self.cur_idx && self.bucket_seq[self.last_idx] < oldest_seq {
            self.last_idx = (self.last_idx + 1) % n;
            freed += 1;
        }
        freed
    }
}
