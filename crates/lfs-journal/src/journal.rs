//! Double-buffered journal.
//!
//! Appenders reserve space in the open entry with a single compare-and-swap
//! on the packed reservation word ([`ResState`]) and copy their words into
//! the entry's buffer without taking a lock. Everything else (opening and
//! closing entries, placing them in the ring, waiting) happens under the
//! metadata lock.
//!
//! # Lock order
//!
//! `reclaim_lock` → `meta` → `pins` / `blacklist`. `fault` is a leaf.
//! Writer I/O is issued with no journal lock held.
//!
//! # Lifecycle of an entry
//!
//! 1. Opened under `meta` in buffer `idx`, taking one reference on that
//!    buffer and one pin on its seq.
//! 2. Closed under `meta` when full, flushed, or dirty for too long: `idx`
//!    flips, `prev_buf_unwritten` is set and the entry's own buffer
//!    reference is dropped.
//! 3. Whoever drops the last buffer reference builds the [`Jset`], places it
//!    in the ring and hands it to the [`JournalWriter`].
//! 4. On completion `prev_buf_unwritten` clears (allowing the next close)
//!    and the entry's own pin is dropped.

use crate::blacklist::{BlacklistEntry, SeqBlacklist};
use crate::config::JournalConfig;
use crate::jset::{
    JSET_BLACKLIST_SLACK, JSET_HEADER_WORDS, Jset, JsetEntryKind, encode_keys_entry, words_to_sectors,
};
use crate::pin::PinList;
use crate::replay::ReplayPlan;
use crate::res_state::{BUF_COUNT_MAX, CLOSED_VAL, ERROR_VAL, ResState};
use crate::ring::JournalRing;
use crate::writer::JournalWriter;
use lfs_error::{LfsError, Result};
use lfs_types::atomic::{try_update, update};
use lfs_types::{Bkey, Bpos, BtreeId, SECTOR_SIZE};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Upper bound on a single condvar wait. Waiters re-check their condition
/// after every wakeup, so this only bounds the cost of a missed notify.
const WAIT_SLICE: Duration = Duration::from_millis(10);

const WORDS_PER_SECTOR: usize = 64;
const _: () = assert!(WORDS_PER_SECTOR as u64 * 8 == SECTOR_SIZE);

/// A claim on `u64s` words of one open journal entry.
///
/// Fill it with [`Journal::res_write`] or [`Journal::add_keys`] and release
/// it with [`Journal::res_put`]. The entry cannot be written while any
/// reservation on it is outstanding.
#[must_use = "journal reservations must be released with Journal::res_put"]
#[derive(Debug, PartialEq, Eq)]
pub struct JournalRes {
    seq: u64,
    idx: usize,
    offset: u32,
    u64s: u32,
    used: u32,
}

impl JournalRes {
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    #[must_use]
    pub fn idx(&self) -> usize {
        self.idx
    }

    /// Word offset within the entry.
    #[must_use]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    #[must_use]
    pub fn u64s(&self) -> u32 {
        self.u64s
    }

    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.u64s - self.used
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JournalStats {
    pub seq: u64,
    pub seq_ondisk: u64,
    pub last_seq: u64,
    pub last_seq_ondisk: u64,
    pub entries_written: u64,
    pub res_slowpath: u64,
    pub pinned_seqs: usize,
    pub ring_spare_buckets: usize,
    pub blacklisted: usize,
    pub halted: bool,
}

struct JournalBuf {
    seq: AtomicU64,
    /// Final size, stored when the entry is closed.
    u64s: AtomicU32,
    data: Box<[AtomicU64]>,
}

impl JournalBuf {
    fn new(words: usize) -> Self {
        Self {
            seq: AtomicU64::new(0),
            u64s: AtomicU32::new(0),
            data: (0..words).map(|_| AtomicU64::new(0)).collect(),
        }
    }
}

struct JournalMeta {
    ring: JournalRing,
    /// Worst-case sectors of the closed entry not yet placed in the ring.
    prev_buf_sectors: u32,
}

struct ClosedEntry {
    seq: u64,
    idx: usize,
    /// The close dropped the last reference: the closer writes.
    write_now: bool,
}

pub struct Journal<W> {
    config: JournalConfig,
    writer: W,
    reservations: AtomicU64,
    bufs: [JournalBuf; 2],
    /// Word budget of the open entry.
    cur_entry_u64s: AtomicU32,
    /// Newest seq opened.
    seq: AtomicU64,
    seq_ondisk: AtomicU64,
    last_seq_ondisk: AtomicU64,
    /// New entries are numbered above every blacklisted seq.
    blacklist_floor: AtomicU64,
    meta: Mutex<JournalMeta>,
    wait: Condvar,
    pins: Mutex<PinList>,
    reclaim_lock: Mutex<()>,
    blacklist: Mutex<SeqBlacklist>,
    fault: Mutex<Option<String>>,
    entries_written: AtomicU64,
    res_slowpath: AtomicU64,
}

impl<W> std::fmt::Debug for Journal<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("state", &ResState::from_raw(self.reservations.load(Ordering::Relaxed)))
            .field("seq", &self.seq.load(Ordering::Relaxed))
            .field("seq_ondisk", &self.seq_ondisk.load(Ordering::Relaxed))
            .field("last_seq_ondisk", &self.last_seq_ondisk.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<W: JournalWriter> Journal<W> {
    /// A fresh journal whose first entry will be seq 1.
    pub fn new(config: JournalConfig, ring: JournalRing, writer: W) -> Result<Self> {
        Self::with_start(config, ring, writer, 1, 0, SeqBlacklist::new(), &[])
    }

    /// Resume after replay: numbering continues after everything the plan
    /// saw, and its blacklist is carried over.
    ///
    /// Every replayed entry starts out pinned, so new entries keep
    /// `last_seq` at the replay start until [`Self::replay_done`] (or a
    /// [`Self::pin_drop`] per replayed seq) says the replayed updates are in
    /// written btree nodes. `ring` should already be
    /// [restored](JournalRing::restore) from the entries found.
    pub fn from_replay(config: JournalConfig, ring: JournalRing, writer: W, plan: &ReplayPlan) -> Result<Self> {
        let replayed: Vec<u64> = plan.entries.iter().map(|j| j.seq).collect();
        Self::with_start(
            config,
            ring,
            writer,
            plan.start_seq,
            plan.last_seq,
            plan.blacklist(),
            &replayed,
        )
    }

    fn with_start(
        config: JournalConfig,
        ring: JournalRing,
        writer: W,
        start_seq: u64,
        last_seq_ondisk: u64,
        blacklist: SeqBlacklist,
        replayed: &[u64],
    ) -> Result<Self> {
        config.validate()?;
        let overhead = JSET_HEADER_WORDS + JSET_BLACKLIST_SLACK;
        let words = config.entry_words() as usize;
        if words <= overhead {
            return Err(LfsError::InvalidConfig(format!(
                "entry_size_max of {} bytes leaves no room for keys",
                config.entry_size_max
            )));
        }
        if ring.bucket_sectors() as usize * WORDS_PER_SECTOR <= overhead {
            return Err(LfsError::InvalidConfig(format!(
                "journal bucket of {} sectors cannot hold an entry",
                ring.bucket_sectors()
            )));
        }
        let floor = blacklist.max_seq().unwrap_or(0);
        let start_seq = start_seq.max(floor + 1).max(1);
        let first_pinned = replayed.first().copied().unwrap_or(start_seq);
        let mut pins = PinList::new(first_pinned, config.pin_capacity);
        for &seq in replayed {
            pins.push(seq).map_err(|_| {
                LfsError::InvalidConfig(format!(
                    "pin_capacity {} cannot hold replayed seqs {first_pinned}..{start_seq}",
                    config.pin_capacity
                ))
            })?;
        }
        info!(
            target: "lfs::journal",
            start_seq,
            last_seq_ondisk,
            replay_pins = pins.len(),
            blacklisted = blacklist.len(),
            "journal_started"
        );
        Ok(Self {
            writer,
            reservations: AtomicU64::new(ResState::INITIAL.raw()),
            bufs: [JournalBuf::new(words), JournalBuf::new(words)],
            cur_entry_u64s: AtomicU32::new(0),
            seq: AtomicU64::new(start_seq - 1),
            seq_ondisk: AtomicU64::new(start_seq - 1),
            last_seq_ondisk: AtomicU64::new(last_seq_ondisk),
            blacklist_floor: AtomicU64::new(floor),
            meta: Mutex::new(JournalMeta {
                ring,
                prev_buf_sectors: 0,
            }),
            wait: Condvar::new(),
            pins: Mutex::new(pins),
            reclaim_lock: Mutex::new(()),
            blacklist: Mutex::new(blacklist),
            fault: Mutex::new(None),
            entries_written: AtomicU64::new(0),
            res_slowpath: AtomicU64::new(0),
            config,
        })
    }

    // ── Accessors ───────────────────────────────────────────────────────

    #[must_use]
    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    #[must_use]
    pub fn writer(&self) -> &W {
        &self.writer
    }

    #[must_use]
    pub fn res_state(&self) -> ResState {
        ResState::from_raw(self.reservations.load(Ordering::Acquire))
    }

    /// Newest seq opened so far.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Newest seq known to be on disk.
    #[must_use]
    pub fn seq_ondisk(&self) -> u64 {
        self.seq_ondisk.load(Ordering::Acquire)
    }

    /// Oldest seq still pinned in memory.
    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.pins.lock().last_seq()
    }

    /// `last_seq` recorded by the newest entry on disk: replay starts here.
    #[must_use]
    pub fn last_seq_ondisk(&self) -> u64 {
        self.last_seq_ondisk.load(Ordering::Acquire)
    }

    /// Largest single reservation, in words.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn max_res_u64s(&self) -> u32 {
        self.config.entry_words() - (JSET_HEADER_WORDS + JSET_BLACKLIST_SLACK) as u32
    }

    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.res_state().is_error()
    }

    #[must_use]
    pub fn ring(&self) -> JournalRing {
        self.meta.lock().ring.clone()
    }

    #[must_use]
    pub fn blacklist(&self) -> Vec<BlacklistEntry> {
        self.blacklist.lock().iter().cloned().collect()
    }

    #[must_use]
    pub fn stats(&self) -> JournalStats {
        let ring_spare_buckets = self.meta.lock().ring.spare_buckets();
        let (last_seq, pinned_seqs) = {
            let pins = self.pins.lock();
            (pins.last_seq(), pins.len())
        };
        JournalStats {
            seq: self.seq(),
            seq_ondisk: self.seq_ondisk(),
            last_seq,
            last_seq_ondisk: self.last_seq_ondisk(),
            entries_written: self.entries_written.load(Ordering::Relaxed),
            res_slowpath: self.res_slowpath.load(Ordering::Relaxed),
            pinned_seqs,
            ring_spare_buckets,
            blacklisted: self.blacklist.lock().len(),
            halted: self.is_halted(),
        }
    }

    // ── Reservations ────────────────────────────────────────────────────

    /// Reserve `u64s` words in the open entry, opening or switching entries
    /// as needed. Blocks while no entry can be opened.
    pub fn res_get(&self, u64s: u32) -> Result<JournalRes> {
        if u64s == 0 || u64s > self.max_res_u64s() {
            return Err(LfsError::Invariant(format!(
                "journal reservation of {u64s} words outside 1..={}",
                self.max_res_u64s()
            )));
        }
        loop {
            if let Some(res) = self.res_get_fast(u64s) {
                return Ok(res);
            }
            self.res_slowpath.fetch_add(1, Ordering::Relaxed);
            self.res_get_slowpath(u64s)?;
        }
    }

    /// Lock-free attempt. Fails when no entry is open, the open entry is
    /// full, or its buffer count would overflow.
    pub fn res_get_fast(&self, u64s: u32) -> Option<JournalRes> {
        let (old, _) = try_update(&self.reservations, |raw| {
            let s = ResState::from_raw(raw);
            if !s.is_open() {
                return Err(());
            }
            let idx = s.idx();
            let end = s.offset() + u64s;
            if end > self.cur_entry_u64s.load(Ordering::Acquire) || s.buf_count(idx) >= BUF_COUNT_MAX {
                return Err(());
            }
            Ok(s.with_offset(end).with_buf_count(idx, s.buf_count(idx) + 1).raw())
        })
        .ok()?;
        let old = ResState::from_raw(old);
        let idx = old.idx();
        // Stable: the reference just taken keeps this buffer from being
        // written and reopened.
        let seq = self.bufs[idx].seq.load(Ordering::Acquire);
        trace!(target: "lfs::journal", seq, offset = old.offset(), u64s, "journal_res_get");
        Some(JournalRes {
            seq,
            idx,
            offset: old.offset(),
            u64s,
            used: 0,
        })
    }

    fn res_get_slowpath(&self, u64s: u32) -> Result<()> {
        let mut meta = self.meta.lock();
        let s = self.res_state();
        if s.is_error() {
            return Err(self.fault_error());
        }
        if s.is_open() {
            let fits = s.offset() + u64s <= self.cur_entry_u64s.load(Ordering::Acquire)
                && s.buf_count(s.idx()) < BUF_COUNT_MAX;
            if fits {
                return Ok(());
            }
            if s.prev_buf_unwritten() {
                self.wait.wait_for(&mut meta, WAIT_SLICE);
                return Ok(());
            }
            let closed = self.entry_close_locked(&mut meta);
            let opened = self.entry_open_locked(&mut meta);
            drop(meta);
            if let Some(c) = closed.filter(|c| c.write_now) {
                self.do_write(c.idx);
            }
            opened?;
            return Ok(());
        }

        if self.entry_open_locked(&mut meta)? {
            return Ok(());
        }
        drop(meta);
        self.reclaim();
        let mut meta = self.meta.lock();
        if !self.entry_open_locked(&mut meta)? {
            self.wait.wait_for(&mut meta, WAIT_SLICE);
        }
        Ok(())
    }

    /// Copy `words` into the reservation.
    pub fn res_write(&self, res: &mut JournalRes, words: &[u64]) -> Result<()> {
        let len = u32::try_from(words.len()).unwrap_or(u32::MAX);
        if len > res.remaining() {
            return Err(LfsError::Invariant(format!(
                "{len} words written to a journal reservation with {} left",
                res.remaining()
            )));
        }
        let base = (res.offset + res.used) as usize;
        let data = &self.bufs[res.idx].data[base..base + words.len()];
        for (slot, &w) in data.iter().zip(words) {
            slot.store(w, Ordering::Relaxed);
        }
        res.used += len;
        Ok(())
    }

    /// Append `keys` as one keyed sub-entry.
    pub fn add_keys(&self, res: &mut JournalRes, btree_id: BtreeId, level: u8, keys: &[Bkey]) -> Result<()> {
        let words = encode_keys_entry(JsetEntryKind::Keys, btree_id, level, keys)
            .ok_or_else(|| LfsError::Invariant(format!("{} keys too large for one journal entry", keys.len())))?;
        self.res_write(res, &words)
    }

    /// Release a reservation. The last release on a closed entry writes it.
    pub fn res_put(&self, res: JournalRes) {
        let buf = &self.bufs[res.idx];
        // Unused words become padding.
        for slot in &buf.data[(res.offset + res.used) as usize..(res.offset + res.u64s) as usize] {
            slot.store(0, Ordering::Relaxed);
        }
        let idx = res.idx;
        let (_, new) = update(&self.reservations, |raw| {
            let s = ResState::from_raw(raw);
            s.with_buf_count(idx, s.buf_count(idx).saturating_sub(1)).raw()
        });
        if ResState::from_raw(new).buf_count(idx) == 0 {
            self.do_write(idx);
        }
    }

    // ── Entry transitions ───────────────────────────────────────────────

    fn entry_close_locked(&self, meta: &mut JournalMeta) -> Option<ClosedEntry> {
        let (old, new) = try_update(&self.reservations, |raw| {
            let s = ResState::from_raw(raw);
            if !s.is_open() || s.prev_buf_unwritten() {
                return Err(());
            }
            let idx = s.idx();
            Ok(s.with_offset(CLOSED_VAL)
                .with_idx(idx ^ 1)
                .with_prev_buf_unwritten(true)
                .with_buf_count(idx, s.buf_count(idx).saturating_sub(1))
                .raw())
        })
        .ok()?;
        let (old, new) = (ResState::from_raw(old), ResState::from_raw(new));
        let idx = old.idx();
        let buf = &self.bufs[idx];
        buf.u64s.store(old.offset(), Ordering::Release);
        meta.prev_buf_sectors = words_to_sectors(old.offset() as usize + JSET_HEADER_WORDS + JSET_BLACKLIST_SLACK);
        let seq = buf.seq.load(Ordering::Acquire);
        debug!(target: "lfs::journal", seq, u64s = old.offset(), "journal_entry_closed");
        Some(ClosedEntry {
            seq,
            idx,
            write_now: new.buf_count(idx) == 0,
        })
    }

    /// Open the next entry if none is open. `Ok(false)` means the pin FIFO
    /// or the ring is full.
    fn entry_open_locked(&self, meta: &mut JournalMeta) -> Result<bool> {
        let s = self.res_state();
        if s.is_error() {
            return Err(self.fault_error());
        }
        if !s.is_closed() {
            return Ok(true);
        }
        // The last spare bucket is kept for an entry that publishes a newer
        // last_seq; without it a full ring could never be reclaimed.
        let reserve = usize::from(self.pins.lock().last_seq() <= self.last_seq_ondisk());
        let sectors = meta.ring.space_for_next_entry(meta.prev_buf_sectors, reserve);
        let u64s = (sectors as usize * WORDS_PER_SECTOR)
            .saturating_sub(JSET_HEADER_WORDS + JSET_BLACKLIST_SLACK)
            .min(self.max_res_u64s() as usize);
        if u64s == 0 {
            debug!(target: "lfs::journal", "journal_ring_full");
            return Ok(false);
        }
        let seq = (self.seq() + 1).max(self.blacklist_floor.load(Ordering::Acquire) + 1);
        {
            let mut pins = self.pins.lock();
            if pins.is_full() {
                debug!(target: "lfs::journal::pin", seq, "journal_pins_full");
                return Ok(false);
            }
            pins.push(seq)?;
        }

        let idx = s.idx();
        self.bufs[idx].seq.store(seq, Ordering::Release);
        self.bufs[idx].u64s.store(0, Ordering::Release);
        self.cur_entry_u64s
            .store(u32::try_from(u64s).unwrap_or(u32::MAX), Ordering::Release);
        self.seq.store(seq, Ordering::Release);
        try_update(&self.reservations, |raw| {
            let s = ResState::from_raw(raw);
            if !s.is_closed() {
                return Err(());
            }
            Ok(s.with_offset(0).with_buf_count(s.idx(), s.buf_count(s.idx()) + 1).raw())
        })
        .map_err(|()| self.fault_error())?;
        debug!(target: "lfs::journal", seq, idx, u64s, "journal_entry_opened");
        self.wait.notify_all();
        Ok(true)
    }

    fn do_write(&self, idx: usize) {
        let (jset, location) = {
            let mut meta = self.meta.lock();
            if self.res_state().is_error() {
                return;
            }
            let buf = &self.bufs[idx];
            let seq = buf.seq.load(Ordering::Acquire);
            let u64s = buf.u64s.load(Ordering::Acquire) as usize;
            let jset = Jset {
                seq,
                last_seq: self.pins.lock().last_seq(),
                payload: buf.data[..u64s].iter().map(|w| w.load(Ordering::Relaxed)).collect(),
                blacklisted: self.blacklist.lock().pending(JSET_BLACKLIST_SLACK),
            };
            let Some(location) = meta.ring.place(jset.sectors(), seq) else {
                drop(meta);
                self.halt(format!("no journal space for entry {seq}"));
                return;
            };
            meta.prev_buf_sectors = 0;
            (jset, location)
        };
        match self.writer.write(location, &jset) {
            Ok(()) => self.write_done(&jset),
            Err(e) => self.halt(format!("write of journal entry {} failed: {e}", jset.seq)),
        }
    }

    fn write_done(&self, jset: &Jset) {
        self.seq_ondisk.fetch_max(jset.seq, Ordering::AcqRel);
        let prev_last_seq = self.last_seq_ondisk.fetch_max(jset.last_seq, Ordering::AcqRel);
        self.entries_written.fetch_add(1, Ordering::Relaxed);
        {
            let mut blacklist = self.blacklist.lock();
            for &seq in &jset.blacklisted {
                if let Err(e) = blacklist.finalize(seq) {
                    warn!(target: "lfs::journal::blacklist", seq, error = %e, "blacklist_finalize_failed");
                }
            }
        }
        update(&self.reservations, |raw| {
            ResState::from_raw(raw).with_prev_buf_unwritten(false).raw()
        });
        info!(
            target: "lfs::journal",
            seq = jset.seq,
            last_seq = jset.last_seq,
            sectors = jset.sectors(),
            blacklisted = jset.blacklisted.len(),
            "journal_entry_written"
        );
        if let Err(e) = self.pin_drop(jset.seq) {
            error!(target: "lfs::journal::pin", seq = jset.seq, error = %e, "journal_entry_pin_lost");
        }
        if jset.last_seq > prev_last_seq {
            self.reclaim();
        }
        self.notify_waiters();
    }

    /// Poison the reservation word. Every later reservation, flush or open
    /// fails with [`LfsError::JournalFault`]. Must not be called with the
    /// metadata lock held.
    pub fn halt(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut fault = self.fault.lock();
            if fault.is_none() {
                error!(target: "lfs::journal", reason = %reason, "journal_halted");
                *fault = Some(reason);
            }
        }
        update(&self.reservations, |raw| ResState::from_raw(raw).with_offset(ERROR_VAL).raw());
        self.notify_waiters();
    }

    fn fault_error(&self) -> LfsError {
        LfsError::JournalFault(
            self.fault
                .lock()
                .clone()
                .unwrap_or_else(|| "journal halted".to_owned()),
        )
    }

    fn notify_waiters(&self) {
        drop(self.meta.lock());
        self.wait.notify_all();
    }

    // ── Flush ───────────────────────────────────────────────────────────

    /// Wait until every entry up to `seq` is on disk, closing the open
    /// entry if it is one of them.
    pub fn flush_seq(&self, seq: u64) -> Result<()> {
        loop {
            let mut meta = self.meta.lock();
            let s = self.res_state();
            if s.is_error() {
                return Err(self.fault_error());
            }
            let cur = self.seq();
            if seq > cur {
                return Err(LfsError::Invariant(format!("flush of seq {seq} beyond newest seq {cur}")));
            }
            let idx = s.idx();
            if s.prev_buf_unwritten() && self.bufs[idx ^ 1].seq.load(Ordering::Acquire) <= seq {
                self.wait.wait_for(&mut meta, WAIT_SLICE);
                continue;
            }
            if s.is_open() && self.bufs[idx].seq.load(Ordering::Acquire) <= seq {
                let closed = self.entry_close_locked(&mut meta);
                drop(meta);
                if let Some(c) = closed.filter(|c| c.write_now) {
                    self.do_write(c.idx);
                }
                continue;
            }
            return Ok(());
        }
    }

    /// Flush everything journaled so far. An open entry with no
    /// reservations is left alone.
    pub fn flush(&self) -> Result<()> {
        let target = {
            let _meta = self.meta.lock();
            let s = self.res_state();
            let cur = self.seq();
            if s.is_open() && s.offset() == 0 { cur.saturating_sub(1) } else { cur }
        };
        self.flush_seq(target)
    }

    /// Write an entry even if nothing is journaled, so the `last_seq` on
    /// disk catches up with pins dropped since the last write.
    pub fn flush_meta(&self) -> Result<()> {
        let res = self.res_get(1)?;
        let seq = res.seq();
        self.res_put(res);
        self.flush_seq(seq)
    }

    /// Write-timer step: closes the open entry once it has been seen dirty
    /// at the same seq on two consecutive ticks. `seen` carries the seq
    /// observed on the previous tick.
    pub(crate) fn timer_tick(&self, seen: &mut Option<u64>) {
        let s = self.res_state();
        if !s.is_open() || s.offset() == 0 {
            *seen = None;
            return;
        }
        let seq = self.bufs[s.idx()].seq.load(Ordering::Acquire);
        if *seen != Some(seq) {
            *seen = Some(seq);
            return;
        }
        *seen = None;
        let closed = {
            let mut meta = self.meta.lock();
            let s = self.res_state();
            if s.is_open() && self.bufs[s.idx()].seq.load(Ordering::Acquire) == seq {
                self.entry_close_locked(&mut meta)
            } else {
                None
            }
        };
        if let Some(c) = closed {
            debug!(target: "lfs::journal", seq = c.seq, "journal_entry_dirty_too_long");
            if c.write_now {
                self.do_write(c.idx);
            }
        }
    }

    // ── Pins and reclaim ────────────────────────────────────────────────

    /// Pin `seq` on behalf of a dirty btree node.
    pub fn pin_add(&self, seq: u64) -> Result<()> {
        let count = self.pins.lock().add(seq)?;
        trace!(target: "lfs::journal::pin", seq, count, "journal_pin_add");
        Ok(())
    }

    /// Release one pin on `seq`. Reclaims journal buckets when the oldest
    /// pinned seq moves.
    pub fn pin_drop(&self, seq: u64) -> Result<()> {
        let advanced = self.pins.lock().drop_ref(seq)?;
        trace!(target: "lfs::journal::pin", seq, advanced, "journal_pin_drop");
        if advanced {
            self.reclaim();
        }
        Ok(())
    }

    /// Release the pins [`Self::from_replay`] took on every replayed entry,
    /// once their updates are in written btree nodes.
    pub fn replay_done(&self, plan: &ReplayPlan) -> Result<()> {
        for jset in &plan.entries {
            self.pin_drop(jset.seq)?;
        }
        debug!(target: "lfs::journal", entries = plan.entries.len(), "journal_replay_pins_released");
        Ok(())
    }

    /// Free ring buckets holding only entries older than both the oldest
    /// pinned seq and the `last_seq` of the newest entry on disk: replay
    /// after a crash starts from the latter. Returns the number of buckets
    /// freed.
    pub fn reclaim(&self) -> usize {
        let _order = self.reclaim_lock.lock();
        let freed = {
            let mut meta = self.meta.lock();
            let oldest = self.pins.lock().last_seq().min(self.last_seq_ondisk());
            let freed = meta.ring.reclaim(oldest);
            self.blacklist.lock().prune(self.last_seq_ondisk());
            if freed > 0 {
                debug!(
                    target: "lfs::journal",
                    oldest,
                    freed,
                    last_idx = meta.ring.last_idx(),
                    "journal_buckets_reclaimed"
                );
            }
            freed
        };
        if freed > 0 {
            self.wait.notify_all();
        }
        freed
    }

    // ── Blacklist ───────────────────────────────────────────────────────

    /// Decide whether a btree bset written at `bset_seq` must be ignored.
    ///
    /// A bset newer than any seq this journal has opened came from an entry
    /// that never reached disk: the gap up to it is blacklisted, the node is
    /// recorded and the answer is yes. An older bset is ignored only if its
    /// seq is already blacklisted.
    pub fn seq_should_ignore(&self, bset_seq: u64, btree_id: BtreeId, pos: Bpos) -> Result<bool> {
        let _meta = self.meta.lock();
        let cur = self.seq();
        let mut blacklist = self.blacklist.lock();
        if bset_seq <= cur {
            if !blacklist.contains(bset_seq) {
                return Ok(false);
            }
            blacklist.add_node(bset_seq, btree_id, pos)?;
            return Ok(true);
        }
        let span = bset_seq - cur;
        if span > (self.config.pin_capacity / 2) as u64 {
            return Err(LfsError::Invariant(format!(
                "bset seq {bset_seq} is {span} ahead of journal seq {cur}"
            )));
        }
        for seq in cur + 1..=bset_seq {
            blacklist.mark_blacklisted(seq);
        }
        blacklist.add_node(bset_seq, btree_id, pos)?;
        self.blacklist_floor.fetch_max(bset_seq, Ordering::AcqRel);
        info!(
            target: "lfs::journal::blacklist",
            from = cur + 1,
            to = bset_seq,
            btree = ?btree_id,
            "journal_seqs_blacklisted"
        );
        Ok(true)
    }

    /// Record `seq` as non-authoritative. It is persisted with the next
    /// entry written. Seqs already on disk cannot be blacklisted.
    pub fn mark_blacklisted(&self, seq: u64) -> Result<bool> {
        let _meta = self.meta.lock();
        if seq <= self.seq_ondisk() {
            return Err(LfsError::Invariant(format!(
                "seq {seq} is already on disk (seq_ondisk {})",
                self.seq_ondisk()
            )));
        }
        let added = self.blacklist.lock().mark_blacklisted(seq);
        self.blacklist_floor.fetch_max(seq, Ordering::AcqRel);
        Ok(added)
    }

    /// Mark `seq`'s blacklist entry as persisted by an outside mechanism.
    pub fn blacklist_finalize(&self, seq: u64) -> Result<()> {
        self.blacklist.lock().finalize(seq)
    }

    #[must_use]
    pub fn is_blacklisted(&self, seq: u64) -> bool {
        self.blacklist.lock().contains(seq)
    }
}
