//! Replay planning.
//!
//! Given every entry read back from the journal ring, decide which ones
//! replay applies and where numbering resumes. The newest entry's
//! `last_seq` bounds what is still needed; blacklisted seqs recorded by any
//! entry are skipped and carried over into the new journal.

use crate::blacklist::SeqBlacklist;
use crate::jset::{Jset, JsetEntry, JsetError};
use std::collections::BTreeSet;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayPlan {
    /// Entries to replay, in seq order.
    pub entries: Vec<Jset>,
    /// Seqs recorded as blacklisted, ascending.
    pub blacklisted: Vec<u64>,
    /// Seqs in `last_seq..=newest` that are neither present nor
    /// blacklisted.
    pub missing: Vec<u64>,
    /// First seq the resumed journal may use.
    pub start_seq: u64,
    /// `last_seq` of the newest entry, 0 if none was found.
    pub last_seq: u64,
}

impl ReplayPlan {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// Blacklist to resume with: every recorded seq, already written.
    #[must_use]
    pub fn blacklist(&self) -> SeqBlacklist {
        let mut blacklist = SeqBlacklist::new();
        for &seq in &self.blacklisted {
            blacklist.restore(seq);
        }
        blacklist
    }

    /// Decoded sub-entries of every replayed entry, tagged with their seq.
    pub fn decoded(&self) -> Result<Vec<(u64, JsetEntry)>, JsetError> {
        let mut out = Vec::new();
        for jset in &self.entries {
            out.extend(jset.entries()?.into_iter().map(|e| (jset.seq, e)));
        }
        Ok(out)
    }
}

pub fn plan_replay(jsets: impl IntoIterator<Item = Jset>) -> ReplayPlan {
    let mut jsets: Vec<Jset> = jsets.into_iter().collect();
    jsets.sort_by_key(|j| j.seq);
    jsets.dedup_by_key(|j| j.seq);

    let blacklisted: BTreeSet<u64> = jsets.iter().flat_map(|j| j.blacklisted.iter().copied()).collect();
    let Some(newest) = jsets.last() else {
        let start_seq = blacklisted.last().map_or(1, |&s| s + 1);
        return ReplayPlan {
            blacklisted: blacklisted.into_iter().collect(),
            start_seq,
            ..ReplayPlan::default()
        };
    };
    let newest_seq = newest.seq;
    let last_seq = newest.last_seq.min(newest_seq);

    let entries: Vec<Jset> = jsets
        .into_iter()
        .filter(|j| j.seq >= last_seq && !blacklisted.contains(&j.seq))
        .collect();
    let present: BTreeSet<u64> = entries.iter().map(|j| j.seq).collect();
    let missing: Vec<u64> = (last_seq..=newest_seq)
        .filter(|s| !present.contains(s) && !blacklisted.contains(s))
        .collect();
    if !missing.is_empty() {
        warn!(
            target: "lfs::journal",
            first = missing[0],
            count = missing.len(),
            "journal_replay_missing_entries"
        );
    }
    let start_seq = newest_seq.max(blacklisted.last().copied().unwrap_or(0)) + 1;
    info!(
        target: "lfs::journal",
        last_seq,
        newest_seq,
        entries = entries.len(),
        blacklisted = blacklisted.len(),
        start_seq,
        "journal_replay_planned"
    );
    ReplayPlan {
        entries,
        blacklisted: blacklisted.into_iter().collect(),
        missing,
        start_seq,
        last_seq,
    }
}
