//! Journal sequence blacklist.
//!
//! A sequence number is blacklisted when a btree node on disk carries a bset
//! from a journal entry that never made it to disk. Replay must not treat
//! such a bset as authoritative, and the journal must never reuse the
//! number. Entries start pending and become `written` once a journal entry
//! recording them is on disk, after which replay skips them without having
//! to re-derive the decision.

use lfs_error::{LfsError, Result};
use lfs_types::{Bpos, BtreeId};
use serde::Serialize;
use tracing::debug;

/// A btree node holding a bset from a blacklisted sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlacklistedNode {
    pub btree_id: BtreeId,
    pub pos: Bpos,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlacklistEntry {
    pub seq: u64,
    /// Persisted in a written journal entry.
    pub written: bool,
    pub nodes: Vec<BlacklistedNode>,
}

#[derive(Debug, Clone, Default)]
pub struct SeqBlacklist {
    /// Sorted by seq.
    entries: Vec<BlacklistEntry>,
}

impl SeqBlacklist {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn find(&self, seq: u64) -> Option<&BlacklistEntry> {
        self.position(seq).ok().map(|i| &self.entries[i])
    }

    #[must_use]
    pub fn contains(&self, seq: u64) -> bool {
        self.position(seq).is_ok()
    }

    /// Highest blacklisted seq, if any.
    #[must_use]
    pub fn max_seq(&self) -> Option<u64> {
        self.entries.last().map(|e| e.seq)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlacklistEntry> {
        self.entries.iter()
    }

    /// Record `seq` as non-authoritative. Returns `true` if it was not
    /// already blacklisted.
    pub fn mark_blacklisted(&mut self, seq: u64) -> bool {
        match self.position(seq) {
            Ok(_) => false,
            Err(i) => {
                self.entries.insert(
                    i,
                    BlacklistEntry {
                        seq,
                        written: false,
                        nodes: Vec::new(),
                    },
                );
                debug!(target: "lfs::journal::blacklist", seq, "seq_blacklisted");
                true
            }
        }
    }

    /// Remember a node with a bset from blacklisted `seq`.
    pub fn add_node(&mut self, seq: u64, btree_id: BtreeId, pos: Bpos) -> Result<()> {
        let i = self
            .position(seq)
            .map_err(|_| LfsError::NotFound(format!("blacklist entry for seq {seq}")))?;
        let node = BlacklistedNode { btree_id, pos };
        let nodes = &mut self.entries[i].nodes;
        if !nodes.contains(&node) {
            nodes.push(node);
        }
        Ok(())
    }

    /// Mark `seq`'s entry as persisted.
    pub fn finalize(&mut self, seq: u64) -> Result<()> {
        let i = self
            .position(seq)
            .map_err(|_| LfsError::Invariant(format!("finalize of seq {seq} which is not blacklisted")))?;
        if !self.entries[i].written {
            self.entries[i].written = true;
            debug!(target: "lfs::journal::blacklist", seq, "seq_blacklist_finalized");
        }
        Ok(())
    }

    /// Restore an entry read back from a written journal entry.
    pub fn restore(&mut self, seq: u64) {
        self.mark_blacklisted(seq);
        if let Ok(i) = self.position(seq) {
            self.entries[i].written = true;
        }
    }

    /// Up to `limit` entries not yet persisted, oldest first.
    #[must_use]
    pub fn pending(&self, limit: usize) -> Vec<u64> {
        self.entries
            .iter()
            .filter(|e| !e.written)
            .take(limit)
            .map(|e| e.seq)
            .collect()
    }

    /// Drop written entries older than `last_seq`: no journal entry that
    /// replay could still read refers to them.
    pub fn prune(&mut self, last_seq: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !e.written || e.seq >= last_seq || !e.nodes.is_empty());
        before - self.entries.len()
    }

    fn position(&self, seq: u64) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by_key(&seq, |e| e.seq)
    }
}
