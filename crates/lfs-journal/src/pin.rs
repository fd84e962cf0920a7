//! FIFO of reference counts, one per unreclaimed journal sequence number.
//!
//! The slot for `seq` lives at `seq - front_seq`. Each open journal entry
//! holds one reference on its own slot, dropped when the entry is on disk;
//! every dirty btree node holds one more, dropped when the node is written.
//! Once the front slot reaches zero it is popped, which moves the oldest
//! sequence the journal must retain (`last_seq`) forward.

use lfs_error::{LfsError, Result};
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct PinList {
    counts: VecDeque<u32>,
    /// Sequence number of `counts[0]`.
    front_seq: u64,
    capacity: usize,
}

impl PinList {
    /// An empty FIFO whose next slot will be `next_seq`.
    #[must_use]
    pub fn new(next_seq: u64, capacity: usize) -> Self {
        Self {
            counts: VecDeque::with_capacity(capacity.min(4096)),
            front_seq: next_seq,
            capacity,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.counts.len() >= self.capacity
    }

    /// Oldest sequence still pinned, or the next one to be created when
    /// nothing is.
    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.front_seq
    }

    /// One past the newest slot.
    #[must_use]
    pub fn end_seq(&self) -> u64 {
        self.front_seq + self.counts.len() as u64
    }

    #[must_use]
    pub fn count(&self, seq: u64) -> Option<u32> {
        self.slot(seq).map(|i| self.counts[i])
    }

    /// Create the slot for a newly opened entry, holding the entry's own
    /// reference. Sequence numbers skipped since the previous slot get empty
    /// slots so the FIFO stays dense; an empty FIFO just moves its front.
    pub fn push(&mut self, seq: u64) -> Result<()> {
        let end = self.end_seq();
        if self.counts.is_empty() && seq >= end {
            self.front_seq = seq;
            self.counts.push_back(1);
            return Ok(());
        }
        if seq < end {
            return Err(LfsError::Invariant(format!(
                "pin slot for seq {seq} created out of order (next is {end})"
            )));
        }
        let needed = usize::try_from(seq - end + 1).unwrap_or(usize::MAX);
        if self.counts.len().saturating_add(needed) > self.capacity {
            return Err(LfsError::Invariant(format!("pin FIFO full at seq {seq}")));
        }
        self.counts.extend(std::iter::repeat_n(0, needed - 1));
        self.counts.push_back(1);
        self.pop_unpinned();
        Ok(())
    }

    /// Take one more reference on an existing slot.
    pub fn add(&mut self, seq: u64) -> Result<u32> {
        let Some(i) = self.slot(seq) else {
            return Err(self.unknown(seq, "add"));
        };
        if self.counts[i] == 0 {
            // The slot is only kept because an older one is still pinned;
            // its entry is already reclaimable.
            return Err(LfsError::Invariant(format!("pin add on released seq {seq}")));
        }
        self.counts[i] += 1;
        Ok(self.counts[i])
    }

    /// Release one reference. Returns whether `last_seq` advanced.
    pub fn drop_ref(&mut self, seq: u64) -> Result<bool> {
        let Some(i) = self.slot(seq) else {
            return Err(self.unknown(seq, "drop"));
        };
        if self.counts[i] == 0 {
            return Err(LfsError::Invariant(format!("pin drop on seq {seq} with no references")));
        }
        self.counts[i] -= 1;
        let before = self.front_seq;
        self.pop_unpinned();
        Ok(self.front_seq != before)
    }

    fn pop_unpinned(&mut self) {
        while self.counts.front() == Some(&0) {
            self.counts.pop_front();
            self.front_seq += 1;
        }
    }

    fn slot(&self, seq: u64) -> Option<usize> {
        let i = usize::try_from(seq.checked_sub(self.front_seq)?).ok()?;
        (i < self.counts.len()).then_some(i)
    }

    fn unknown(&self, seq: u64, op: &str) -> LfsError {
        LfsError::Invariant(format!(
            "pin {op} for seq {seq} outside live range {}..{}",
            self.front_seq,
            self.end_seq()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_drop_balance_advances_last_seq() {
        let mut pins = PinList::new(1, 16);
        pins.push(1).unwrap();
        pins.push(2).unwrap();
        assert_eq!(pins.last_seq(), 1);

        assert_eq!(pins.add(1).unwrap(), 2);
        assert!(!pins.drop_ref(1).unwrap());
        assert_eq!(pins.count(1), Some(1));
        // The entry's own reference goes last.
        assert!(pins.drop_ref(1).unwrap());
        assert_eq!(pins.last_seq(), 2);
        assert_eq!(pins.count(1), None);
    }

    #[test]
    fn out_of_order_release_waits_for_front() {
        let mut pins = PinList::new(5, 16);
        for seq in 5..8 {
            pins.push(seq).unwrap();
        }
        assert!(!pins.drop_ref(6).unwrap());
        assert!(!pins.drop_ref(7).unwrap());
        assert_eq!(pins.last_seq(), 5);
        assert!(pins.drop_ref(5).unwrap());
        assert_eq!(pins.last_seq(), 8);
        assert!(pins.is_empty());
    }

    #[test]
    fn dropping_unknown_or_released_is_invariant_violation() {
        let mut pins = PinList::new(3, 16);
        assert!(matches!(pins.drop_ref(3), Err(LfsError::Invariant(_))));
        pins.push(3).unwrap();
        pins.push(4).unwrap();
        assert!(matches!(pins.drop_ref(9), Err(LfsError::Invariant(_))));
        assert!(matches!(pins.add(2), Err(LfsError::Invariant(_))));
        pins.drop_ref(4).unwrap();
        assert!(matches!(pins.drop_ref(4), Err(LfsError::Invariant(_))));
        assert!(matches!(pins.add(4), Err(LfsError::Invariant(_))));
    }

    #[test]
    fn skipped_seqs_get_empty_slots() {
        let mut pins = PinList::new(10, 16);
        pins.push(10).unwrap();
        pins.push(14).unwrap();
        assert_eq!(pins.len(), 5);
        assert_eq!(pins.count(12), Some(0));
        assert!(pins.drop_ref(10).unwrap());
        assert_eq!(pins.last_seq(), 14);
        assert_eq!(pins.len(), 1);
    }

    #[test]
    fn empty_fifo_jumps_to_new_front() {
        let mut pins = PinList::new(3, 4);
        pins.push(3).unwrap();
        assert!(pins.drop_ref(3).unwrap());
        pins.push(100).unwrap();
        assert_eq!(pins.last_seq(), 100);
        assert_eq!(pins.len(), 1);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut pins = PinList::new(0, 2);
        pins.push(0).unwrap();
        pins.push(1).unwrap();
        assert!(pins.is_full());
        assert!(pins.push(2).is_err());
        assert!(matches!(pins.push(1), Err(LfsError::Invariant(_))));
    }
}
