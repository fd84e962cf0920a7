//! Bounded heap of GC reclamation candidates.
//!
//! The heap never grows past the capacity it was built with. Once full, the
//! root holds the least favorable entry kept so far; a new entry replaces it
//! only if it is more favorable. A scan over any number of buckets therefore
//! ends with the best `capacity` candidates in fixed memory.

use lfs_types::BucketNumber;

/// A candidate bucket and its score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapEntry {
    pub bucket: BucketNumber,
    pub value: u64,
}

/// Which scores are favorable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapOrder {
    /// Keep the lowest scores (e.g. emptiest buckets first).
    KeepLowest,
    /// Keep the highest scores (e.g. most stale buckets first).
    KeepHighest,
}

impl HeapOrder {
    /// `a` is strictly more favorable than `b`.
    fn better(self, a: u64, b: u64) -> bool {
        match self {
            Self::KeepLowest => a < b,
            Self::KeepHighest => a > b,
        }
    }
}

#[derive(Debug)]
pub struct BucketHeap {
    data: Vec<HeapEntry>,
    capacity: usize,
    order: HeapOrder,
}

impl BucketHeap {
    #[must_use]
    pub fn new(capacity: usize, order: HeapOrder) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
            order,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.data.len() >= self.capacity
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn order(&self) -> HeapOrder {
        self.order
    }

    /// Empty the heap and switch its ordering, keeping the allocation.
    pub fn reset(&mut self, order: HeapOrder) {
        self.data.clear();
        self.order = order;
    }

    /// The least favorable entry currently kept.
    #[must_use]
    pub fn peek_worst(&self) -> Option<HeapEntry> {
        self.data.first().copied()
    }

    /// Offer a candidate. Returns whether it was kept.
    pub fn push(&mut self, bucket: BucketNumber, value: u64) -> bool {
        let entry = HeapEntry { bucket, value };
        if !self.is_full() {
            self.data.push(entry);
            self.sift_up(self.data.len() - 1);
            return true;
        }
        match self.data.first() {
            Some(root) if self.order.better(value, root.value) => {
                self.data[0] = entry;
                self.sift_down(0);
                true
            }
            _ => false,
        }
    }

    /// Remove and return the least favorable entry.
    pub fn pop_worst(&mut self) -> Option<HeapEntry> {
        if self.data.is_empty() {
            return None;
        }
        let last = self.data.len() - 1;
        self.data.swap(0, last);
        let worst = self.data.pop();
        if !self.data.is_empty() {
            self.sift_down(0);
        }
        worst
    }

    /// Drain all entries, most favorable first.
    pub fn drain_best_first(&mut self) -> Vec<HeapEntry> {
        let mut out = Vec::with_capacity(self.data.len());
        while let Some(e) = self.pop_worst() {
            out.push(e);
        }
        out.reverse();
        out
    }

    /// Parent must be no more favorable than its children.
    fn out_of_order(&self, parent: usize, child: usize) -> bool {
        self.order.better(self.data[parent].value, self.data[child].value)
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if !self.out_of_order(parent, idx) {
                break;
            }
            self.data.swap(parent, idx);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.data.len();
        loop {
            let left = 2 * idx + 1;
            let right = left + 1;
            let mut worst = idx;
            if left < len && self.out_of_order(worst, left) {
                worst = left;
            }
            if right < len && self.out_of_order(worst, right) {
                worst = right;
            }
            if worst == idx {
                break;
            }
            self.data.swap(idx, worst);
            idx = worst;
        }
    }
}
