//! Packed journal reservation word.
//!
//! | Bits | Field |
//! |------|-------|
//! | 0..20 | offset of the open entry, in 8-byte words, or a sentinel |
//! | 20 | idx: which of the two buffers is current |
//! | 21 | prev_buf_unwritten: the other buffer is not yet on disk |
//! | 22..43 | outstanding references on buffer 0 |
//! | 43..64 | outstanding references on buffer 1 |
//!
//! Two offset values are reserved: [`CLOSED_VAL`] (no entry open; `idx`
//! names the buffer the next entry will use) and [`ERROR_VAL`] (journal
//! halted, sticky). An open entry holds one reference on its own buffer.

/// Largest journal entry in bytes.
pub const ENTRY_SIZE_MAX: u32 = 4 << 20;

pub const ENTRY_OFFSET_MAX: u32 = (1 << 20) - 1;
pub const CLOSED_VAL: u32 = ENTRY_OFFSET_MAX - 1;
pub const ERROR_VAL: u32 = ENTRY_OFFSET_MAX;

/// Largest per-buffer reference count.
pub const BUF_COUNT_MAX: u32 = (1 << 21) - 1;

const OFFSET_MASK: u64 = (1 << 20) - 1;
const IDX_BIT: u64 = 1 << 20;
const PREV_UNWRITTEN_BIT: u64 = 1 << 21;
const COUNT_MASK: u64 = (1 << 21) - 1;
const BUF0_SHIFT: u32 = 22;
const BUF1_SHIFT: u32 = 43;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResState(u64);

impl std::fmt::Debug for ResState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let offset = match self.offset() {
            CLOSED_VAL => "closed".to_owned(),
            ERROR_VAL => "error".to_owned(),
            o => o.to_string(),
        };
        f.debug_struct("ResState")
            .field("offset", &offset)
            .field("idx", &self.idx())
            .field("prev_buf_unwritten", &self.prev_buf_unwritten())
            .field("buf0", &self.buf_count(0))
            .field("buf1", &self.buf_count(1))
            .finish()
    }
}

#[expect(clippy::cast_possible_truncation)]
impl ResState {
    /// No entry open yet, buffer 0 next, nothing outstanding.
    pub const INITIAL: Self = Self(CLOSED_VAL as u64);

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn offset(self) -> u32 {
        (self.0 & OFFSET_MASK) as u32
    }

    #[must_use]
    pub fn idx(self) -> usize {
        usize::from(self.0 & IDX_BIT != 0)
    }

    #[must_use]
    pub fn prev_buf_unwritten(self) -> bool {
        self.0 & PREV_UNWRITTEN_BIT != 0
    }

    #[must_use]
    pub fn buf_count(self, idx: usize) -> u32 {
        ((self.0 >> Self::count_shift(idx)) & COUNT_MASK) as u32
    }

    #[must_use]
    pub fn is_open(self) -> bool {
        self.offset() < CLOSED_VAL
    }

    #[must_use]
    pub fn is_closed(self) -> bool {
        self.offset() == CLOSED_VAL
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self.offset() == ERROR_VAL
    }

    #[must_use]
    pub fn with_offset(self, offset: u32) -> Self {
        Self((self.0 & !OFFSET_MASK) | (u64::from(offset) & OFFSET_MASK))
    }

    #[must_use]
    pub fn with_idx(self, idx: usize) -> Self {
        if idx & 1 == 1 { Self(self.0 | IDX_BIT) } else { Self(self.0 & !IDX_BIT) }
    }

    #[must_use]
    pub fn with_prev_buf_unwritten(self, unwritten: bool) -> Self {
        if unwritten {
            Self(self.0 | PREV_UNWRITTEN_BIT)
        } else {
            Self(self.0 & !PREV_UNWRITTEN_BIT)
        }
    }

    #[must_use]
    pub fn with_buf_count(self, idx: usize, count: u32) -> Self {
        let shift = Self::count_shift(idx);
        Self((self.0 & !(COUNT_MASK << shift)) | ((u64::from(count) & COUNT_MASK) << shift))
    }

    fn count_shift(idx: usize) -> u32 {
        if idx & 1 == 0 { BUF0_SHIFT } else { BUF1_SHIFT }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_do_not_overlap() {
        let s = ResState::INITIAL
            .with_offset(12345)
            .with_idx(1)
            .with_prev_buf_unwritten(true)
            .with_buf_count(0, BUF_COUNT_MAX)
            .with_buf_count(1, 7);
        assert_eq!(s.offset(), 12345);
        assert_eq!(s.idx(), 1);
        assert!(s.prev_buf_unwritten());
        assert_eq!(s.buf_count(0), BUF_COUNT_MAX);
        assert_eq!(s.buf_count(1), 7);

        let s = s.with_buf_count(0, 0).with_idx(0).with_prev_buf_unwritten(false);
        assert_eq!(s.offset(), 12345);
        assert_eq!(s.buf_count(0), 0);
        assert_eq!(s.buf_count(1), 7);
        assert_eq!(s.idx(), 0);
    }

    #[test]
    fn sentinels() {
        assert!(ResState::INITIAL.is_closed());
        assert!(!ResState::INITIAL.is_open());
        let err = ResState::INITIAL.with_offset(ERROR_VAL);
        assert!(err.is_error());
        assert!(!err.is_open());
        assert!(ResState::INITIAL.with_offset(0).is_open());
        // The largest entry's end offset stays below both sentinels.
        assert!(ENTRY_SIZE_MAX / 8 < CLOSED_VAL);
    }
}
