//! Journal entry wire format.
//!
//! A sealed entry is a run of little-endian 64-bit words:
//!
//! | Word | Content |
//! |------|---------|
//! | 0 | [`JSET_MAGIC`] |
//! | 1 | seq |
//! | 2 | last_seq: oldest seq still pinned when the entry was written |
//! | 3 | payload words (low 32 bits), blacklisted seq count (high 32 bits) |
//! | 4 | CRC32C of every other word |
//! | 5.. | payload, then the newly blacklisted seqs |
//!
//! The payload is a sequence of keyed sub-entries, each a one-word header
//! followed by `u64s` words of encoded keys. A zero header word is padding
//! left by a reservation that was not fully used.

use lfs_types::{Bkey, BtreeId, KeyDecodeError, SECTOR_SIZE};
use thiserror::Error;

pub const JSET_MAGIC: u64 = 0x6c66_735f_6a73_6574;
pub const JSET_HEADER_WORDS: usize = 5;

/// Words held back in every entry for blacklisted seqs.
pub const JSET_BLACKLIST_SLACK: usize = 16;

const WORDS_PER_SECTOR: u64 = SECTOR_SIZE / 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JsetError {
    #[error("bad journal entry magic {0:#018x}")]
    BadMagic(u64),
    #[error("truncated journal entry: need {needed} words, got {actual}")]
    Truncated { needed: usize, actual: usize },
    #[error("journal entry {seq} checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    Checksum { seq: u64, stored: u32, computed: u32 },
    #[error("bad sub-entry header {0:#018x}")]
    BadEntry(u64),
    #[error(transparent)]
    Key(#[from] KeyDecodeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JsetEntryKind {
    Keys = 1,
    BtreeRoot = 2,
}

impl JsetEntryKind {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            1 => Some(Self::Keys),
            2 => Some(Self::BtreeRoot),
            _ => None,
        }
    }
}

/// Header word of a payload sub-entry: u64s 0..16, btree id 16..24,
/// level 24..32, kind 32..40.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsetEntryHeader {
    pub u64s: u16,
    pub btree_id: BtreeId,
    pub level: u8,
    pub kind: JsetEntryKind,
}

impl JsetEntryHeader {
    #[must_use]
    pub fn encode(self) -> u64 {
        u64::from(self.u64s)
            | u64::from(self.btree_id as u8) << 16
            | u64::from(self.level) << 24
            | u64::from(self.kind as u8) << 32
    }

    #[expect(clippy::cast_possible_truncation)]
    pub fn decode(word: u64) -> Result<Self, JsetError> {
        let btree_id = BtreeId::from_bits((word >> 16) as u8).ok_or(JsetError::BadEntry(word))?;
        let kind = JsetEntryKind::from_bits((word >> 32) as u8).ok_or(JsetError::BadEntry(word))?;
        if word >> 40 != 0 {
            return Err(JsetError::BadEntry(word));
        }
        Ok(Self {
            u64s: word as u16,
            btree_id,
            level: (word >> 24) as u8,
            kind,
        })
    }
}

/// A decoded payload sub-entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsetEntry {
    pub kind: JsetEntryKind,
    pub btree_id: BtreeId,
    pub level: u8,
    pub keys: Vec<Bkey>,
}

/// Largest number of key words one sub-entry can carry.
pub const JSET_ENTRY_U64S_MAX: usize = u16::MAX as usize;

/// Words needed to journal `keys` as one sub-entry.
#[must_use]
pub fn keys_entry_words(keys: &[Bkey]) -> usize {
    1 + keys.iter().map(Bkey::encoded_words).sum::<usize>()
}

/// Encode `keys` as one sub-entry. Returns `None` when the keys do not fit
/// the 16-bit length field or a key has too many pointers to encode.
#[must_use]
pub fn encode_keys_entry(kind: JsetEntryKind, btree_id: BtreeId, level: u8, keys: &[Bkey]) -> Option<Vec<u64>> {
    if !keys.iter().all(Bkey::is_encodable) {
        return None;
    }
    let body = keys_entry_words(keys) - 1;
    let u64s = u16::try_from(body).ok()?;
    let mut out = Vec::with_capacity(body + 1);
    out.push(
        JsetEntryHeader {
            u64s,
            btree_id,
            level,
            kind,
        }
        .encode(),
    );
    for key in keys {
        out.extend(key.encode());
    }
    Some(out)
}

/// A sealed journal entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Jset {
    pub seq: u64,
    pub last_seq: u64,
    pub payload: Vec<u64>,
    pub blacklisted: Vec<u64>,
}

impl Jset {
    #[must_use]
    pub fn words(&self) -> usize {
        JSET_HEADER_WORDS + self.payload.len() + self.blacklisted.len()
    }

    /// On-disk footprint, rounded up to whole sectors.
    #[must_use]
    pub fn sectors(&self) -> u32 {
        words_to_sectors(self.words())
    }

    #[expect(clippy::cast_possible_truncation)]
    #[must_use]
    pub fn to_words(&self) -> Vec<u64> {
        let mut out = Vec::with_capacity(self.words());
        out.push(JSET_MAGIC);
        out.push(self.seq);
        out.push(self.last_seq);
        out.push((self.payload.len() as u64 & 0xffff_ffff) | (self.blacklisted.len() as u64) << 32);
        out.push(0);
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.blacklisted);
        out[4] = u64::from(checksum(&out));
        out
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_words().iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// Decode and verify an entry from the front of `words`. Trailing words
    /// are ignored.
    #[expect(clippy::cast_possible_truncation)]
    pub fn from_words(words: &[u64]) -> Result<Self, JsetError> {
        if words.len() < JSET_HEADER_WORDS {
            return Err(JsetError::Truncated {
                needed: JSET_HEADER_WORDS,
                actual: words.len(),
            });
        }
        if words[0] != JSET_MAGIC {
            return Err(JsetError::BadMagic(words[0]));
        }
        let seq = words[1];
        let payload_len = (words[3] & 0xffff_ffff) as usize;
        let bl_len = (words[3] >> 32) as usize;
        let total = JSET_HEADER_WORDS + payload_len + bl_len;
        if words.len() < total {
            return Err(JsetError::Truncated {
                needed: total,
                actual: words.len(),
            });
        }
        let words = &words[..total];
        let stored = words[4] as u32;
        let computed = checksum(words);
        if stored != computed || words[4] >> 32 != 0 {
            return Err(JsetError::Checksum { seq, stored, computed });
        }
        let payload_end = JSET_HEADER_WORDS + payload_len;
        Ok(Self {
            seq,
            last_seq: words[2],
            payload: words[JSET_HEADER_WORDS..payload_end].to_vec(),
            blacklisted: words[payload_end..].to_vec(),
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, JsetError> {
        let words: Vec<u64> = bytes
            .chunks_exact(8)
            .map(|c| {
                let mut w = [0_u8; 8];
                w.copy_from_slice(c);
                u64::from_le_bytes(w)
            })
            .collect();
        Self::from_words(&words)
    }

    /// Decode the payload sub-entries, skipping padding.
    pub fn entries(&self) -> Result<Vec<JsetEntry>, JsetError> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < self.payload.len() {
            let word = self.payload[pos];
            if word == 0 {
                pos += 1;
                continue;
            }
            let header = JsetEntryHeader::decode(word)?;
            let end = pos + 1 + usize::from(header.u64s);
            if end > self.payload.len() {
                return Err(JsetError::Truncated {
                    needed: end,
                    actual: self.payload.len(),
                });
            }
            let mut body = &self.payload[pos + 1..end];
            let mut keys = Vec::new();
            while !body.is_empty() {
                let (key, used) = Bkey::decode(body)?;
                keys.push(key);
                body = &body[used..];
            }
            out.push(JsetEntry {
                kind: header.kind,
                btree_id: header.btree_id,
                level: header.level,
                keys,
            });
            pos = end;
        }
        Ok(out)
    }
}

/// Sectors needed for an entry of `words` words.
#[must_use]
pub fn words_to_sectors(words: usize) -> u32 {
    let sectors = (words as u64).div_ceil(WORDS_PER_SECTOR);
    u32::try_from(sectors).unwrap_or(u32::MAX)
}

/// CRC32C over all words except the checksum slot.
fn checksum(words: &[u64]) -> u32 {
    words
        .iter()
        .enumerate()
        .filter(|&(i, _)| i != 4)
        .fold(0, |crc, (_, w)| crc32c::crc32c_append(crc, &w.to_le_bytes()))
}
