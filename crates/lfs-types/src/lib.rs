#![forbid(unsafe_code)]
//! Shared types for bucket accounting and the journal.
//!
//! Unit-carrying newtypes keep device indices, bucket numbers, sectors and
//! journal sequence numbers from being mixed up. The key model here is only
//! as deep as accounting needs: which buckets a key points into, at what
//! generation, and how many sectors it covers.

pub mod atomic;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Sector size in bytes. All space accounting is done in 512-byte sectors.
pub const SECTOR_SIZE: u64 = 512;

/// Maximum number of member devices.
pub const MAX_DEVICES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceIdx(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketNumber(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JournalSeq(pub u64);

impl JournalSeq {
    /// Low 16 bits, as stored in a bucket mark's journal tag.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn tag(self) -> u16 {
        self.0 as u16
    }
}

impl fmt::Display for JournalSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 8-bit wrapping bucket generation.
///
/// Incremented each time a bucket is invalidated for reuse. A pointer that
/// carries an older generation than its bucket is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BucketGen(pub u8);

impl BucketGen {
    /// Window of generation distances that can legitimately occur. A distance
    /// at or beyond this means a pointer outlived 128 reuses of its bucket,
    /// which GC is required to prevent.
    pub const STALE_WINDOW: u8 = 128;

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// How far `self` is ahead of `older`, mod 256.
    #[must_use]
    pub fn distance_after(self, older: Self) -> u8 {
        self.0.wrapping_sub(older.0)
    }
}

/// What a bucket currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum BucketDataType {
    #[default]
    Unused = 0,
    Data = 1,
    Btree = 2,
    Journal = 3,
    Superblock = 4,
}

impl BucketDataType {
    /// Decode the 3-bit tag stored in a bucket mark. Unknown tags decode as
    /// `Unused`; marks are only ever written through [`Self::bits`].
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Self::Data,
            2 => Self::Btree,
            3 => Self::Journal,
            4 => Self::Superblock,
            _ => Self::Unused,
        }
    }

    #[must_use]
    pub fn bits(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn is_metadata(self) -> bool {
        matches!(self, Self::Btree | Self::Journal | Self::Superblock)
    }
}

/// Btree a journaled key or blacklisted node belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BtreeId {
    Extents = 0,
    Inodes = 1,
    Dirents = 2,
    Xattrs = 3,
    Alloc = 4,
}

impl BtreeId {
    #[must_use]
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Extents),
            1 => Some(Self::Inodes),
            2 => Some(Self::Dirents),
            3 => Some(Self::Xattrs),
            4 => Some(Self::Alloc),
            _ => None,
        }
    }
}

/// Position within a btree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Bpos {
    pub inode: u64,
    pub offset: u64,
}

impl Bpos {
    #[must_use]
    pub const fn new(inode: u64, offset: u64) -> Self {
        Self { inode, offset }
    }
}

/// One pointer of an extent: a sector offset on a device plus the bucket
/// generation it was written against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtentPtr {
    pub dev: DeviceIdx,
    /// Device sector offset.
    pub offset: u64,
    pub generation: BucketGen,
    /// Cached copies do not count towards replicas and are accounted as
    /// cached rather than dirty sectors.
    pub cached: bool,
}

/// Compression parameters of an extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Compression {
    pub compressed_sectors: u32,
    pub uncompressed_sectors: u32,
}

impl Compression {
    /// Disk sectors consumed by `sectors` logical sectors, rounded away from
    /// zero so partial sectors are never under-counted.
    #[must_use]
    pub fn disk_sectors(&self, sectors: i64) -> i64 {
        if self.uncompressed_sectors == 0 {
            return sectors;
        }
        let num = sectors.saturating_mul(i64::from(self.compressed_sectors));
        let den = i64::from(self.uncompressed_sectors);
        let q = num / den;
        if num % den == 0 {
            q
        } else {
            q + num.signum()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Extent {
    pub ptrs: Vec<ExtentPtr>,
    pub compression: Option<Compression>,
}

/// A key as seen by space accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bkey {
    /// Data or btree node pointers.
    Extent(Extent),
    /// Space reserved for a future write (e.g. fallocate), accounted as
    /// persistent reservation.
    Reservation { nr_replicas: u8 },
    Deleted,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyDecodeError {
    #[error("truncated key: need {needed} words, got {actual}")]
    Truncated { needed: usize, actual: usize },
    #[error("unknown key kind {0}")]
    UnknownKind(u8),
}

const KEY_KIND_DELETED: u8 = 0;
const KEY_KIND_EXTENT: u8 = 1;
const KEY_KIND_RESERVATION: u8 = 2;

impl Bkey {
    /// Most pointers the 8-bit count in the key header can carry.
    pub const MAX_PTRS: usize = 255;

    /// Whether [`Self::encode`] can represent this key without dropping
    /// pointers.
    #[must_use]
    pub fn is_encodable(&self) -> bool {
        match self {
            Self::Extent(e) => e.ptrs.len() <= Self::MAX_PTRS,
            Self::Reservation { .. } | Self::Deleted => true,
        }
    }

    /// Number of 8-byte words [`Self::encode`] produces.
    #[must_use]
    pub fn encoded_words(&self) -> usize {
        match self {
            Self::Extent(e) => 1 + usize::from(e.compression.is_some()) + 2 * e.ptrs.len().min(Self::MAX_PTRS),
            Self::Reservation { .. } | Self::Deleted => 1,
        }
    }

    /// Word encoding used for journal payloads.
    ///
    /// Header word: kind in bits 0..8, pointer count or replica count in
    /// 8..16, compression flag at 16. Each pointer takes two words: the
    /// sector offset, then `dev | gen << 16 | cached << 24`. Pointers past
    /// [`Self::MAX_PTRS`] are not encoded; check [`Self::is_encodable`].
    #[must_use]
    pub fn encode(&self) -> Vec<u64> {
        let mut out = Vec::with_capacity(self.encoded_words());
        match self {
            Self::Deleted => out.push(u64::from(KEY_KIND_DELETED)),
            Self::Reservation { nr_replicas } => {
                out.push(u64::from(KEY_KIND_RESERVATION) | u64::from(*nr_replicas) << 8);
            }
            Self::Extent(e) => {
                let nr = e.ptrs.len().min(Self::MAX_PTRS) as u64;
                out.push(
                    u64::from(KEY_KIND_EXTENT)
                        | nr << 8
                        | u64::from(e.compression.is_some()) << 16,
                );
                if let Some(c) = e.compression {
                    out.push(u64::from(c.compressed_sectors) | u64::from(c.uncompressed_sectors) << 32);
                }
                for ptr in e.ptrs.iter().take(Self::MAX_PTRS) {
                    out.push(ptr.offset);
                    out.push(
                        u64::from(ptr.dev.0)
                            | u64::from(ptr.generation.0) << 16
                            | u64::from(ptr.cached) << 24,
                    );
                }
            }
        }
        out
    }

    /// Decode one key from the front of `words`, returning the key and the
    /// number of words consumed.
    #[expect(clippy::cast_possible_truncation)]
    pub fn decode(words: &[u64]) -> Result<(Self, usize), KeyDecodeError> {
        let need = |needed: usize| {
            if words.len() < needed {
                Err(KeyDecodeError::Truncated {
                    needed,
                    actual: words.len(),
                })
            } else {
                Ok(())
            }
        };
        need(1)?;
        let header = words[0];
        let kind = (header & 0xff) as u8;
        let count = ((header >> 8) & 0xff) as usize;
        match kind {
            KEY_KIND_DELETED => Ok((Self::Deleted, 1)),
            KEY_KIND_RESERVATION => Ok((
                Self::Reservation {
                    nr_replicas: count as u8,
                },
                1,
            )),
            KEY_KIND_EXTENT => {
                let compressed = (header >> 16) & 1 == 1;
                let total = 1 + usize::from(compressed) + 2 * count;
                need(total)?;
                let mut pos = 1;
                let compression = if compressed {
                    let w = words[pos];
                    pos += 1;
                    Some(Compression {
                        compressed_sectors: w as u32,
                        uncompressed_sectors: (w >> 32) as u32,
                    })
                } else {
                    None
                };
                let ptrs = (0..count)
                    .map(|i| {
                        let offset = words[pos + 2 * i];
                        let meta = words[pos + 2 * i + 1];
                        ExtentPtr {
                            dev: DeviceIdx(meta as u16),
                            offset,
                            generation: BucketGen((meta >> 16) as u8),
                            cached: (meta >> 24) & 1 == 1,
                        }
                    })
                    .collect();
                Ok((Self::Extent(Extent { ptrs, compression }), total))
            }
            other => Err(KeyDecodeError::UnknownKind(other)),
        }
    }
}

/// Member state as recorded in the member table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
    #[default]
    ReadWrite,
    ReadOnly,
    Failed,
    Spare,
}

/// Per-device geometry and policy, read from the member table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub nbuckets: u64,
    /// Buckets below this index hold the superblock and are never allocated.
    pub first_bucket: u64,
    /// Bucket size in sectors.
    pub bucket_size: u32,
    #[serde(default)]
    pub state: MemberState,
    #[serde(default = "default_true")]
    pub has_metadata: bool,
    #[serde(default = "default_true")]
    pub has_data: bool,
}

fn default_true() -> bool {
    true
}

impl MemberInfo {
    #[must_use]
    pub fn new(nbuckets: u64, first_bucket: u64, bucket_size: u32) -> Self {
        Self {
            nbuckets,
            first_bucket,
            bucket_size,
            state: MemberState::ReadWrite,
            has_metadata: true,
            has_data: true,
        }
    }

    /// Sectors in the usable bucket range.
    #[must_use]
    pub fn usable_sectors(&self) -> u64 {
        self.nbuckets
            .saturating_sub(self.first_bucket)
            .saturating_mul(u64::from(self.bucket_size))
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        matches!(self.state, MemberState::ReadWrite | MemberState::ReadOnly)
    }
}

/// How many live copies data and metadata need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaTargets {
    pub data: u8,
    pub metadata: u8,
}

impl Default for ReplicaTargets {
    fn default() -> Self {
        Self {
            data: 1,
            metadata: 1,
        }
    }
}

impl ReplicaTargets {
    #[must_use]
    pub fn for_class(self, metadata: bool) -> u8 {
        if metadata { self.metadata } else { self.data }
    }
}
