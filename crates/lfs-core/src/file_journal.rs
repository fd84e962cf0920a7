//! Journal entries stored in a device image file.
//!
//! Entries are written with positional I/O at
//! `(bucket * bucket_sectors + offset) * 512` and synced before the write
//! returns. Reading back scans every ring bucket for entry magic; a corrupt
//! entry is skipped one sector at a time so later entries are still found.

use lfs_error::{LfsError, Result};
use lfs_journal::jset::JSET_MAGIC;
use lfs_journal::{JournalLocation, JournalRing, JournalWriter, Jset};
use lfs_types::SECTOR_SIZE;
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace, warn};

const SECTOR: usize = SECTOR_SIZE as usize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FileJournalStats {
    pub writes: u64,
    pub bytes_written: u64,
}

/// [`JournalWriter`] over a device image.
pub struct FileJournalWriter {
    file: Arc<File>,
    bucket_sectors: u32,
    stats: Mutex<FileJournalStats>,
}

impl FileJournalWriter {
    /// Open an image read-write.
    pub fn open(path: &Path, bucket_sectors: u32) -> Result<Self> {
        let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        Self::from_file(Arc::new(file), bucket_sectors)
    }

    pub fn from_file(file: Arc<File>, bucket_sectors: u32) -> Result<Self> {
        if bucket_sectors == 0 {
            return Err(LfsError::InvalidConfig("journal bucket size must be non-zero".to_owned()));
        }
        Ok(Self {
            file,
            bucket_sectors,
            stats: Mutex::new(FileJournalStats::default()),
        })
    }

    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    #[must_use]
    pub fn stats(&self) -> FileJournalStats {
        *self.stats.lock()
    }

    fn byte_offset(&self, location: &JournalLocation) -> u64 {
        (location.bucket.0 * u64::from(self.bucket_sectors) + u64::from(location.offset)) * SECTOR_SIZE
    }
}

impl std::fmt::Debug for FileJournalWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileJournalWriter")
            .field("bucket_sectors", &self.bucket_sectors)
            .field("stats", &*self.stats.lock())
            .finish_non_exhaustive()
    }
}

impl JournalWriter for FileJournalWriter {
    fn write(&self, location: JournalLocation, jset: &Jset) -> Result<()> {
        if location.offset + location.sectors > self.bucket_sectors {
            return Err(LfsError::Invariant(format!(
                "journal write of {} sectors at {} overruns a {}-sector bucket",
                location.sectors, location.offset, self.bucket_sectors
            )));
        }
        let mut bytes = jset.to_bytes();
        // Zero the tail of the last sector so a rescan never sees stale words.
        bytes.resize(bytes.len().div_ceil(SECTOR) * SECTOR, 0);
        let offset = self.byte_offset(&location);
        self.file.write_all_at(&bytes, offset)?;
        self.file.sync_data()?;

        let mut stats = self.stats.lock();
        stats.writes += 1;
        stats.bytes_written += bytes.len() as u64;
        drop(stats);
        trace!(
            target: "lfs::core",
            seq = jset.seq,
            bucket = location.bucket.0,
            offset = location.offset,
            bytes = bytes.len(),
            "journal_file_write"
        );
        Ok(())
    }
}

fn word_at(buf: &[u8], word: usize) -> Option<u64> {
    let bytes = buf.get(word * 8..word * 8 + 8)?;
    let mut w = [0_u8; 8];
    w.copy_from_slice(bytes);
    Some(u64::from_le_bytes(w))
}

/// Read every decodable entry in `ring`'s buckets, with where it was found.
///
/// Buckets past the end of the file read as empty. Order follows the ring,
/// not seq; replay planning sorts.
pub fn read_journal(file: &File, ring: &JournalRing) -> Result<Vec<(JournalLocation, Jset)>> {
    let file_len = file.metadata()?.len();
    let bucket_bytes = u64::from(ring.bucket_sectors()) * SECTOR_SIZE;
    let mut found = Vec::new();
    let mut corrupt = 0_usize;

    for (ring_idx, &bucket) in ring.buckets().iter().enumerate() {
        let start = bucket.0 * bucket_bytes;
        if start >= file_len {
            continue;
        }
        let len = usize::try_from((file_len - start).min(bucket_bytes))
            .map_err(|_| LfsError::InvalidConfig("journal bucket larger than address space".to_owned()))?;
        let mut buf = vec![0_u8; len];
        file.read_exact_at(&mut buf, start)?;

        let mut sector = 0;
        while sector * SECTOR < buf.len() {
            let base = sector * SECTOR;
            if word_at(&buf[base..], 0) != Some(JSET_MAGIC) {
                sector += 1;
                continue;
            }
            match Jset::from_bytes(&buf[base..]) {
                Ok(jset) => {
                    let sectors = jset.sectors();
                    let location = JournalLocation {
                        dev: ring.dev(),
                        bucket,
                        ring_idx,
                        offset: u32::try_from(sector).unwrap_or(u32::MAX),
                        sectors,
                    };
                    found.push((location, jset));
                    sector += sectors.max(1) as usize;
                }
                Err(e) => {
                    corrupt += 1;
                    warn!(
                        target: "lfs::core",
                        bucket = bucket.0,
                        sector,
                        error = %e,
                        "journal_entry_corrupt"
                    );
                    sector += 1;
                }
            }
        }
    }

    debug!(target: "lfs::core", entries = found.len(), corrupt, "journal_scanned");
    Ok(found)
}
