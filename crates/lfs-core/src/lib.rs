#![forbid(unsafe_code)]
//! Core of the filesystem's space management: bucket accounting and the
//! metadata journal, wired together.
//!
//! [`CoreFs`] owns a [`lfs_buckets::BucketSpace`] and a
//! [`lfs_journal::Journal`]. Key updates go through the journal first, and
//! bucket reuse waits on journal commit. Configuration is one JSON document
//! ([`LfsConfig`]); [`FileJournalWriter`] persists entries into a device
//! image and [`read_journal`] scans them back for recovery.

pub mod config;
pub mod file_journal;
pub mod fs;

pub use config::LfsConfig;
pub use file_journal::{FileJournalStats, FileJournalWriter, read_journal};
pub use fs::{CoreFs, CoreStats};
