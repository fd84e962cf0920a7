#![forbid(unsafe_code)]
//! Metadata journal.
//!
//! Updates are appended to one of two in-memory entries through a lock-free
//! reservation word, sealed into checksummed [`Jset`]s and written to a ring
//! of journal buckets through a [`JournalWriter`]. Dirty btree nodes pin the
//! seq of the entry holding their updates; ring buckets are reused only once
//! nothing in them is pinned.

pub mod blacklist;
pub mod config;
pub mod journal;
pub mod jset;
pub mod pin;
pub mod replay;
pub mod res_state;
pub mod ring;
pub mod timer;
pub mod writer;

pub use blacklist::{BlacklistEntry, SeqBlacklist};
pub use config::JournalConfig;
pub use journal::{Journal, JournalRes, JournalStats};
pub use jset::{Jset, JsetEntry, JsetEntryKind, JsetError};
pub use replay::{ReplayPlan, plan_replay};
pub use res_state::ResState;
pub use ring::{JournalLocation, JournalRing};
pub use timer::{WriteTimer, spawn_write_timer};
pub use writer::{JournalWriter, MemWriter};
