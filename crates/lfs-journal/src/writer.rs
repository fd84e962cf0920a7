//! The journal's I/O boundary.

use crate::jset::Jset;
use crate::ring::JournalLocation;
use lfs_error::{LfsError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Durable sink for sealed journal entries.
///
/// `write` must not return until the entry is stable. It is called without
/// any journal lock held, at most one call at a time per journal, in seq
/// order. An error halts the journal.
pub trait JournalWriter: Send + Sync {
    fn write(&self, location: JournalLocation, jset: &Jset) -> Result<()>;
}

impl<T: JournalWriter + ?Sized> JournalWriter for std::sync::Arc<T> {
    fn write(&self, location: JournalLocation, jset: &Jset) -> Result<()> {
        (**self).write(location, jset)
    }
}

/// Keeps every written entry in memory.
#[derive(Debug, Default)]
pub struct MemWriter {
    written: Mutex<Vec<(JournalLocation, Jset)>>,
    /// Writes left before failing; `u64::MAX` never fails.
    fail_after: AtomicU64,
}

impl MemWriter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            written: Mutex::new(Vec::new()),
            fail_after: AtomicU64::new(u64::MAX),
        }
    }

    /// Fail every write after the next `n` succeed.
    pub fn fail_after(&self, n: u64) {
        self.fail_after.store(n, Ordering::Release);
    }

    #[must_use]
    pub fn written(&self) -> Vec<(JournalLocation, Jset)> {
        self.written.lock().clone()
    }

    #[must_use]
    pub fn jsets(&self) -> Vec<Jset> {
        self.written.lock().iter().map(|(_, j)| j.clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.written.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.written.lock().is_empty()
    }
}

impl JournalWriter for MemWriter {
    fn write(&self, location: JournalLocation, jset: &Jset) -> Result<()> {
        let allowed = self
            .fail_after
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match n {
                u64::MAX => Some(n),
                0 => None,
                n => Some(n - 1),
            })
            .is_ok();
        if !allowed {
            return Err(LfsError::Io(std::io::Error::other(format!(
                "injected write failure at seq {}",
                jset.seq
            ))));
        }
        self.written.lock().push((location, jset.clone()));
        Ok(())
    }
}
