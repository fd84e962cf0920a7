#![forbid(unsafe_code)]
//! Error types for the space-management and journal core.
//!
//! # Error Taxonomy
//!
//! | Class | Variant | Recoverable | Propagation |
//! |-------|---------|-------------|-------------|
//! | Capacity exhaustion | `NoSpace` | yes | returned by the reservation slow path unless NOFAIL |
//! | Journal fault | `JournalFault` | no | sticky: the reservation word is poisoned with the error sentinel |
//! | Corruption | `Corruption` | no | generation distance outside the wraparound window; filesystem goes read-only |
//! | Contract violation | `Invariant` | no | pin drop without add, finalize of an unknown blacklist seq, ... |
//! | Lock ordering | `Restart` | yes | caller drops its btree locks and retries |
//! | Transient I/O | `Io` | at the I/O layer | a journal write error halts the journal |
//!
//! Lock-free accounting paths never produce an error for contention. They
//! report fast-path failure as `bool`/`Option` and only the slow path turns
//! that into an `LfsError`.
//!
//! ## errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `NoSpace` | `ENOSPC` |
//! | `JournalFault` | `EROFS` |
//! | `ReadOnly` | `EROFS` |
//! | `Corruption` | `EIO` |
//! | `Invariant` | `EIO` |
//! | `Restart` | `EINTR` |
//! | `InvalidConfig` | `EINVAL` |
//! | `NotFound` | `ENOENT` |

use thiserror::Error;

/// Unified error type for bucket accounting, reservations and the journal.
#[derive(Debug, Error)]
pub enum LfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A disk reservation could not be admitted against available capacity.
    #[error("no space left on device")]
    NoSpace,

    /// The journal has faulted. Every later reservation re-reports this until
    /// the journal is rebuilt from replay.
    #[error("journal halted: {0}")]
    JournalFault(String),

    /// On-disk state violates an invariant that cannot occur in a correctly
    /// operating system (e.g. a pointer generation 128 or more behind its bucket).
    #[error("corruption on device {device} bucket {bucket}: {detail}")]
    Corruption {
        device: u16,
        bucket: u64,
        detail: String,
    },

    /// A caller broke an API contract (unbalanced pin drop, unknown seq, ...).
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// A lock could not be taken without risking deadlock against locks the
    /// caller already holds.
    #[error("operation must be restarted after dropping locks")]
    Restart,

    /// Configuration rejected by validation or failed to parse.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The filesystem has fallen back to read-only.
    #[error("read-only filesystem")]
    ReadOnly,

    /// A named object (device, blacklist entry, ...) does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl LfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The match is exhaustive so a new variant cannot ship without an errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::NoSpace => libc::ENOSPC,
            Self::JournalFault(_) | Self::ReadOnly => libc::EROFS,
            Self::Corruption { .. } | Self::Invariant(_) => libc::EIO,
            Self::Restart => libc::EINTR,
            Self::InvalidConfig(_) => libc::EINVAL,
            Self::NotFound(_) => libc::ENOENT,
        }
    }

    /// Whether the error leaves shared state unusable (journal halted or
    /// on-disk corruption) rather than failing a single request.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::JournalFault(_) | Self::Corruption { .. } | Self::Invariant(_)
        )
    }
}

/// Result alias using `LfsError`.
pub type Result<T> = std::result::Result<T, LfsError>;
