//! Atomic read-transform-retry loops.
//!
//! Every packed state word in the core (bucket marks, the journal
//! reservation word) is updated the same way: load, compute a new value
//! from the old one, compare-and-swap, and on contention recompute from the
//! value that won. The transform may therefore run more than once and must
//! be a pure function of its input.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};

/// Apply `transform` until the compare-and-swap succeeds.
///
/// Returns `(old, new)` for the successful attempt.
pub fn update<F>(word: &AtomicU64, mut transform: F) -> (u64, u64)
where
    F: FnMut(u64) -> u64,
{
    match try_update(word, |old| Ok::<u64, Infallible>(transform(old))) {
        Ok(pair) => pair,
        Err(never) => match never {},
    }
}

/// Apply a fallible `transform` until the compare-and-swap succeeds or the
/// transform declines.
///
/// When `transform` returns `Err`, the word is left untouched and the error is
/// returned. The decision is always made against the latest observed value.
pub fn try_update<F, E>(word: &AtomicU64, mut transform: F) -> Result<(u64, u64), E>
where
    F: FnMut(u64) -> Result<u64, E>,
{
    let mut old = word.load(Ordering::Acquire);
    loop {
        let new = transform(old)?;
        match word.compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return Ok((old, new)),
            Err(actual) => old = actual,
        }
    }
}
