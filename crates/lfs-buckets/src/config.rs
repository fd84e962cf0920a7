//! Tunables for space accounting.

use lfs_error::{LfsError, Result};
use serde::{Deserialize, Serialize};

/// Space-accounting configuration.
///
/// The defaults are the values the accounting was tuned with; both the
/// reservation overhead and the saturation ceiling depend on workload and
/// device characteristics, so they are parameters rather than constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceConfig {
    /// Reserved sectors are inflated by `reserved >> reserve_overhead_shift`
    /// when computing sectors used. Default: 7 (1/128).
    pub reserve_overhead_shift: u32,
    /// Ceiling at which per-bucket dirty/cached counts saturate. Past it,
    /// accounting is approximate until a GC sweep recounts. Default: 32767.
    pub gc_max_sectors_used: u16,
    /// Bound on the GC candidate heap. Default: 512.
    pub gc_heap_capacity: usize,
    /// Target length of each device's ready and invalidated free lists.
    /// Default: 64.
    pub free_list_capacity: usize,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            reserve_overhead_shift: 7,
            gc_max_sectors_used: (1 << 15) - 1,
            gc_heap_capacity: 512,
            free_list_capacity: 64,
        }
    }
}

impl SpaceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.reserve_overhead_shift == 0 || self.reserve_overhead_shift >= 64 {
            return Err(LfsError::InvalidConfig(format!(
                "reserve_overhead_shift must be in 1..64, got {}",
                self.reserve_overhead_shift
            )));
        }
        if self.gc_max_sectors_used == 0 {
            return Err(LfsError::InvalidConfig(
                "gc_max_sectors_used must be non-zero".to_owned(),
            ));
        }
        if self.free_list_capacity == 0 {
            return Err(LfsError::InvalidConfig(
                "free_list_capacity must be non-zero".to_owned(),
            ));
        }
        Ok(())
    }

    /// Reservation inflated by the overhead margin.
    #[must_use]
    pub fn with_overhead(&self, reserved: u64) -> u64 {
        reserved.saturating_add(reserved >> self.reserve_overhead_shift)
    }
}
