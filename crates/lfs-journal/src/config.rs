//! Journal tunables.

use crate::res_state::ENTRY_SIZE_MAX;
use lfs_error::{LfsError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Byte budget of one journal entry. Must be a multiple of 8 and at most
    /// 4 MiB, the largest offset the reservation word can address.
    pub entry_size_max: u32,
    /// An entry holding reservations for longer than this is closed and
    /// written by the write timer.
    pub write_delay_ms: u64,
    /// Period of the background reclaim pass.
    pub reclaim_delay_ms: u64,
    /// Maximum number of unreclaimed sequence numbers. Opening a new entry
    /// blocks while the pin FIFO is full.
    pub pin_capacity: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            entry_size_max: ENTRY_SIZE_MAX,
            write_delay_ms: 100,
            reclaim_delay_ms: 100,
            pin_capacity: 1024,
        }
    }
}

impl JournalConfig {
    pub fn validate(&self) -> Result<()> {
        if self.entry_size_max == 0 || self.entry_size_max % 8 != 0 || self.entry_size_max > ENTRY_SIZE_MAX {
            return Err(LfsError::InvalidConfig(format!(
                "entry_size_max must be a non-zero multiple of 8 no larger than {ENTRY_SIZE_MAX}, got {}",
                self.entry_size_max
            )));
        }
        if self.write_delay_ms == 0 || self.reclaim_delay_ms == 0 {
            return Err(LfsError::InvalidConfig("journal delays must be non-zero".to_owned()));
        }
        if self.pin_capacity < 2 {
            return Err(LfsError::InvalidConfig(format!(
                "pin_capacity must be at least 2, got {}",
                self.pin_capacity
            )));
        }
        Ok(())
    }

    /// Entry budget in 8-byte words.
    #[must_use]
    pub fn entry_words(&self) -> u32 {
        self.entry_size_max / 8
    }

    #[must_use]
    pub fn write_delay(&self) -> Duration {
        Duration::from_millis(self.write_delay_ms)
    }

    #[must_use]
    pub fn reclaim_delay(&self) -> Duration {
        Duration::from_millis(self.reclaim_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_four_mib() {
        let cfg = JournalConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.entry_size_max, 4 << 20);
        assert_eq!(cfg.entry_words(), 1 << 19);
        assert_eq!(cfg.write_delay(), Duration::from_millis(100));
    }

    #[test]
    fn rejects_oversized_and_unaligned_entries() {
        for bad in [0, 12, ENTRY_SIZE_MAX + 8] {
            let cfg = JournalConfig {
                entry_size_max: bad,
                ..JournalConfig::default()
            };
            assert!(matches!(cfg.validate(), Err(LfsError::InvalidConfig(_))), "{bad}");
        }
    }

    #[test]
    fn json_overrides_subset() {
        let cfg: JournalConfig = serde_json::from_str(r#"{"write_delay_ms": 5}"#).unwrap();
        assert_eq!(cfg.write_delay_ms, 5);
        assert_eq!(cfg.entry_size_max, ENTRY_SIZE_MAX);
    }
}
