//! Filesystem-level configuration: member devices, replica targets and the
//! tunables of each subsystem, loadable from JSON.

use lfs_buckets::config::SpaceConfig;
use lfs_error::{LfsError, Result};
use lfs_journal::JournalConfig;
use lfs_types::{MemberInfo, ReplicaTargets};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LfsConfig {
    pub space: SpaceConfig,
    pub journal: JournalConfig,
    pub replicas: ReplicaTargets,
    pub members: Vec<MemberInfo>,
    /// Member holding the journal ring.
    pub journal_device: u16,
    /// Buckets dedicated to the journal, starting at the device's
    /// `first_bucket`.
    pub journal_buckets: u64,
}

impl Default for LfsConfig {
    fn default() -> Self {
        Self {
            space: SpaceConfig::default(),
            journal: JournalConfig::default(),
            replicas: ReplicaTargets::default(),
            members: Vec::new(),
            journal_device: 0,
            journal_buckets: 8,
        }
    }
}

impl LfsConfig {
    /// Check cross-field constraints. Per-subsystem checks run again when
    /// the subsystem is built.
    pub fn validate(&self) -> Result<()> {
        self.space.validate()?;
        self.journal.validate()?;
        let Some(member) = self.members.get(usize::from(self.journal_device)) else {
            return Err(LfsError::InvalidConfig(format!(
                "journal_device {} out of range for {} members",
                self.journal_device,
                self.members.len()
            )));
        };
        if !member.has_metadata {
            return Err(LfsError::InvalidConfig(format!(
                "journal_device {} does not accept metadata",
                self.journal_device
            )));
        }
        if self.journal_buckets < 2 {
            return Err(LfsError::InvalidConfig(format!(
                "journal_buckets must be at least 2, got {}",
                self.journal_buckets
            )));
        }
        let end = member.first_bucket.saturating_add(self.journal_buckets);
        if end >= member.nbuckets {
            return Err(LfsError::InvalidConfig(format!(
                "journal of {} buckets leaves no data buckets on device {} ({} buckets, first {})",
                self.journal_buckets, self.journal_device, member.nbuckets, member.first_bucket
            )));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| LfsError::InvalidConfig(format!("config parse: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Pretty-printed JSON, as accepted by [`Self::from_json_str`].
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| LfsError::InvalidConfig(format!("config encode: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_device() -> LfsConfig {
        LfsConfig {
            members: vec![MemberInfo::new(128, 1, 16)],
            ..LfsConfig::default()
        }
    }

    #[test]
    fn minimal_json_takes_defaults() {
        let cfg = LfsConfig::from_json_str(r#"{"members":[{"nbuckets":64,"first_bucket":1,"bucket_size":8}]}"#)
            .unwrap();
        assert_eq!(cfg.journal_buckets, 8);
        assert_eq!(cfg.space, SpaceConfig::default());
        assert_eq!(cfg.journal, JournalConfig::default());
        assert!(cfg.members[0].has_data);
    }

    #[test]
    fn json_roundtrip_keeps_tunables() {
        let mut cfg = one_device();
        cfg.space.reserve_overhead_shift = 5;
        cfg.journal.entry_size_max = 64 << 10;
        let back = LfsConfig::from_json_str(&cfg.to_json().unwrap()).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn rejects_bad_journal_placement() {
        let mut cfg = one_device();
        cfg.journal_device = 1;
        assert!(matches!(cfg.validate(), Err(LfsError::InvalidConfig(_))));

        let mut cfg = one_device();
        cfg.journal_buckets = 1;
        assert!(matches!(cfg.validate(), Err(LfsError::InvalidConfig(_))));

        let mut cfg = one_device();
        cfg.journal_buckets = 127;
        assert!(matches!(cfg.validate(), Err(LfsError::InvalidConfig(_))));

        assert!(matches!(LfsConfig::default().validate(), Err(LfsError::InvalidConfig(_))));
    }

    #[test]
    fn malformed_json_is_invalid_config() {
        assert!(matches!(
            LfsConfig::from_json_str("{\"members\": 3}"),
            Err(LfsError::InvalidConfig(_))
        ));
    }

    #[test]
    fn missing_file_is_io() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            LfsConfig::from_json_file(&dir.path().join("absent.json")),
            Err(LfsError::Io(_))
        ));
    }
}
