use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::run::write_json_atomic;

/// Per-environment record of the running version and the last known-good one
/// before it. `previous` is the default rollback target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionLedger {
    pub current: Option<String>,
    pub previous: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl VersionLedger {
    pub fn load(state_dir: &Path, environment: &str) -> Result<Self> {
        let path = Self::path(state_dir, environment);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read version ledger: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse version ledger: {}", path.display()))
    }

    pub fn save(&self, state_dir: &Path, environment: &str) -> Result<()> {
        write_json_atomic(&Self::path(state_dir, environment), self)
    }

    /// A completed deploy shifts current to previous. Only called once a run
    /// reaches COMPLETE, so `previous` always names a known-good version.
    pub fn record_release(&mut self, version: &str) {
        self.previous = self.current.take();
        self.current = Some(version.to_string());
        self.updated_at = Some(Utc::now());
    }

    /// A successful rollback makes the target current again. The version we
    /// just rolled away from is not a safe target, so it is not retained.
    pub fn record_rollback(&mut self, target: &str) {
        self.current = Some(target.to_string());
        self.previous = None;
        self.updated_at = Some(Utc::now());
    }

    fn path(state_dir: &Path, environment: &str) -> PathBuf {
        state_dir
            .join("versions")
            .join(format!("{}.json", environment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_shifts_current_to_previous() {
        let mut ledger = VersionLedger::default();
        ledger.record_release("2.3.9");
        ledger.record_release("2.4.0");

        assert_eq!(ledger.current.as_deref(), Some("2.4.0"));
        assert_eq!(ledger.previous.as_deref(), Some("2.3.9"));
    }

    #[test]
    fn rollback_drops_the_bad_version() {
        let mut ledger = VersionLedger::default();
        ledger.record_release("2.3.9");
        ledger.record_release("2.4.0");
        ledger.record_rollback("2.3.9");

        assert_eq!(ledger.current.as_deref(), Some("2.3.9"));
        assert!(ledger.previous.is_none());
    }

    #[test]
    fn round_trips_through_the_state_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ledger = VersionLedger::default();
        ledger.record_release("2.4.0");
        ledger.save(tmp.path(), "production").unwrap();

        let loaded = VersionLedger::load(tmp.path(), "production").unwrap();
        assert_eq!(loaded.current.as_deref(), Some("2.4.0"));

        // Absent ledger loads as empty, not as an error.
        let empty = VersionLedger::load(tmp.path(), "staging").unwrap();
        assert!(empty.current.is_none());
    }
}
