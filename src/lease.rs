use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::error::DeployError;

/// Distinguishes acquisitions within one process, so a stale guard whose
/// lock was force-taken cannot release the new holder's lease.
static LEASE_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Serialize, Deserialize)]
struct LeaseRecord {
    pid: u32,
    token: String,
    environment: String,
    acquired_at: DateTime<Utc>,
}

/// Exclusive per-environment deployment lease, backed by a lock file created
/// with `create_new`. A concurrent deploy against the same environment fails
/// fast with `LeaseHeld` instead of interleaving.
///
/// Dropping the guard releases the lease, so every exit path of a run frees
/// the environment.
#[derive(Debug)]
pub struct Lease {
    path: PathBuf,
    token: String,
}

impl Lease {
    pub fn acquire(state_dir: &Path, environment: &str) -> Result<Self> {
        let dir = state_dir.join("lease");
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create lease dir: {}", dir.display()))?;
        let path = dir.join(format!("{}.lock", environment));

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let token = format!(
                    "{}-{}",
                    std::process::id(),
                    LEASE_SEQ.fetch_add(1, Ordering::Relaxed)
                );
                let record = LeaseRecord {
                    pid: std::process::id(),
                    token: token.clone(),
                    environment: environment.to_string(),
                    acquired_at: Utc::now(),
                };
                file.write_all(serde_json::to_string_pretty(&record)?.as_bytes())
                    .with_context(|| format!("Failed to write lease: {}", path.display()))?;
                debug!("Lease acquired for '{}'", environment);
                Ok(Self { path, token })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder_pid = fs::read_to_string(&path)
                    .ok()
                    .and_then(|raw| serde_json::from_str::<LeaseRecord>(&raw).ok())
                    .map(|record| record.pid)
                    .unwrap_or(0);
                Err(DeployError::LeaseHeld {
                    environment: environment.to_string(),
                    holder_pid,
                }
                .into())
            }
            Err(e) => {
                Err(e).with_context(|| format!("Failed to create lease: {}", path.display()))
            }
        }
    }

    /// Emergency takeover: removes any existing lock first. Only the
    /// emergency rollback path uses this, when a wedged deploy still holds
    /// the environment.
    pub fn force(state_dir: &Path, environment: &str) -> Result<Self> {
        let path = state_dir
            .join("lease")
            .join(format!("{}.lock", environment));
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove stale lease: {}", path.display()))?;
            debug!("Forced takeover of lease for '{}'", environment);
        }
        Self::acquire(state_dir, environment)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        // Release only if the lock record is still ours. After a forced
        // takeover the stale guard must not delete the new holder's lock.
        let still_ours = fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_str::<LeaseRecord>(&raw).ok())
            .is_some_and(|record| record.token == self.token);
        if still_ours {
            let _ = fs::remove_file(&self.path);
        }
    }
}
