use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::{BackupConfig, BackupSourceConfig};
use crate::error::DeployError;

/// One verified snapshot. Immutable once created; only the retention sweep
/// deletes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub checksum: String,
    pub artifact: PathBuf,
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub removed: usize,
    pub kept: usize,
}

pub struct BackupManager {
    dir: PathBuf,
    retention_days: u64,
    retention_count: usize,
}

impl BackupManager {
    pub fn new(config: &BackupConfig) -> Self {
        Self {
            dir: config.dir.clone(),
            retention_days: config.retention_days,
            retention_count: config.retention_count,
        }
    }

    /// Snapshot one source and verify the artifact before returning. The
    /// checksum is recomputed from the bytes on disk, so a torn or partial
    /// write surfaces here as `BackupIntegrity` and the caller must not
    /// proceed to the phase this backup protects.
    pub async fn create(&self, source: &BackupSourceConfig) -> Result<Backup> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create backup dir: {}", self.dir.display()))?;

        let created_at = Utc::now();
        let stamp = created_at.format("%Y%m%d-%H%M%S");
        let artifact = self.unique_artifact_path(&format!("{}_{}", source.name, stamp), source.extension());

        if let Some(dump) = &source.dump {
            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(dump)
                .kill_on_drop(true)
                .output()
                .await
                .with_context(|| format!("Failed to run dump command for '{}'", source.name))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                bail!(
                    "Dump command for '{}' failed: {}",
                    source.name,
                    stderr.trim()
                );
            }
            fs::write(&artifact, &output.stdout)
                .with_context(|| format!("Failed to write artifact: {}", artifact.display()))?;
        } else if let Some(path) = &source.path {
            snapshot_path(path, &artifact).await?;
        } else {
            bail!(
                "Backup source '{}' has neither a dump command nor a path",
                source.name
            );
        }

        let checksum = checksum_file(&artifact)?;
        fs::write(checksum_path(&artifact), &checksum)
            .with_context(|| format!("Failed to write checksum for {}", artifact.display()))?;

        let backup = Backup {
            id: artifact
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            source: source.name.clone(),
            created_at,
            checksum,
            artifact,
        };
        self.verify(&backup)?;

        debug!("Backup created: {} ({})", backup.id, backup.checksum);
        Ok(backup)
    }

    /// Recompute the artifact checksum and compare against both the stored
    /// sidecar file and the in-memory record.
    pub fn verify(&self, backup: &Backup) -> Result<()> {
        let actual = checksum_file(&backup.artifact)?;
        let stored = fs::read_to_string(checksum_path(&backup.artifact))
            .with_context(|| format!("Missing checksum file for {}", backup.id))?
            .trim()
            .to_string();

        if actual != stored || actual != backup.checksum {
            return Err(DeployError::BackupIntegrity {
                source_name: backup.source.clone(),
                expected: backup.checksum.clone(),
                actual,
            }
            .into());
        }
        Ok(())
    }

    /// Most recent verified backup for a source, or None when none exists.
    /// Callers that need a rollback target must treat None as fatal.
    pub fn latest(&self, source: &str) -> Result<Option<Backup>> {
        Ok(self.list(source)?.into_iter().next())
    }

    /// All backups for a source, newest first.
    pub fn list(&self, source: &str) -> Result<Vec<Backup>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let prefix = format!("{}_", source);
        let mut backups = Vec::new();

        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read backup dir: {}", self.dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&prefix) || name.ends_with(".sha256") {
                continue;
            }

            let artifact = entry.path();
            let Ok(checksum) = fs::read_to_string(checksum_path(&artifact)) else {
                // Artifact without a sidecar never finished verification.
                continue;
            };

            let modified = entry.metadata()?.modified()?;
            backups.push(Backup {
                id: name,
                source: source.to_string(),
                created_at: DateTime::<Utc>::from(modified),
                checksum: checksum.trim().to_string(),
                artifact,
            });
        }

        backups.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(backups)
    }

    /// Reverse state to the snapshot. Safe to call twice: restore commands
    /// are idempotent by contract and tar extraction overwrites in place.
    pub async fn restore(&self, source: &BackupSourceConfig, backup: &Backup) -> Result<()> {
        self.verify(backup)?;

        if let Some(restore) = &source.restore {
            let env = minijinja::Environment::new();
            let command = env
                .render_str(
                    restore,
                    minijinja::context! { artifact => backup.artifact.to_string_lossy() },
                )
                .with_context(|| format!("Failed to render restore command for '{}'", source.name))?;

            // Restore runs under the rollback budget; if the budget cancels
            // it, the command must not keep mutating state.
            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&command)
                .kill_on_drop(true)
                .output()
                .await
                .with_context(|| format!("Failed to run restore command for '{}'", source.name))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                bail!(
                    "Restore command for '{}' failed: {}",
                    source.name,
                    stderr.trim()
                );
            }
        } else if let Some(path) = &source.path {
            restore_path(path, &backup.artifact).await?;
        } else {
            bail!("Backup source '{}' has no restore mechanism", source.name);
        }

        debug!("Restored '{}' from {}", source.name, backup.id);
        Ok(())
    }

    /// Age- and count-based retention. Never removes the single most recent
    /// backup of a source, even when it is past the retention window.
    pub fn sweep(&self, sources: &[BackupSourceConfig]) -> Result<SweepReport> {
        self.sweep_at(sources, Utc::now())
    }

    fn sweep_at(&self, sources: &[BackupSourceConfig], now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for source in sources {
            for (index, backup) in self.list(&source.name)?.into_iter().enumerate() {
                let age_days = now
                    .signed_duration_since(backup.created_at)
                    .num_days()
                    .max(0) as u64;
                let expired = index >= self.retention_count || age_days > self.retention_days;

                if index > 0 && expired {
                    fs::remove_file(&backup.artifact).with_context(|| {
                        format!("Failed to remove artifact: {}", backup.artifact.display())
                    })?;
                    let _ = fs::remove_file(checksum_path(&backup.artifact));
                    debug!("Swept backup {}", backup.id);
                    report.removed += 1;
                } else {
                    report.kept += 1;
                }
            }
        }

        Ok(report)
    }

    fn unique_artifact_path(&self, base: &str, ext: &str) -> PathBuf {
        let candidate = self.dir.join(format!("{}.{}", base, ext));
        if !candidate.exists() {
            return candidate;
        }
        // Immediate retries within the same second get a distinct artifact.
        let mut n = 2;
        loop {
            let candidate = self.dir.join(format!("{}-{}.{}", base, n, ext));
            if !candidate.exists() {
                return candidate;
            }
            n += 1;
        }
    }
}

async fn snapshot_path(path: &Path, artifact: &Path) -> Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    let name = path
        .file_name()
        .with_context(|| format!("Backup path has no file name: {}", path.display()))?;

    let mut cmd = tokio::process::Command::new("tar");
    cmd.arg("-cf").arg(artifact).kill_on_drop(true);
    if let Some(parent) = parent {
        cmd.arg("-C").arg(parent);
    }
    cmd.arg(name);

    let output = cmd
        .output()
        .await
        .with_context(|| format!("Failed to run tar for {}", path.display()))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("tar failed for {}: {}", path.display(), stderr.trim());
    }
    Ok(())
}

async fn restore_path(path: &Path, artifact: &Path) -> Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());

    let mut cmd = tokio::process::Command::new("tar");
    cmd.arg("-xf").arg(artifact).kill_on_drop(true);
    if let Some(parent) = parent {
        cmd.arg("-C").arg(parent);
    }

    let output = cmd
        .output()
        .await
        .with_context(|| format!("Failed to run tar -x for {}", artifact.display()))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("tar -x failed for {}: {}", artifact.display(), stderr.trim());
    }
    Ok(())
}

fn checksum_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_owned();
    name.push(".sha256");
    PathBuf::from(name)
}

fn checksum_file(path: &Path) -> Result<String> {
    let bytes =
        fs::read(path).with_context(|| format!("Failed to read artifact: {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackupConfig;

    fn manager(dir: &Path) -> BackupManager {
        BackupManager::new(&BackupConfig {
            dir: dir.to_path_buf(),
            retention_days: 7,
            retention_count: 10,
        })
    }

    fn dump_source(name: &str, dump: &str) -> BackupSourceConfig {
        BackupSourceConfig {
            name: name.into(),
            dump: Some(dump.into()),
            restore: Some("true".into()),
            path: None,
            ext: None,
        }
    }

    #[tokio::test]
    async fn create_writes_artifact_with_verified_checksum() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path());

        let backup = mgr
            .create(&dump_source("database", "printf hello"))
            .await
            .unwrap();

        assert_eq!(fs::read(&backup.artifact).unwrap(), b"hello");
        assert!(checksum_path(&backup.artifact).exists());
        assert!(mgr.verify(&backup).is_ok());
        assert_eq!(
            mgr.latest("database").unwrap().unwrap().id,
            backup.id
        );
    }

    #[tokio::test]
    async fn immediate_retry_yields_two_independent_backups() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path());
        let source = dump_source("database", "printf data");

        let first = mgr.create(&source).await.unwrap();
        let second = mgr.create(&source).await.unwrap();

        assert_ne!(first.id, second.id);
        assert!(mgr.verify(&first).is_ok());
        assert!(mgr.verify(&second).is_ok());
        assert_eq!(mgr.list("database").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn tampered_artifact_fails_integrity_check() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path());

        let backup = mgr
            .create(&dump_source("database", "printf hello"))
            .await
            .unwrap();
        fs::write(&backup.artifact, b"tampered").unwrap();

        let err = mgr.verify(&backup).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DeployError>(),
            Some(DeployError::BackupIntegrity { .. })
        ));
    }

    #[tokio::test]
    async fn failed_dump_command_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path());

        let err = mgr
            .create(&dump_source("database", "echo nope >&2; exit 1"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
        assert!(mgr.latest("database").unwrap().is_none());
    }

    #[tokio::test]
    async fn restore_command_receives_the_artifact_path() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp.path().join("backups"));
        let restored = tmp.path().join("restored");

        let source = BackupSourceConfig {
            name: "database".into(),
            dump: Some("printf snapshot".into()),
            restore: Some(format!("cp {{{{ artifact }}}} {}", restored.display())),
            path: None,
            ext: None,
        };

        let backup = mgr.create(&source).await.unwrap();
        mgr.restore(&source, &backup).await.unwrap();
        assert_eq!(fs::read(&restored).unwrap(), b"snapshot");

        // Idempotent: a second restore is safe and leaves the same state.
        mgr.restore(&source, &backup).await.unwrap();
        assert_eq!(fs::read(&restored).unwrap(), b"snapshot");
    }

    #[tokio::test]
    async fn path_snapshot_round_trips_through_tar() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = tmp.path().join("config");
        fs::create_dir(&data_dir).unwrap();
        fs::write(data_dir.join("app.toml"), b"key = 1").unwrap();

        let mgr = manager(&tmp.path().join("backups"));
        let source = BackupSourceConfig {
            name: "config".into(),
            dump: None,
            restore: None,
            path: Some(data_dir.clone()),
            ext: None,
        };

        let backup = mgr.create(&source).await.unwrap();
        assert_eq!(backup.id.split('.').next_back(), Some("tar"));

        fs::write(data_dir.join("app.toml"), b"key = 2").unwrap();
        mgr.restore(&source, &backup).await.unwrap();
        assert_eq!(fs::read(data_dir.join("app.toml")).unwrap(), b"key = 1");
    }

    #[tokio::test]
    async fn sweep_never_removes_the_most_recent_backup() {
        let tmp = tempfile::tempdir().unwrap();
        let mut mgr = manager(tmp.path());
        mgr.retention_count = 1;
        let source = dump_source("database", "printf data");

        for _ in 0..3 {
            mgr.create(&source).await.unwrap();
        }

        let report = mgr.sweep(std::slice::from_ref(&source)).unwrap();
        assert_eq!(report.removed, 2);
        assert_eq!(report.kept, 1);
        assert_eq!(mgr.list("database").unwrap().len(), 1);

        // Even far past the age window, the last backup survives.
        let future = Utc::now() + chrono::Duration::days(365);
        let report = mgr
            .sweep_at(std::slice::from_ref(&source), future)
            .unwrap();
        assert_eq!(report.removed, 0);
        assert_eq!(report.kept, 1);
    }
}
