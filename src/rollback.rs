use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tracing::error;

use crate::abort::AbortFlag;
use crate::backup::BackupManager;
use crate::config::{CutoverConfig, EnvironmentConfig};
use crate::error::DeployError;
use crate::output;
use crate::phase;
use crate::plan::TemplateCtx;
use crate::probe::{HealthProbe, HealthStatus, ProbeTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackOutcome {
    Success,
    Failed,
    TimedOut,
}

/// Append-only audit entry, one per executed rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub run_id: String,
    pub environment: String,
    pub trigger_phase: String,
    pub reason: String,
    pub backup_ids: Vec<String>,
    pub target_version: Option<String>,
    pub outcome: RollbackOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub duration_ms: u64,
    pub at: DateTime<Utc>,
}

/// Reverses a deployment: restore the latest verified backups, redeploy the
/// prior version, re-validate health under a shorter budget. The whole
/// sequence races the rollback SLA; overrunning it yields TIMED_OUT, never a
/// hang. A failed rollback is terminal: there is no retry and no rollback
/// of the rollback.
pub struct RollbackController<'a> {
    config: &'a CutoverConfig,
    env: &'a EnvironmentConfig,
    backups: &'a BackupManager,
    probe: &'a HealthProbe,
}

impl<'a> RollbackController<'a> {
    pub fn new(
        config: &'a CutoverConfig,
        env: &'a EnvironmentConfig,
        backups: &'a BackupManager,
        probe: &'a HealthProbe,
    ) -> Self {
        Self {
            config,
            env,
            backups,
            probe,
        }
    }

    pub async fn rollback(
        &self,
        environment: &str,
        run_id: &str,
        trigger_phase: &str,
        reason: &str,
        target_version: Option<&str>,
        failed_version: Option<&str>,
    ) -> RollbackRecord {
        output::warning(&format!(
            "Rolling back {} ({}): {}",
            environment, trigger_phase, reason
        ));

        let started = Instant::now();
        let budget = Duration::from_secs(self.config.deploy.rollback_budget);
        let mut backup_ids = Vec::new();

        let attempt = self.attempt(environment, run_id, target_version, failed_version, &mut backup_ids);
        let (outcome, failure) = match tokio::time::timeout(budget, attempt).await {
            Ok(Ok(())) => (RollbackOutcome::Success, None),
            Ok(Err(e)) => (
                RollbackOutcome::Failed,
                Some(DeployError::RollbackFailure(format!("{:#}", e)).to_string()),
            ),
            Err(_) => (
                RollbackOutcome::TimedOut,
                Some(format!("exceeded the {}s rollback budget", budget.as_secs())),
            ),
        };

        match outcome {
            RollbackOutcome::Success => {
                output::success(&format!("Rollback complete for {}", environment))
            }
            _ => output::error(&format!(
                "ROLLBACK {} for {}, manual intervention required: {}",
                if outcome == RollbackOutcome::TimedOut {
                    "TIMED OUT"
                } else {
                    "FAILED"
                },
                environment,
                failure.as_deref().unwrap_or("unknown"),
            )),
        }

        let record = RollbackRecord {
            run_id: run_id.to_string(),
            environment: environment.to_string(),
            trigger_phase: trigger_phase.to_string(),
            reason: reason.to_string(),
            backup_ids,
            target_version: target_version.map(str::to_string),
            outcome,
            failure,
            duration_ms: started.elapsed().as_millis() as u64,
            at: Utc::now(),
        };

        if let Err(e) = append_audit(&self.config.app.state_dir, &record) {
            error!("Failed to append rollback audit record: {:#}", e);
        }
        record
    }

    async fn attempt(
        &self,
        environment: &str,
        run_id: &str,
        target_version: Option<&str>,
        failed_version: Option<&str>,
        backup_ids: &mut Vec<String>,
    ) -> Result<()> {
        // Restore every protected source from its latest verified backup.
        // No backup means no safe restore point, which is fatal here.
        for source in &self.env.backups {
            let backup = self.backups.latest(&source.name)?.with_context(|| {
                format!(
                    "no backup exists for '{}', no safe rollback target",
                    source.name
                )
            })?;
            self.backups.restore(source, &backup).await?;
            backup_ids.push(backup.id);
        }

        // Redeploy the prior version's service set.
        let ctx = TemplateCtx {
            version: target_version.unwrap_or("").to_string(),
            previous_version: failed_version.map(str::to_string),
            environment: environment.to_string(),
            release: run_id.to_string(),
        };
        let default_timeout = Duration::from_secs(self.config.deploy.step_timeout);
        for step in &self.env.phases.rollback {
            let command = ctx.render(&step.run)?;
            let timeout = step
                .timeout
                .map(Duration::from_secs)
                .unwrap_or(default_timeout);
            phase::run_command(&command, timeout)
                .await
                .map_err(|reason| anyhow!("rollback step '{}' failed: {}", step.name, reason))?;
        }

        // Re-validate with the dedicated, shorter budget. A fresh abort flag:
        // an operator cannot cancel a rollback halfway through.
        let probe_timeout = Duration::from_secs(self.config.deploy.rollback_probe_timeout);
        let interval = Duration::from_secs(self.config.deploy.probe_interval);
        let no_abort = AbortFlag::new();
        for target_cfg in &self.env.health {
            let target = ProbeTarget::from_config(target_cfg)?;
            let sample = self
                .probe
                .wait_until_healthy(&target, probe_timeout, interval, &no_abort)
                .await;
            if sample.status != HealthStatus::Up {
                return Err(DeployError::HealthCheckTimeout {
                    target: target.name().to_string(),
                    budget_secs: probe_timeout.as_secs(),
                }
                .into());
            }
        }

        Ok(())
    }
}

pub fn append_audit(state_dir: &Path, record: &RollbackRecord) -> Result<()> {
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("Failed to create state dir: {}", state_dir.display()))?;
    let path = state_dir.join("rollbacks.jsonl");
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open audit log: {}", path.display()))?;
    writeln!(file, "{}", serde_json::to_string(record)?)
        .with_context(|| format!("Failed to append to audit log: {}", path.display()))?;
    Ok(())
}

pub fn read_audit(state_dir: &Path) -> Result<Vec<RollbackRecord>> {
    let path = state_dir.join("rollbacks.jsonl");
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read audit log: {}", path.display()))?;
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).context("Malformed audit record"))
        .collect()
}
