use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::backup::Backup;
use crate::gate::ValidationResult;
use crate::monitor::AnomalyReport;
use crate::phase::PhaseOutcome;
use crate::plan::DeploymentPlan;
use crate::rollback::RollbackRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Validating,
    BackingUp,
    Deploying { phase: String },
    ValidatingSmoke,
    Monitoring,
    Complete,
    /// Aborted before any destructive phase ran (failed gate or failed
    /// backup). Nothing to roll back.
    Failed,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Failed | Self::RolledBack | Self::RollbackFailed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Passed,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub name: String,
    pub status: PhaseStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Mutable execution record for one deployment, owned exclusively by the
/// orchestrator and persisted atomically at every state transition. The
/// final report is this record, frozen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRun {
    pub id: String,
    pub environment: String,
    pub version: String,
    pub previous_version: Option<String>,
    pub blue_green: bool,
    pub state: RunState,
    pub phases: Vec<PhaseRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smoke: Option<ValidationResult>,
    pub backups: Vec<Backup>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitoring: Option<AnomalyReport>,
    pub log: Vec<LogEntry>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl DeploymentRun {
    pub fn new(plan: &DeploymentPlan) -> Self {
        Self {
            id: plan.release.clone(),
            environment: plan.environment.clone(),
            version: plan.version.clone(),
            previous_version: plan.previous_version.clone(),
            blue_green: plan.blue_green,
            state: RunState::Pending,
            phases: plan
                .phases
                .iter()
                .map(|p| PhaseRecord {
                    name: p.name.clone(),
                    status: PhaseStatus::Pending,
                    started_at: None,
                    ended_at: None,
                    failure: None,
                })
                .collect(),
            validation: None,
            smoke: None,
            backups: Vec::new(),
            rollback: None,
            monitoring: None,
            log: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn transition(&mut self, state: RunState) {
        self.log(&format!("state: {:?}", state));
        if state.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        self.state = state;
    }

    pub fn log(&mut self, message: &str) {
        self.log.push(LogEntry {
            at: Utc::now(),
            message: message.to_string(),
        });
    }

    /// Phases are strictly sequential within a run; starting a phase while
    /// another is RUNNING is a bug.
    pub fn start_phase(&mut self, name: &str) -> Result<()> {
        if let Some(running) = self.phases.iter().find(|p| p.status == PhaseStatus::Running) {
            bail!(
                "Cannot start phase '{}' while '{}' is still running",
                name,
                running.name
            );
        }
        let phase = self
            .phases
            .iter_mut()
            .find(|p| p.name == name)
            .with_context(|| format!("Phase '{}' not in this run", name))?;
        phase.status = PhaseStatus::Running;
        phase.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn finish_phase(&mut self, outcome: &PhaseOutcome) {
        if let Some(phase) = self.phases.iter_mut().find(|p| p.name == outcome.phase) {
            phase.ended_at = Some(Utc::now());
            match &outcome.failure {
                None => phase.status = PhaseStatus::Passed,
                Some(failure) => {
                    phase.status = PhaseStatus::Failed;
                    phase.failure =
                        Some(format!("step '{}': {}", failure.step, failure.reason));
                }
            }
        }
    }

    /// After a successful rollback every phase that ran has been undone.
    pub fn mark_phases_rolled_back(&mut self) {
        for phase in &mut self.phases {
            if matches!(phase.status, PhaseStatus::Passed | PhaseStatus::Failed) {
                phase.status = PhaseStatus::RolledBack;
            }
        }
    }

    pub fn failed_phase(&self) -> Option<&PhaseRecord> {
        self.phases.iter().find(|p| p.failure.is_some())
    }

    pub fn persist(&self, state_dir: &Path) -> Result<()> {
        write_json_atomic(&Self::run_path(state_dir, &self.environment, &self.id), self)
    }

    pub fn write_report(&self, state_dir: &Path) -> Result<PathBuf> {
        let path = state_dir
            .join("reports")
            .join(format!("{}-{}.json", self.environment, self.id));
        write_json_atomic(&path, self)?;
        Ok(path)
    }

    pub fn run_path(state_dir: &Path, environment: &str, id: &str) -> PathBuf {
        state_dir
            .join("runs")
            .join(format!("{}-{}.json", environment, id))
    }

    /// CLI exit code contract: 0 success, 1 failed but safe (rolled back or
    /// never started), 2 rollback failed and the environment needs a human.
    pub fn exit_code(&self) -> i32 {
        match self.state {
            RunState::Complete => 0,
            RunState::RollbackFailed => 2,
            _ => 1,
        }
    }
}

/// Write-then-rename so a crash mid-write never leaves a torn record.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("Path has no parent: {}", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create dir: {}", parent.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.write_all(b"\n")?;
    tmp.persist(path)
        .with_context(|| format!("Failed to persist {}", path.display()))?;
    Ok(())
}
