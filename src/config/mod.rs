use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

mod validate;

#[derive(Debug, Deserialize, Serialize)]
pub struct CutoverConfig {
    pub app: AppConfig,
    #[serde(default)]
    pub deploy: DeployConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub environments: HashMap<String, EnvironmentConfig>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AppConfig {
    pub name: String,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".cutover")
}

/// Timeout budgets, all in seconds. Fixed-interval polling everywhere so the
/// worst-case wall-clock time of a run is computable up front.
#[derive(Debug, Deserialize, Serialize)]
pub struct DeployConfig {
    #[serde(default = "default_validation_timeout")]
    pub validation_timeout: u64,
    #[serde(default = "default_step_timeout")]
    pub step_timeout: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: u64,
    #[serde(default = "default_probe_interval")]
    pub probe_interval: u64,
    /// End-to-end rollback SLA. Default keeps recovery under ten minutes.
    #[serde(default = "default_rollback_budget")]
    pub rollback_budget: u64,
    /// Health re-validation budget during rollback, deliberately shorter
    /// than the deploy-time probe budget.
    #[serde(default = "default_rollback_probe_timeout")]
    pub rollback_probe_timeout: u64,
    #[serde(default = "default_monitor_duration")]
    pub monitor_duration: u64,
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval: u64,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            validation_timeout: default_validation_timeout(),
            step_timeout: default_step_timeout(),
            probe_timeout: default_probe_timeout(),
            probe_interval: default_probe_interval(),
            rollback_budget: default_rollback_budget(),
            rollback_probe_timeout: default_rollback_probe_timeout(),
            monitor_duration: default_monitor_duration(),
            monitor_interval: default_monitor_interval(),
        }
    }
}

fn default_validation_timeout() -> u64 {
    120
}
fn default_step_timeout() -> u64 {
    300
}
fn default_probe_timeout() -> u64 {
    300
}
fn default_probe_interval() -> u64 {
    5
}
fn default_rollback_budget() -> u64 {
    600
}
fn default_rollback_probe_timeout() -> u64 {
    120
}
fn default_monitor_duration() -> u64 {
    300
}
fn default_monitor_interval() -> u64 {
    15
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BackupConfig {
    #[serde(default = "default_backup_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    #[serde(default = "default_retention_count")]
    pub retention_count: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: default_backup_dir(),
            retention_days: default_retention_days(),
            retention_count: default_retention_count(),
        }
    }
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("backups")
}
fn default_retention_days() -> u64 {
    7
}
fn default_retention_count() -> usize {
    10
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct EnvironmentConfig {
    /// Environment variables that must be present before deploying.
    #[serde(default)]
    pub required_env: Vec<String>,
    #[serde(default)]
    pub checks: Vec<CheckConfig>,
    /// Shallow post-cutover checks. Fast by design.
    #[serde(default)]
    pub smoke_checks: Vec<CheckConfig>,
    /// Health targets polled after cutover and during rollback. The first
    /// entry is the primary target used by the monitoring window.
    #[serde(default)]
    pub health: Vec<ProbeTargetConfig>,
    #[serde(default)]
    pub backups: Vec<BackupSourceConfig>,
    #[serde(default)]
    pub phases: PhasesConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct PhasesConfig {
    #[serde(default)]
    pub infrastructure: Vec<StepConfig>,
    #[serde(default)]
    pub migration: Vec<StepConfig>,
    #[serde(default)]
    pub cutover: Vec<StepConfig>,
    /// Alternative cutover step list used with `deploy --blue-green`.
    #[serde(default)]
    pub blue_green_cutover: Vec<StepConfig>,
    /// Steps that redeploy the previous version during rollback.
    #[serde(default)]
    pub rollback: Vec<StepConfig>,
}

/// One idempotent unit of work. `run` is a minijinja template rendered with
/// `version`, `previous_version`, `environment` and `release`.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StepConfig {
    pub name: String,
    pub run: String,
    /// Per-step timeout in seconds; falls back to `deploy.step_timeout`.
    pub timeout: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Env,
    Disk,
    Tcp,
    Http,
    Command,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CheckConfig {
    pub name: String,
    pub kind: CheckKind,
    /// Advisory checks downgrade FAIL to WARN in the aggregate verdict.
    #[serde(default)]
    pub advisory: bool,
    /// kind = "env": variables that must be set.
    #[serde(default)]
    pub vars: Vec<String>,
    /// kind = "disk": mount point to inspect and minimum free space.
    pub path: Option<String>,
    pub min_free_mb: Option<u64>,
    /// kind = "tcp": host:port to connect to.
    pub addr: Option<String>,
    /// kind = "http": endpoint that must answer 2xx.
    pub url: Option<String>,
    /// kind = "command": exit 0 passes, anything else fails.
    pub run: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Http,
    Command,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProbeTargetConfig {
    pub name: String,
    pub kind: ProbeKind,
    pub url: Option<String>,
    pub run: Option<String>,
}

/// A mutable state source protected by backups. Either a dump/restore
/// command pair or a filesystem path snapshotted with tar.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BackupSourceConfig {
    pub name: String,
    /// Command whose stdout is captured as the artifact (e.g. pg_dump).
    pub dump: Option<String>,
    /// Command that restores from the artifact; rendered with `artifact`.
    pub restore: Option<String>,
    /// Filesystem path to snapshot instead of a dump command.
    pub path: Option<PathBuf>,
    /// Artifact extension; "dump" for commands, "tar" for snapshots.
    pub ext: Option<String>,
}

impl BackupSourceConfig {
    pub fn extension(&self) -> &str {
        match &self.ext {
            Some(ext) => ext,
            None if self.path.is_some() => "tar",
            None => "dump",
        }
    }
}

impl CutoverConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.apply_env_overrides()?;
        validate::validate(&config)?;

        Ok(config)
    }

    pub fn environment(&self, name: &str) -> Result<&EnvironmentConfig> {
        self.environments
            .get(name)
            .with_context(|| format!("Environment '{}' not found in config", name))
    }

    /// Bounded, enumerated overrides. Everything else in the process
    /// environment is opaque pass-through to step commands.
    fn apply_env_overrides(&mut self) -> Result<()> {
        override_u64("CUTOVER_VALIDATION_TIMEOUT", &mut self.deploy.validation_timeout)?;
        override_u64("CUTOVER_STEP_TIMEOUT", &mut self.deploy.step_timeout)?;
        override_u64("CUTOVER_ROLLBACK_BUDGET", &mut self.deploy.rollback_budget)?;
        override_u64("CUTOVER_MONITOR_DURATION", &mut self.deploy.monitor_duration)?;
        override_u64("CUTOVER_MONITOR_INTERVAL", &mut self.deploy.monitor_interval)?;
        override_u64("CUTOVER_RETENTION_DAYS", &mut self.backup.retention_days)?;

        if let Ok(raw) = std::env::var("CUTOVER_RETENTION_COUNT") {
            self.backup.retention_count = raw
                .parse()
                .context("CUTOVER_RETENTION_COUNT must be an integer")?;
        }
        Ok(())
    }
}

fn override_u64(var: &str, slot: &mut u64) -> Result<()> {
    if let Ok(raw) = std::env::var(var) {
        *slot = raw
            .parse()
            .with_context(|| format!("{} must be an integer (seconds)", var))?;
    }
    Ok(())
}
