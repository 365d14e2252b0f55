use anyhow::Result;

use crate::backup::BackupManager;
use crate::config::CutoverConfig;
use crate::output;

/// Apply the retention policy to the environment's backup artifacts.
pub fn run(config: CutoverConfig, environment: &str) -> Result<i32> {
    let env = config.environment(environment)?;
    let backups = BackupManager::new(&config.backup);

    let report = backups.sweep(&env.backups)?;
    output::success(&format!(
        "Sweep complete: {} removed, {} kept",
        report.removed, report.kept
    ));
    Ok(0)
}
