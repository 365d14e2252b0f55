use anyhow::{bail, Result};
use chrono::Utc;

use crate::backup::BackupManager;
use crate::config::CutoverConfig;
use crate::lease::Lease;
use crate::output;
use crate::probe::HealthProbe;
use crate::rollback::{self, RollbackController, RollbackOutcome};
use crate::versions::VersionLedger;

/// Operator-initiated rollback, outside any deployment run. Used when a
/// problem surfaces after a deploy already completed.
pub async fn run(
    config: CutoverConfig,
    environment: &str,
    emergency: bool,
    version: Option<&str>,
) -> Result<i32> {
    let state_dir = config.app.state_dir.clone();
    let env = config.environment(environment)?.clone();

    let _lease = if emergency {
        output::warning("--emergency given: taking over the environment lease");
        Lease::force(&state_dir, environment)?
    } else {
        Lease::acquire(&state_dir, environment)?
    };

    let mut ledger = VersionLedger::load(&state_dir, environment)?;
    let target = match version {
        Some(v) => v.to_string(),
        None => match &ledger.previous {
            Some(v) => v.clone(),
            None => bail!(
                "No previous version recorded for '{}'; pass --version explicitly",
                environment
            ),
        },
    };

    let prior = rollback::read_audit(&state_dir)?
        .iter()
        .filter(|r| r.environment == environment)
        .count();
    if prior > 0 {
        output::info(&format!(
            "{} earlier rollback(s) on record for {}",
            prior, environment
        ));
    }

    let backups = BackupManager::new(&config.backup);
    let probe = HealthProbe::new();
    let controller = RollbackController::new(&config, &env, &backups, &probe);

    let run_id = Utc::now().format("%Y%m%d-%H%M%S").to_string();
    let record = controller
        .rollback(
            environment,
            &run_id,
            "operator",
            "manual rollback requested",
            Some(&target),
            ledger.current.as_deref(),
        )
        .await;

    match record.outcome {
        RollbackOutcome::Success => {
            ledger.record_rollback(&target);
            ledger.save(&state_dir, environment)?;
            output::success(&format!("{} is back on {}", environment, target));
            Ok(0)
        }
        RollbackOutcome::Failed | RollbackOutcome::TimedOut => Ok(2),
    }
}
