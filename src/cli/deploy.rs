use anyhow::Result;

use crate::abort::AbortFlag;
use crate::config::CutoverConfig;
use crate::gate::{self, ValidationGate, Verdict};
use crate::orchestrator::DeploymentOrchestrator;
use crate::output;
use crate::plan::{DeploymentPlan, Step};
use crate::run::RunState;
use crate::versions::VersionLedger;
use std::time::Duration;

pub async fn run(
    config: CutoverConfig,
    environment: &str,
    version: &str,
    blue_green: bool,
    dry_run: bool,
    force: bool,
) -> Result<i32> {
    let ledger = VersionLedger::load(&config.app.state_dir, environment)?;
    let plan = DeploymentPlan::build(
        &config,
        environment,
        version,
        ledger.current.clone(),
        blue_green,
    )?;

    if dry_run {
        return preview(&config, &plan).await;
    }

    let abort = AbortFlag::new();
    abort.listen_for_ctrl_c();

    let orchestrator = DeploymentOrchestrator::new(config, abort);
    let run = orchestrator.execute(&plan, force).await?;

    match run.state {
        RunState::Complete => {}
        RunState::Failed => {
            output::error(&format!(
                "Deployment of {} to {} aborted before any change",
                version, environment
            ));
        }
        RunState::RolledBack => {
            if let Some(phase) = run.failed_phase() {
                output::error(&format!(
                    "Deployment failed in phase '{}': {}",
                    phase.name,
                    phase.failure.as_deref().unwrap_or("unknown")
                ));
            }
            output::warning(&format!(
                "{} was rolled back to {}",
                environment,
                run.previous_version.as_deref().unwrap_or("restored state")
            ));
        }
        RunState::RollbackFailed => {
            output::error(&format!(
                "{} is in an unknown state and needs manual intervention",
                environment
            ));
        }
        _ => {}
    }

    Ok(run.exit_code())
}

/// Show what would run, gate included, without touching the environment.
async fn preview(config: &CutoverConfig, plan: &DeploymentPlan) -> Result<i32> {
    output::header(&format!(
        "Dry run: {} {} -> {}",
        plan.environment,
        plan.previous_version.as_deref().unwrap_or("(none)"),
        plan.version
    ));

    let env = config.environment(&plan.environment)?;
    for phase in &plan.phases {
        output::info(&format!("Phase: {}", phase.name));
        for (index, step) in phase.steps.iter().enumerate() {
            let detail = match step {
                Step::Command { run, .. } => run.clone(),
                Step::WaitHealthy { timeout, .. } => {
                    format!("poll until healthy, up to {}s", timeout.as_secs())
                }
            };
            output::step(index + 1, phase.steps.len(), &format!("{}: {}", step.name(), detail));
        }
    }
    for source in &env.backups {
        output::info(&format!("Would back up: {}", source.name));
    }

    output::header("Pre-flight validation");
    let gate = ValidationGate::new(Duration::from_secs(config.deploy.validation_timeout));
    let result = gate.evaluate(&gate::pre_flight_checks(env)).await;
    for check in &result.checks {
        output::check(&check.name, &check.status, &check.detail);
    }
    match result.verdict() {
        Verdict::NoGo => {
            output::error(&format!("Gate: NO-GO ({})", result.summary()));
            Ok(1)
        }
        _ => {
            output::success(&format!("Gate: GO ({})", result.summary()));
            Ok(0)
        }
    }
}
