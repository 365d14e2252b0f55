use anyhow::Result;
use chrono::Utc;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::abort::AbortFlag;
use crate::backup::BackupManager;
use crate::config::{CutoverConfig, EnvironmentConfig};
use crate::error::DeployError;
use crate::gate::{self, CheckStatus, ValidationGate, Verdict};
use crate::lease::Lease;
use crate::monitor::{self, Baseline, MonitoringWindow};
use crate::output;
use crate::phase::PhaseRunner;
use crate::plan::DeploymentPlan;
use crate::probe::{HealthProbe, ProbeTarget};
use crate::rollback::{RollbackController, RollbackOutcome};
use crate::run::{DeploymentRun, RunState};
use crate::versions::VersionLedger;

/// Top-level state machine. Drives one run through
/// validate → backup → phases → smoke tests → monitoring, in plan order,
/// never skipping or reordering. Any gated failure after the backups exist
/// converts synchronously into a rollback; the caller only ever sees a
/// terminal state.
pub struct DeploymentOrchestrator {
    config: CutoverConfig,
    probe: HealthProbe,
    gate: ValidationGate,
    backups: BackupManager,
    abort: AbortFlag,
}

impl DeploymentOrchestrator {
    pub fn new(config: CutoverConfig, abort: AbortFlag) -> Self {
        let gate = ValidationGate::new(Duration::from_secs(config.deploy.validation_timeout));
        let backups = BackupManager::new(&config.backup);
        Self {
            config,
            probe: HealthProbe::new(),
            gate,
            backups,
            abort,
        }
    }

    pub async fn execute(
        &self,
        plan: &DeploymentPlan,
        skip_validation: bool,
    ) -> Result<DeploymentRun> {
        let state_dir = self.config.app.state_dir.clone();
        let env = self.config.environment(&plan.environment)?.clone();

        // Exclusive per-environment lease; a concurrent deploy fails fast
        // here instead of interleaving. Released on drop, so every exit
        // path below frees the environment.
        let _lease = Lease::acquire(&state_dir, &plan.environment)?;

        info!(
            "Deployment {} of {} to {} started",
            plan.release, plan.version, plan.environment
        );
        let mut run = DeploymentRun::new(plan);
        run.persist(&state_dir)?;

        // Pre-flight gate: non-destructive, so a NO-GO aborts locally with
        // nothing to roll back.
        run.transition(RunState::Validating);
        run.persist(&state_dir)?;
        if skip_validation {
            output::warning("--force given: skipping pre-flight validation");
            run.log("pre-flight validation skipped (--force)");
        } else {
            output::header("Pre-flight validation");
            let battery = gate::pre_flight_checks(&env);
            let result = self.gate.evaluate(&battery).await;
            for check in &result.checks {
                output::check(&check.name, &check.status, &check.detail);
            }
            let verdict = result.verdict();
            let summary = result.summary();
            run.validation = Some(result);
            match verdict {
                Verdict::NoGo => {
                    run.log(&DeployError::ValidationFailure(summary).to_string());
                    output::error("Validation gate: NO-GO, aborting before any change");
                    return self.finalize(run, RunState::Failed, &state_dir);
                }
                Verdict::GoWithWarnings => output::warning("Validation gate: GO with advisories"),
                Verdict::Go => output::success("Validation gate: GO"),
            }
        }

        // Verified backups before anything destructive, so every later
        // failure has a restore point. A failed or unverifiable backup
        // aborts locally for the same reason a failed gate does.
        run.transition(RunState::BackingUp);
        run.persist(&state_dir)?;
        for source in &env.backups {
            match self.backups.create(source).await {
                Ok(backup) => {
                    output::success(&format!("Backup verified: {}", backup.id));
                    run.backups.push(backup);
                }
                Err(e) => {
                    output::error(&format!("Backup of '{}' failed: {:#}", source.name, e));
                    run.log(&format!("backup of '{}' failed: {:#}", source.name, e));
                    return self.finalize(run, RunState::Failed, &state_dir);
                }
            }
        }
        run.persist(&state_dir)?;

        // Ordered phases. Plan order is authoritative.
        let runner = PhaseRunner::new(&self.probe, &self.abort);
        for phase in &plan.phases {
            output::header(&format!("Phase: {}", phase.name));
            run.start_phase(&phase.name)?;
            run.transition(RunState::Deploying {
                phase: phase.name.clone(),
            });
            run.persist(&state_dir)?;

            let outcome = runner.run(phase).await;
            run.finish_phase(&outcome);
            run.persist(&state_dir)?;

            if let Some(failure) = &outcome.failure {
                let reason = DeployError::PhaseStepFailure {
                    phase: phase.name.clone(),
                    step: failure.step.clone(),
                    reason: failure.reason.clone(),
                }
                .to_string();
                return self
                    .roll_back(run, plan, &env, &phase.name, &reason, &state_dir)
                    .await;
            }
        }

        // Post-cutover smoke tests. The new version is live now, so a
        // NO-GO here takes the rollback path.
        run.transition(RunState::ValidatingSmoke);
        run.persist(&state_dir)?;
        if !env.smoke_checks.is_empty() {
            output::header("Smoke tests");
            let result = self.gate.evaluate(&env.smoke_checks).await;
            for check in &result.checks {
                output::check(&check.name, &check.status, &check.detail);
            }
            let verdict = result.verdict();
            let reason = result
                .checks
                .iter()
                .find(|c| c.status == CheckStatus::Fail)
                .map(|c| format!("smoke test '{}' failed: {}", c.name, c.detail))
                .unwrap_or_else(|| "smoke test battery failed".to_string());
            run.smoke = Some(result);
            if verdict == Verdict::NoGo {
                return self
                    .roll_back(run, plan, &env, "smoke-tests", &reason, &state_dir)
                    .await;
            }
        }

        // Timed monitoring window. Anomalies are reported, never acted on;
        // post-deploy drift is an operator decision.
        run.transition(RunState::Monitoring);
        run.persist(&state_dir)?;
        if let Some(primary) = env.health.first() {
            let target = ProbeTarget::from_config(primary)?;
            let baseline = monitor::load_baseline(&state_dir, &plan.environment)?;
            output::info(&format!(
                "Monitoring {} for {}s",
                target.name(),
                self.config.deploy.monitor_duration
            ));
            let report = MonitoringWindow::new(&self.probe)
                .observe(
                    &target,
                    baseline.as_ref(),
                    Duration::from_secs(self.config.deploy.monitor_duration),
                    Duration::from_secs(self.config.deploy.monitor_interval),
                    &self.abort,
                )
                .await;
            for anomaly in &report.anomalies {
                output::warning(&format!(
                    "Anomaly [{:?}] {}: {}",
                    anomaly.severity, anomaly.metric, anomaly.detail
                ));
            }
            if baseline.is_none() {
                monitor::save_baseline(
                    &state_dir,
                    &plan.environment,
                    &Baseline {
                        latency_ms: report.mean_latency_ms,
                        error_rate: report.error_rate,
                        recorded_at: Utc::now(),
                    },
                )?;
                run.log("monitoring baseline seeded from this run");
            }
            run.monitoring = Some(report);
        }

        let mut ledger = VersionLedger::load(&state_dir, &plan.environment)?;
        ledger.record_release(&plan.version);
        ledger.save(&state_dir, &plan.environment)?;

        output::success(&format!(
            "Deploy complete! {} is live on {}.",
            plan.version, plan.environment
        ));
        self.finalize(run, RunState::Complete, &state_dir)
    }

    async fn roll_back(
        &self,
        mut run: DeploymentRun,
        plan: &DeploymentPlan,
        env: &EnvironmentConfig,
        trigger_phase: &str,
        reason: &str,
        state_dir: &Path,
    ) -> Result<DeploymentRun> {
        run.transition(RunState::RollingBack);
        run.persist(state_dir)?;

        let controller = RollbackController::new(&self.config, env, &self.backups, &self.probe);
        let record = controller
            .rollback(
                &plan.environment,
                &run.id,
                trigger_phase,
                reason,
                plan.previous_version.as_deref(),
                Some(&plan.version),
            )
            .await;
        let outcome = record.outcome;
        run.rollback = Some(record);

        match outcome {
            RollbackOutcome::Success => {
                run.mark_phases_rolled_back();
                if let Some(target) = plan.previous_version.as_deref() {
                    let mut ledger = VersionLedger::load(state_dir, &plan.environment)?;
                    ledger.record_rollback(target);
                    ledger.save(state_dir, &plan.environment)?;
                }
                self.finalize(run, RunState::RolledBack, state_dir)
            }
            RollbackOutcome::Failed | RollbackOutcome::TimedOut => {
                self.finalize(run, RunState::RollbackFailed, state_dir)
            }
        }
    }

    fn finalize(
        &self,
        mut run: DeploymentRun,
        state: RunState,
        state_dir: &Path,
    ) -> Result<DeploymentRun> {
        run.transition(state);
        run.persist(state_dir)?;
        let report = run.write_report(state_dir)?;
        output::info(&format!("Report written to {}", report.display()));
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeployError;
    use std::fs;
    use std::path::PathBuf;

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let root = tmp.path().to_path_buf();
            Self { _tmp: tmp, root }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.root.join(name)
        }

        fn config(&self, env_toml: &str) -> CutoverConfig {
            toml::from_str(&format!(
                r#"
                [app]
                name = "acme-api"
                state_dir = "{state}"

                [deploy]
                validation_timeout = 30
                step_timeout = 30
                probe_timeout = 2
                probe_interval = 1
                rollback_budget = 60
                rollback_probe_timeout = 1
                monitor_duration = 0
                monitor_interval = 1

                [backup]
                dir = "{backups}"

                {env}
            "#,
                state = self.path("state").display(),
                backups = self.path("backups").display(),
                env = env_toml,
            ))
            .unwrap()
        }
    }

    fn build_plan(config: &CutoverConfig, previous: Option<&str>) -> DeploymentPlan {
        DeploymentPlan::build(
            config,
            "production",
            "2.4.0",
            previous.map(str::to_string),
            false,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn happy_path_runs_every_stage_and_completes() {
        let fx = Fixture::new();
        let infra = fx.path("infra-done");
        let deployed = fx.path("deployed-version");
        let data = fx.path("data.txt");
        fs::write(&data, "v1 data").unwrap();

        let config = fx.config(&format!(
            r#"
            [environments.production]
            required_env = ["PATH"]

            [[environments.production.checks]]
            name = "disk"
            kind = "command"
            run = "true"

            [[environments.production.smoke_checks]]
            name = "api-alive"
            kind = "command"
            run = "true"

            [[environments.production.backups]]
            name = "database"
            dump = "cat {data}"
            restore = "cp {{{{ artifact }}}} {data}"

            [[environments.production.phases.infrastructure]]
            name = "bring up"
            run = "touch {infra}"

            [[environments.production.phases.cutover]]
            name = "switch"
            run = "echo {{{{ version }}}} > {deployed}"

            [[environments.production.health]]
            name = "web"
            kind = "command"
            run = "true"
        "#,
            data = data.display(),
            infra = infra.display(),
            deployed = deployed.display(),
        ));

        let plan = build_plan(&config, Some("2.3.9"));
        let orch = DeploymentOrchestrator::new(config, AbortFlag::new());
        let run = orch.execute(&plan, false).await.unwrap();

        assert_eq!(run.state, RunState::Complete);
        assert_eq!(run.exit_code(), 0);
        assert!(infra.exists());
        assert_eq!(fs::read_to_string(&deployed).unwrap().trim(), "2.4.0");
        assert_eq!(run.backups.len(), 1);
        assert!(run.validation.is_some());
        assert!(run.smoke.is_some());
        assert!(run.monitoring.is_some());

        let state_dir = fx.path("state");
        let ledger = VersionLedger::load(&state_dir, "production").unwrap();
        assert_eq!(ledger.current.as_deref(), Some("2.4.0"));
        assert!(state_dir.join("reports").read_dir().unwrap().count() == 1);
        // First run seeds the monitoring baseline.
        assert!(monitor::load_baseline(&state_dir, "production")
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn failure_mid_phase_restores_the_pre_phase_backup() {
        let fx = Fixture::new();
        let data = fx.path("data.txt");
        let deployed = fx.path("deployed-version");
        fs::write(&data, "known good").unwrap();

        let config = fx.config(&format!(
            r#"
            [environments.production]

            [[environments.production.backups]]
            name = "database"
            dump = "cat {data}"
            restore = "cp {{{{ artifact }}}} {data}"

            [[environments.production.phases.infrastructure]]
            name = "bring up"
            run = "true"

            [[environments.production.phases.migration]]
            name = "corrupt then fail"
            run = "echo corrupted > {data}; echo schema error >&2; exit 1"

            [[environments.production.phases.cutover]]
            name = "never reached"
            run = "touch {deployed}"
        "#,
            data = data.display(),
            deployed = deployed.display(),
        ));

        let plan = build_plan(&config, Some("2.3.9"));
        let orch = DeploymentOrchestrator::new(config, AbortFlag::new());
        let run = orch.execute(&plan, false).await.unwrap();

        assert_eq!(run.state, RunState::RolledBack);
        assert_eq!(run.exit_code(), 1);
        assert!(!deployed.exists(), "cutover must not run after a failure");
        assert_eq!(fs::read_to_string(&data).unwrap(), "known good");

        let record = run.rollback.as_ref().unwrap();
        assert_eq!(record.trigger_phase, "migration");
        assert_eq!(record.backup_ids, vec![run.backups[0].id.clone()]);
        assert!(record.reason.contains("schema error"));
        assert_eq!(record.target_version.as_deref(), Some("2.3.9"));

        let ledger = VersionLedger::load(&fx.path("state"), "production").unwrap();
        assert_eq!(ledger.current.as_deref(), Some("2.3.9"));
    }

    #[tokio::test]
    async fn failed_gate_aborts_before_any_backup_or_phase() {
        let fx = Fixture::new();
        let infra = fx.path("infra-done");

        let config = fx.config(&format!(
            r#"
            [environments.production]

            [[environments.production.checks]]
            name = "disk"
            kind = "command"
            run = "true"

            [[environments.production.checks]]
            name = "ssl"
            kind = "command"
            advisory = true
            run = "false"

            [[environments.production.checks]]
            name = "dns"
            kind = "command"
            run = "false"

            [[environments.production.backups]]
            name = "database"
            dump = "printf data"
            restore = "true"

            [[environments.production.phases.cutover]]
            name = "switch"
            run = "touch {infra}"
        "#,
            infra = infra.display(),
        ));

        let plan = build_plan(&config, None);
        let orch = DeploymentOrchestrator::new(config, AbortFlag::new());
        let run = orch.execute(&plan, false).await.unwrap();

        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.exit_code(), 1);
        assert!(run.backups.is_empty());
        assert!(!infra.exists());
        assert!(run.rollback.is_none(), "nothing ran, nothing to roll back");
    }

    #[tokio::test]
    async fn failed_backup_never_lets_a_phase_start() {
        let fx = Fixture::new();
        let infra = fx.path("infra-done");

        let config = fx.config(&format!(
            r#"
            [environments.production]

            [[environments.production.backups]]
            name = "database"
            dump = "echo cannot reach database >&2; exit 1"
            restore = "true"

            [[environments.production.phases.cutover]]
            name = "switch"
            run = "touch {infra}"
        "#,
            infra = infra.display(),
        ));

        let plan = build_plan(&config, None);
        let orch = DeploymentOrchestrator::new(config, AbortFlag::new());
        let run = orch.execute(&plan, false).await.unwrap();

        assert_eq!(run.state, RunState::Failed);
        assert!(!infra.exists());
    }

    #[tokio::test]
    async fn force_skips_the_gate_and_proceeds() {
        let fx = Fixture::new();
        let deployed = fx.path("deployed-version");

        let config = fx.config(&format!(
            r#"
            [environments.production]

            [[environments.production.checks]]
            name = "dns"
            kind = "command"
            run = "false"

            [[environments.production.phases.cutover]]
            name = "switch"
            run = "touch {deployed}"
        "#,
            deployed = deployed.display(),
        ));

        let plan = build_plan(&config, None);
        let orch = DeploymentOrchestrator::new(config, AbortFlag::new());
        let run = orch.execute(&plan, true).await.unwrap();

        assert_eq!(run.state, RunState::Complete);
        assert!(deployed.exists());
        // The gate never ran, and the skip is on the record.
        assert!(run.validation.is_none());
        assert!(run.log.iter().any(|e| e.message.contains("skipped")));
    }

    #[tokio::test]
    async fn failing_smoke_test_names_the_check_in_the_rollback_reason() {
        let fx = Fixture::new();

        let config = fx.config(
            r#"
            [environments.production]

            [[environments.production.smoke_checks]]
            name = "api-alive"
            kind = "command"
            run = "echo api down >&2; exit 1"

            [[environments.production.phases.cutover]]
            name = "switch"
            run = "true"
        "#,
        );

        let plan = build_plan(&config, Some("2.3.9"));
        let orch = DeploymentOrchestrator::new(config, AbortFlag::new());
        let run = orch.execute(&plan, false).await.unwrap();

        assert_eq!(run.state, RunState::RolledBack);
        let record = run.rollback.as_ref().unwrap();
        assert_eq!(record.trigger_phase, "smoke-tests");
        assert!(record.reason.contains("api-alive"));
        assert!(record.reason.contains("api down"));
    }

    #[tokio::test]
    async fn concurrent_deploy_is_rejected_by_the_lease() {
        let fx = Fixture::new();
        let config = fx.config(
            r#"
            [environments.production]

            [[environments.production.phases.cutover]]
            name = "switch"
            run = "true"
        "#,
        );
        let state_dir = config.app.state_dir.clone();

        let _held = Lease::acquire(&state_dir, "production").unwrap();

        let plan = build_plan(&config, None);
        let orch = DeploymentOrchestrator::new(config, AbortFlag::new());
        let err = orch.execute(&plan, false).await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<DeployError>(),
            Some(DeployError::LeaseHeld { .. })
        ));
    }

    #[tokio::test]
    async fn failed_rollback_surfaces_as_rollback_failed() {
        let fx = Fixture::new();
        let config = fx.config(
            r#"
            [environments.production]

            [[environments.production.phases.cutover]]
            name = "switch"
            run = "false"

            [[environments.production.health]]
            name = "web"
            kind = "command"
            run = "false"
        "#,
        );

        let plan = build_plan(&config, Some("2.3.9"));
        let orch = DeploymentOrchestrator::new(config, AbortFlag::new());
        let run = orch.execute(&plan, false).await.unwrap();

        assert_eq!(run.state, RunState::RollbackFailed);
        assert_eq!(run.exit_code(), 2);
    }

    #[tokio::test]
    async fn operator_abort_takes_the_rollback_path() {
        let fx = Fixture::new();
        let data = fx.path("data.txt");
        fs::write(&data, "good").unwrap();

        let config = fx.config(&format!(
            r#"
            [environments.production]

            [[environments.production.backups]]
            name = "database"
            dump = "cat {data}"
            restore = "cp {{{{ artifact }}}} {data}"

            [[environments.production.phases.cutover]]
            name = "switch"
            run = "true"
        "#,
            data = data.display(),
        ));

        let abort = AbortFlag::new();
        abort.set();

        let plan = build_plan(&config, Some("2.3.9"));
        let orch = DeploymentOrchestrator::new(config, abort);
        let run = orch.execute(&plan, false).await.unwrap();

        assert_eq!(run.state, RunState::RolledBack);
        let record = run.rollback.as_ref().unwrap();
        assert!(record.reason.contains("operator abort"));
    }
}
