use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::abort::AbortFlag;
use crate::output;
use crate::plan::{Phase, Step};
use crate::probe::{HealthProbe, HealthStatus};

#[derive(Debug, Clone)]
pub struct StepFailure {
    pub step: String,
    pub reason: String,
}

/// Result of one phase. A failed step stops the phase immediately; its
/// diagnostic rides along for the rollback record and the final report.
#[derive(Debug)]
pub struct PhaseOutcome {
    pub phase: String,
    pub failure: Option<StepFailure>,
    pub duration: Duration,
}

impl PhaseOutcome {
    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }
}

/// Dumb sequencer: runs steps strictly in order with per-step timeouts and
/// structured logging, no branching of its own. Steps are idempotent by
/// contract, so re-running a phase after a transient failure is safe.
pub struct PhaseRunner<'a> {
    probe: &'a HealthProbe,
    abort: &'a AbortFlag,
}

impl<'a> PhaseRunner<'a> {
    pub fn new(probe: &'a HealthProbe, abort: &'a AbortFlag) -> Self {
        Self { probe, abort }
    }

    pub async fn run(&self, phase: &Phase) -> PhaseOutcome {
        let started = Instant::now();
        let total = phase.steps.len();
        info!("Running phase '{}' ({} steps)", phase.name, total);

        for (index, step) in phase.steps.iter().enumerate() {
            if self.abort.is_set() {
                return self.fail(phase, started, step.name(), "operator abort".to_string());
            }

            output::step(index + 1, total, step.name());

            let result = match step {
                Step::Command { run, timeout, .. } => {
                    debug!("Executing: {}", run);
                    run_command(run, *timeout).await
                }
                Step::WaitHealthy {
                    target,
                    timeout,
                    interval,
                    ..
                } => {
                    let spinner =
                        output::create_spinner(&format!("Waiting for {} ...", target.name()));
                    let sample = self
                        .probe
                        .wait_until_healthy(target, *timeout, *interval, self.abort)
                        .await;
                    spinner.finish_and_clear();

                    if sample.status == HealthStatus::Up {
                        Ok(())
                    } else {
                        Err(format!(
                            "health check '{}' did not pass within {}s (last status: {:?})",
                            target.name(),
                            timeout.as_secs(),
                            sample.status
                        ))
                    }
                }
            };

            match result {
                Ok(()) => output::success(step.name()),
                Err(reason) => {
                    output::error(&format!("{}: {}", step.name(), reason));
                    return self.fail(phase, started, step.name(), reason);
                }
            }
        }

        PhaseOutcome {
            phase: phase.name.clone(),
            failure: None,
            duration: started.elapsed(),
        }
    }

    fn fail(
        &self,
        phase: &Phase,
        started: Instant,
        step: &str,
        reason: String,
    ) -> PhaseOutcome {
        info!("Phase '{}' failed at step '{}': {}", phase.name, step, reason);
        PhaseOutcome {
            phase: phase.name.clone(),
            failure: Some(StepFailure {
                step: step.to_string(),
                reason,
            }),
            duration: started.elapsed(),
        }
    }
}

/// Run a step command under its timeout. Used by both the phase runner and
/// the rollback controller so the two paths fail the same way.
///
/// `kill_on_drop` so a step that overruns its timeout is killed, not
/// orphaned: a hung migration must never keep writing while the rollback
/// restores the backup underneath it.
pub(crate) async fn run_command(run: &str, timeout: Duration) -> Result<(), String> {
    let command = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(run)
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, command).await {
        Err(_) => Err(format!("timed out after {}s", timeout.as_secs())),
        Ok(Err(e)) => Err(format!("failed to spawn: {}", e)),
        Ok(Ok(out)) if out.status.success() => Ok(()),
        Ok(Ok(out)) => {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            if stderr.is_empty() {
                Err(format!("exited with {}", out.status))
            } else {
                Err(tail(&stderr, 400))
            }
        }
    }
}

fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let start = text.len() - max;
    // Stay on a char boundary.
    let start = (start..text.len())
        .find(|i| text.is_char_boundary(*i))
        .unwrap_or(start);
    format!("...{}", &text[start..])
}
