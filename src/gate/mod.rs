use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{CheckConfig, CheckKind, EnvironmentConfig};

pub mod checks;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Go,
    GoWithWarnings,
    NoGo,
}

/// Itemized result of one gate evaluation. Check names are unique within a
/// result (enforced at config load).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub checks: Vec<CheckOutcome>,
}

impl ValidationResult {
    /// Any FAIL is a NO-GO regardless of how many checks passed; WARN alone
    /// still goes, with advisories.
    pub fn verdict(&self) -> Verdict {
        let mut verdict = Verdict::Go;
        for check in &self.checks {
            match check.status {
                CheckStatus::Fail => return Verdict::NoGo,
                CheckStatus::Warn => verdict = Verdict::GoWithWarnings,
                CheckStatus::Pass => {}
            }
        }
        verdict
    }

    pub fn summary(&self) -> String {
        let mut pass = 0;
        let mut warn = 0;
        let mut fail = 0;
        for check in &self.checks {
            match check.status {
                CheckStatus::Pass => pass += 1,
                CheckStatus::Warn => warn += 1,
                CheckStatus::Fail => fail += 1,
            }
        }
        format!("{} passed, {} warned, {} failed", pass, warn, fail)
    }
}

pub struct ValidationGate {
    client: reqwest::Client,
    timeout: Duration,
}

impl ValidationGate {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    /// Run every check concurrently and merge once all have resolved.
    ///
    /// Checks share no mutable state, so order is irrelevant. Each check is
    /// isolated in its own task: a panic or error becomes a FAIL outcome for
    /// that check alone, never an error from the gate itself. Every task
    /// races the same global deadline, so one slow check turns into its own
    /// FAIL instead of silently vanishing from the report.
    pub async fn evaluate(&self, checks: &[CheckConfig]) -> ValidationResult {
        let budget = self.timeout;
        let tasks: Vec<_> = checks
            .iter()
            .cloned()
            .map(|check| {
                let client = self.client.clone();
                let name = check.name.clone();
                let mut handle = tokio::spawn(checks::run(check, client));
                async move {
                    match tokio::time::timeout(budget, &mut handle).await {
                        Ok(Ok(outcome)) => outcome,
                        Ok(Err(join_err)) => CheckOutcome {
                            name,
                            status: CheckStatus::Fail,
                            detail: format!("check crashed: {}", join_err),
                        },
                        Err(_) => {
                            // Cancel, don't detach: the check task (and any
                            // child process it spawned) must not keep running
                            // after it has been reported as failed.
                            handle.abort();
                            CheckOutcome {
                                name,
                                status: CheckStatus::Fail,
                                detail: format!("timed out after {}s", budget.as_secs()),
                            }
                        }
                    }
                }
            })
            .collect();

        ValidationResult {
            checks: join_all(tasks).await,
        }
    }
}

/// The environment's `required_env` list plus its configured checks, as one
/// battery for the pre-flight gate.
pub fn pre_flight_checks(env: &EnvironmentConfig) -> Vec<CheckConfig> {
    let mut battery = Vec::new();
    if !env.required_env.is_empty() {
        battery.push(CheckConfig {
            name: "required-env".to_string(),
            kind: CheckKind::Env,
            advisory: false,
            vars: env.required_env.clone(),
            path: None,
            min_free_mb: None,
            addr: None,
            url: None,
            run: None,
        });
    }
    battery.extend(env.checks.iter().cloned());
    battery
}
