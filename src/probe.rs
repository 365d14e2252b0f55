use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::abort::AbortFlag;
use crate::config::{ProbeKind, ProbeTargetConfig};

/// HTTP requests get their own cap so one hung endpoint cannot eat the
/// whole polling budget in a single tick.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Up,
    Down,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSample {
    pub target: String,
    pub at: DateTime<Utc>,
    pub status: HealthStatus,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub enum ProbeTarget {
    Http { name: String, url: String },
    Command { name: String, run: String },
}

impl ProbeTarget {
    pub fn from_config(cfg: &ProbeTargetConfig) -> Result<Self> {
        match cfg.kind {
            ProbeKind::Http => {
                let url = cfg
                    .url
                    .clone()
                    .with_context(|| format!("Health target '{}' has no url", cfg.name))?;
                Ok(Self::Http {
                    name: cfg.name.clone(),
                    url,
                })
            }
            ProbeKind::Command => {
                let run = cfg
                    .run
                    .clone()
                    .with_context(|| format!("Health target '{}' has no run command", cfg.name))?;
                Ok(Self::Command {
                    name: cfg.name.clone(),
                    run,
                })
            }
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Http { name, .. } => name,
            Self::Command { name, .. } => name,
        }
    }
}

pub struct HealthProbe {
    client: reqwest::Client,
}

impl HealthProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Poll at a fixed interval until the target reports UP or the budget is
    /// spent, whichever comes first. Returns the final sample either way; the
    /// caller decides whether a non-UP result fails the phase.
    ///
    /// Fixed-interval polling keeps the worst case deterministic: at most
    /// `ceil(timeout / interval)` samples are ever taken.
    pub async fn wait_until_healthy(
        &self,
        target: &ProbeTarget,
        timeout: Duration,
        interval: Duration,
        abort: &AbortFlag,
    ) -> HealthSample {
        let started = Instant::now();
        let max_polls = timeout
            .as_millis()
            .div_ceil(interval.as_millis().max(1))
            .max(1);

        let mut attempt: u128 = 1;
        let mut sample = self.sample(target).await;

        while sample.status != HealthStatus::Up
            && attempt < max_polls
            && started.elapsed() < timeout
            && !abort.is_set()
        {
            debug!(
                "Health check '{}' attempt {}/{}: {:?}",
                target.name(),
                attempt,
                max_polls,
                sample.status
            );
            tokio::time::sleep(interval).await;
            attempt += 1;
            sample = self.sample(target).await;
        }

        sample
    }

    pub async fn sample(&self, target: &ProbeTarget) -> HealthSample {
        let tick = Instant::now();
        match target {
            ProbeTarget::Http { name, url } => {
                let response = self
                    .client
                    .get(url)
                    .timeout(REQUEST_TIMEOUT)
                    .send()
                    .await;
                let latency_ms = tick.elapsed().as_millis() as u64;

                match response {
                    Ok(resp) if resp.status().is_success() => {
                        let payload = resp.json::<serde_json::Value>().await.ok();
                        let status = match payload
                            .as_ref()
                            .and_then(|p| p.get("status"))
                            .and_then(|s| s.as_str())
                        {
                            Some("unhealthy") => HealthStatus::Down,
                            Some("degraded") => HealthStatus::Degraded,
                            _ => HealthStatus::Up,
                        };
                        make_sample(name, status, latency_ms, payload)
                    }
                    Ok(resp) => make_sample(
                        name,
                        HealthStatus::Down,
                        latency_ms,
                        Some(serde_json::json!({ "http_status": resp.status().as_u16() })),
                    ),
                    Err(e) => make_sample(
                        name,
                        HealthStatus::Down,
                        latency_ms,
                        Some(serde_json::json!({ "error": e.to_string() })),
                    ),
                }
            }
            ProbeTarget::Command { name, run } => {
                // The rollback budget can cancel a poll mid-sample; the
                // probe command must die with it.
                let output = tokio::process::Command::new("sh")
                    .arg("-c")
                    .arg(run)
                    .kill_on_drop(true)
                    .output()
                    .await;
                let latency_ms = tick.elapsed().as_millis() as u64;

                match output {
                    Ok(out) if out.status.success() => {
                        make_sample(name, HealthStatus::Up, latency_ms, None)
                    }
                    Ok(out) => {
                        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
                        let payload = (!stderr.is_empty())
                            .then(|| serde_json::json!({ "stderr": stderr }));
                        make_sample(name, HealthStatus::Down, latency_ms, payload)
                    }
                    Err(e) => make_sample(
                        name,
                        HealthStatus::Down,
                        latency_ms,
                        Some(serde_json::json!({ "error": e.to_string() })),
                    ),
                }
            }
        }
    }
}

impl Default for HealthProbe {
    fn default() -> Self {
        Self::new()
    }
}

fn make_sample(
    name: &str,
    status: HealthStatus,
    latency_ms: u64,
    payload: Option<serde_json::Value>,
) -> HealthSample {
    HealthSample {
        target: name.to_string(),
        at: Utc::now(),
        status,
        latency_ms,
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_target(run: &str) -> ProbeTarget {
        ProbeTarget::Command {
            name: "web".into(),
            run: run.into(),
        }
    }

    #[tokio::test]
    async fn healthy_target_returns_up_without_waiting() {
        let probe = HealthProbe::new();
        let sample = probe
            .wait_until_healthy(
                &command_target("true"),
                Duration::from_secs(60),
                Duration::from_secs(10),
                &AbortFlag::new(),
            )
            .await;
        assert_eq!(sample.status, HealthStatus::Up);
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_target_terminates_within_budget() {
        let probe = HealthProbe::new();
        let started = Instant::now();
        let sample = probe
            .wait_until_healthy(
                &command_target("false"),
                Duration::from_secs(10),
                Duration::from_secs(3),
                &AbortFlag::new(),
            )
            .await;

        // ceil(10 / 3) = 4 polls, three sleeps in between
        assert_eq!(sample.status, HealthStatus::Down);
        assert!(started.elapsed() <= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn returns_as_soon_as_target_becomes_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("polls");
        // Healthy on the fifth poll.
        let run = format!(
            "n=$(cat {c} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {c}; [ $n -ge 5 ]",
            c = counter.display()
        );

        let probe = HealthProbe::new();
        let started = Instant::now();
        let sample = probe
            .wait_until_healthy(
                &command_target(&run),
                Duration::from_secs(300),
                Duration::from_secs(30),
                &AbortFlag::new(),
            )
            .await;

        assert_eq!(sample.status, HealthStatus::Up);
        // Four sleeps of 30s, not the full 300s budget.
        assert!(started.elapsed() >= Duration::from_secs(120));
        assert!(started.elapsed() < Duration::from_secs(300));
    }

    #[tokio::test]
    async fn abort_stops_polling_early() {
        let probe = HealthProbe::new();
        let abort = AbortFlag::new();
        abort.set();
        let sample = probe
            .wait_until_healthy(
                &command_target("false"),
                Duration::from_secs(600),
                Duration::from_secs(1),
                &abort,
            )
            .await;
        assert_eq!(sample.status, HealthStatus::Down);
    }

    #[tokio::test]
    async fn down_http_target_reports_error_payload() {
        let probe = HealthProbe::new();
        let target = ProbeTarget::Http {
            name: "api".into(),
            url: "http://127.0.0.1:1/health".into(),
        };
        let sample = probe.sample(&target).await;
        assert_eq!(sample.status, HealthStatus::Down);
        assert!(sample.payload.is_some());
    }
}
