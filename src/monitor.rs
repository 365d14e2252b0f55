use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::abort::AbortFlag;
use crate::probe::{HealthProbe, HealthStatus, ProbeTarget};
use crate::run::write_json_atomic;

/// Latency deviation from baseline, in percent.
const LATENCY_WARN_PCT: f64 = 10.0;
const LATENCY_CRITICAL_PCT: f64 = 25.0;

/// Error-rate increase over baseline, in absolute points (0.0 to 1.0).
const ERROR_RATE_WARN_PTS: f64 = 0.05;
const ERROR_RATE_CRITICAL_PTS: f64 = 0.20;

/// Trend mean uses only the most recent samples.
const TREND_SAMPLES: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Baseline {
    pub latency_ms: f64,
    pub error_rate: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalySeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub metric: String,
    pub severity: AnomalySeverity,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub target: String,
    pub samples: usize,
    pub mean_latency_ms: f64,
    pub error_rate: f64,
    pub anomalies: Vec<Anomaly>,
}

/// Post-cutover observation pass. Feeds operators and the final report;
/// never triggers rollback on its own. Automatic rollback is reserved for
/// phase failures during the active deployment.
pub struct MonitoringWindow<'a> {
    probe: &'a HealthProbe,
}

impl<'a> MonitoringWindow<'a> {
    pub fn new(probe: &'a HealthProbe) -> Self {
        Self { probe }
    }

    pub async fn observe(
        &self,
        target: &ProbeTarget,
        baseline: Option<&Baseline>,
        duration: Duration,
        interval: Duration,
        abort: &AbortFlag,
    ) -> AnomalyReport {
        let started = Instant::now();
        let mut recent: VecDeque<u64> = VecDeque::with_capacity(TREND_SAMPLES);
        let mut total = 0usize;
        let mut errors = 0usize;

        loop {
            let sample = self.probe.sample(target).await;
            total += 1;
            if sample.status != HealthStatus::Up {
                errors += 1;
            }
            if recent.len() == TREND_SAMPLES {
                recent.pop_front();
            }
            recent.push_back(sample.latency_ms);
            debug!(
                "Monitor sample {}: {:?} in {}ms",
                total, sample.status, sample.latency_ms
            );

            if started.elapsed() >= duration || abort.is_set() {
                break;
            }
            tokio::time::sleep(interval).await;
        }

        let mean_latency_ms = if recent.is_empty() {
            0.0
        } else {
            recent.iter().sum::<u64>() as f64 / recent.len() as f64
        };
        let error_rate = if total == 0 {
            0.0
        } else {
            errors as f64 / total as f64
        };

        AnomalyReport {
            target: target.name().to_string(),
            samples: total,
            mean_latency_ms,
            error_rate,
            anomalies: detect(baseline, mean_latency_ms, error_rate),
        }
    }
}

/// Compare window means against the stored baseline. No baseline means
/// nothing to deviate from; the first deploy seeds one instead.
pub fn detect(
    baseline: Option<&Baseline>,
    mean_latency_ms: f64,
    error_rate: f64,
) -> Vec<Anomaly> {
    let Some(baseline) = baseline else {
        return Vec::new();
    };
    let mut anomalies = Vec::new();

    if baseline.latency_ms > 0.0 {
        let deviation_pct =
            (mean_latency_ms - baseline.latency_ms).abs() / baseline.latency_ms * 100.0;
        let severity = if deviation_pct > LATENCY_CRITICAL_PCT {
            Some(AnomalySeverity::Critical)
        } else if deviation_pct > LATENCY_WARN_PCT {
            Some(AnomalySeverity::Warning)
        } else {
            None
        };
        if let Some(severity) = severity {
            anomalies.push(Anomaly {
                metric: "latency".to_string(),
                severity,
                detail: format!(
                    "mean {:.0}ms deviates {:.1}% from baseline {:.0}ms",
                    mean_latency_ms, deviation_pct, baseline.latency_ms
                ),
            });
        }
    }

    let increase = error_rate - baseline.error_rate;
    let severity = if increase > ERROR_RATE_CRITICAL_PTS {
        Some(AnomalySeverity::Critical)
    } else if increase > ERROR_RATE_WARN_PTS {
        Some(AnomalySeverity::Warning)
    } else {
        None
    };
    if let Some(severity) = severity {
        anomalies.push(Anomaly {
            metric: "error-rate".to_string(),
            severity,
            detail: format!(
                "error rate {:.1}% is up {:.1} points from baseline {:.1}%",
                error_rate * 100.0,
                increase * 100.0,
                baseline.error_rate * 100.0
            ),
        });
    }

    anomalies
}

pub fn load_baseline(state_dir: &Path, environment: &str) -> Result<Option<Baseline>> {
    let path = baseline_path(state_dir, environment);
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read baseline: {}", path.display()))?;
    let baseline = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse baseline: {}", path.display()))?;
    Ok(Some(baseline))
}

pub fn save_baseline(state_dir: &Path, environment: &str, baseline: &Baseline) -> Result<()> {
    write_json_atomic(&baseline_path(state_dir, environment), baseline)
}

fn baseline_path(state_dir: &Path, environment: &str) -> PathBuf {
    state_dir
        .join("baseline")
        .join(format!("{}.json", environment))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baseline(latency_ms: f64, error_rate: f64) -> Baseline {
        Baseline {
            latency_ms,
            error_rate,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn no_baseline_means_no_anomalies() {
        assert!(detect(None, 500.0, 0.5).is_empty());
    }

    #[test]
    fn latency_deviation_thresholds() {
        let base = baseline(100.0, 0.0);

        assert!(detect(Some(&base), 105.0, 0.0).is_empty());

        let warn = detect(Some(&base), 112.0, 0.0);
        assert_eq!(warn.len(), 1);
        assert_eq!(warn[0].severity, AnomalySeverity::Warning);
        assert_eq!(warn[0].metric, "latency");

        let critical = detect(Some(&base), 130.0, 0.0);
        assert_eq!(critical[0].severity, AnomalySeverity::Critical);

        // Deviation counts in both directions.
        let faster = detect(Some(&base), 80.0, 0.0);
        assert_eq!(faster[0].severity, AnomalySeverity::Warning);
    }

    #[test]
    fn error_rate_increase_thresholds() {
        let base = baseline(100.0, 0.01);

        assert!(detect(Some(&base), 100.0, 0.03).is_empty());

        let warn = detect(Some(&base), 100.0, 0.10);
        assert_eq!(warn.len(), 1);
        assert_eq!(warn[0].severity, AnomalySeverity::Warning);
        assert_eq!(warn[0].metric, "error-rate");

        let critical = detect(Some(&base), 100.0, 0.30);
        assert_eq!(critical[0].severity, AnomalySeverity::Critical);
    }

    #[tokio::test(start_paused = true)]
    async fn observes_for_the_full_window_at_fixed_interval() {
        let probe = HealthProbe::new();
        let target = ProbeTarget::Command {
            name: "web".into(),
            run: "true".into(),
        };

        let report = MonitoringWindow::new(&probe)
            .observe(
                &target,
                None,
                Duration::from_secs(30),
                Duration::from_secs(10),
                &AbortFlag::new(),
            )
            .await;

        // Samples at t = 0, 10, 20, 30.
        assert_eq!(report.samples, 4);
        assert_eq!(report.error_rate, 0.0);
        assert!(report.anomalies.is_empty());
    }

    #[test]
    fn baseline_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(load_baseline(tmp.path(), "production").unwrap().is_none());

        save_baseline(tmp.path(), "production", &baseline(42.0, 0.0)).unwrap();
        let loaded = load_baseline(tmp.path(), "production").unwrap().unwrap();
        assert_eq!(loaded.latency_ms, 42.0);
    }
}
