use anyhow::Result;
use std::time::Duration;

use crate::config::CutoverConfig;
use crate::gate::{self, ValidationGate, Verdict};
use crate::output;

/// Run the pre-flight gate on its own, for use before a planned deploy or
/// from CI. Deploys nothing.
pub async fn run(config: CutoverConfig, environment: &str, strict: bool) -> Result<i32> {
    let env = config.environment(environment)?;

    output::header(&format!("Pre-flight validation for {}", environment));
    let gate = ValidationGate::new(Duration::from_secs(config.deploy.validation_timeout));
    let result = gate.evaluate(&gate::pre_flight_checks(env)).await;

    for check in &result.checks {
        output::check(&check.name, &check.status, &check.detail);
    }

    match result.verdict() {
        Verdict::NoGo => {
            output::error(&format!("NO-GO: {}", result.summary()));
            Ok(1)
        }
        Verdict::GoWithWarnings if strict => {
            output::error(&format!("NO-GO under --strict: {}", result.summary()));
            Ok(1)
        }
        Verdict::GoWithWarnings => {
            output::warning(&format!("GO with advisories: {}", result.summary()));
            Ok(0)
        }
        Verdict::Go => {
            output::success(&format!("GO: {}", result.summary()));
            Ok(0)
        }
    }
}
