use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::time::Duration;

use crate::config::{CutoverConfig, StepConfig};
use crate::probe::ProbeTarget;

/// Template context shared by step commands, rollback commands and restore
/// commands. Fields map 1:1 to the template variables.
#[derive(Debug, Clone)]
pub struct TemplateCtx {
    pub version: String,
    pub previous_version: Option<String>,
    pub environment: String,
    pub release: String,
}

impl TemplateCtx {
    pub fn render(&self, template: &str) -> Result<String> {
        let env = minijinja::Environment::new();
        env.render_str(
            template,
            minijinja::context! {
                version => self.version.as_str(),
                previous_version => self.previous_version.as_deref().unwrap_or(""),
                environment => self.environment.as_str(),
                release => self.release.as_str(),
            },
        )
        .with_context(|| format!("Failed to render command template: {}", template))
    }
}

#[derive(Debug, Clone)]
pub enum Step {
    Command {
        name: String,
        run: String,
        timeout: Duration,
    },
    WaitHealthy {
        name: String,
        target: ProbeTarget,
        timeout: Duration,
        interval: Duration,
    },
}

impl Step {
    pub fn name(&self) -> &str {
        match self {
            Self::Command { name, .. } => name,
            Self::WaitHealthy { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Phase {
    pub name: String,
    pub steps: Vec<Step>,
}

/// Immutable descriptor of one release rollout. Built once when the
/// deployment is initiated; the orchestrator never reorders or skips its
/// phases.
#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    pub environment: String,
    pub version: String,
    pub previous_version: Option<String>,
    pub release: String,
    pub blue_green: bool,
    pub phases: Vec<Phase>,
}

impl DeploymentPlan {
    pub fn build(
        config: &CutoverConfig,
        environment: &str,
        version: &str,
        previous_version: Option<String>,
        blue_green: bool,
    ) -> Result<Self> {
        let env = config.environment(environment)?;
        let release = Utc::now().format("%Y%m%d-%H%M%S").to_string();

        let ctx = TemplateCtx {
            version: version.to_string(),
            previous_version: previous_version.clone(),
            environment: environment.to_string(),
            release: release.clone(),
        };

        let cutover_steps = if blue_green {
            if env.phases.blue_green_cutover.is_empty() {
                bail!(
                    "Environment '{}' has no blue_green_cutover steps; \
                     run without --blue-green or configure them",
                    environment
                );
            }
            &env.phases.blue_green_cutover
        } else {
            &env.phases.cutover
        };

        let default_timeout = Duration::from_secs(config.deploy.step_timeout);
        let mut phases = Vec::new();

        for (name, steps) in [
            ("infrastructure", &env.phases.infrastructure),
            ("migration", &env.phases.migration),
        ] {
            if steps.is_empty() {
                continue;
            }
            phases.push(Phase {
                name: name.to_string(),
                steps: render_steps(steps, &ctx, default_timeout)?,
            });
        }

        // The cutover phase ends by waiting on every health target, so a
        // release that never comes up fails here and rolls back.
        let mut steps = render_steps(cutover_steps, &ctx, default_timeout)?;
        for target in &env.health {
            steps.push(Step::WaitHealthy {
                name: format!("wait for {}", target.name),
                target: ProbeTarget::from_config(target)?,
                timeout: Duration::from_secs(config.deploy.probe_timeout),
                interval: Duration::from_secs(config.deploy.probe_interval),
            });
        }
        phases.push(Phase {
            name: "cutover".to_string(),
            steps,
        });

        Ok(Self {
            environment: environment.to_string(),
            version: version.to_string(),
            previous_version,
            release,
            blue_green,
            phases,
        })
    }
}

fn render_steps(
    steps: &[StepConfig],
    ctx: &TemplateCtx,
    default_timeout: Duration,
) -> Result<Vec<Step>> {
    steps
        .iter()
        .map(|step| {
            Ok(Step::Command {
                name: step.name.clone(),
                run: ctx.render(&step.run)?,
                timeout: step
                    .timeout
                    .map(Duration::from_secs)
                    .unwrap_or(default_timeout),
            })
        })
        .collect()
}
