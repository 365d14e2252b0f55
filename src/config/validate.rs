use anyhow::{bail, Result};
use std::collections::HashSet;

use super::{CheckConfig, CheckKind, CutoverConfig, ProbeKind};

pub fn validate(config: &CutoverConfig) -> Result<()> {
    if config.app.name.is_empty() {
        bail!("app.name cannot be empty");
    }

    if config.deploy.rollback_budget == 0 {
        bail!("deploy.rollback_budget cannot be zero");
    }

    if config.deploy.probe_interval == 0 || config.deploy.monitor_interval == 0 {
        bail!("probe and monitor intervals cannot be zero");
    }

    for (name, env) in &config.environments {
        let mut seen = HashSet::new();
        for check in env.checks.iter().chain(env.smoke_checks.iter()) {
            if !seen.insert(check.name.as_str()) {
                bail!(
                    "Environment '{}' has duplicate check name '{}'",
                    name,
                    check.name
                );
            }
            validate_check(name, check)?;
        }

        for target in &env.health {
            match target.kind {
                ProbeKind::Http if target.url.is_none() => {
                    bail!(
                        "Environment '{}' health target '{}' is http but has no url",
                        name,
                        target.name
                    );
                }
                ProbeKind::Command if target.run.is_none() => {
                    bail!(
                        "Environment '{}' health target '{}' is command but has no run",
                        name,
                        target.name
                    );
                }
                _ => {}
            }
        }

        for source in &env.backups {
            if source.dump.is_none() && source.path.is_none() {
                bail!(
                    "Environment '{}' backup source '{}' needs either a dump command or a path",
                    name,
                    source.name
                );
            }
            if source.dump.is_some() && source.restore.is_none() {
                bail!(
                    "Environment '{}' backup source '{}' has a dump command but no restore command",
                    name,
                    source.name
                );
            }
        }

        let phases = &env.phases;
        for (phase_name, steps) in [
            ("infrastructure", &phases.infrastructure),
            ("migration", &phases.migration),
            ("cutover", &phases.cutover),
            ("blue_green_cutover", &phases.blue_green_cutover),
            ("rollback", &phases.rollback),
        ] {
            for step in steps {
                if step.name.is_empty() || step.run.is_empty() {
                    bail!(
                        "Environment '{}' phase '{}' has a step with an empty name or command",
                        name,
                        phase_name
                    );
                }
                if step.timeout == Some(0) {
                    bail!(
                        "Environment '{}' phase '{}' step '{}' has a zero timeout",
                        name,
                        phase_name,
                        step.name
                    );
                }
            }
        }

        if phases.cutover.is_empty() {
            bail!("Environment '{}' has no cutover steps defined", name);
        }
    }

    Ok(())
}

fn validate_check(env: &str, check: &CheckConfig) -> Result<()> {
    let missing = match check.kind {
        CheckKind::Env if check.vars.is_empty() => Some("vars"),
        CheckKind::Disk if check.path.is_none() || check.min_free_mb.is_none() => {
            Some("path and min_free_mb")
        }
        CheckKind::Tcp if check.addr.is_none() => Some("addr"),
        CheckKind::Http if check.url.is_none() => Some("url"),
        CheckKind::Command if check.run.is_none() => Some("run"),
        _ => None,
    };

    if let Some(field) = missing {
        bail!(
            "Environment '{}' check '{}' is missing required field(s): {}",
            env,
            check.name,
            field
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(extra: &str) -> String {
        format!(
            r#"
            [app]
            name = "acme-api"

            [[environments.production.phases.cutover]]
            name = "switch"
            run = "switch.sh"
            {}
        "#,
            extra
        )
    }

    #[test]
    fn rejects_duplicate_check_names() {
        let toml = base_config(
            r#"
            [[environments.production.checks]]
            name = "disk"
            kind = "disk"
            path = "/"
            min_free_mb = 512

            [[environments.production.smoke_checks]]
            name = "disk"
            kind = "command"
            run = "true"
        "#,
        );
        let config: CutoverConfig = toml::from_str(&toml).unwrap();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("duplicate check name"));
    }

    #[test]
    fn rejects_dump_without_restore() {
        let toml = base_config(
            r#"
            [[environments.production.backups]]
            name = "database"
            dump = "pg_dump app"
        "#,
        );
        let config: CutoverConfig = toml::from_str(&toml).unwrap();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("no restore command"));
    }

    #[test]
    fn rejects_environment_without_cutover_steps() {
        let toml = r#"
            [app]
            name = "acme-api"

            [environments.production]
            required_env = ["DATABASE_URL"]
        "#;
        let config: CutoverConfig = toml::from_str(toml).unwrap();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("no cutover steps"));
    }

    #[test]
    fn accepts_complete_config() {
        let toml = base_config(
            r#"
            [[environments.production.checks]]
            name = "api-reachable"
            kind = "http"
            url = "https://api.internal/health"

            [[environments.production.health]]
            name = "web"
            kind = "http"
            url = "https://api.internal/health"
        "#,
        );
        let config: CutoverConfig = toml::from_str(&toml).unwrap();
        assert!(validate(&config).is_ok());
    }
}
