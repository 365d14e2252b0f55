mod abort;
mod backup;
mod cli;
mod config;
mod error;
mod gate;
mod lease;
mod monitor;
mod orchestrator;
mod output;
mod phase;
mod plan;
mod probe;
mod rollback;
mod run;
mod versions;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .without_time()
        .init();

    let config = config::CutoverConfig::load(&cli.config)?;

    let code = match cli.command {
        Command::Deploy {
            version,
            environment,
            blue_green,
            dry_run,
            force,
        } => cli::deploy::run(config, &environment, &version, blue_green, dry_run, force).await?,

        Command::Rollback {
            environment,
            emergency,
            version,
        } => cli::rollback::run(config, &environment, emergency, version.as_deref()).await?,

        Command::Validate {
            environment,
            strict,
        } => cli::validate::run(config, &environment, strict).await?,

        Command::Sweep { environment } => cli::sweep::run(config, &environment)?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
