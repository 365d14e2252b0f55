use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod deploy;
pub mod rollback;
pub mod sweep;
pub mod validate;

#[derive(Parser)]
#[command(name = "cutover", version, about = "Deploy releases with verified backups and automatic rollback")]
pub struct Cli {
    /// Path to cutover.toml
    #[arg(short, long, default_value = "cutover.toml")]
    pub config: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Deploy a version to an environment
    Deploy {
        /// Version to deploy (e.g. 2.4.0)
        version: String,
        /// Target environment
        #[arg(short, long)]
        environment: String,
        /// Use the blue_green_cutover step list instead of cutover
        #[arg(long)]
        blue_green: bool,
        /// Print the resolved plan and run the pre-flight gate, change nothing
        #[arg(long)]
        dry_run: bool,
        /// Skip the pre-flight validation gate
        #[arg(long)]
        force: bool,
    },

    /// Roll an environment back to its previous version
    Rollback {
        /// Target environment
        #[arg(short, long)]
        environment: String,
        /// Take over the environment lease even if another run holds it
        #[arg(long)]
        emergency: bool,
        /// Version to roll back to (defaults to the ledger's previous)
        #[arg(long)]
        version: Option<String>,
    },

    /// Run the pre-flight validation gate and report, deploy nothing
    Validate {
        /// Target environment
        #[arg(short, long)]
        environment: String,
        /// Treat warnings as failures
        #[arg(long)]
        strict: bool,
    },

    /// Apply the backup retention policy and delete expired artifacts
    Sweep {
        /// Target environment
        #[arg(short, long)]
        environment: String,
    },
}
