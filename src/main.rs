//! motif - step-graph workflow runner
//!
//! Checks workflow documents and simulates scripted runs through them.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use colored::Colorize;
use config::Config;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "motif")]
#[command(about = "Check and simulate motif workflow documents")]
#[command(version)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, env = "MOTIF_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow document and describe its graph
    Check {
        /// Basic export (.json, .yaml or .yml)
        file: PathBuf,
    },

    /// Run a scripted scenario through a workflow
    Simulate {
        /// Scenario document (.json, .yaml or .yml)
        scenario: PathBuf,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over the configured filter
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_ansi(config.log.ansi)
        .with_writer(std::io::stderr)
        .init();

    if let Some(path) = &cli.config {
        tracing::info!("Loaded config from {}", path.display());
    }

    // steps with pending hooks are spawned onto this set
    let local = tokio::task::LocalSet::new();
    let result = local
        .run_until(async {
            match &cli.command {
                Commands::Check { file } => commands::check(file),
                Commands::Simulate { scenario } => commands::simulate(scenario, &config.simulate),
            }
        })
        .await;

    match result {
        Ok(output) => {
            println!("{}", output);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }
}
