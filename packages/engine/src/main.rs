// packages/engine/src/main.rs
//! Netredir Engine
//!
//! Command-line driver for the redirection datapath: replays scripted hook
//! scenarios against a freshly built datapath and prints the resolved
//! configuration.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use netredir_engine::observability::{init_metrics, init_tracing};
use netredir_engine::replay::{self, Scenario};
use netredir_engine::{BuildInfo, Datapath, EngineConfig};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "netredir-engine")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/engine.* when present)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a YAML scenario of hook events and print a JSON report
    Replay {
        scenario: PathBuf,

        /// Pretty-print the report
        #[arg(long)]
        pretty: bool,
    },

    /// Print the resolved configuration as YAML
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load_from(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => EngineConfig::load().context("loading configuration")?,
    };

    init_tracing(&config.observability)?;
    init_metrics(config.observability.metrics_addr)?;

    let build = BuildInfo::current();
    info!(
        "Starting Netredir Engine v{} ({})",
        build.version, build.git_hash
    );

    match cli.command {
        Command::Replay { scenario, pretty } => {
            let scenario = Scenario::load(&scenario)
                .with_context(|| format!("reading scenario {}", scenario.display()))?;
            let datapath = Datapath::new(&config)?;
            let report = replay::run(&datapath, &scenario)?;
            println!("{}", report.to_json(pretty)?);
        }
        Command::ShowConfig => {
            print!("{}", serde_yaml::to_string(&config)?);
        }
    }

    Ok(())
}
