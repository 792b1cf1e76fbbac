//! Open-data harvester CLI
//!
//! Command-line interface for harvesting open-data portals

use anyhow::Context;
use clap::Parser;
use opendata_harvester::cli::{Cli, Runner};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG overrides -v
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_directive()));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let sources = cli.sources.clone();
    Runner::new(cli)
        .run()
        .await
        .with_context(|| format!("source list '{}'", sources.display()))
}
