//! CLI commands and argument parsing

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// Open-data portal metadata harvester
#[derive(Parser, Debug)]
#[command(name = "opendata-harvester")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Source list (YAML)
    #[arg(short, long, global = true, default_value = "sources.yaml")]
    pub sources: PathBuf,

    /// Output format of the messages printed to stdout
    #[arg(short, long, global = true, default_value = "json")]
    pub format: OutputFormat,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Default log directive for the verbosity level
    pub fn log_directive(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Harvest sources into newline-delimited JSON files
    Harvest {
        /// Directory receiving the output files
        #[arg(short, long, default_value = "data/harvested")]
        output: PathBuf,

        /// Harvest only these source ids (repeatable)
        #[arg(long = "only", value_name = "ID")]
        only: Vec<String>,

        /// Hosts harvested concurrently
        #[arg(short, long, default_value_t = 4)]
        workers: usize,
    },

    /// Check the format and options of every source
    Validate,

    /// List built-in formats
    Formats,
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// One JSON object per line
    Json,
    /// Indented JSON
    Pretty,
}
