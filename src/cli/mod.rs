//! CLI module
//!
//! Command-line interface for harvesting a source list.
//!
//! # Commands
//!
//! - `harvest` - Harvest sources into newline-delimited JSON files
//! - `validate` - Check every source's format and options
//! - `formats` - List built-in formats

mod commands;
mod runner;

pub use commands::{Cli, Commands, OutputFormat};
pub use runner::{schedule, select, Runner};
