//! # Open-data Harvester
//!
//! Resilient harvesting of resource metadata from open-data portal APIs
//! into local newline-delimited JSON files.
//!
//! ## Features
//!
//! - **Protocol families**: offset/limit, opaque tokens, search-after,
//!   date-bounded windows, multi-endpoint, single-shot, URL indexes and
//!   streamed XML
//! - **Politeness**: per-run request spacing and a shared retry budget
//! - **Safe output**: files stay `.INCOMPLETE` unless the run fully succeeded
//! - **Guards**: record ceiling, repeated-page detection, zero-result failure
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use opendata_harvester::{HarvestConfig, Harvester, SourceRegistry};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> opendata_harvester::Result<()> {
//!     let config = HarvestConfig::new("data_gov", "https://catalog.data.gov/api", "out");
//!     let strategy = SourceRegistry::builtin().create(
//!         "ckan3",
//!         &config.api_url,
//!         &json!({"rows": 500}),
//!     )?;
//!
//!     let report = Harvester::new(config, strategy).run().await?;
//!     println!("{} records in {}", report.records, report.output_path.display());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Harvester run-loop                       │
//! │  create file → open session → pages → guards → flush → finalize │
//! └─────────────────────────────────────────────────────────────────┘
//!                                │
//! ┌────────────┬─────────────────┴─────┬──────────────┬─────────────┐
//! │  Registry  │      Pagination       │     HTTP     │   Output    │
//! ├────────────┼───────────────────────┼──────────────┼─────────────┤
//! │ ckan3      │ Offset     Token      │ Rate limit   │ JSONL sink  │
//! │ oai-pmh    │ SearchAfter Windowed  │ Retry budget │ .INCOMPLETE │
//! │ csw2 ...   │ Multi Single Index    │ Challenge    │ Ceiling     │
//! │            │ Streaming             │ Charset/XML  │             │
//! └────────────┴───────────────────────┴──────────────┴─────────────┘
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

// ============================================================================
// Module declarations
// ============================================================================

/// Error types
pub mod error;

/// Common types and type aliases
pub mod types;

/// Run configuration and the YAML source list
pub mod config;

/// HTTP client with retry and rate limiting
pub mod http;

/// Response decoding (charsets, XML, field paths)
pub mod decode;

/// Newline-delimited JSON output
pub mod output;

/// Pagination strategies
pub mod pagination;

/// Main run loop
pub mod harvester;

/// Format name to strategy mapping
pub mod registry;

/// Command-line interface
pub mod cli;

// ============================================================================
// Re-exports
// ============================================================================

pub use error::{Error, Result};
pub use types::*;

pub use config::{HarvestConfig, SourceDefinition, SourcesFile};
pub use harvester::{HarvestReport, Harvester, RunOutcome};
pub use pagination::PaginationStrategy;
pub use registry::SourceRegistry;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
