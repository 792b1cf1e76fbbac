//! Output module
//!
//! Handles the newline-delimited JSON files a harvest produces.
//!
//! # Overview
//!
//! Every run writes exactly one file, named after the source and the
//! run's start time. The file exists from the first moment of the run
//! with an `.INCOMPLETE` suffix and is renamed only when the run ends in
//! full success, so downstream readers can trust any file without the
//! suffix to be a complete harvest.

mod sink;

pub use sink::{output_uid, OutputSink, INCOMPLETE_SUFFIX, OUTPUT_EXTENSION};
