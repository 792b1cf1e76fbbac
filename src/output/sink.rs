//! Newline-delimited JSON output sink
//!
//! Records are buffered in memory and appended to `{uid}.jsonl.INCOMPLETE`
//! in batches. Only a fully successful run renames the file to
//! `{uid}.jsonl`; any other ending leaves the suffix as a partial marker.

use crate::error::{Error, Result};
use crate::types::Record;
use chrono::{DateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Suffix of an output file that is still being written or was abandoned
pub const INCOMPLETE_SUFFIX: &str = ".INCOMPLETE";

/// Output file extension
pub const OUTPUT_EXTENSION: &str = "jsonl";

/// Build the unique output name of a run
///
/// `{id}_{UTC timestamp}Z` with every `:` replaced by `-`, so the name is
/// valid on every filesystem.
pub fn output_uid(id: &str, started: DateTime<Utc>) -> String {
    format!("{id}_{}Z", started.format("%Y-%m-%dT%H:%M:%S")).replace(':', "-")
}

/// Buffered writer for one run's output file
#[derive(Debug)]
pub struct OutputSink {
    incomplete_path: PathBuf,
    final_path: PathBuf,
    buffer: Vec<Record>,
    flush_threshold: usize,
    max_size: usize,
    total: usize,
    finalized: bool,
}

impl OutputSink {
    /// Create the empty `.INCOMPLETE` file, and the directory if needed
    pub fn create(
        dir: impl AsRef<Path>,
        uid: &str,
        flush_threshold: usize,
        max_size: usize,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let final_path = dir.join(format!("{uid}.{OUTPUT_EXTENSION}"));
        let incomplete_path = dir.join(format!("{uid}.{OUTPUT_EXTENSION}{INCOMPLETE_SUFFIX}"));
        File::create(&incomplete_path)?;
        debug!(path = %incomplete_path.display(), "Created output file");

        Ok(Self {
            incomplete_path,
            final_path,
            buffer: Vec::new(),
            flush_threshold: flush_threshold.max(1),
            max_size,
            total: 0,
            finalized: false,
        })
    }

    /// Append records to the buffer
    pub fn add(&mut self, records: impl IntoIterator<Item = Record>) {
        self.buffer.extend(records);
    }

    /// Number of buffered, not yet written records
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Number of records written so far
    pub fn total(&self) -> usize {
        self.total
    }

    /// Path of the file as it currently exists on disk
    pub fn path(&self) -> &Path {
        if self.finalized {
            &self.final_path
        } else {
            &self.incomplete_path
        }
    }

    /// Flush once the buffer has reached the threshold
    ///
    /// Returns the number of records written.
    pub fn flush_if_needed(&mut self) -> Result<usize> {
        if self.buffer.len() >= self.flush_threshold {
            self.flush()
        } else {
            Ok(0)
        }
    }

    /// Write the buffer to disk
    ///
    /// A batch that would take the total past the ceiling is discarded and
    /// reported as [`Error::TooMuchData`].
    pub fn flush(&mut self) -> Result<usize> {
        if self.buffer.is_empty() {
            return Ok(0);
        }

        let count = self.buffer.len();
        if self.total + count > self.max_size {
            self.buffer.clear();
            return Err(Error::too_much_data(format!(
                "{} records exceed the limit of {}",
                self.total + count,
                self.max_size
            )));
        }

        // the buffer is kept until the batch is on disk
        let mut batch = Vec::new();
        for record in &self.buffer {
            serde_json::to_writer(&mut batch, record)?;
            batch.push(b'\n');
        }
        let mut file = OpenOptions::new().append(true).open(&self.incomplete_path)?;
        file.write_all(&batch)?;
        file.flush()?;

        self.buffer.clear();
        self.total += count;
        info!(written = count, total = self.total, "Flushed records");
        Ok(count)
    }

    /// Flush the remainder and, on success, drop the `.INCOMPLETE` suffix
    ///
    /// Returns the final location of the file.
    pub fn finalize(&mut self, success: bool) -> Result<PathBuf> {
        self.flush()?;
        if success && !self.finalized {
            fs::rename(&self.incomplete_path, &self.final_path)?;
            self.finalized = true;
            info!(path = %self.final_path.display(), records = self.total, "Output finalized");
        }
        Ok(self.path().to_path_buf())
    }
}
