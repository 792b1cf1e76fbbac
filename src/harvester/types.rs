//! Harvester types
//!
//! Run states and the report a finished run hands back.

use crate::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Where a run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Creating the output file and opening the session
    Starting,
    /// Waiting for the next page
    Fetching,
    /// Buffering a page and flushing when the threshold is reached
    Flushing,
    /// Writing the remainder and naming the file
    Finalizing,
    /// Tearing down after an external interrupt
    Cancelling,
    /// Keeping what was harvested after a fatal error
    Failing,
    /// Finished
    Done,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Fetching => "fetching",
            Self::Flushing => "flushing",
            Self::Finalizing => "finalizing",
            Self::Cancelling => "cancelling",
            Self::Failing => "failing",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// How a run ended
#[derive(Debug)]
pub enum RunOutcome {
    /// Every page was harvested; the output file is final
    Completed,
    /// Iteration finished but part of the harvest failed along the way
    SoftFailed,
    /// The run stopped on an error
    Failed(Error),
}

impl RunOutcome {
    /// True only for a complete harvest
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// The error that ended the run, if any
    pub fn error(&self) -> Option<&Error> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Summary of one run
#[derive(Debug)]
pub struct HarvestReport {
    /// Source identifier
    pub source_id: String,
    /// Output file as left on disk
    pub output_path: PathBuf,
    /// Records written
    pub records: usize,
    /// Pages received
    pub pages: usize,
    /// How the run ended
    pub outcome: RunOutcome,
    /// Wall-clock duration of the run
    pub elapsed: Duration,
}

impl HarvestReport {
    pub(crate) fn new(source_id: impl Into<String>, output_path: PathBuf) -> Self {
        Self {
            source_id: source_id.into(),
            output_path,
            records: 0,
            pages: 0,
            outcome: RunOutcome::Completed,
            elapsed: Duration::ZERO,
        }
    }

    /// True when the output file is final
    pub fn is_complete(&self) -> bool {
        self.outcome.is_success()
    }
}
