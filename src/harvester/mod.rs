//! Harvester module
//!
//! Main run loop of one harvest.
//!
//! # Overview
//!
//! A [`Harvester`] owns one source's configuration and strategy. Running it:
//! - creates the `.INCOMPLETE` output file before any network I/O
//! - opens a session that lives exactly as long as the run
//! - pulls pages from the strategy, refilling the retry budget after each
//! - rejects a page whose first record repeats the previous page's
//! - flushes to disk in batches and enforces the record ceiling
//! - names the file final only after a complete, non-empty harvest
//!
//! Failures end the run with a report rather than an error. Cancellation
//! is the exception: it tears the session down and is returned as
//! [`Error::Cancelled`].

mod types;

pub use types::{HarvestReport, RunOutcome, RunState};

use crate::config::HarvestConfig;
use crate::error::{Error, Result};
use crate::http::{ChallengeSolver, HttpClient, RetryBudget};
use crate::output::{output_uid, OutputSink, INCOMPLETE_SUFFIX, OUTPUT_EXTENSION};
use crate::pagination::{PageContext, PaginationStrategy, RunFlags};
use crate::types::Record;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Runs one source from first request to final file
pub struct Harvester {
    config: HarvestConfig,
    strategy: Box<dyn PaginationStrategy>,
    solver: Option<Arc<dyn ChallengeSolver>>,
}

impl Harvester {
    /// Create a harvester for a source
    pub fn new(config: HarvestConfig, strategy: Box<dyn PaginationStrategy>) -> Self {
        Self {
            config,
            strategy,
            solver: None,
        }
    }

    /// Provide the solver used when the source opted into challenge bypass
    #[must_use]
    pub fn with_challenge_solver(mut self, solver: Arc<dyn ChallengeSolver>) -> Self {
        self.solver = Some(solver);
        self
    }

    /// Source configuration
    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    /// Run until the strategy is exhausted or the run fails
    pub async fn run(self) -> Result<HarvestReport> {
        self.run_until_cancelled(CancellationToken::new()).await
    }

    /// Run, tearing down as soon as `cancel` fires
    ///
    /// Returns `Err` only for [`Error::Cancelled`]; every other failure is
    /// described by the report's outcome.
    pub async fn run_until_cancelled(self, cancel: CancellationToken) -> Result<HarvestReport> {
        let span = info_span!("harvester", source = %self.config.id);
        self.execute(cancel).instrument(span).await
    }

    async fn execute(mut self, cancel: CancellationToken) -> Result<HarvestReport> {
        let clock = Instant::now();
        let uid = output_uid(&self.config.id, Utc::now());
        let mut report = HarvestReport::new(
            &self.config.id,
            self.config
                .output_dir
                .join(format!("{uid}.{OUTPUT_EXTENSION}{INCOMPLETE_SUFFIX}")),
        );
        debug!(state = %RunState::Starting, "Run state");

        let mut sink = match OutputSink::create(
            &self.config.output_dir,
            &uid,
            self.config.cache_size,
            self.config.max_size,
        ) {
            Ok(sink) => sink,
            Err(err) => {
                error!(error = %err, "Could not create the output file");
                report.outcome = RunOutcome::Failed(err);
                report.elapsed = clock.elapsed();
                return Ok(report);
            }
        };

        let client = match HttpClient::connect(&self.config, self.solver.take()) {
            Ok(client) => client,
            Err(err) => {
                abandon(&mut sink, err, &mut report);
                report.elapsed = clock.elapsed();
                return Ok(report);
            }
        };

        let mut run = RunLoop::new(&self.config, client, sink);
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = run.drive(self.strategy.as_mut()) => result,
        };
        report.pages = run.pages;

        match result {
            Ok(()) => run.complete(&mut report),
            Err(Error::Cancelled) => {
                run.transition(RunState::Cancelling);
                drop(run);
                error!("The Harvester was stopped by cancellation");
                tokio::time::sleep(self.config.cancel_grace).await;
                return Err(Error::Cancelled);
            }
            Err(err) => {
                run.transition(RunState::Failing);
                abandon(&mut run.sink, err, &mut report);
            }
        }

        report.elapsed = clock.elapsed();
        Ok(report)
    }
}

impl std::fmt::Debug for Harvester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harvester")
            .field("config", &self.config)
            .field("strategy", &self.strategy.name())
            .finish_non_exhaustive()
    }
}

/// State of one run while the session is open
struct RunLoop<'a> {
    config: &'a HarvestConfig,
    client: HttpClient,
    sink: OutputSink,
    budget: RetryBudget,
    flags: RunFlags,
    pages: usize,
    state: RunState,
}

impl<'a> RunLoop<'a> {
    fn new(config: &'a HarvestConfig, client: HttpClient, sink: OutputSink) -> Self {
        let budget = client.budget();
        Self {
            config,
            client,
            sink,
            budget,
            flags: RunFlags::default(),
            pages: 0,
            state: RunState::Starting,
        }
    }

    fn transition(&mut self, next: RunState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "Run state");
            self.state = next;
        }
    }

    /// Pull pages until the strategy is exhausted
    async fn drive(&mut self, strategy: &mut dyn PaginationStrategy) -> Result<()> {
        let single = self.config.is_single_request || strategy.is_single_request();
        let mut previous_first: Option<Record> = None;

        loop {
            self.transition(RunState::Fetching);
            let mut ctx = PageContext::new(&self.client, &mut self.budget, &mut self.flags);
            let Some(page) = strategy.next_page(&mut ctx).await? else {
                break;
            };
            self.pages += 1;

            if !single {
                if let Some(first) = page.first() {
                    if !self.config.allow_repeating_data && previous_first.as_ref() == Some(first) {
                        return Err(Error::unexpected("New data equals previous"));
                    }
                    previous_first = Some(first.clone());
                }
            }
            self.budget.reset();

            self.transition(RunState::Flushing);
            self.sink.add(page);
            self.sink.flush_if_needed()?;
        }

        let total = self.sink.total() + self.sink.buffered();
        if total == 0 {
            return Err(Error::NoResults);
        }
        info!(total, pages = self.pages, "Harvesting finished, {} items downloaded", total);
        Ok(())
    }

    /// Write the remainder and name the file after natural exhaustion
    fn complete(&mut self, report: &mut HarvestReport) {
        self.transition(RunState::Finalizing);
        let success = !self.flags.has_failed;
        match self.sink.finalize(success) {
            Ok(path) => {
                report.output_path = path;
                report.records = self.sink.total();
                report.outcome = if success {
                    RunOutcome::Completed
                } else {
                    warn!("Part of the harvest failed, output kept as incomplete");
                    RunOutcome::SoftFailed
                };
            }
            Err(err) => abandon(&mut self.sink, err, report),
        }
        self.transition(RunState::Done);
    }
}

/// Keep what was harvested and record the failure
fn abandon(sink: &mut OutputSink, err: Error, report: &mut HarvestReport) {
    error!(error = %err, "The Harvester has stopped with the following exception");
    report.output_path = match sink.finalize(false) {
        Ok(path) => path,
        Err(flush_err) => {
            warn!(error = %flush_err, "Could not write the remaining records");
            PathBuf::from(sink.path())
        }
    };
    report.records = sink.total();
    report.outcome = RunOutcome::Failed(err);
}

#[cfg(test)]
mod tests;
