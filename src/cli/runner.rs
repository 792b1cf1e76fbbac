//! CLI runner - executes commands

use crate::cli::commands::{Cli, Commands, OutputFormat};
use crate::config::{SourceDefinition, SourcesFile};
use crate::error::{Error, Result};
use crate::harvester::{HarvestReport, Harvester, RunOutcome};
use crate::registry::SourceRegistry;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

/// CLI runner
pub struct Runner {
    cli: Cli,
    registry: SourceRegistry,
}

impl Runner {
    /// Create a runner with the built-in formats
    pub fn new(cli: Cli) -> Self {
        Self {
            cli,
            registry: SourceRegistry::builtin(),
        }
    }

    /// Run the CLI command
    pub async fn run(&self) -> Result<()> {
        match &self.cli.command {
            Commands::Harvest {
                output,
                only,
                workers,
            } => self.harvest(output, only, *workers).await,
            Commands::Validate => self.validate(),
            Commands::Formats => {
                self.formats();
                Ok(())
            }
        }
    }

    fn load_sources(&self) -> Result<SourcesFile> {
        SourcesFile::from_path(&self.cli.sources)
    }

    fn validate(&self) -> Result<()> {
        let sources = self.load_sources()?;
        self.registry.validate(&sources)?;

        self.output_message(&json!({
            "type": "LOG",
            "log": {
                "level": "INFO",
                "message": format!(
                    "{} sources in '{}' are valid",
                    sources.sources.len(),
                    self.cli.sources.display()
                )
            }
        }));
        Ok(())
    }

    fn formats(&self) {
        for info in self.registry.formats() {
            self.output_message(&json!({
                "name": info.name,
                "family": info.family,
                "description": info.description,
            }));
        }
    }

    async fn harvest(&self, output: &Path, only: &[String], workers: usize) -> Result<()> {
        let sources = self.load_sources()?;
        self.registry.validate(&sources)?;
        let selected = select(&sources, only)?;
        let groups = schedule(selected);
        info!(
            sources = groups.iter().map(Vec::len).sum::<usize>(),
            hosts = groups.len(),
            workers,
            "Starting harvest"
        );

        let cancel = CancellationToken::new();
        let interrupt = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, stopping harvesters");
                    cancel.cancel();
                }
            })
        };

        let reports: Vec<HarvestReport> = stream::iter(groups)
            .map(|group| self.run_group(group, &sources, output, cancel.clone()))
            .buffer_unordered(workers.max(1))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flatten()
            .collect();
        interrupt.abort();

        for report in &reports {
            self.output_message(&report_message(report));
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let incomplete = reports.iter().filter(|r| !r.is_complete()).count();
        if incomplete > 0 {
            return Err(Error::Other(format!(
                "{incomplete} of {} sources did not complete",
                reports.len()
            )));
        }
        Ok(())
    }

    /// Harvest one host's sources one after the other
    async fn run_group(
        &self,
        group: Vec<&SourceDefinition>,
        sources: &SourcesFile,
        output: &Path,
        cancel: CancellationToken,
    ) -> Vec<HarvestReport> {
        let mut reports = Vec::with_capacity(group.len());
        for source in group {
            if cancel.is_cancelled() {
                break;
            }
            match self.harvest_source(source, sources, output, cancel.clone()).await {
                Ok(report) => reports.push(report),
                Err(Error::Cancelled) => break,
                Err(err) => {
                    error!(source = %source.id, error = %err, "Could not start harvester");
                }
            }
        }
        reports
    }

    async fn harvest_source(
        &self,
        source: &SourceDefinition,
        sources: &SourcesFile,
        output: &Path,
        cancel: CancellationToken,
    ) -> Result<HarvestReport> {
        let config = sources.to_harvest_config(source, output)?;
        config.validate()?;
        let strategy = self.registry.create_for(source)?;
        Harvester::new(config, strategy)
            .run_until_cancelled(cancel)
            .await
    }

    /// Print a message to stdout
    fn output_message(&self, msg: &Value) {
        match self.cli.format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string(msg).unwrap_or_default());
            }
            OutputFormat::Pretty => {
                println!("{}", serde_json::to_string_pretty(msg).unwrap_or_default());
            }
        }
    }
}

fn report_message(report: &HarvestReport) -> Value {
    let (outcome, error) = match &report.outcome {
        RunOutcome::Completed => ("COMPLETED", None),
        RunOutcome::SoftFailed => ("SOFT_FAILED", None),
        RunOutcome::Failed(err) => ("FAILED", Some(err.to_string())),
    };
    json!({
        "type": "REPORT",
        "report": {
            "source": report.source_id,
            "outcome": outcome,
            "error": error,
            "records": report.records,
            "pages": report.pages,
            "path": report.output_path.display().to_string(),
            "elapsed_secs": report.elapsed.as_secs_f64(),
        }
    })
}

/// Pick the sources named in `only`, or all of them
pub fn select<'a>(sources: &'a SourcesFile, only: &[String]) -> Result<Vec<&'a SourceDefinition>> {
    if only.is_empty() {
        return Ok(sources.sources.iter().collect());
    }
    only.iter()
        .map(|id| {
            sources
                .get(id)
                .ok_or_else(|| Error::config(format!("unknown source '{id}'")))
        })
        .collect()
}

/// Group sources by API host, biggest sources first
///
/// Groups are ordered by their biggest source; inside a group sources keep
/// descending `count` order.
pub fn schedule(mut sources: Vec<&SourceDefinition>) -> Vec<Vec<&SourceDefinition>> {
    sources.sort_by(|a, b| b.count.cmp(&a.count));

    let mut groups: Vec<(String, Vec<&SourceDefinition>)> = Vec::new();
    for source in sources {
        let host = host_of(&source.api_url);
        match groups.iter_mut().find(|(h, _)| *h == host) {
            Some((_, group)) => group.push(source),
            None => groups.push((host, vec![source])),
        }
    }
    groups.into_iter().map(|(_, group)| group).collect()
}

fn host_of(api_url: &str) -> String {
    Url::parse(api_url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| api_url.to_string())
}
