//! Source registry
//!
//! Maps the `format` of a source entry to a factory that builds its
//! pagination strategy. Every source of a source list is checked against
//! the registry before any harvest starts, so a typo in a format name or
//! an invalid option fails the whole run up front instead of one source
//! hours in.

mod builtin;
mod portals;

pub use builtin::{
    ArcgisOptions, CkanOptions, CswOptions, CswSchema, DataverseOptions, ElasticsearchOptions,
    GeonodeOptions, IndexOptions, MagdaOptions, OaiPmhOptions, ScrollOptions, SingleOptions,
    XmlLinesOptions,
};
pub use portals::{JunarOptions, KnoemaOptions, PortalOptions};

use crate::config::{SourceDefinition, SourcesFile};
use crate::error::{Error, Result};
use crate::pagination::PaginationStrategy;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;

/// Builds a strategy from the source's API URL and its format options
pub type StrategyFactory = fn(&str, &Value) -> Result<Box<dyn PaginationStrategy>>;

/// A registered format
#[derive(Debug, Clone, Copy)]
pub struct FormatInfo {
    pub name: &'static str,
    /// Continuation family the format is an instance of
    pub family: &'static str,
    pub description: &'static str,
    pub factory: StrategyFactory,
}

/// Format name to strategy factory
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    formats: BTreeMap<String, FormatInfo>,
}

impl SourceRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in format
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for info in builtin::FORMATS.iter().chain(portals::PORTAL_FORMATS) {
            registry.register(*info);
        }
        registry
    }

    /// Add or replace a format
    pub fn register(&mut self, info: FormatInfo) -> &mut Self {
        self.formats.insert(info.name.to_string(), info);
        self
    }

    /// Whether `format` is known
    pub fn contains(&self, format: &str) -> bool {
        self.formats.contains_key(format)
    }

    /// Registered formats, sorted by name
    pub fn formats(&self) -> impl Iterator<Item = &FormatInfo> {
        self.formats.values()
    }

    /// Build the strategy of a format
    pub fn create(
        &self,
        format: &str,
        api_url: &str,
        options: &Value,
    ) -> Result<Box<dyn PaginationStrategy>> {
        let info = self.formats.get(format).ok_or_else(|| Error::UnknownFormat {
            format: format.to_string(),
        })?;
        (info.factory)(api_url, options)
    }

    /// Build the strategy of a source entry
    pub fn create_for(&self, source: &SourceDefinition) -> Result<Box<dyn PaginationStrategy>> {
        self.create(&source.format, &source.api_url, &source.options)
    }

    /// Check every source's format and options
    ///
    /// Building a strategy does no I/O, so this is the same construction a
    /// harvest performs, minus the run.
    pub fn validate(&self, sources: &SourcesFile) -> Result<()> {
        for source in &sources.sources {
            self.create_for(source).map_err(|err| match err {
                Error::InvalidOptions { format, message } => Error::InvalidOptions {
                    format,
                    message: format!("source '{}': {message}", source.id),
                },
                other => other,
            })?;
        }
        Ok(())
    }
}

/// Deserialize format options, treating a missing block as all defaults
pub(crate) fn parse_options<T>(format: &str, options: &Value) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if options.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(options.clone())
        .map_err(|e| Error::invalid_options(format, e.to_string()))
}
