//! Configuration types for harvest runs
//!
//! This module contains the immutable per-run [`HarvestConfig`] and the
//! YAML source list it is usually built from.
//!
//! # Example
//!
//! ```yaml
//! defaults:
//!   download_delay: 1
//!   retry_delays: [5, 30, 120]
//!
//! sources:
//!   - id: data_gov
//!     format: ckan3
//!     api_url: https://catalog.data.gov/api
//!     count: 300000
//!     options:
//!       rows: 1000
//! ```

use crate::error::{Error, Result};
use crate::types::{JsonValue, StringMap};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

const DEFAULT_DOWNLOAD_DELAY: f64 = 1.0;
const DEFAULT_RETRY_DELAYS: [f64; 3] = [5.0, 30.0, 120.0];
const DEFAULT_CACHE_SIZE: usize = 1000;
const DEFAULT_MAX_SIZE: usize = 50_000_000;
const DEFAULT_TOTAL_TIMEOUT: f64 = 300.0;
const DEFAULT_CONNECT_TIMEOUT: f64 = 120.0;
const DEFAULT_READ_TIMEOUT: f64 = 120.0;
const DEFAULT_CANCEL_GRACE: f64 = 5.0;

// ============================================================================
// Harvest Config
// ============================================================================

/// Per-phase request timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Whole request, from connect to the last body byte
    pub total: Duration,
    /// Establishing the connection (socket connect included)
    pub connect: Duration,
    /// Idle time between two reads
    pub read: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            total: Duration::from_secs_f64(DEFAULT_TOTAL_TIMEOUT),
            connect: Duration::from_secs_f64(DEFAULT_CONNECT_TIMEOUT),
            read: Duration::from_secs_f64(DEFAULT_READ_TIMEOUT),
        }
    }
}

/// Settings for one harvest run
///
/// Built once per source and never mutated while the run is in progress.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// Source identifier, also the output file prefix
    pub id: String,
    /// Base API URL
    pub api_url: String,
    /// Directory the `.jsonl` output is written to
    pub output_dir: PathBuf,
    /// Minimum spacing between two requests
    pub download_delay: Duration,
    /// Backoff schedule, consumed front to back
    pub retry_delays: Vec<Duration>,
    /// Number of buffered records that triggers a flush
    pub cache_size: usize,
    /// Request timeouts
    pub timeouts: Timeouts,
    /// Ceiling for harvested records and for single response bodies in bytes
    pub max_size: usize,
    /// Extra PEM trust anchor
    pub certfile: Option<PathBuf>,
    /// Fixed response encoding label, overrides the Content-Type charset
    pub encoding: Option<String>,
    /// Pattern replaced in XML bodies before parsing
    pub invalid_xml_regex: Option<String>,
    /// Fixed user agent
    pub user_agent: Option<String>,
    /// Headers sent with every request
    pub additional_headers: StringMap,
    /// Skip the repeated-page guard
    pub is_single_request: bool,
    /// Accept consecutive pages with the same first record
    pub allow_repeating_data: bool,
    /// Enable the challenge-bypass hook on 503 responses
    pub challenge_bypass: bool,
    /// Pause after a cancellation before returning
    pub cancel_grace: Duration,
}

impl HarvestConfig {
    /// Create a config with default settings
    pub fn new(
        id: impl Into<String>,
        api_url: impl Into<String>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            api_url: api_url.into(),
            output_dir: output_dir.into(),
            download_delay: Duration::from_secs_f64(DEFAULT_DOWNLOAD_DELAY),
            retry_delays: DEFAULT_RETRY_DELAYS
                .iter()
                .map(|s| Duration::from_secs_f64(*s))
                .collect(),
            cache_size: DEFAULT_CACHE_SIZE,
            timeouts: Timeouts::default(),
            max_size: DEFAULT_MAX_SIZE,
            certfile: None,
            encoding: None,
            invalid_xml_regex: None,
            user_agent: None,
            additional_headers: StringMap::new(),
            is_single_request: false,
            allow_repeating_data: false,
            challenge_bypass: false,
            cancel_grace: Duration::from_secs_f64(DEFAULT_CANCEL_GRACE),
        }
    }

    /// Set the download delay
    #[must_use]
    pub fn with_download_delay(mut self, delay: Duration) -> Self {
        self.download_delay = delay;
        self
    }

    /// Set the backoff schedule
    #[must_use]
    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    /// Set the flush threshold
    #[must_use]
    pub fn with_cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }

    /// Set the size ceiling
    #[must_use]
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set the timeouts
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set a fixed response encoding
    #[must_use]
    pub fn with_encoding(mut self, label: impl Into<String>) -> Self {
        self.encoding = Some(label.into());
        self
    }

    /// Set the invalid XML pattern
    #[must_use]
    pub fn with_invalid_xml_regex(mut self, pattern: impl Into<String>) -> Self {
        self.invalid_xml_regex = Some(pattern.into());
        self
    }

    /// Set a fixed user agent
    #[must_use]
    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    /// Add a header sent with every request
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional_headers.insert(name.into(), value.into());
        self
    }

    /// Mark the source as answered by a single request
    #[must_use]
    pub fn with_single_request(mut self, single: bool) -> Self {
        self.is_single_request = single;
        self
    }

    /// Allow consecutive pages with the same first record
    #[must_use]
    pub fn with_repeating_data(mut self, allow: bool) -> Self {
        self.allow_repeating_data = allow;
        self
    }

    /// Enable the challenge-bypass hook
    #[must_use]
    pub fn with_challenge_bypass(mut self, enabled: bool) -> Self {
        self.challenge_bypass = enabled;
        self
    }

    /// Set the cancellation grace period
    #[must_use]
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Check the config for values a run cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::config("source id must not be empty"));
        }
        url::Url::parse(&self.api_url)
            .map_err(|e| Error::config(format!("{}: invalid api_url '{}': {e}", self.id, self.api_url)))?;
        if self.cache_size == 0 {
            return Err(Error::config(format!("{}: cache_size must be positive", self.id)));
        }
        if self.max_size == 0 {
            return Err(Error::config(format!("{}: max_size must be positive", self.id)));
        }
        if let Some(label) = &self.encoding {
            if encoding_rs::Encoding::for_label(label.as_bytes()).is_none() {
                return Err(Error::config(format!("{}: unknown encoding '{label}'", self.id)));
            }
        }
        if let Some(pattern) = &self.invalid_xml_regex {
            regex::Regex::new(pattern).map_err(|e| {
                Error::config(format!("{}: invalid_xml_regex does not compile: {e}", self.id))
            })?;
        }
        Ok(())
    }
}

// ============================================================================
// Source List (YAML)
// ============================================================================

/// Optional run settings, used both as file-wide defaults and per source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceSettings {
    /// Seconds between requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_delay: Option<f64>,

    /// Backoff schedule in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delays: Option<Vec<f64>>,

    /// Flush threshold
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_size: Option<usize>,

    /// Size ceiling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<usize>,

    /// Total request timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,

    /// Connect timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<f64>,

    /// Read timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_timeout: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certfile: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_xml_regex: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_headers: Option<StringMap>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_repeating_data: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge_bypass: Option<bool>,

    /// The whole harvest is one request, so pages are never compared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_single_request: Option<bool>,

    /// Keys matching no setting, rejected when the list is loaded
    #[serde(flatten, skip_serializing)]
    pub unknown: BTreeMap<String, serde_yaml::Value>,
}

impl SourceSettings {
    /// Overlay `other` on top of these settings
    pub fn merged(&self, other: &SourceSettings) -> SourceSettings {
        let headers = match (&self.additional_headers, &other.additional_headers) {
            (Some(base), Some(over)) => {
                let mut merged = base.clone();
                merged.extend(over.iter().map(|(k, v)| (k.clone(), v.clone())));
                Some(merged)
            }
            (base, over) => over.clone().or_else(|| base.clone()),
        };

        SourceSettings {
            download_delay: other.download_delay.or(self.download_delay),
            retry_delays: other.retry_delays.clone().or_else(|| self.retry_delays.clone()),
            cache_size: other.cache_size.or(self.cache_size),
            max_size: other.max_size.or(self.max_size),
            timeout: other.timeout.or(self.timeout),
            connect_timeout: other.connect_timeout.or(self.connect_timeout),
            read_timeout: other.read_timeout.or(self.read_timeout),
            certfile: other.certfile.clone().or_else(|| self.certfile.clone()),
            encoding: other.encoding.clone().or_else(|| self.encoding.clone()),
            invalid_xml_regex: other
                .invalid_xml_regex
                .clone()
                .or_else(|| self.invalid_xml_regex.clone()),
            user_agent: other.user_agent.clone().or_else(|| self.user_agent.clone()),
            additional_headers: headers,
            allow_repeating_data: other.allow_repeating_data.or(self.allow_repeating_data),
            challenge_bypass: other.challenge_bypass.or(self.challenge_bypass),
            is_single_request: other.is_single_request.or(self.is_single_request),
            unknown: BTreeMap::new(),
        }
    }

    fn check_known(&self, context: &str) -> Result<()> {
        match self.unknown.keys().next() {
            Some(key) => Err(Error::config(format!("{context}: unknown setting '{key}'"))),
            None => Ok(()),
        }
    }
}

/// One source entry of the YAML source list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDefinition {
    /// Unique source identifier
    pub id: String,

    /// Registered format name (e.g., "ckan3")
    pub format: String,

    /// Base API URL
    pub api_url: String,

    /// Expected number of records, used to schedule big sources first
    #[serde(default)]
    pub count: u64,

    /// Per-source overrides of the file-wide defaults
    #[serde(flatten)]
    pub settings: SourceSettings,

    /// Format-specific options
    #[serde(default)]
    pub options: JsonValue,
}

/// The YAML source list
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcesFile {
    /// Settings applied to every source
    #[serde(default)]
    pub defaults: SourceSettings,

    /// Source entries
    #[serde(default)]
    pub sources: Vec<SourceDefinition>,
}

impl SourcesFile {
    /// Parse a source list from YAML text
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: SourcesFile = serde_yaml::from_str(yaml)?;
        file.check_ids()?;
        file.defaults.check_known("defaults")?;
        for source in &file.sources {
            source.settings.check_known(&format!("source '{}'", source.id))?;
        }
        Ok(file)
    }

    /// Load a source list from a file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&yaml)
    }

    /// Find a source by id
    pub fn get(&self, id: &str) -> Option<&SourceDefinition> {
        self.sources.iter().find(|s| s.id == id)
    }

    /// Build the run config of one source
    pub fn to_harvest_config(
        &self,
        source: &SourceDefinition,
        output_dir: impl Into<PathBuf>,
    ) -> Result<HarvestConfig> {
        let settings = self.defaults.merged(&source.settings);
        let defaults = Timeouts::default();

        let mut config = HarvestConfig::new(&source.id, &source.api_url, output_dir);
        if let Some(delay) = settings.download_delay {
            config.download_delay = seconds(delay, "download_delay")?;
        }
        if let Some(delays) = &settings.retry_delays {
            config.retry_delays = delays
                .iter()
                .map(|d| seconds(*d, "retry_delays"))
                .collect::<Result<Vec<_>>>()?;
        }
        if let Some(size) = settings.cache_size {
            config.cache_size = size;
        }
        if let Some(size) = settings.max_size {
            config.max_size = size;
        }
        config.timeouts = Timeouts {
            total: settings
                .timeout
                .map_or(Ok(defaults.total), |t| seconds(t, "timeout"))?,
            connect: settings
                .connect_timeout
                .map_or(Ok(defaults.connect), |t| seconds(t, "connect_timeout"))?,
            read: settings
                .read_timeout
                .map_or(Ok(defaults.read), |t| seconds(t, "read_timeout"))?,
        };
        config.certfile = settings.certfile;
        config.encoding = settings.encoding;
        config.invalid_xml_regex = settings.invalid_xml_regex;
        config.user_agent = settings.user_agent;
        config.additional_headers = settings.additional_headers.unwrap_or_default();
        config.allow_repeating_data = settings.allow_repeating_data.unwrap_or(false);
        config.challenge_bypass = settings.challenge_bypass.unwrap_or(false);
        config.is_single_request = settings.is_single_request.unwrap_or(false);

        config.validate()?;
        Ok(config)
    }

    fn check_ids(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.id.as_str()) {
                return Err(Error::config(format!("duplicate source id '{}'", source.id)));
            }
        }
        Ok(())
    }
}

fn seconds(value: f64, field: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| Error::config(format!("{field} must be a non-negative number of seconds")))
}

// ============================================================================
// Tests
// ============================================================================
