//! Pagination types and traits
//!
//! Defines the strategy contract every source implements and the context a
//! strategy talks to the network through.

use crate::decode::{strip_namespaces, FieldPath};
use crate::error::{Error, Result};
use crate::http::{HttpClient, HttpRequest, RequestConfig, RetryBudget};
use crate::types::{Page, ResponseFormat};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use std::fmt;
use tracing::info;

/// Core trait for pagination strategies
///
/// A strategy produces a lazy, finite, forward-only sequence of pages.
/// `Ok(None)` signals exhaustion; an empty page is a legal value. Once a
/// strategy has returned `None` or an error it is not restartable.
#[async_trait]
pub trait PaginationStrategy: Send {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// True when the whole harvest is one response, which disables the
    /// repeated-page guard
    fn is_single_request(&self) -> bool {
        false
    }

    /// Produce the next page
    async fn next_page(&mut self, ctx: &mut PageContext<'_>) -> Result<Option<Page>>;
}

/// Flags a run keeps across pages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunFlags {
    /// Some part of the harvest failed but the run carried on
    pub has_failed: bool,
    /// The total number of entries has been logged
    pub total_logged: bool,
}

/// What a strategy sees of the run while producing a page
///
/// Every request goes through the run's client and draws on the run's
/// retry budget.
pub struct PageContext<'a> {
    client: &'a HttpClient,
    budget: &'a mut RetryBudget,
    flags: &'a mut RunFlags,
}

impl<'a> PageContext<'a> {
    /// Create a context over a client, a budget and the run flags
    pub fn new(client: &'a HttpClient, budget: &'a mut RetryBudget, flags: &'a mut RunFlags) -> Self {
        Self {
            client,
            budget,
            flags,
        }
    }

    /// The run's client
    pub fn client(&self) -> &HttpClient {
        self.client
    }

    /// Send a request and parse the response
    ///
    /// XML responses come back with their namespaces stripped.
    pub async fn fetch(&mut self, request: &HttpRequest) -> Result<Value> {
        let value = self.client.fetch(request, self.budget).await?;
        Ok(match request.format {
            ResponseFormat::Json => value,
            ResponseFormat::Xml => strip_namespaces(value),
        })
    }

    /// Send a request and pull what the strategy needs out of the response
    ///
    /// An extraction error means a well-formed response lacked an expected
    /// field. The whole request is repeated against the shared budget.
    pub async fn fetch_with<T, F>(&mut self, request: &HttpRequest, mut extract: F) -> Result<T>
    where
        F: FnMut(Value) -> Result<T> + Send,
        T: Send,
    {
        loop {
            let value = self.fetch(request).await?;
            match extract(value) {
                Ok(found) => return Ok(found),
                Err(err) => {
                    self.client
                        .retry_policy()
                        .recover(self.budget, "extract", &request.url, err, Error::is_extraction)
                        .await?;
                }
            }
        }
    }

    /// Open a line stream; nothing about it is retried
    pub async fn lines(
        &self,
        url: &str,
        config: &RequestConfig,
    ) -> Result<BoxStream<'static, Result<String>>> {
        self.client.get_lines(url, config).await
    }

    /// Record a soft failure
    pub fn mark_failed(&mut self) {
        self.flags.has_failed = true;
    }

    /// True once a soft failure was recorded
    pub fn has_failed(&self) -> bool {
        self.flags.has_failed
    }

    /// Refill the retry budget
    pub fn reset_budget(&mut self) {
        self.budget.reset();
    }

    /// Log the total number of entries, only the first time it is called
    pub fn log_total(&mut self, total: impl fmt::Display) {
        if !self.flags.total_logged {
            info!("Total number of entries {}", total);
            self.flags.total_logged = true;
        }
    }
}

// ============================================================================
// Response helpers
// ============================================================================

/// Where the records of a page sit inside a response
#[derive(Debug, Clone, PartialEq)]
pub struct RecordsAt {
    /// Candidate locations, the first present one wins
    pub paths: Vec<FieldPath>,
    /// A response without any candidate holds an empty page instead of
    /// being an extraction error
    pub optional: bool,
    /// Element that must be present even when the records are optional
    pub container: Option<FieldPath>,
}

impl RecordsAt {
    /// Records at one location
    pub fn path(path: impl Into<FieldPath>) -> Self {
        Self {
            paths: vec![path.into()],
            optional: false,
            container: None,
        }
    }

    /// The response itself is the record array
    pub fn root() -> Self {
        Self::path(FieldPath::from_segments(Vec::<String>::new()))
    }

    /// Add a fallback location
    #[must_use]
    pub fn or(mut self, path: impl Into<FieldPath>) -> Self {
        self.paths.push(path.into());
        self
    }

    /// Treat a missing location as an empty page
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Require `path` to be present; it may be empty
    #[must_use]
    pub fn within(mut self, path: impl Into<FieldPath>) -> Self {
        self.container = Some(path.into());
        self
    }

    /// Take the records out of a response
    pub fn take(&self, body: Value) -> Result<Page> {
        if let Some(container) = &self.container {
            if !container.exists(&body) {
                return Err(Error::missing_field(container.to_string()));
            }
        }
        match self.paths.iter().find(|p| p.get(&body).is_some()) {
            Some(path) => Ok(path.extract(body).map(into_records).unwrap_or_default()),
            None if self.optional => Ok(Vec::new()),
            None => Err(Error::missing_field(
                self.paths
                    .first()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
            )),
        }
    }
}

/// Turn a decoded value into a page
///
/// A single object stands for a page of one; XML collapses a lone repeated
/// element that way.
pub fn into_records(value: Value) -> Page {
    match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

/// Read a continuation token
///
/// Tokens may arrive as strings, numbers, an XML element with attributes
/// (`{"#text": ..}`) or a map of language alternatives, in which case the
/// first usable alternative is taken.
pub fn token_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => match map.get("#text") {
            Some(text) => token_string(text),
            None => map
                .iter()
                .filter(|(key, _)| !key.starts_with('@'))
                .find_map(|(_, v)| token_string(v)),
        },
        _ => None,
    }
}

/// Read a reported count, as a number, a numeric string or `{"value": n}`
pub fn count_of(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Object(map) => map.get("value").and_then(count_of),
        _ => None,
    }
}

/// Stop conditions for offset pagination
#[derive(Debug, Clone, Default, PartialEq)]
pub enum StopCondition {
    /// Stop after an empty page
    #[default]
    EmptyPage,

    /// Stop after a page shorter than the requested size
    ShortPage,

    /// Stop once the next offset passes the total reported by the API
    TotalCount {
        /// Location of the total count field
        path: FieldPath,
    },
}

impl StopCondition {
    /// Create a total count stop condition
    pub fn total_count(path: impl Into<FieldPath>) -> Self {
        Self::TotalCount { path: path.into() }
    }
}
