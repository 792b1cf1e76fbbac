//! Pagination strategy implementations
//!
//! Each strategy handles one continuation family.

use super::types::{
    count_of, into_records, token_string, PageContext, PaginationStrategy, RecordsAt,
    StopCondition,
};
use crate::decode::FieldPath;
use crate::error::{Error, Result};
use crate::http::{HttpRequest, RequestConfig};
use crate::types::{JsonObject, Method, Page, Record};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Hard ceiling of `from + size` on Elasticsearch-style search endpoints
pub const RESULT_WINDOW: usize = 10_000;

// ============================================================================
// Offset Pagination
// ============================================================================

/// How far the offset moves after each page
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Advance {
    /// By the requested page size
    #[default]
    ByPageSize,
    /// By the number of records actually received
    ByPageLength,
    /// By one; the offset is a page number
    ByPage,
}

/// What the limit parameter carries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PageLimit {
    /// The page size
    #[default]
    Count,
    /// The position of the last record of the page (`from`/`to` ranges)
    LastIndex,
}

/// How a failing page is handled before giving up
///
/// A timeout, or an invalid status when `throttle_on_status` is set, first
/// divides the page size by ten once. After that a page that still fails is
/// skipped with `skip_on_fail`; the run is then marked as failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageRecovery {
    /// Also throttle on a retryable status
    pub throttle_on_status: bool,
    /// Skip a page that keeps failing after throttling
    pub skip_on_fail: bool,
}

/// Offset/limit pagination (CKAN, Dataverse, CSW)
///
/// Common patterns:
/// - `?start=100&rows=50`
/// - `?startPosition=101&maxRecords=100` (1-based)
/// - `?page=3&page_size=50` (page numbers)
/// - `?from=101&to=200` (index ranges)
#[derive(Debug, Clone)]
pub struct OffsetPaginator {
    /// Request every page is derived from
    pub request: HttpRequest,
    /// Query parameter name for the offset
    pub offset_param: String,
    /// Query parameter name for the page size
    pub limit_param: String,
    /// Number of records requested per page
    pub page_size: u64,
    /// Offset of the first record (0 or 1)
    pub start: u64,
    /// Location of the records in a response
    pub records: RecordsAt,
    /// How the offset advances
    pub advance: Advance,
    /// Stop condition
    pub stop_condition: StopCondition,
    /// What the limit parameter carries
    pub limit: PageLimit,
    /// Location of a total entry count, logged once
    pub total: Option<FieldPath>,
    /// Throttling and skipping of failing pages
    pub recovery: Option<PageRecovery>,
    offset: u64,
    throttled: bool,
    done: bool,
}

impl OffsetPaginator {
    /// Create a new offset paginator starting at 0
    pub fn new(
        request: HttpRequest,
        offset_param: impl Into<String>,
        limit_param: impl Into<String>,
        page_size: u64,
        records: RecordsAt,
    ) -> Self {
        Self {
            request,
            offset_param: offset_param.into(),
            limit_param: limit_param.into(),
            page_size: page_size.max(1),
            start: 0,
            records,
            advance: Advance::default(),
            stop_condition: StopCondition::default(),
            limit: PageLimit::default(),
            total: None,
            recovery: None,
            offset: 0,
            throttled: false,
            done: false,
        }
    }

    /// Start counting at `start` instead of 0
    #[must_use]
    pub fn starting_at(mut self, start: u64) -> Self {
        self.start = start;
        self.offset = start;
        self
    }

    /// Set how the offset advances
    #[must_use]
    pub fn advancing(mut self, advance: Advance) -> Self {
        self.advance = advance;
        self
    }

    /// Set the stop condition
    #[must_use]
    pub fn stopping(mut self, stop_condition: StopCondition) -> Self {
        self.stop_condition = stop_condition;
        self
    }

    /// Set what the limit parameter carries
    #[must_use]
    pub fn limited_by(mut self, limit: PageLimit) -> Self {
        self.limit = limit;
        self
    }

    /// Log the total found at `path`
    #[must_use]
    pub fn with_total(mut self, path: impl Into<FieldPath>) -> Self {
        self.total = Some(path.into());
        self
    }

    /// Throttle, and optionally skip, pages that keep failing
    #[must_use]
    pub fn recovering(mut self, recovery: PageRecovery) -> Self {
        self.recovery = Some(recovery);
        self
    }

    /// Current offset
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn page_request(&self) -> HttpRequest {
        let limit = match self.limit {
            PageLimit::Count => self.page_size,
            PageLimit::LastIndex => self.offset + self.page_size - 1,
        };
        self.request
            .clone()
            .query(&self.offset_param, self.offset.to_string())
            .query(&self.limit_param, limit.to_string())
    }

    fn step(&self, count: u64) -> u64 {
        match self.advance {
            Advance::ByPageSize => self.page_size,
            Advance::ByPageLength => count,
            Advance::ByPage => 1,
        }
    }

    /// Decide what to do with a page that failed for good
    ///
    /// Returns true when the page should be requested again.
    fn recover(&mut self, err: &Error, ctx: &mut PageContext<'_>) -> bool {
        let Some(recovery) = self.recovery else {
            return false;
        };
        let timed_out = matches!(err, Error::Timeout { .. });
        let bad_status = matches!(err, Error::InvalidStatus { .. });
        if !timed_out && !bad_status {
            return false;
        }

        if !self.throttled && (timed_out || recovery.throttle_on_status) {
            self.page_size = (self.page_size / 10).max(1);
            self.throttled = true;
            warn!(rows = self.page_size, error = %err, "Throttling the page size");
        } else if recovery.skip_on_fail {
            warn!(offset = self.offset, error = %err, "Skipping page");
            self.offset += self.step(self.page_size);
            ctx.mark_failed();
        } else {
            return false;
        }
        ctx.reset_budget();
        true
    }
}

#[async_trait]
impl PaginationStrategy for OffsetPaginator {
    fn name(&self) -> &str {
        "offset"
    }

    async fn next_page(&mut self, ctx: &mut PageContext<'_>) -> Result<Option<Page>> {
        if self.done {
            return Ok(None);
        }

        let (page, total) = loop {
            let request = self.page_request();
            let records = &self.records;
            let (stop_path, log_path) = match &self.stop_condition {
                StopCondition::TotalCount { path } => (Some(path), None),
                _ => (None, self.total.as_ref()),
            };
            let fetched = ctx
                .fetch_with(&request, |body| {
                    let total = stop_path
                        .map(|path| {
                            path.get(&body)
                                .and_then(count_of)
                                .ok_or_else(|| Error::missing_field(path.to_string()))
                        })
                        .transpose()?
                        .or_else(|| log_path.and_then(|path| path.get(&body)).and_then(count_of));
                    Ok((records.take(body)?, total))
                })
                .await;
            match fetched {
                Ok(found) => break found,
                Err(err) if self.recover(&err, ctx) => {}
                Err(err) => return Err(err),
            }
        };

        if let Some(total) = total {
            ctx.log_total(total);
        }

        let count = page.len() as u64;
        self.offset += self.step(count);

        self.done = match self.stop_condition {
            StopCondition::EmptyPage => count == 0,
            StopCondition::ShortPage => count < self.page_size,
            StopCondition::TotalCount { .. } => self.offset - self.start >= total.unwrap_or(0),
        };
        // an empty page cannot move a length-driven offset
        if count == 0 && self.advance == Advance::ByPageLength {
            self.done = true;
        }

        debug!(offset = self.offset, records = count, done = self.done, "Offset page");
        Ok(Some(page))
    }
}

// ============================================================================
// Token Pagination
// ============================================================================

/// Which query parameters of the first request follow a token
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ParamCarry {
    /// Every parameter is sent again
    #[default]
    All,
    /// Only the named parameters are sent again
    Only(Vec<String>),
}

/// How a continuation token becomes the next request
#[derive(Debug, Clone, PartialEq)]
pub enum NextRequest {
    /// Repeat the first request with the token as a query parameter
    Query {
        /// Parameter carrying the token (e.g. "resumptionToken")
        param: String,
        /// Parameters of the first request that are kept
        carry: ParamCarry,
    },
    /// Send a JSON body built from a template plus the token
    Body {
        /// Endpoint receiving continuation bodies
        url: String,
        /// HTTP method of continuation requests
        method: Method,
        /// Fields sent with every continuation
        template: JsonObject,
        /// Body field carrying the token
        field: String,
    },
    /// The token is the next URL, or a path below `base`
    Url {
        /// Base for relative continuation paths
        base: Option<String>,
    },
    /// A separate continuation endpoint taking only the token
    Endpoint {
        /// Endpoint receiving continuation requests
        url: String,
        /// Parameter carrying the token (e.g. "scrollId")
        param: String,
    },
}

impl NextRequest {
    /// Token as a query parameter, all other parameters kept
    pub fn query(param: impl Into<String>) -> Self {
        Self::Query {
            param: param.into(),
            carry: ParamCarry::All,
        }
    }

    /// Token as the next URL
    pub fn url(base: Option<String>) -> Self {
        Self::Url { base }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Cursor {
    Start,
    Token(String),
    Done,
}

/// Opaque-token pagination (OAI-PMH, scroll ids, page tokens, next links)
#[derive(Debug, Clone)]
pub struct TokenPaginator {
    /// First request
    pub request: HttpRequest,
    /// Location of the records in a response
    pub records: RecordsAt,
    /// Candidate token locations, the first present one wins
    pub token: Vec<FieldPath>,
    /// How a token turns into the next request
    pub next: NextRequest,
    /// Token values that mean "no more pages"
    pub sentinels: Vec<String>,
    /// Boolean field that turns false on the last page
    pub has_more: Option<FieldPath>,
    /// Stop after a page shorter than this
    pub page_size: Option<usize>,
    /// Location of the total entry count, logged once
    pub total: Option<FieldPath>,
    /// Read the token from the last record instead of the response
    pub last_record: Option<FieldPath>,
    cursor: Cursor,
}

impl TokenPaginator {
    /// Create a new token paginator
    pub fn new(
        request: HttpRequest,
        records: RecordsAt,
        token: impl Into<FieldPath>,
        next: NextRequest,
    ) -> Self {
        Self {
            request,
            records,
            token: vec![token.into()],
            next,
            sentinels: Vec::new(),
            has_more: None,
            page_size: None,
            total: None,
            last_record: None,
            cursor: Cursor::Start,
        }
    }

    /// Paginate on the value at `path` in the last record of each page
    ///
    /// Cursor-by-id APIs (`scroll_id=<last id>`) work this way.
    pub fn keyed_on_last_record(
        request: HttpRequest,
        records: RecordsAt,
        path: impl Into<FieldPath>,
        next: NextRequest,
    ) -> Self {
        let path = path.into();
        let mut paginator = Self::new(request, records, path.clone(), next);
        paginator.token.clear();
        paginator.last_record = Some(path);
        paginator
    }

    /// Look for the token at another location as well
    #[must_use]
    pub fn or_token(mut self, path: impl Into<FieldPath>) -> Self {
        self.token.push(path.into());
        self
    }

    /// Treat a token value as the end of the harvest
    #[must_use]
    pub fn with_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.sentinels.push(sentinel.into());
        self
    }

    /// Stop once the boolean at `path` is false
    #[must_use]
    pub fn with_has_more(mut self, path: impl Into<FieldPath>) -> Self {
        self.has_more = Some(path.into());
        self
    }

    /// Stop after a page shorter than `size`
    #[must_use]
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size);
        self
    }

    /// Log the total found at `path`
    #[must_use]
    pub fn with_total(mut self, path: impl Into<FieldPath>) -> Self {
        self.total = Some(path.into());
        self
    }

    fn request_for(&self, token: &str) -> HttpRequest {
        match &self.next {
            NextRequest::Query { param, carry } => {
                let mut request = self.request.clone();
                if let ParamCarry::Only(keep) = carry {
                    request.config.query.retain(|key, _| keep.contains(key));
                }
                request.query(param, token)
            }
            NextRequest::Body {
                url,
                method,
                template,
                field,
            } => {
                let mut body = template.clone();
                body.insert(field.clone(), Value::String(token.to_string()));
                HttpRequest {
                    method: *method,
                    url: url.clone(),
                    config: RequestConfig {
                        headers: self.request.config.headers.clone(),
                        ..RequestConfig::default()
                    }
                    .json(Value::Object(body)),
                    format: self.request.format,
                    chunked: false,
                }
            }
            NextRequest::Url { base } => HttpRequest {
                url: resolve_url(base.as_deref(), token),
                config: RequestConfig {
                    headers: self.request.config.headers.clone(),
                    ..RequestConfig::default()
                },
                ..self.request.clone()
            },
            NextRequest::Endpoint { url, param } => HttpRequest {
                url: url.clone(),
                config: RequestConfig {
                    headers: self.request.config.headers.clone(),
                    ..RequestConfig::default()
                },
                ..self.request.clone()
            }
            .query(param, token),
        }
    }

    fn is_sentinel(&self, token: &str) -> bool {
        token.is_empty() || self.sentinels.iter().any(|s| s == token)
    }
}

/// Join a continuation path onto a base URL; absolute URLs pass through
fn resolve_url(base: Option<&str>, next: &str) -> String {
    match base {
        Some(base) if !next.starts_with("http://") && !next.starts_with("https://") => {
            format!("{}{}", base.trim_end_matches('/'), next)
        }
        _ => next.to_string(),
    }
}

/// One token page, pulled out of its response
struct TokenPage {
    records: Page,
    token: Option<String>,
    has_more: Option<bool>,
    total: Option<u64>,
}

#[async_trait]
impl PaginationStrategy for TokenPaginator {
    fn name(&self) -> &str {
        "token"
    }

    async fn next_page(&mut self, ctx: &mut PageContext<'_>) -> Result<Option<Page>> {
        let request = match &self.cursor {
            Cursor::Done => return Ok(None),
            Cursor::Start => self.request.clone(),
            Cursor::Token(token) => self.request_for(token),
        };

        let (records_at, token_paths, has_more_path, total_path, last_record) = (
            &self.records,
            &self.token,
            &self.has_more,
            &self.total,
            &self.last_record,
        );
        let found = ctx
            .fetch_with(&request, |body| {
                let token = token_paths
                    .iter()
                    .find_map(|path| path.get(&body))
                    .and_then(token_string);
                let has_more = has_more_path
                    .as_ref()
                    .map(|path| {
                        path.get(&body)
                            .and_then(Value::as_bool)
                            .ok_or_else(|| Error::missing_field(path.to_string()))
                    })
                    .transpose()?;
                let total = total_path
                    .as_ref()
                    .and_then(|path| path.get(&body))
                    .and_then(count_of);
                let records = records_at.take(body)?;
                let token = match (last_record, records.last()) {
                    (Some(path), Some(last)) => Some(
                        path.get(last)
                            .and_then(token_string)
                            .ok_or_else(|| Error::missing_field(path.to_string()))?,
                    ),
                    (Some(_), None) => None,
                    (None, _) => token,
                };
                Ok(TokenPage {
                    records,
                    token,
                    has_more,
                    total,
                })
            })
            .await?;

        if let Some(total) = found.total {
            ctx.log_total(total);
        }

        if let (NextRequest::Url { .. }, Cursor::Token(previous), Some(token)) =
            (&self.next, &self.cursor, &found.token)
        {
            if previous == token {
                return Err(Error::unexpected("New request url same as previous one"));
            }
        }

        // an empty first page is followed while a usable token remains
        let first = self.cursor == Cursor::Start;
        let exhausted = if found.records.is_empty() {
            if !first {
                warn!("No more records found, assuming all is downloaded");
            }
            !first
        } else {
            self.page_size
                .is_some_and(|size| found.records.len() < size)
        };

        self.cursor = match found.token {
            _ if found.has_more == Some(false) || exhausted => Cursor::Done,
            Some(token) if !self.is_sentinel(&token) => Cursor::Token(token),
            _ => Cursor::Done,
        };

        debug!(records = found.records.len(), next = ?self.cursor, "Token page");
        Ok(Some(found.records))
    }
}

// ============================================================================
// Search-after Pagination
// ============================================================================

/// Elasticsearch `_search` pagination
///
/// Pages with `from`/`size` while the result window allows it, then
/// continues with `search_after` on the sort field. Without a sort field
/// a harvest that would cross the window fails instead of silently
/// truncating.
#[derive(Debug, Clone)]
pub struct SearchAfterPaginator {
    /// `_search` endpoint
    pub url: String,
    /// Query body; `size` and `sort` are managed here
    pub query: JsonObject,
    /// Hits per page
    pub page_size: usize,
    /// Unique, sortable field used for `search_after`
    pub sort_field: Option<String>,
    /// Location of the hits
    pub records: RecordsAt,
    /// Largest `from + size` the endpoint accepts
    pub window: usize,
    from: usize,
    after: Option<Value>,
    last_hit: Option<Record>,
    done: bool,
}

impl SearchAfterPaginator {
    /// Create a paginator; `query` defaults to `match_all`
    pub fn new(
        url: impl Into<String>,
        query: Option<JsonObject>,
        page_size: usize,
        sort_field: Option<String>,
    ) -> Self {
        let mut query = query.unwrap_or_else(|| {
            let mut default = JsonObject::new();
            default.insert("query".into(), json!({"match_all": {}}));
            default
        });
        if let Some(field) = &sort_field {
            query.insert("sort".into(), json!([{ field.as_str(): {"order": "asc"} }]));
        }
        let page_size = page_size.max(1);
        query.insert("size".into(), json!(page_size));

        Self {
            url: url.into(),
            query,
            page_size,
            sort_field,
            records: RecordsAt::path("hits.hits"),
            window: RESULT_WINDOW,
            from: 0,
            after: None,
            last_hit: None,
            done: false,
        }
    }

    /// Override the result window
    #[must_use]
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    /// Move the cursor past `last`, the final hit of a full page
    fn advance(&mut self, last: &Record) -> Result<()> {
        let next_from = self.from + self.page_size;
        if self.after.is_none() && next_from + self.page_size <= self.window {
            self.from = next_from;
            return Ok(());
        }
        match &self.sort_field {
            Some(field) => {
                self.after = Some(search_after_value(last, field)?);
                Ok(())
            }
            None => Err(Error::unexpected(format!(
                "From + Size exceeds {}. Not all entries can be harvested",
                self.window
            ))),
        }
    }

    fn page_body(&self) -> Value {
        let mut body = self.query.clone();
        if let Some(after) = &self.after {
            body.insert("search_after".into(), json!([after]));
        } else if self.from > 0 {
            body.insert("from".into(), json!(self.from));
        }
        Value::Object(body)
    }
}

/// Value of the sort field in a hit's `_source`
///
/// Walks the dotted field; the first scalar found is the value, so a
/// sub-field resolves to its parent when only the parent is stored.
pub fn search_after_value(hit: &Record, field: &str) -> Result<Value> {
    let mut current = hit
        .get("_source")
        .ok_or_else(|| Error::unexpected("Hit has no _source"))?;
    for segment in field.split('.') {
        current = current
            .get(segment)
            .filter(|v| !v.is_null())
            .ok_or_else(|| Error::unexpected("Search After field not found in hit"))?;
        match current {
            Value::String(_) | Value::Number(_) => return Ok(current.clone()),
            Value::Object(_) => continue,
            _ => break,
        }
    }
    Err(Error::unexpected(format!(
        "Search After field does not contain str, int or float in hit: {hit}"
    )))
}

#[async_trait]
impl PaginationStrategy for SearchAfterPaginator {
    fn name(&self) -> &str {
        "search_after"
    }

    async fn next_page(&mut self, ctx: &mut PageContext<'_>) -> Result<Option<Page>> {
        if self.done {
            return Ok(None);
        }
        if let Some(last) = self.last_hit.take() {
            self.advance(&last)?;
        }

        let request = HttpRequest::post(&self.url, self.page_body());
        let records = &self.records;
        let (hits, total) = ctx
            .fetch_with(&request, |body| {
                let total = body.pointer("/hits/total").and_then(count_of);
                Ok((records.take(body)?, total))
            })
            .await?;

        if let Some(total) = total {
            ctx.log_total(total);
        }

        if hits.len() < self.page_size {
            self.done = true;
        } else {
            self.last_hit = hits.last().cloned();
        }

        debug!(from = self.from, hits = hits.len(), "Search page");
        Ok(Some(hits))
    }
}

// ============================================================================
// Single-shot
// ============================================================================

/// One response holding every record
///
/// The body is read in bounded chunks so an oversized payload is rejected
/// before it is held in memory whole.
#[derive(Debug, Clone)]
pub struct SinglePaginator {
    /// The only request
    pub request: HttpRequest,
    /// Location of the record array; the response itself when absent
    pub result: Option<FieldPath>,
    done: bool,
}

impl SinglePaginator {
    /// Create a single-shot paginator
    pub fn new(request: HttpRequest, result: Option<FieldPath>) -> Self {
        Self {
            request: request.chunked(),
            result,
            done: false,
        }
    }
}

#[async_trait]
impl PaginationStrategy for SinglePaginator {
    fn name(&self) -> &str {
        "single"
    }

    fn is_single_request(&self) -> bool {
        true
    }

    async fn next_page(&mut self, ctx: &mut PageContext<'_>) -> Result<Option<Page>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;

        let result_path = &self.result;
        let page = ctx
            .fetch_with(&self.request, |body| {
                let result = match result_path {
                    Some(path) => path.require(body)?,
                    None => body,
                };
                match result {
                    Value::Array(items) => Ok(items),
                    _ if result_path.is_some() => {
                        Err(Error::unexpected("No array at \"result_key\" location"))
                    }
                    _ => Err(Error::unexpected("The response data is not an array")),
                }
            })
            .await?;
        Ok(Some(page))
    }
}

// ============================================================================
// Index of URLs
// ============================================================================

/// A manifest listing one URL per record
///
/// Each child URL is fetched on its own and becomes a page of one.
#[derive(Debug, Clone)]
pub struct IndexPaginator {
    /// Request for the index
    pub request: HttpRequest,
    /// Location of the URL inside object items; string items are URLs
    pub url_location: Option<FieldPath>,
    /// Location of the URL list in the index; the index itself when absent
    pub list: Option<FieldPath>,
    /// Location of the record in each child response
    pub record: Option<FieldPath>,
    urls: Option<VecDeque<String>>,
}

impl IndexPaginator {
    /// Create an index paginator
    pub fn new(request: HttpRequest, url_location: Option<FieldPath>) -> Self {
        Self {
            request,
            url_location,
            list: None,
            record: None,
            urls: None,
        }
    }

    /// Read the URL list at `path`; a lone entry counts as a list of one
    #[must_use]
    pub fn listed_at(mut self, path: impl Into<FieldPath>) -> Self {
        self.list = Some(path.into());
        self
    }

    /// Take each record from `path` in its child response
    #[must_use]
    pub fn record_at(mut self, path: impl Into<FieldPath>) -> Self {
        self.record = Some(path.into());
        self
    }
}

fn index_urls(
    body: Value,
    list: Option<&FieldPath>,
    location: Option<&FieldPath>,
) -> Result<VecDeque<String>> {
    let items = match (list, body) {
        (Some(path), body) => into_records(path.require(body)?),
        (None, Value::Array(items)) => items,
        (None, _) => return Err(Error::unexpected("The index is not an array")),
    };

    let mut urls = VecDeque::with_capacity(items.len());
    for item in items {
        match (item, location) {
            (Value::String(url), _) => urls.push_back(url),
            (item @ Value::Object(_), Some(path)) => match path.get(&item) {
                Some(Value::String(url)) => urls.push_back(url.clone()),
                _ => return Err(Error::missing_field(path.to_string())),
            },
            _ => {}
        }
    }
    Ok(urls)
}

#[async_trait]
impl PaginationStrategy for IndexPaginator {
    fn name(&self) -> &str {
        "index"
    }

    async fn next_page(&mut self, ctx: &mut PageContext<'_>) -> Result<Option<Page>> {
        if self.urls.is_none() {
            let (list, location) = (self.list.as_ref(), self.url_location.as_ref());
            let urls = ctx
                .fetch_with(&self.request, |body| index_urls(body, list, location))
                .await?;
            ctx.log_total(urls.len());
            self.urls = Some(urls);
        }

        let Some(url) = self.urls.as_mut().and_then(VecDeque::pop_front) else {
            return Ok(None);
        };
        let request = HttpRequest {
            url,
            config: RequestConfig {
                headers: self.request.config.headers.clone(),
                ..RequestConfig::default()
            },
            ..self.request.clone()
        };
        let record = match &self.record {
            Some(path) => ctx.fetch_with(&request, |body| path.require(body)).await?,
            None => ctx.fetch(&request).await?,
        };
        Ok(Some(vec![record]))
    }
}

// ============================================================================
// Detail Expansion
// ============================================================================

/// Replaces each record of an inner strategy by a detail document
///
/// The detail URL is `{url}?{param}=<key>` with the key read from the
/// record; the key is copied into the detail under the same name. Each
/// detail is yielded as a page of one.
pub struct ExpandPaginator {
    /// Strategy listing the records to expand
    pub inner: Box<dyn PaginationStrategy>,
    /// Request for a detail, without the key
    pub request: HttpRequest,
    /// Parameter carrying the key
    pub param: String,
    /// Location of the key in a listed record
    pub key: FieldPath,
    pending: VecDeque<String>,
}

impl ExpandPaginator {
    /// Create an expanding paginator
    pub fn new(
        inner: Box<dyn PaginationStrategy>,
        request: HttpRequest,
        param: impl Into<String>,
        key: impl Into<FieldPath>,
    ) -> Self {
        Self {
            inner,
            request,
            param: param.into(),
            key: key.into(),
            pending: VecDeque::new(),
        }
    }
}

#[async_trait]
impl PaginationStrategy for ExpandPaginator {
    fn name(&self) -> &str {
        "expand"
    }

    async fn next_page(&mut self, ctx: &mut PageContext<'_>) -> Result<Option<Page>> {
        while self.pending.is_empty() {
            let Some(page) = self.inner.next_page(ctx).await? else {
                return Ok(None);
            };
            for record in &page {
                let key = self
                    .key
                    .get(record)
                    .and_then(token_string)
                    .ok_or_else(|| Error::missing_field(self.key.to_string()))?;
                self.pending.push_back(key);
            }
        }

        let Some(key) = self.pending.pop_front() else {
            return Ok(None);
        };
        let request = self.request.clone().query(&self.param, key.as_str());
        let mut detail = ctx.fetch(&request).await?;
        if let Value::Object(fields) = &mut detail {
            fields.insert(self.key.to_string(), Value::String(key));
        }
        Ok(Some(vec![detail]))
    }
}
