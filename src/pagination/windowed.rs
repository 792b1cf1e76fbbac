//! Date-bounded ID windowing
//!
//! Search backends that refuse to page past a fixed result window can
//! still be harvested in full by sorting on modification date and
//! restarting with a `before(date)` filter (or an inclusive
//! `field:[* TO time]` range) whenever the window runs out. Records on the
//! boundary show up in two consecutive windows, so the ids of the current
//! and the previous window are kept to drop repeats.

use super::strategies::RESULT_WINDOW;
use super::types::{token_string, PageContext, PaginationStrategy, RecordsAt};
use crate::decode::FieldPath;
use crate::error::{Error, Result};
use crate::http::HttpRequest;
use crate::types::{Page, Record};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta, Timelike, Utc};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, warn};

/// How a new window is bounded by the last record seen
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum WindowBoundary {
    /// `before(YYYY-MM-DD)`, exclusive, by day
    #[default]
    BeforeDate,
    /// `field:[* TO YYYY-MM-DDTHH:MM:SS]`, inclusive, by second
    UpTo {
        /// Indexed field the range applies to
        field: String,
    },
}

impl WindowBoundary {
    fn filter(&self, boundary: NaiveDateTime) -> String {
        match self {
            Self::BeforeDate => format!("before({})", boundary.format("%Y-%m-%d")),
            Self::UpTo { field } => {
                format!("{field}:[* TO {}]", boundary.format("%Y-%m-%dT%H:%M:%S"))
            }
        }
    }

    /// The boundary following `old` when the last record did not move it
    fn step_back(&self, old: NaiveDateTime) -> Option<NaiveDateTime> {
        match self {
            Self::BeforeDate => old.date().pred_opt().and_then(|d| d.and_hms_opt(0, 0, 0)),
            Self::UpTo { .. } => old.checked_sub_signed(TimeDelta::seconds(1)),
        }
    }

    fn truncate(&self, stamp: NaiveDateTime) -> Option<NaiveDateTime> {
        match self {
            Self::BeforeDate => stamp.date().and_hms_opt(0, 0, 0),
            Self::UpTo { .. } => stamp.with_nanosecond(0),
        }
    }
}

/// Read a modification time: epoch milliseconds or an ISO 8601 string
fn parse_time(value: &Value) -> Option<NaiveDateTime> {
    match value {
        Value::Number(n) => {
            let millis = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            DateTime::<Utc>::from_timestamp_millis(millis).map(|t| t.naive_utc())
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.naive_utc())
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
            .ok(),
        _ => None,
    }
}

/// Paginator that narrows a date filter each time the window is used up
#[derive(Debug, Clone)]
pub struct WindowedPaginator {
    /// Request every page is derived from, sorted newest first
    pub request: HttpRequest,
    /// Query parameter for the page number
    pub page_param: String,
    /// Query parameter receiving the boundary filter
    pub filter_param: String,
    /// Shape of the boundary filter
    pub bound: WindowBoundary,
    /// Records per page
    pub page_size: usize,
    /// Records reachable before the backend refuses to page further
    pub window: usize,
    /// Location of the records in a response
    pub records: RecordsAt,
    /// Location of a record's id
    pub id_field: FieldPath,
    /// Location of a record's modification time
    pub modified_field: FieldPath,
    /// A page shorter than the page size is the last one
    pub short_page_ends: bool,
    page: usize,
    boundary: Option<NaiveDateTime>,
    current_ids: HashSet<String>,
    previous_ids: HashSet<String>,
    last_modified: Option<NaiveDateTime>,
    done: bool,
}

impl WindowedPaginator {
    /// Create a paginator over `request`
    pub fn new(
        request: HttpRequest,
        page_param: impl Into<String>,
        filter_param: impl Into<String>,
        page_size: usize,
        records: RecordsAt,
    ) -> Self {
        Self {
            request,
            page_param: page_param.into(),
            filter_param: filter_param.into(),
            bound: WindowBoundary::default(),
            page_size: page_size.max(1),
            window: RESULT_WINDOW,
            records,
            id_field: FieldPath::parse("id"),
            modified_field: FieldPath::parse("attributes.modified"),
            short_page_ends: false,
            page: 1,
            boundary: None,
            current_ids: HashSet::new(),
            previous_ids: HashSet::new(),
            last_modified: None,
            done: false,
        }
    }

    /// Override the result window
    #[must_use]
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    /// Bound new windows with `bound`
    #[must_use]
    pub fn bounded_by(mut self, bound: WindowBoundary) -> Self {
        self.bound = bound;
        self
    }

    /// Read ids and modification times from other record fields
    #[must_use]
    pub fn with_fields(mut self, id: impl Into<FieldPath>, modified: impl Into<FieldPath>) -> Self {
        self.id_field = id.into();
        self.modified_field = modified.into();
        self
    }

    /// Finish after the first page shorter than the page size
    #[must_use]
    pub fn ending_on_short_page(mut self) -> Self {
        self.short_page_ends = true;
        self
    }

    /// The day of the current boundary, if a window has been used up
    pub fn boundary(&self) -> Option<NaiveDate> {
        self.boundary.map(|b| b.date())
    }

    /// Pages in one window are numbered `1..max_page`
    fn max_page(&self) -> usize {
        (self.window / self.page_size).max(2)
    }

    /// Start a new window bounded by the last record seen
    fn roll_window(&mut self) -> Result<()> {
        let stamp = self
            .last_modified
            .ok_or_else(|| Error::missing_field(self.modified_field.to_string()))?;
        let mut boundary = self
            .bound
            .truncate(stamp)
            .ok_or_else(|| Error::unexpected(format!("Invalid modification time {stamp}")))?;

        if let Some(old) = self.boundary {
            if boundary >= old {
                warn!(boundary = %old, "Skipping further entries for boundary, additional entries ignored");
                boundary = self
                    .bound
                    .step_back(old)
                    .ok_or_else(|| Error::unexpected("Date boundary out of range"))?;
            }
        }

        debug!(boundary = %boundary, "Starting new round");
        self.boundary = Some(boundary);
        self.page = 1;
        self.previous_ids = std::mem::take(&mut self.current_ids);
        Ok(())
    }

    fn page_request(&self) -> HttpRequest {
        let mut request = self.request.clone();
        if self.page > 1 || self.boundary.is_some() {
            request = request.query(&self.page_param, self.page.to_string());
        }
        if let Some(boundary) = self.boundary {
            request = request.query(&self.filter_param, self.bound.filter(boundary));
        }
        request
    }

    /// Keep the records whose id is new to both windows
    fn filter_seen(&mut self, records: Vec<(String, Record)>) -> Page {
        let mut page = Vec::with_capacity(records.len());
        for (id, record) in records {
            if !self.previous_ids.contains(&id) && !self.current_ids.contains(&id) {
                page.push(record);
            }
            self.current_ids.insert(id);
        }
        page
    }
}

#[async_trait]
impl PaginationStrategy for WindowedPaginator {
    fn name(&self) -> &str {
        "windowed"
    }

    async fn next_page(&mut self, ctx: &mut PageContext<'_>) -> Result<Option<Page>> {
        if self.done {
            return Ok(None);
        }
        if self.page >= self.max_page() {
            self.roll_window()?;
        }

        let request = self.page_request();
        let (records_at, id_field, modified_field) =
            (&self.records, &self.id_field, &self.modified_field);
        let (records, last_modified) = ctx
            .fetch_with(&request, |body| {
                let records = records_at.take(body)?;
                let last_modified = records
                    .last()
                    .and_then(|r| modified_field.get(r))
                    .and_then(parse_time);
                let keyed = records
                    .into_iter()
                    .map(|record| {
                        let id = id_field
                            .get(&record)
                            .and_then(token_string)
                            .ok_or_else(|| Error::missing_field(id_field.to_string()))?;
                        Ok((id, record))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok((keyed, last_modified))
            })
            .await?;

        if records.is_empty() {
            debug!(page = self.page, "0 results returned, harvester finished");
            self.done = true;
            return Ok(None);
        }

        self.last_modified = last_modified;
        self.page += 1;
        let received = records.len();
        if self.short_page_ends && received < self.page_size {
            self.done = true;
        }
        let page = self.filter_seen(records);
        debug!(received, kept = page.len(), "Windowed page");
        Ok(Some(page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").unwrap()
    }

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time(&json!(1_577_923_200_000_i64)), Some(at("2020-01-02T00:00:00")));
        assert_eq!(parse_time(&json!("2021-03-04T05:06:07.891+00:00")).map(|t| t.date()), Some(at("2021-03-04T00:00:00").date()));
        assert_eq!(parse_time(&json!("2021-03-04T05:06:07")), Some(at("2021-03-04T05:06:07")));
        assert_eq!(parse_time(&json!("yesterday")), None);
        assert_eq!(parse_time(&json!(null)), None);
    }

    #[test]
    fn test_boundary_filters() {
        let stamp = at("2021-03-04T05:06:07");
        assert_eq!(WindowBoundary::BeforeDate.filter(stamp), "before(2021-03-04)");
        let up_to = WindowBoundary::UpTo { field: "created".into() };
        assert_eq!(up_to.filter(stamp), "created:[* TO 2021-03-04T05:06:07]");

        assert_eq!(up_to.step_back(stamp), Some(at("2021-03-04T05:06:06")));
        assert_eq!(
            WindowBoundary::BeforeDate.step_back(stamp),
            Some(at("2021-03-03T00:00:00"))
        );
    }
}
