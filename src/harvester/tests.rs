//! Tests for harvester module

use super::*;
use crate::http::HttpRequest;
use crate::pagination::{OffsetPaginator, RecordsAt, StopCondition};
use crate::types::Page;
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ============================================================================
// Helpers
// ============================================================================

enum Step {
    Page(Page),
    Fail(Error),
    SoftFail,
    Hang,
}

/// Strategy replaying a fixed script
struct Scripted {
    steps: VecDeque<Step>,
    single: bool,
}

impl Scripted {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: steps.into(),
            single: false,
        }
    }

    fn single(mut self) -> Self {
        self.single = true;
        self
    }
}

#[async_trait]
impl PaginationStrategy for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    fn is_single_request(&self) -> bool {
        self.single
    }

    async fn next_page(&mut self, ctx: &mut PageContext<'_>) -> Result<Option<Page>> {
        loop {
            match self.steps.pop_front() {
                None => return Ok(None),
                Some(Step::Page(page)) => return Ok(Some(page)),
                Some(Step::Fail(err)) => return Err(err),
                Some(Step::SoftFail) => ctx.mark_failed(),
                Some(Step::Hang) => std::future::pending::<()>().await,
            }
        }
    }
}

fn page(ids: &[u64]) -> Step {
    Step::Page(ids.iter().map(|id| json!({"id": id})).collect())
}

fn config(dir: &Path) -> HarvestConfig {
    HarvestConfig::new("portal", "http://127.0.0.1:9/api", dir)
        .with_download_delay(Duration::ZERO)
        .with_retry_delays(vec![Duration::from_millis(1); 3])
        .with_cancel_grace(Duration::ZERO)
}

fn read_ids(path: &Path) -> Vec<u64> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str::<Value>(line).unwrap()["id"].as_u64().unwrap())
        .collect()
}

fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

// ============================================================================
// Completion
// ============================================================================

#[tokio::test]
async fn test_complete_run_finalizes_file() {
    let dir = TempDir::new().unwrap();
    let strategy = Scripted::new(vec![page(&[1, 2]), page(&[3, 4]), page(&[5])]);

    let report = Harvester::new(config(dir.path()).with_cache_size(2), Box::new(strategy))
        .run()
        .await
        .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.records, 5);
    assert_eq!(report.pages, 3);
    assert_eq!(report.source_id, "portal");
    assert!(report.output_path.to_string_lossy().ends_with(".jsonl"));
    assert_eq!(read_ids(&report.output_path), vec![1, 2, 3, 4, 5]);

    let names = files_in(dir.path());
    assert_eq!(names.len(), 1);
    assert!(names[0].starts_with("portal_"));
    assert!(!names[0].ends_with(INCOMPLETE_SUFFIX));
}

#[tokio::test]
async fn test_empty_pages_between_data_are_kept_going() {
    let dir = TempDir::new().unwrap();
    let strategy = Scripted::new(vec![page(&[1]), Step::Page(Vec::new()), page(&[2])]);

    let report = Harvester::new(config(dir.path()), Box::new(strategy))
        .run()
        .await
        .unwrap();

    assert!(report.is_complete());
    assert_eq!(read_ids(&report.output_path), vec![1, 2]);
}

// ============================================================================
// Duplicate guard
// ============================================================================

#[tokio::test]
async fn test_repeated_first_record_fails_after_first_page() {
    let dir = TempDir::new().unwrap();
    let strategy = Scripted::new(vec![page(&[1, 2]), page(&[1, 3]), page(&[9])]);

    let report = Harvester::new(config(dir.path()), Box::new(strategy))
        .run()
        .await
        .unwrap();

    assert!(matches!(
        report.outcome.error(),
        Some(Error::UnexpectedData { .. })
    ));
    assert!(report.output_path.to_string_lossy().ends_with(INCOMPLETE_SUFFIX));
    assert_eq!(read_ids(&report.output_path), vec![1, 2]);
}

#[tokio::test]
async fn test_repeated_first_record_allowed_when_configured() {
    let dir = TempDir::new().unwrap();
    let strategy = Scripted::new(vec![page(&[1, 2]), page(&[1, 3])]);

    let report = Harvester::new(
        config(dir.path()).with_repeating_data(true),
        Box::new(strategy),
    )
    .run()
    .await
    .unwrap();

    assert!(report.is_complete());
    assert_eq!(read_ids(&report.output_path), vec![1, 2, 1, 3]);
}

#[tokio::test]
async fn test_single_request_strategy_skips_duplicate_check() {
    let dir = TempDir::new().unwrap();
    let strategy = Scripted::new(vec![page(&[7]), page(&[7])]).single();

    let report = Harvester::new(config(dir.path()), Box::new(strategy))
        .run()
        .await
        .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.records, 2);
}

#[tokio::test]
async fn test_single_request_config_skips_duplicate_check() {
    let dir = TempDir::new().unwrap();
    let strategy = Scripted::new(vec![page(&[7]), page(&[7])]);

    let report = Harvester::new(
        config(dir.path()).with_single_request(true),
        Box::new(strategy),
    )
    .run()
    .await
    .unwrap();

    assert!(report.is_complete());
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test]
async fn test_zero_results_leave_empty_incomplete_file() {
    let dir = TempDir::new().unwrap();
    let strategy = Scripted::new(vec![Step::Page(Vec::new())]);

    let report = Harvester::new(config(dir.path()), Box::new(strategy))
        .run()
        .await
        .unwrap();

    assert!(matches!(report.outcome.error(), Some(Error::NoResults)));
    assert!(report.output_path.exists());
    assert_eq!(fs::metadata(&report.output_path).unwrap().len(), 0);
    assert!(files_in(dir.path())[0].ends_with(INCOMPLETE_SUFFIX));
}

#[tokio::test]
async fn test_record_ceiling_discards_overflowing_batch() {
    let dir = TempDir::new().unwrap();
    let strategy = Scripted::new(vec![page(&[1, 2]), page(&[3, 4]), page(&[5])]);

    let report = Harvester::new(
        config(dir.path()).with_cache_size(2).with_max_size(3),
        Box::new(strategy),
    )
    .run()
    .await
    .unwrap();

    assert!(matches!(
        report.outcome.error(),
        Some(Error::TooMuchData { .. })
    ));
    assert_eq!(read_ids(&report.output_path), vec![1, 2]);
    assert!(report.output_path.to_string_lossy().ends_with(INCOMPLETE_SUFFIX));
}

#[tokio::test]
async fn test_fatal_error_keeps_buffered_records() {
    let dir = TempDir::new().unwrap();
    let strategy = Scripted::new(vec![
        page(&[1]),
        page(&[2]),
        Step::Fail(Error::status(403, "forbidden")),
    ]);

    let report = Harvester::new(config(dir.path()).with_cache_size(100), Box::new(strategy))
        .run()
        .await
        .unwrap();

    assert!(!report.is_complete());
    assert_eq!(report.outcome.error().and_then(Error::status_code), Some(403));
    assert_eq!(report.records, 2);
    assert_eq!(read_ids(&report.output_path), vec![1, 2]);
}

#[tokio::test]
async fn test_soft_failure_keeps_incomplete_suffix() {
    let dir = TempDir::new().unwrap();
    let strategy = Scripted::new(vec![page(&[1]), Step::SoftFail, page(&[2])]);

    let report = Harvester::new(config(dir.path()), Box::new(strategy))
        .run()
        .await
        .unwrap();

    assert!(matches!(report.outcome, RunOutcome::SoftFailed));
    assert_eq!(report.records, 2);
    assert!(report.output_path.to_string_lossy().ends_with(INCOMPLETE_SUFFIX));
}

#[tokio::test]
async fn test_invalid_session_config_fails_with_file_created() {
    let dir = TempDir::new().unwrap();
    let strategy = Scripted::new(vec![page(&[1])]);

    let report = Harvester::new(
        config(dir.path()).with_encoding("no-such-charset"),
        Box::new(strategy),
    )
    .run()
    .await
    .unwrap();

    assert!(matches!(report.outcome.error(), Some(Error::Config { .. })));
    assert!(report.output_path.exists());
    assert_eq!(report.pages, 0);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancellation_is_propagated() {
    let dir = TempDir::new().unwrap();
    let strategy = Scripted::new(vec![page(&[1]), Step::Hang]);
    let cancel = CancellationToken::new();

    let harvester = Harvester::new(config(dir.path()), Box::new(strategy));
    let handle = tokio::spawn(harvester.run_until_cancelled(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let result = handle.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(files_in(dir.path())[0].ends_with(INCOMPLETE_SUFFIX));
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let dir = TempDir::new().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = Harvester::new(config(dir.path()), Box::new(Scripted::new(vec![page(&[1])])))
        .run_until_cancelled(cancel)
        .await;

    assert!(matches!(result, Err(Error::Cancelled)));
}

// ============================================================================
// Retry budget
// ============================================================================

#[tokio::test]
async fn test_budget_refilled_between_pages() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    // Each page needs the full budget of three retries
    for start in ["0", "2"] {
        Mock::given(method("GET"))
            .and(path("/items"))
            .and(query_param("start", start))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(3)
            .mount(&server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path("/items"))
        .and(query_param("start", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}, {"id": 2}])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/items"))
        .and(query_param("start", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 3}])))
        .mount(&server)
        .await;

    let strategy = OffsetPaginator::new(
        HttpRequest::get(format!("{}/items", server.uri())),
        "start",
        "rows",
        2,
        RecordsAt::root(),
    )
    .stopping(StopCondition::ShortPage);
    let config = HarvestConfig::new("budget", server.uri(), dir.path())
        .with_download_delay(Duration::ZERO)
        .with_retry_delays(vec![Duration::from_millis(1); 3]);

    let report = Harvester::new(config, Box::new(strategy)).run().await.unwrap();

    assert!(report.is_complete(), "{:?}", report.outcome);
    assert_eq!(read_ids(&report.output_path), vec![1, 2, 3]);
}
