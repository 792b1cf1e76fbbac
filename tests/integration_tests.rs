//! Integration tests using mock HTTP server
//!
//! Tests the full end-to-end flow: YAML source list → registry → harvester → JSONL files

use opendata_harvester::output::INCOMPLETE_SUFFIX;
use opendata_harvester::{
    Error, HarvestReport, Harvester, RunOutcome, SourceRegistry, SourcesFile,
};
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ============================================================================
// Helpers
// ============================================================================

/// Source list with fast defaults followed by `sources`
fn source_list(sources: &str) -> String {
    format!(
        r"
defaults:
  download_delay: 0
  retry_delays: [0.001, 0.001, 0.001]
sources:
{sources}"
    )
}

async fn harvest(yaml: &str, id: &str, dir: &Path) -> HarvestReport {
    let sources = SourcesFile::from_yaml(yaml).unwrap();
    let registry = SourceRegistry::builtin();
    registry.validate(&sources).unwrap();

    let source = sources.get(id).unwrap();
    let config = sources.to_harvest_config(source, dir).unwrap();
    config.validate().unwrap();
    let strategy = registry.create_for(source).unwrap();
    Harvester::new(config, strategy).run().await.unwrap()
}

fn read_records(path: &Path) -> Vec<Value> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn is_incomplete(path: &Path) -> bool {
    path.to_string_lossy().ends_with(INCOMPLETE_SUFFIX)
}

// ============================================================================
// Complete harvests
// ============================================================================

#[tokio::test]
async fn test_ckan_harvest_to_final_file() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    for (start, ids) in [("0", vec!["a", "b"]), ("2", vec!["c", "d"]), ("4", vec!["e"])] {
        let results: Vec<Value> = ids.iter().map(|id| json!({"name": id})).collect();
        Mock::given(method("GET"))
            .and(path("/api/3/action/package_search"))
            .and(query_param("start", start))
            .and(query_param("rows", "2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"success": true, "result": {"count": 5, "results": results}})),
            )
            .expect(1)
            .mount(&server)
            .await;
    }
    Mock::given(method("GET"))
        .and(query_param("start", "6"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": {"results": []}})))
        .expect(1)
        .mount(&server)
        .await;

    let yaml = source_list(&format!(
        r"
  - id: portal_ckan
    format: ckan3
    api_url: {}/api/
    cache_size: 3
    options:
      rows: 2
",
        server.uri()
    ));
    let report = harvest(&yaml, "portal_ckan", dir.path()).await;

    assert!(report.is_complete(), "{:?}", report.outcome);
    assert!(!is_incomplete(&report.output_path));
    assert_eq!(report.records, 5);
    let names: Vec<Value> = read_records(&report.output_path)
        .into_iter()
        .map(|r| r["name"].clone())
        .collect();
    assert_eq!(names, vec!["a", "b", "c", "d", "e"]);
}

#[tokio::test]
async fn test_oai_pmh_harvest_follows_tokens() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/oai"))
        .and(query_param("verb", "ListRecords"))
        .and(query_param("metadataPrefix", "oai_dc"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <ListRecords>
    <record><header><identifier>oai:1</identifier></header></record>
    <record><header><identifier>oai:2</identifier></header></record>
    <resumptionToken completeListSize="3">tok-1</resumptionToken>
  </ListRecords>
</OAI-PMH>"#,
        ))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/oai"))
        .and(query_param("resumptionToken", "tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<OAI-PMH><ListRecords>
    <record><header><identifier>oai:3</identifier></header></record>
    <resumptionToken completeListSize="3"/>
  </ListRecords></OAI-PMH>"#,
        ))
        .expect(1)
        .mount(&server)
        .await;

    let yaml = source_list(&format!(
        r"
  - id: repo
    format: oai-pmh
    api_url: {}/oai
",
        server.uri()
    ));
    let report = harvest(&yaml, "repo", dir.path()).await;

    assert!(report.is_complete(), "{:?}", report.outcome);
    let records = read_records(&report.output_path);
    assert_eq!(records.len(), 3);
    assert_eq!(records[2]["header"]["identifier"], "oai:3");
}

#[tokio::test]
async fn test_xml_lines_harvest() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    let body = r#"<?xml version="1.0"?>
<rdf:RDF xmlns:rdf="http://www.w3.org/1999/02/22-rdf-syntax-ns#" xmlns:dcat="http://www.w3.org/ns/dcat#" xmlns:dct="http://purl.org/dc/terms/">
<dcat:Dataset rdf:about="https://example.org/d/1">
  <dct:title>First</dct:title>
</dcat:Dataset>
<dcat:Dataset rdf:about="https://example.org/d/2">
  <dct:title>Second</dct:title>
</dcat:Dataset>
</rdf:RDF>
"#;
    Mock::given(method("GET"))
        .and(path("/catalog.rdf"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .expect(1)
        .mount(&server)
        .await;

    let yaml = source_list(&format!(
        r"
  - id: rdf_dump
    format: xml-lines
    api_url: {}/catalog.rdf
    options:
      resource_element: dcat:Dataset
",
        server.uri()
    ));
    let report = harvest(&yaml, "rdf_dump", dir.path()).await;

    assert!(report.is_complete(), "{:?}", report.outcome);
    let records = read_records(&report.output_path);
    assert_eq!(records.len(), 2);
    assert_eq!(records[1]["Dataset"]["title"], "Second");
}

// ============================================================================
// Incomplete harvests
// ============================================================================

#[tokio::test]
async fn test_failed_oai_set_keeps_incomplete_suffix() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(query_param("set", "good"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<OAI-PMH><ListRecords><record><id>g1</id></record></ListRecords></OAI-PMH>",
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("set", "flaky"))
        .respond_with(ResponseTemplate::new(502))
        .expect(4)
        .mount(&server)
        .await;

    let yaml = source_list(&format!(
        r"
  - id: multi_set
    format: oai-pmh
    api_url: {}
    options:
      collection_set: [flaky, good]
",
        server.uri()
    ));
    let report = harvest(&yaml, "multi_set", dir.path()).await;

    assert!(matches!(report.outcome, RunOutcome::SoftFailed));
    assert!(is_incomplete(&report.output_path));
    assert_eq!(read_records(&report.output_path), vec![json!({"id": "g1"})]);
}

#[tokio::test]
async fn test_oai_error_reply_keeps_incomplete_suffix() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(query_param("metadataPrefix", "oai_dc"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<OAI-PMH><ListRecords>
    <record><header><identifier>oai:1</identifier></header></record>
    <record><header><identifier>oai:2</identifier></header></record>
    <resumptionToken>tok-1</resumptionToken>
  </ListRecords></OAI-PMH>"#,
        ))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("resumptionToken", "tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<OAI-PMH><error code="badResumptionToken">The token has expired</error></OAI-PMH>"#,
        ))
        .expect(4)
        .mount(&server)
        .await;

    let yaml = source_list(&format!(
        r"
  - id: repo
    format: oai-pmh
    api_url: {}
",
        server.uri()
    ));
    let report = harvest(&yaml, "repo", dir.path()).await;

    assert!(matches!(
        report.outcome.error(),
        Some(Error::MissingField { .. })
    ));
    assert!(is_incomplete(&report.output_path));
    assert_eq!(report.records, 2);
    assert_eq!(read_records(&report.output_path).len(), 2);
}

#[tokio::test]
async fn test_terminal_status_is_not_retried() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;

    let yaml = source_list(&format!(
        r"
  - id: forbidden
    format: magda
    api_url: {}
",
        server.uri()
    ));
    let report = harvest(&yaml, "forbidden", dir.path()).await;

    assert_eq!(
        report.outcome.error().and_then(Error::status_code),
        Some(403)
    );
    assert!(is_incomplete(&report.output_path));
    assert_eq!(fs::metadata(&report.output_path).unwrap().len(), 0);
}

#[tokio::test]
async fn test_record_ceiling_from_source_list() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("start", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"items": [{"id": 1}, {"id": 2}, {"id": 3}]}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("start", "3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"items": [{"id": 4}, {"id": 5}, {"id": 6}]}
        })))
        .mount(&server)
        .await;

    let yaml = source_list(&format!(
        r"
  - id: capped
    format: dataverse
    api_url: {}
    cache_size: 3
    max_size: 4
    options:
      rows: 3
",
        server.uri()
    ));
    let report = harvest(&yaml, "capped", dir.path()).await;

    assert!(matches!(
        report.outcome.error(),
        Some(Error::TooMuchData { .. })
    ));
    assert!(is_incomplete(&report.output_path));
    assert_eq!(report.records, 3);
}

#[tokio::test]
async fn test_oversized_single_document() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    let items: Vec<Value> = (0..100).map(|i| json!({"id": i, "pad": "x".repeat(20)})).collect();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(Value::Array(items)))
        .expect(1)
        .mount(&server)
        .await;

    let yaml = source_list(&format!(
        r"
  - id: dump
    format: single-json
    api_url: {}/all.json
    max_size: 512
",
        server.uri()
    ));
    let report = harvest(&yaml, "dump", dir.path()).await;

    assert!(matches!(
        report.outcome.error(),
        Some(Error::TooMuchData { .. })
    ));
    assert!(is_incomplete(&report.output_path));
}

#[tokio::test]
async fn test_empty_portal_fails_with_no_results() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": {"results": []}})))
        .expect(1)
        .mount(&server)
        .await;

    let yaml = source_list(&format!(
        r"
  - id: empty
    format: ckan3
    api_url: {}
",
        server.uri()
    ));
    let report = harvest(&yaml, "empty", dir.path()).await;

    assert!(matches!(report.outcome.error(), Some(Error::NoResults)));
    let files: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(files.len(), 1);
    assert!(is_incomplete(&report.output_path));
}

// ============================================================================
// Source list validation
// ============================================================================

#[test]
fn test_source_list_rejects_bad_options_up_front() {
    let yaml = source_list(
        r"
  - id: fine
    format: ckan3
    api_url: http://a.example
  - id: broken
    format: elasticsearch-scroll
    api_url: http://b.example/_search
",
    );
    let sources = SourcesFile::from_yaml(&yaml).unwrap();
    let err = SourceRegistry::builtin().validate(&sources).unwrap_err();

    assert!(matches!(err, Error::InvalidOptions { .. }));
    assert!(err.to_string().contains("scroll_url"));
}
