//! Tests for decoder module

use super::*;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use test_case::test_case;

// ============================================================================
// Charset Tests
// ============================================================================

#[test_case("text/xml; charset=ISO-8859-1", Some("ISO-8859-1"); "plain")]
#[test_case("application/json;charset=\"utf-8\"", Some("utf-8"); "quoted")]
#[test_case("text/html; Charset=windows-1252; q=1", Some("windows-1252"); "mixed case")]
#[test_case("application/json", None; "absent")]
fn test_charset_from_content_type(content_type: &str, expected: Option<&str>) {
    assert_eq!(charset_from_content_type(content_type), expected);
}

#[test]
fn test_decode_text_uses_content_type() {
    let bytes = b"caf\xe9";
    assert_eq!(
        decode_text(bytes, None, Some("text/plain; charset=ISO-8859-1")),
        "café"
    );
}

#[test]
fn test_decode_text_fixed_encoding_wins() {
    let bytes = b"caf\xe9";
    let latin1 = encoding_for_label("latin1");
    assert_eq!(
        decode_text(bytes, latin1, Some("text/plain; charset=utf-8")),
        "café"
    );
}

#[test]
fn test_decode_text_invalid_bytes_replaced() {
    let text = decode_text(b"ok \xff\xfe end", None, None);
    assert!(text.starts_with("ok "));
    assert!(text.contains('\u{fffd}'));
}

// ============================================================================
// XML Tests
// ============================================================================

#[test]
fn test_parse_simple_document() {
    let xml = r#"<?xml version="1.0"?>
<catalog>
  <title>Open data</title>
  <empty/>
  <dataset id="1">first</dataset>
  <dataset id="2"><name>second</name></dataset>
</catalog>"#;

    let value = parse_xml(xml).unwrap();
    assert_eq!(
        value,
        json!({
            "catalog": {
                "title": "Open data",
                "empty": null,
                "dataset": [
                    {"@id": "1", "#text": "first"},
                    {"@id": "2", "name": "second"}
                ]
            }
        })
    );
}

#[test]
fn test_parse_entities_cdata_and_comments() {
    let xml = "<!DOCTYPE r [<!ENTITY x \"y\">]><r><!-- skip --><a>a &amp; b &#233; &#x41;</a>\
               <b><![CDATA[<raw> & text]]></b></r>";
    let value = parse_xml(xml).unwrap();
    assert_eq!(value["r"]["a"], "a & b é A");
    assert_eq!(value["r"]["b"], "<raw> & text");
}

#[test]
fn test_parse_quoted_gt_in_attribute() {
    let value = parse_xml(r#"<r expr="a > b" other='x'/>"#).unwrap();
    assert_eq!(value, json!({"r": {"@expr": "a > b", "@other": "x"}}));
}

#[test_case("<r><a></r>"; "mismatched")]
#[test_case("<r>"; "unclosed")]
#[test_case("</r>"; "stray close")]
#[test_case("<r/><s/>"; "two roots")]
#[test_case("just text"; "no root")]
#[test_case("<r>&bogus;</r>"; "undefined entity")]
#[test_case("<r a=1/>"; "unquoted attribute")]
#[test_case(""; "empty")]
fn test_parse_errors(xml: &str) {
    let err = parse_xml(xml).unwrap_err();
    assert!(err.is_parse(), "expected parse error, got {err}");
}

#[test]
fn test_limit_depth_clears_deep_containers() {
    let mut value = json!({"a": {"b": {"c": {"d": 1}}, "list": [[1, 2]]}});
    limit_depth(&mut value, 3);
    assert_eq!(value, json!({"a": {"b": {"c": {}}, "list": [[]]}}));
}

#[test]
fn test_deeply_nested_document_is_clamped() {
    let depth = 2000;
    let xml = format!("{}x{}", "<n>".repeat(depth), "</n>".repeat(depth));
    let mut value = parse_xml(&xml).unwrap();
    limit_depth(&mut value, XML_DEPTH_LIMIT);

    let mut level = 1;
    let mut current = &value;
    while let Some(next) = current.get("n") {
        current = next;
        level += 1;
    }
    assert!(level <= XML_DEPTH_LIMIT + 1);
    assert_eq!(current, &json!({}));
}

#[test]
fn test_strip_namespaces() {
    let value = json!({
        "rdf:RDF": {
            "@xmlns:rdf": "http://www.w3.org/1999/02/22-rdf-syntax-ns#",
            "@xsi:schemaLocation": "somewhere",
            "@rdf:about": "x",
            "dcat:Catalog": {
                "dct:title": {"#text": "Catalog", "@xmlns:dct": "http://purl.org/dc/terms/"},
                "dc:title": "Duplicate"
            }
        }
    });

    assert_eq!(
        strip_namespaces(value),
        json!({
            "RDF": {
                "@about": "x",
                "Catalog": {
                    "title": "Catalog",
                    "title_1": "Duplicate"
                }
            }
        })
    );
}

#[test]
fn test_replace_invalid() {
    let pattern = regex::Regex::new(r"[\x00-\x08]").unwrap();
    assert_eq!(replace_invalid("a\u{1}b", &pattern), "a\u{fffd}b");
}

// ============================================================================
// FieldPath Tests
// ============================================================================

#[test]
fn test_field_path_from_dotted_and_nested() {
    let dotted: FieldPath = serde_json::from_value(json!("result.results")).unwrap();
    let nested: FieldPath = serde_json::from_value(json!({"result": "results"})).unwrap();
    assert_eq!(dotted, nested);
    assert_eq!(dotted.to_string(), "result.results");

    let deep: FieldPath = serde_json::from_value(json!({"RDF": {"Catalog": "dataset"}})).unwrap();
    assert_eq!(deep.segments(), &["RDF", "Catalog", "dataset"]);

    assert!(serde_json::from_value::<FieldPath>(json!({"a": 1, "b": 2})).is_err());
}

#[test]
fn test_field_path_get() {
    let value = json!({"meta": {"next": "/api/layers/?offset=10", "empty": null}});
    assert_eq!(
        FieldPath::parse("meta.next").get(&value),
        Some(&json!("/api/layers/?offset=10"))
    );
    assert_eq!(FieldPath::parse("meta.empty").get(&value), None);
    assert_eq!(FieldPath::parse("meta.missing").get(&value), None);
    assert_eq!(FieldPath::parse("").get(&value), Some(&value));
}

#[test]
fn test_field_path_extract_maps_over_arrays() {
    let value = json!({
        "data": [
            {"links": {"url": "a"}},
            {"links": {}},
            "not an object",
            {"links": {"url": "b"}}
        ]
    });
    let urls = FieldPath::parse("data.links.url").extract(value).unwrap();
    assert_eq!(urls, json!(["a", "b"]));
}

#[test]
fn test_field_path_require() {
    let err = FieldPath::parse("hits.hits")
        .require(json!({"hits": {}}))
        .unwrap_err();
    assert!(err.is_extraction());

    let hits = FieldPath::parse("hits.hits")
        .require(json!({"hits": {"hits": []}}))
        .unwrap();
    assert_eq!(hits, Value::Array(vec![]));
}
