//! Common types used throughout the harvester
//!
//! This module contains shared type definitions and type aliases
//! used across multiple modules.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Type Aliases
// ============================================================================

/// JSON value type (re-exported from serde_json)
pub type JsonValue = serde_json::Value;

/// JSON object type
pub type JsonObject = serde_json::Map<String, JsonValue>;

/// Generic key-value map with string keys and values
pub type StringMap = HashMap<String, String>;

/// One raw harvested record
pub type Record = JsonValue;

/// One batch of records produced by a single strategy step
pub type Page = Vec<Record>;

// ============================================================================
// HTTP Types
// ============================================================================

/// HTTP method used by a page request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    GET,
    POST,
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::GET => reqwest::Method::GET,
            Method::POST => reqwest::Method::POST,
        }
    }
}

/// Body format of an API response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    /// JSON document (default)
    #[default]
    Json,
    /// XML document, converted to a JSON tree with namespaces stripped
    Xml,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_serde() {
        let m: Method = serde_json::from_str("\"POST\"").unwrap();
        assert_eq!(m, Method::POST);
        assert_eq!(reqwest::Method::from(m), reqwest::Method::POST);
    }

    #[test]
    fn test_response_format_default() {
        assert_eq!(ResponseFormat::default(), ResponseFormat::Json);
        let f: ResponseFormat = serde_json::from_str("\"xml\"").unwrap();
        assert_eq!(f, ResponseFormat::Xml);
    }
}
