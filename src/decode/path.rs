//! Field paths into decoded responses

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// A nested location inside a decoded response
///
/// Written either as a dotted string (`"result.results"`) or as a nested
/// single-key map (`{result: results}`). Traversing an array applies the
/// remaining path to each object item and drops the items where it leads
/// nowhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Parse a dotted path
    pub fn parse(path: &str) -> Self {
        Self {
            segments: path
                .split('.')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    /// Build a path from its segments
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Path segments
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// True for the path pointing at the value itself
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Borrow the value at this path, following objects only
    pub fn get<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(value, |current, segment| current.get(segment.as_str()))
            .filter(|v| !v.is_null())
    }

    /// True when the path exists, even if it holds null
    ///
    /// An empty XML element decodes to null and still counts as present.
    pub fn exists(&self, value: &Value) -> bool {
        self.segments
            .iter()
            .try_fold(value, |current, segment| current.get(segment.as_str()))
            .is_some()
    }

    /// Move the value at this path out of `value`, mapping over arrays
    pub fn extract(&self, value: Value) -> Option<Value> {
        extract(value, &self.segments)
    }

    /// Like [`FieldPath::extract`] but a missing value is an error
    pub fn require(&self, value: Value) -> Result<Value> {
        self.extract(value)
            .ok_or_else(|| Error::missing_field(self.to_string()))
    }
}

fn extract(value: Value, segments: &[String]) -> Option<Value> {
    let Some((segment, rest)) = segments.split_first() else {
        return (!value.is_null()).then_some(value);
    };

    match value {
        Value::Object(mut map) => extract(map.remove(segment)?, rest),
        Value::Array(items) => {
            let found: Vec<Value> = items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(mut map) => map.remove(segment),
                    _ => None,
                })
                .filter_map(|child| extract(child, rest))
                .collect();
            (!found.is_empty()).then_some(Value::Array(found))
        }
        _ => None,
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

impl From<&str> for FieldPath {
    fn from(path: &str) -> Self {
        Self::parse(path)
    }
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FieldPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        let mut segments = Vec::new();
        collect_segments(&raw, &mut segments).map_err(serde::de::Error::custom)?;
        Ok(Self { segments })
    }
}

fn collect_segments(raw: &Value, segments: &mut Vec<String>) -> std::result::Result<(), String> {
    match raw {
        Value::String(path) => {
            segments.extend(FieldPath::parse(path).segments);
            Ok(())
        }
        Value::Array(items) => items
            .iter()
            .try_for_each(|item| collect_segments(item, segments)),
        Value::Object(map) if map.len() == 1 => {
            let (key, nested) = map.iter().next().ok_or("empty field path")?;
            segments.push(key.clone());
            collect_segments(nested, segments)
        }
        other => Err(format!(
            "field path must be a string or a single-key map, got {other}"
        )),
    }
}
