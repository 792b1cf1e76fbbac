//! XML to JSON tree conversion
//!
//! Converts an XML document into a [`Value`] tree:
//!
//! - the document becomes `{root_tag: root_value}`
//! - an element with neither attributes nor children becomes its text, or
//!   `null` when empty
//! - attributes become `@name` keys, mixed text becomes `#text`
//! - repeated child elements are collected into an array
//!
//! Comments, processing instructions and the doctype are skipped, CDATA is
//! kept as text.

use crate::error::{Error, Result};
use regex::Regex;
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::sync::LazyLock;

/// Nesting bound applied to every XML response
pub const XML_DEPTH_LIMIT: usize = 50;

/// Elements nested deeper than this are parsed but not materialised
const MAX_TREE_DEPTH: usize = 512;

static XMLNS_ATTRIBUTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(^@xmlns)|(^@xsi:schemaLocation)").unwrap());

static NAMESPACE_PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(@)?(.*?:)").unwrap());

// ============================================================================
// Parsing
// ============================================================================

struct Frame {
    name: String,
    children: Map<String, Value>,
    has_content: bool,
    text: String,
    keep: bool,
}

impl Frame {
    fn new(name: String, attributes: Vec<(String, String)>, keep: bool) -> Self {
        let has_content = !attributes.is_empty();
        let mut children = Map::new();
        if keep {
            for (key, value) in attributes {
                children.insert(format!("@{key}"), Value::String(value));
            }
        }
        Self {
            name,
            children,
            has_content,
            text: String::new(),
            keep,
        }
    }

    fn add_child(&mut self, name: String, value: Value) {
        self.has_content = true;
        match self.children.get_mut(&name) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                self.children.insert(name, value);
            }
        }
    }

    fn finish(mut self) -> Value {
        let text = self.text.trim();
        if !self.has_content {
            return if text.is_empty() {
                Value::Null
            } else {
                Value::String(text.to_string())
            };
        }
        if !text.is_empty() {
            self.children
                .insert("#text".to_string(), Value::String(text.to_string()));
        }
        Value::Object(self.children)
    }
}

/// Parse an XML document into a JSON tree
pub fn parse_xml(input: &str) -> Result<Value> {
    let mut stack: Vec<Frame> = Vec::new();
    let mut root: Option<(String, Value)> = None;
    let mut rest = input.trim_start_matches('\u{feff}');

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("<?") {
            rest = skip_past(after, "?>", "processing instruction")?;
        } else if let Some(after) = rest.strip_prefix("<!--") {
            rest = skip_past(after, "-->", "comment")?;
        } else if let Some(after) = rest.strip_prefix("<![CDATA[") {
            let end = after
                .find("]]>")
                .ok_or_else(|| Error::xml("unterminated CDATA section"))?;
            let frame = stack
                .last_mut()
                .ok_or_else(|| Error::xml("CDATA outside the root element"))?;
            frame.text.push_str(&after[..end]);
            rest = &after[end + 3..];
        } else if let Some(after) = rest.strip_prefix("<!") {
            rest = skip_declaration(after)?;
        } else if let Some(after) = rest.strip_prefix("</") {
            let end = after
                .find('>')
                .ok_or_else(|| Error::xml("unterminated closing tag"))?;
            let name = after[..end].trim();
            let frame = stack
                .pop()
                .ok_or_else(|| Error::xml(format!("unexpected closing tag </{name}>")))?;
            if frame.name != name {
                return Err(Error::xml(format!(
                    "mismatched tag: expected </{}>, found </{name}>",
                    frame.name
                )));
            }
            close_element(frame, &mut stack, &mut root);
            rest = &after[end + 1..];
        } else if let Some(after) = rest.strip_prefix('<') {
            let end = find_tag_end(after)?;
            let (body, self_closing) = match after[..end].strip_suffix('/') {
                Some(body) => (body, true),
                None => (&after[..end], false),
            };
            let (name, attributes) = parse_tag(body)?;
            if root.is_some() {
                return Err(Error::xml(format!("junk after document element: <{name}>")));
            }
            let keep = stack.len() < MAX_TREE_DEPTH && stack.last().map_or(true, |f| f.keep);
            let frame = Frame::new(name, attributes, keep);
            if self_closing {
                close_element(frame, &mut stack, &mut root);
            } else {
                stack.push(frame);
            }
            rest = &after[end + 1..];
        } else {
            let end = rest.find('<').unwrap_or(rest.len());
            let text = &rest[..end];
            match stack.last_mut() {
                Some(frame) => {
                    if frame.keep {
                        frame.text.push_str(&decode_entities(text)?);
                    }
                }
                None if text.trim().is_empty() => {}
                None => return Err(Error::xml("text outside the root element")),
            }
            rest = &rest[end..];
        }
    }

    if let Some(frame) = stack.last() {
        return Err(Error::xml(format!("unclosed element <{}>", frame.name)));
    }

    let (name, value) = root.ok_or_else(|| Error::xml("no root element found"))?;
    let mut document = Map::new();
    document.insert(name, value);
    Ok(Value::Object(document))
}

fn close_element(
    frame: Frame,
    stack: &mut [Frame],
    root: &mut Option<(String, Value)>,
) {
    let keep = frame.keep;
    let name = frame.name.clone();
    let value = if keep { frame.finish() } else { Value::Null };
    match stack.last_mut() {
        Some(parent) => {
            if keep {
                parent.add_child(name, value);
            } else {
                parent.has_content = true;
            }
        }
        None => *root = Some((name, value)),
    }
}

fn skip_past<'a>(input: &'a str, terminator: &str, what: &str) -> Result<&'a str> {
    input
        .find(terminator)
        .map(|end| &input[end + terminator.len()..])
        .ok_or_else(|| Error::xml(format!("unterminated {what}")))
}

/// Skip a `<!DOCTYPE ...>` declaration, internal subset included
fn skip_declaration(input: &str) -> Result<&str> {
    let mut depth = 0usize;
    for (i, c) in input.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            '>' if depth == 0 => return Ok(&input[i + 1..]),
            _ => {}
        }
    }
    Err(Error::xml("unterminated declaration"))
}

/// Position of the `>` closing a start tag, quoted `>` ignored
fn find_tag_end(input: &str) -> Result<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in input.char_indices() {
        match (quote, c) {
            (None, '"' | '\'') => quote = Some(c),
            (Some(q), _) if c == q => quote = None,
            (None, '>') => return Ok(i),
            _ => {}
        }
    }
    Err(Error::xml("unterminated start tag"))
}

fn parse_tag(body: &str) -> Result<(String, Vec<(String, String)>)> {
    let body = body.trim();
    let name_end = body
        .find(|c: char| c.is_whitespace())
        .unwrap_or(body.len());
    let name = &body[..name_end];
    if name.is_empty() {
        return Err(Error::xml("empty tag name"));
    }

    let mut attributes = Vec::new();
    let mut rest = body[name_end..].trim_start();
    while !rest.is_empty() {
        let eq = rest
            .find('=')
            .ok_or_else(|| Error::xml(format!("attribute without value in <{name}>")))?;
        let key = rest[..eq].trim();
        let after = rest[eq + 1..].trim_start();
        let quote = after
            .chars()
            .next()
            .filter(|c| *c == '"' || *c == '\'')
            .ok_or_else(|| Error::xml(format!("unquoted attribute '{key}' in <{name}>")))?;
        let value_end = after[1..]
            .find(quote)
            .ok_or_else(|| Error::xml(format!("unterminated attribute '{key}' in <{name}>")))?;
        let value = decode_entities(&after[1..=value_end])?;
        attributes.push((key.to_string(), value.into_owned()));
        rest = after[value_end + 2..].trim_start();
    }

    Ok((name.to_string(), attributes))
}

/// Replace character and predefined entity references
pub fn decode_entities(text: &str) -> Result<Cow<'_, str>> {
    if !text.contains('&') {
        return Ok(Cow::Borrowed(text));
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after
            .find(';')
            .ok_or_else(|| Error::xml("unterminated entity reference"))?;
        let entity = &after[..end];
        let decoded = match entity {
            "lt" => '<',
            "gt" => '>',
            "amp" => '&',
            "quot" => '"',
            "apos" => '\'',
            _ => {
                let code = if let Some(hex) = entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                {
                    u32::from_str_radix(hex, 16).ok()
                } else if let Some(dec) = entity.strip_prefix('#') {
                    dec.parse::<u32>().ok()
                } else {
                    None
                };
                code.and_then(char::from_u32)
                    .ok_or_else(|| Error::xml(format!("undefined entity &{entity};")))?
            }
        };
        out.push(decoded);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(Cow::Owned(out))
}

// ============================================================================
// Post-processing
// ============================================================================

/// Empty every container nested deeper than `limit` levels
///
/// The document itself is level 1.
pub fn limit_depth(value: &mut Value, limit: usize) {
    clamp(value, 1, limit);
}

fn clamp(value: &mut Value, level: usize, limit: usize) {
    match value {
        Value::Object(map) => {
            if level > limit {
                map.clear();
                return;
            }
            for child in map.values_mut() {
                clamp(child, level + 1, limit);
            }
        }
        Value::Array(items) => {
            if level > limit {
                items.clear();
                return;
            }
            for child in items {
                clamp(child, level + 1, limit);
            }
        }
        _ => {}
    }
}

/// Drop namespace information from a converted XML tree
///
/// `@xmlns*` and `@xsi:schemaLocation` attributes are removed, `prefix:`
/// is stripped from every key, and objects left holding only `#text`
/// collapse to that text. Keys that collide after stripping get `_1`,
/// `_2`, ... suffixes.
pub fn strip_namespaces(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, child) in map {
                if XMLNS_ATTRIBUTE.is_match(&key) {
                    continue;
                }
                let stripped = NAMESPACE_PREFIX.replace(&key, "$1").into_owned();
                let key = unique_key(stripped, &out);
                out.insert(key, strip_namespaces(child));
            }
            if out.len() == 1 && out.contains_key("#text") {
                return out.remove("#text").unwrap_or(Value::Null);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(strip_namespaces).collect()),
        other => other,
    }
}

fn unique_key(key: String, existing: &Map<String, Value>) -> String {
    if !existing.contains_key(&key) {
        return key;
    }
    (1..)
        .map(|n| format!("{key}_{n}"))
        .find(|candidate| !existing.contains_key(candidate))
        .unwrap_or(key)
}

/// Replace every match of `pattern` with U+FFFD
pub fn replace_invalid(text: &str, pattern: &Regex) -> String {
    pattern.replace_all(text, "\u{fffd}").into_owned()
}
