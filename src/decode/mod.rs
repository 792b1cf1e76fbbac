//! Response decoder module
//!
//! Supports: text charsets, XML trees, field paths
//!
//! # Overview
//!
//! The decode module turns raw response bodies into values the pagination
//! strategies can walk. XML documents are converted into the same
//! `serde_json::Value` shape as JSON responses so that every strategy
//! locates records with a [`FieldPath`], whatever the wire format.

mod charset;
mod path;
mod xml;

pub use charset::{charset_from_content_type, decode_text, encoding_for_label};
pub use path::FieldPath;
pub use xml::{
    decode_entities, limit_depth, parse_xml, replace_invalid, strip_namespaces, XML_DEPTH_LIMIT,
};

#[cfg(test)]
mod tests;
