//! Streaming element splitting
//!
//! Very large XML documents are read line by line. Lines between an
//! opening and a closing tag of the resource element are collected and
//! parsed as one record, so the whole document never sits in memory.

use super::types::{PageContext, PaginationStrategy};
use crate::decode::strip_namespaces;
use crate::error::{Error, Result};
use crate::http::RequestConfig;
use crate::types::{Page, ResponseFormat};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::debug;

/// Splits a line stream into one record per resource element
///
/// Not retried: a stream consumed halfway cannot be replayed without
/// writing its first part twice.
pub struct StreamingPaginator {
    /// Document location
    pub url: String,
    /// Extra query parameters and headers
    pub config: RequestConfig,
    /// Resource element name, prefix included (e.g. `dcat:Dataset`)
    pub element: String,
    lines: Option<BoxStream<'static, Result<String>>>,
    element_text: Option<String>,
    line_number: usize,
    done: bool,
}

impl StreamingPaginator {
    /// Create a paginator for `element` over the document at `url`
    pub fn new(url: impl Into<String>, element: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            config: RequestConfig::default(),
            element: element.into(),
            lines: None,
            element_text: None,
            line_number: 0,
            done: false,
        }
    }

    fn opens(&self, line: &str) -> bool {
        line.contains(&format!("<{} ", self.element)) || line.contains(&format!("<{}>", self.element))
    }

    fn closes(&self, line: &str) -> bool {
        line.contains(&format!("</{}>", self.element))
    }

    /// Feed one line; returns the element text once it is complete
    fn push_line(&mut self, line: &str) -> Result<Option<String>> {
        let opens = self.opens(line);
        let closes = self.closes(line);

        if opens {
            if self.element_text.is_some() {
                return Err(Error::unexpected(
                    "Found opening element while already in element",
                ));
            }
            self.element_text = Some(String::new());
        } else if closes && self.element_text.is_none() {
            return Err(Error::unexpected("Found closing element outside element"));
        }

        if let Some(text) = &mut self.element_text {
            text.push_str(line);
            text.push('\n');
        }

        Ok(if closes { self.element_text.take() } else { None })
    }
}

#[async_trait]
impl PaginationStrategy for StreamingPaginator {
    fn name(&self) -> &str {
        "streaming"
    }

    fn is_single_request(&self) -> bool {
        true
    }

    async fn next_page(&mut self, ctx: &mut PageContext<'_>) -> Result<Option<Page>> {
        if self.done {
            return Ok(None);
        }
        if self.lines.is_none() {
            self.lines = Some(ctx.lines(&self.url, &self.config).await?);
        }

        loop {
            let next = match self.lines.as_mut() {
                Some(lines) => lines.next().await,
                None => None,
            };
            let Some(line) = next else {
                self.done = true;
                self.lines = None;
                if self.element_text.is_some() {
                    return Err(Error::unexpected("Stream ended inside an element"));
                }
                return Ok(None);
            };

            let line = line?;
            self.line_number += 1;
            if self.line_number % 10_000 == 0 {
                debug!(lines = self.line_number, "Received lines");
            }

            if let Some(text) = self.push_line(&line)? {
                let record = ctx.client().parse_body(ResponseFormat::Xml, &text)?;
                return Ok(Some(vec![strip_namespaces(record)]));
            }
        }
    }
}
