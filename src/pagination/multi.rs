//! Multi-endpoint sequential pagination
//!
//! Harvests several sections one after the other, each with its own
//! strategy and cursor.

use super::types::{PageContext, PaginationStrategy};
use crate::error::Result;
use crate::types::Page;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, info};

/// One section of a multi-endpoint harvest
pub struct Section {
    /// Label written into every record of the section when tagging is on
    pub label: Option<String>,
    /// Strategy producing the section's pages
    pub strategy: Box<dyn PaginationStrategy>,
}

impl Section {
    /// A section without a label
    pub fn new(strategy: Box<dyn PaginationStrategy>) -> Self {
        Self {
            label: None,
            strategy,
        }
    }

    /// A labelled section
    pub fn labelled(label: impl Into<String>, strategy: Box<dyn PaginationStrategy>) -> Self {
        Self {
            label: Some(label.into()),
            strategy,
        }
    }
}

/// Runs sections in order until all are exhausted
///
/// With `soft_fail` a section that fails with a recoverable error is
/// abandoned, the run is marked as failed and the next section starts.
/// Without it the error ends the harvest.
pub struct MultiEndpointPaginator {
    /// Sections, harvested front to back
    pub sections: Vec<Section>,
    /// Record field receiving the section label
    pub tag_field: Option<String>,
    /// Carry on with the next section after a recoverable failure
    pub soft_fail: bool,
    current: usize,
    announced: bool,
}

impl MultiEndpointPaginator {
    /// Create a paginator over `sections`
    pub fn new(sections: Vec<Section>) -> Self {
        Self {
            sections,
            tag_field: None,
            soft_fail: false,
            current: 0,
            announced: false,
        }
    }

    /// Write each section's label into its records under `field`
    #[must_use]
    pub fn tagged(mut self, field: impl Into<String>) -> Self {
        self.tag_field = Some(field.into());
        self
    }

    /// Keep going after a section fails
    #[must_use]
    pub fn soft_fail(mut self, soft_fail: bool) -> Self {
        self.soft_fail = soft_fail;
        self
    }
}

fn tag(page: &mut Page, field: &str, label: &str) {
    for record in page.iter_mut() {
        if let Value::Object(map) = record {
            map.insert(field.to_string(), Value::String(label.to_string()));
        }
    }
}

#[async_trait]
impl PaginationStrategy for MultiEndpointPaginator {
    fn name(&self) -> &str {
        "multi_endpoint"
    }

    async fn next_page(&mut self, ctx: &mut PageContext<'_>) -> Result<Option<Page>> {
        loop {
            let multiple = self.sections.len() > 1;
            let Some(section) = self.sections.get_mut(self.current) else {
                return Ok(None);
            };
            let label = section.label.clone().unwrap_or_else(|| self.current.to_string());

            if multiple && !self.announced {
                info!(section = %label, "Starting to harvest section");
                self.announced = true;
            }

            match section.strategy.next_page(ctx).await {
                Ok(Some(mut page)) => {
                    if let (Some(field), Some(label)) = (&self.tag_field, &section.label) {
                        tag(&mut page, field, label);
                    }
                    return Ok(Some(page));
                }
                Ok(None) => {}
                Err(err) if self.soft_fail && err.is_recoverable() => {
                    error!(section = %label, error = %err, "Harvesting of section failed");
                    ctx.mark_failed();
                    ctx.reset_budget();
                }
                Err(err) => return Err(err),
            }

            self.current += 1;
            self.announced = false;
        }
    }
}
