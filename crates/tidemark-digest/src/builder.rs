//! Daily digest generation.

use chrono::{DateTime, Utc};

use tidemark_core::config::DigestConfig;

use crate::aggregate::summarize;
use crate::render::render;
use crate::types::{DigestInput, DigestReport};

/// Turns one day's input into a rendered report.
#[derive(Debug, Clone)]
pub struct DigestBuilder {
    top_domains: usize,
}

impl DigestBuilder {
    pub fn new(top_domains: usize) -> Self {
        Self { top_domains }
    }

    pub fn from_config(config: &DigestConfig) -> Self {
        Self::new(config.top_domains)
    }

    /// Aggregate and render. Pure; the caller decides whether the day is
    /// worth building at all.
    pub fn build(&self, input: &DigestInput, generated_at: DateTime<Utc>) -> DigestReport {
        let summary = summarize(input, self.top_domains);
        DigestReport {
            date: input.date,
            text: render(input.date, &summary),
            event_count: input.events.len(),
            domain_count: summary.domain_count,
            content_count: input.content.len(),
            generated_at,
        }
    }
}

impl Default for DigestBuilder {
    fn default() -> Self {
        Self::from_config(&DigestConfig::default())
    }
}
