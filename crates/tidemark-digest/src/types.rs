use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use tidemark_core::types::{ActivityEvent, PageContentEntry};
use tidemark_tracker::DwellEntry;

/// Everything a digest for one day is built from.
#[derive(Debug, Clone, PartialEq)]
pub struct DigestInput {
    pub date: NaiveDate,
    /// The day's events in chronological order.
    pub events: Vec<ActivityEvent>,
    pub dwell: BTreeMap<String, DwellEntry>,
    pub content: Vec<PageContentEntry>,
}

/// A rendered digest plus the metadata delivery sinks receive with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestReport {
    pub date: NaiveDate,
    pub text: String,
    pub event_count: usize,
    pub domain_count: usize,
    pub content_count: usize,
    pub generated_at: DateTime<Utc>,
}

/// Who asked for a digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestTrigger {
    /// The daily alarm. Honors the already-sent guard.
    Scheduled,
    /// An explicit request. Bypasses the already-sent guard.
    Manual,
}

/// Result of one digest run. Only `Delivered` marks the day as sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DigestOutcome {
    AlreadySent {
        date: NaiveDate,
    },
    NoEvents {
        date: NaiveDate,
    },
    NotConfigured {
        date: NaiveDate,
    },
    DeliveryFailed {
        date: NaiveDate,
        errors: Vec<String>,
    },
    Delivered {
        date: NaiveDate,
        delivered_to: Vec<String>,
        failed: Vec<String>,
        event_count: usize,
    },
}

impl DigestOutcome {
    pub fn date(&self) -> NaiveDate {
        match self {
            DigestOutcome::AlreadySent { date }
            | DigestOutcome::NoEvents { date }
            | DigestOutcome::NotConfigured { date }
            | DigestOutcome::DeliveryFailed { date, .. }
            | DigestOutcome::Delivered { date, .. } => *date,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, DigestOutcome::Delivered { .. })
    }

    /// Whether a scheduled day is done with. Failed or unconfigured
    /// deliveries stay pending and are tried again.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            DigestOutcome::AlreadySent { .. } | DigestOutcome::NoEvents { .. } | DigestOutcome::Delivered { .. }
        )
    }
}

/// Read-only digest state for UI surfaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestStatus {
    pub enabled: bool,
    pub last_sent: Option<NaiveDate>,
    pub next_run_at: Option<DateTime<Utc>>,
    /// Scheduled days still waiting for a successful delivery.
    pub pending: Vec<NaiveDate>,
    pub sinks: Vec<String>,
}
