//! Append-only activity event log.
//!
//! Holds the in-memory log (loaded once from the blob store), validates and
//! sanitizes incoming events, persists in batches, enforces the retention
//! window before every write, and degrades to a fixed-size tail when a write
//! hits the storage quota. Also owns the per-day page-content side table.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tidemark_core::category::{categorize, Category};
use tidemark_core::config::{StorageConfig, TrackerConfig};
use tidemark_core::error::Result;
use tidemark_core::privacy::{PrivacyDecision, PrivacyFilter};
use tidemark_core::types::{
    local_date, truncate_chars, ActivityEvent, DayWindow, EventKind, EventPayload,
    PageContentEntry, RawEvent,
};

use crate::blob::{keys, read_json, write_json, BlobStore};
use crate::content::{merge_page_content, ContentMerge};

/// Tunables for the event store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSettings {
    pub retention_days: u32,
    /// Appends buffered before an automatic flush. Zero and one both flush
    /// on every append.
    pub flush_every: usize,
    pub overflow_tail: usize,
    pub max_content_per_day: usize,
    pub max_title_chars: usize,
}

impl StoreSettings {
    pub fn from_config(storage: &StorageConfig, tracker: &TrackerConfig) -> Self {
        Self {
            retention_days: storage.retention_days,
            flush_every: storage.flush_every,
            overflow_tail: storage.overflow_tail,
            max_content_per_day: storage.max_content_per_day,
            max_title_chars: tracker.max_title_chars,
        }
    }

    fn retention(&self) -> Duration {
        Duration::days(i64::from(self.retention_days))
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self::from_config(&StorageConfig::default(), &TrackerConfig::default())
    }
}

/// Bookkeeping persisted next to the log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreMeta {
    /// Events ever appended, including expired and truncated ones.
    pub total_count: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub last_flush: Option<DateTime<Utc>>,
    /// Number of times the log was cut back to its tail after a quota failure.
    pub truncations: u64,
}

/// Result of offering an event to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Appended { kind: EventKind, domain: String },
    Rejected { reason: String },
}

/// What a flush did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    pub retained: usize,
    pub expired: usize,
    pub truncated: usize,
    pub bytes_written: usize,
}

/// Observability snapshot of the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub count: usize,
    pub total_count: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub estimated_bytes: usize,
    pub pending_writes: usize,
    pub retention_days: u32,
    pub truncations: u64,
}

/// Per-domain rollup of a set of events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainAggregate {
    pub visits: u32,
    pub category: Category,
    pub last_title: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// The append-only event log and page-content side table.
pub struct EventStore {
    blobs: Arc<dyn BlobStore>,
    privacy: PrivacyFilter,
    settings: StoreSettings,
    events: Vec<ActivityEvent>,
    meta: StoreMeta,
    pending: usize,
}

impl EventStore {
    /// Load the log and its metadata from durable storage.
    pub fn load(
        blobs: Arc<dyn BlobStore>,
        privacy: PrivacyFilter,
        settings: StoreSettings,
    ) -> Result<Self> {
        let mut events: Vec<ActivityEvent> =
            read_json(blobs.as_ref(), keys::EVENTS_LOG)?.unwrap_or_default();
        let meta: StoreMeta = read_json(blobs.as_ref(), keys::EVENTS_META)?.unwrap_or_default();

        // Stable: equal timestamps keep their stored order.
        events.sort_by_key(|e| e.timestamp);

        let mut store = Self {
            blobs,
            privacy,
            settings,
            events,
            meta,
            pending: 0,
        };
        store.refresh_bounds();
        store.persist_retention_setting()?;

        info!(
            count = store.events.len(),
            total = store.meta.total_count,
            retention_days = store.settings.retention_days,
            "Event store loaded"
        );
        Ok(store)
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    pub fn events(&self) -> &[ActivityEvent] {
        &self.events
    }

    pub fn meta(&self) -> &StoreMeta {
        &self.meta
    }

    pub fn pending_writes(&self) -> usize {
        self.pending
    }

    /// Apply new settings and privacy rules.
    pub fn reload(&mut self, settings: StoreSettings, privacy: PrivacyFilter) -> Result<()> {
        let retention_changed = settings.retention_days != self.settings.retention_days;
        self.settings = settings;
        self.privacy = privacy;
        if retention_changed {
            self.persist_retention_setting()?;
        }
        Ok(())
    }

    pub fn set_retention_days(&mut self, days: u32) -> Result<()> {
        self.settings.retention_days = days;
        self.persist_retention_setting()
    }

    fn persist_retention_setting(&self) -> Result<()> {
        write_json(
            self.blobs.as_ref(),
            keys::RETENTION_DAYS,
            &self.settings.retention_days,
        )
    }

    // =========================================================================
    // Append
    // =========================================================================

    /// Validate, sanitize, compact and append one event.
    ///
    /// Never fails: malformed input is rejected with a reason, and a failed
    /// batch flush is logged and retried on the next flush.
    pub fn append(&mut self, raw: RawEvent, now: DateTime<Utc>) -> AppendOutcome {
        let event = match self.normalize(raw, now) {
            Ok(event) => event,
            Err(reason) => {
                debug!(reason = %reason, "Event rejected");
                return AppendOutcome::Rejected { reason };
            }
        };

        let kind = event.kind;
        let domain = event.domain.clone();
        self.insert_chronological(event);
        self.meta.total_count += 1;
        self.pending += 1;

        if self.pending >= self.settings.flush_every.max(1) {
            if let Err(e) = self.flush(now) {
                warn!(error = %e, pending = self.pending, "Batch flush failed; will retry");
            }
        }

        AppendOutcome::Appended { kind, domain }
    }

    fn normalize(&self, raw: RawEvent, now: DateTime<Utc>) -> std::result::Result<ActivityEvent, String> {
        let kind = EventKind::parse(&raw.kind)
            .ok_or_else(|| format!("unknown event type '{}'", raw.kind))?;

        let timestamp = raw.timestamp.unwrap_or(now);
        if timestamp <= now - self.settings.retention() {
            return Err("event is older than the retention window".to_string());
        }

        let (url, domain) = match raw.url.as_deref().map(str::trim) {
            _ if kind.is_presence() => (String::new(), String::new()),
            Some(u) if !u.is_empty() => match self.privacy.check(u) {
                PrivacyDecision::Track { url, domain } => (url, domain),
                // A download keeps its file details even when its source is private.
                PrivacyDecision::Skip { .. } if kind == EventKind::DownloadCompleted => {
                    (String::new(), String::new())
                }
                PrivacyDecision::Skip { reason } => return Err(reason),
            },
            _ if matches!(kind, EventKind::Navigation | EventKind::TabActivated) => {
                return Err(format!("{} without url", kind.as_str()));
            }
            _ => (String::new(), String::new()),
        };

        let title = raw
            .title
            .as_deref()
            .map(|t| truncate_chars(t.trim(), self.settings.max_title_chars))
            .unwrap_or_default();

        Ok(ActivityEvent {
            timestamp,
            kind,
            category: categorize(&domain),
            url,
            domain,
            title,
            payload: EventPayload::compact(kind, &raw.payload),
        })
    }

    fn insert_chronological(&mut self, event: ActivityEvent) {
        let ts = event.timestamp;
        match self.events.last() {
            Some(last) if ts < last.timestamp => {
                let idx = self.events.partition_point(|e| e.timestamp <= ts);
                self.events.insert(idx, event);
            }
            _ => self.events.push(event),
        }
        self.meta.oldest = Some(self.meta.oldest.map_or(ts, |o| o.min(ts)));
        self.meta.newest = Some(self.meta.newest.map_or(ts, |n| n.max(ts)));
    }

    fn refresh_bounds(&mut self) {
        self.meta.oldest = self.events.first().map(|e| e.timestamp);
        self.meta.newest = self.events.last().map(|e| e.timestamp);
    }

    // =========================================================================
    // Retention and persistence
    // =========================================================================

    /// Drop every event at or before `now - retention`. Returns how many went.
    pub fn enforce_retention(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.settings.retention();
        let idx = self.events.partition_point(|e| e.timestamp <= cutoff);
        if idx > 0 {
            self.events.drain(..idx);
            self.refresh_bounds();
            debug!(expired = idx, cutoff = %cutoff, "Retention pass dropped events");
        }
        idx
    }

    /// Enforce retention, then persist the log and metadata.
    ///
    /// A quota failure truncates the log to its most recent
    /// `overflow_tail` events and retries exactly once.
    pub fn flush(&mut self, now: DateTime<Utc>) -> Result<FlushReport> {
        let expired = self.enforce_retention(now);
        if let Err(e) = self.prune_content(now) {
            warn!(error = %e, "Failed to prune expired page content");
        }

        self.meta.last_flush = Some(now);
        let mut truncated = 0;
        let bytes_written = match self.persist() {
            Ok(bytes) => bytes,
            Err(e) if e.is_quota() => {
                truncated = self.truncate_to_tail();
                warn!(
                    error = %e,
                    truncated,
                    retained = self.events.len(),
                    "Storage quota hit; retrying with truncated log"
                );
                self.persist()?
            }
            Err(e) => return Err(e),
        };
        self.pending = 0;

        debug!(
            retained = self.events.len(),
            expired,
            truncated,
            bytes_written,
            "Event log flushed"
        );
        Ok(FlushReport {
            retained: self.events.len(),
            expired,
            truncated,
            bytes_written,
        })
    }

    fn persist(&self) -> Result<usize> {
        let raw = serde_json::to_string(&self.events)?;
        self.blobs.put(keys::EVENTS_LOG, &raw)?;
        write_json(self.blobs.as_ref(), keys::EVENTS_META, &self.meta)?;
        Ok(raw.len())
    }

    fn truncate_to_tail(&mut self) -> usize {
        let excess = self.events.len().saturating_sub(self.settings.overflow_tail);
        if excess > 0 {
            self.events.drain(..excess);
            self.meta.truncations += 1;
            self.refresh_bounds();
        }
        excess
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Events inside a calendar-day window, in chronological order.
    pub fn query(&self, window: &DayWindow) -> &[ActivityEvent] {
        let lo = self.events.partition_point(|e| e.timestamp < window.start);
        let hi = self.events.partition_point(|e| e.timestamp < window.end);
        &self.events[lo..hi.max(lo)]
    }

    /// Roll a set of events up by domain. Presence events and events without
    /// a domain are skipped.
    pub fn aggregate_by_domain(events: &[ActivityEvent]) -> BTreeMap<String, DomainAggregate> {
        let mut by_domain: BTreeMap<String, DomainAggregate> = BTreeMap::new();
        for event in events
            .iter()
            .filter(|e| !e.kind.is_presence() && !e.domain.is_empty())
        {
            by_domain
                .entry(event.domain.clone())
                .and_modify(|agg| {
                    agg.visits += 1;
                    agg.first_seen = agg.first_seen.min(event.timestamp);
                    if event.timestamp >= agg.last_seen {
                        agg.last_seen = event.timestamp;
                        if !event.title.is_empty() {
                            agg.last_title = event.title.clone();
                        }
                    }
                })
                .or_insert_with(|| DomainAggregate {
                    visits: 1,
                    category: event.category,
                    last_title: event.title.clone(),
                    first_seen: event.timestamp,
                    last_seen: event.timestamp,
                });
        }
        by_domain
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            count: self.events.len(),
            total_count: self.meta.total_count,
            oldest: self.meta.oldest,
            newest: self.meta.newest,
            estimated_bytes: serde_json::to_string(&self.events)
                .map(|s| s.len())
                .unwrap_or(0),
            pending_writes: self.pending,
            retention_days: self.settings.retention_days,
            truncations: self.meta.truncations,
        }
    }

    // =========================================================================
    // Page content side table
    // =========================================================================

    /// Offer an extracted page to a day's content table.
    pub fn add_page_content(&self, date: NaiveDate, entry: PageContentEntry) -> Result<ContentMerge> {
        let key = keys::content(date);
        let mut entries: Vec<PageContentEntry> =
            read_json(self.blobs.as_ref(), &key)?.unwrap_or_default();
        let url = entry.url.clone();

        let outcome = merge_page_content(&mut entries, entry, self.settings.max_content_per_day);
        if matches!(outcome, ContentMerge::Inserted | ContentMerge::Replaced) {
            write_json(self.blobs.as_ref(), &key, &entries)?;
        }
        debug!(date = %date, url = %url, outcome = ?outcome, "Page content offered");
        Ok(outcome)
    }

    /// A day's content entries, longest dwell first.
    pub fn page_content(&self, date: NaiveDate) -> Result<Vec<PageContentEntry>> {
        Ok(read_json(self.blobs.as_ref(), &keys::content(date))?.unwrap_or_default())
    }

    /// Days that have a content table.
    pub fn content_days(&self) -> Result<Vec<NaiveDate>> {
        Ok(self
            .blobs
            .keys_with_prefix(keys::CONTENT_PREFIX)?
            .iter()
            .filter_map(|k| keys::content_date(k))
            .collect())
    }

    /// Delete content tables for days entirely outside the retention window.
    pub fn prune_content(&self, now: DateTime<Utc>) -> Result<usize> {
        let oldest_kept = local_date(now - self.settings.retention());
        let mut removed = 0;
        for date in self.content_days()? {
            if date < oldest_kept {
                self.blobs.delete(&keys::content(date))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    // =========================================================================
    // Clear
    // =========================================================================

    /// Erase the log, its metadata and every page-content day. Irreversible.
    pub fn clear(&mut self) -> Result<()> {
        let content_keys = self.blobs.keys_with_prefix(keys::CONTENT_PREFIX)?;
        for key in &content_keys {
            self.blobs.delete(key)?;
        }
        self.blobs.delete(keys::EVENTS_LOG)?;
        self.blobs.delete(keys::EVENTS_META)?;

        let dropped = self.events.len();
        self.events.clear();
        self.meta = StoreMeta::default();
        self.pending = 0;

        info!(
            events = dropped,
            content_days = content_keys.len(),
            "Event store cleared"
        );
        Ok(())
    }
}
