//! Day-level aggregation.
//!
//! Reduces one day's events, dwell totals and page content into the
//! figures the report shows. Pure; rendering lives in `render`.

use std::collections::BTreeMap;

use chrono::{Local, Timelike};

use tidemark_core::category::Category;
use tidemark_core::types::{EventKind, EventPayload, PageContentEntry};
use tidemark_storage::EventStore;

use crate::types::DigestInput;

const DOMAINS_PER_CATEGORY: usize = 3;
const PEAK_HOURS: usize = 3;

/// One "Top Sites" row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteLine {
    pub domain: String,
    pub visits: u32,
    pub dwell_secs: Option<u64>,
}

/// One category row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryLine {
    pub category: Category,
    pub visits: u32,
    pub top_domains: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookmarkLine {
    pub title: String,
    pub url: String,
    pub folder: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadLine {
    pub filename: String,
    pub size_bytes: Option<u64>,
}

/// Aggregated figures for one day.
#[derive(Debug, Clone, PartialEq)]
pub struct DaySummary {
    pub active_secs: u64,
    /// True when `active_secs` is the first-to-last event span rather than
    /// measured dwell.
    pub active_estimated: bool,
    pub domain_count: usize,
    pub top_sites: Vec<SiteLine>,
    pub categories: Vec<CategoryLine>,
    pub bookmarks: Vec<BookmarkLine>,
    pub downloads: Vec<DownloadLine>,
    /// Page content, longest dwell first.
    pub reading: Vec<PageContentEntry>,
    /// `(local hour, event count)`, busiest first.
    pub peak_hours: Vec<(u32, usize)>,
    pub page_loads: usize,
    pub comebacks: usize,
}

/// Aggregate a day. `top_n` bounds the "Top Sites" list.
pub fn summarize(input: &DigestInput, top_n: usize) -> DaySummary {
    let by_domain = EventStore::aggregate_by_domain(&input.events);

    let mut ranked: Vec<_> = by_domain.iter().collect();
    ranked.sort_by(|(da, a), (db, b)| b.visits.cmp(&a.visits).then_with(|| da.cmp(db)));

    let top_sites = ranked
        .iter()
        .take(top_n)
        .map(|(domain, agg)| SiteLine {
            domain: (*domain).clone(),
            visits: agg.visits,
            dwell_secs: input
                .dwell
                .get(domain.as_str())
                .map(|d| d.total_secs)
                .filter(|secs| *secs > 0),
        })
        .collect();

    let mut per_category: BTreeMap<Category, CategoryLine> = BTreeMap::new();
    for (domain, agg) in &ranked {
        if agg.category.is_generic() {
            continue;
        }
        let line = per_category.entry(agg.category).or_insert_with(|| CategoryLine {
            category: agg.category,
            visits: 0,
            top_domains: Vec::new(),
        });
        line.visits += agg.visits;
        // `ranked` is already by visits, so the first few seen are the top ones.
        if line.top_domains.len() < DOMAINS_PER_CATEGORY {
            line.top_domains.push((*domain).clone());
        }
    }
    let mut categories: Vec<CategoryLine> = per_category.into_values().collect();
    categories.sort_by(|a, b| {
        b.visits
            .cmp(&a.visits)
            .then_with(|| a.category.label().cmp(b.category.label()))
    });

    let mut bookmarks = Vec::new();
    let mut downloads = Vec::new();
    let mut hours: BTreeMap<u32, usize> = BTreeMap::new();
    let mut page_loads = 0;
    let mut comebacks = 0;

    for event in &input.events {
        match event.kind {
            EventKind::BookmarkCreated => bookmarks.push(BookmarkLine {
                title: if event.title.is_empty() {
                    event.url.clone()
                } else {
                    event.title.clone()
                },
                url: event.url.clone(),
                folder: match &event.payload {
                    EventPayload::Bookmark { folder } => folder.clone(),
                    _ => None,
                },
            }),
            EventKind::DownloadCompleted => {
                if let EventPayload::Download {
                    filename,
                    size_bytes,
                    ..
                } = &event.payload
                {
                    downloads.push(DownloadLine {
                        filename: filename.clone(),
                        size_bytes: *size_bytes,
                    });
                }
            }
            EventKind::Navigation => page_loads += 1,
            EventKind::UserComeback => comebacks += 1,
            EventKind::TabActivated | EventKind::Idle => {}
        }
        if !event.kind.is_presence() {
            *hours
                .entry(event.timestamp.with_timezone(&Local).hour())
                .or_default() += 1;
        }
    }

    let mut peak_hours: Vec<(u32, usize)> = hours.into_iter().collect();
    peak_hours.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    peak_hours.truncate(PEAK_HOURS);

    let mut reading = input.content.clone();
    reading.sort_by(|a, b| b.time_spent_secs.cmp(&a.time_spent_secs));

    let dwell_secs: u64 = input.dwell.values().map(|d| d.total_secs).sum();
    let (active_secs, active_estimated) = if dwell_secs > 0 {
        (dwell_secs, false)
    } else {
        let span = match (input.events.first(), input.events.last()) {
            (Some(first), Some(last)) => (last.timestamp - first.timestamp).num_seconds().max(0) as u64,
            _ => 0,
        };
        (span, true)
    };

    DaySummary {
        active_secs,
        active_estimated,
        domain_count: by_domain.len(),
        top_sites,
        categories,
        bookmarks,
        downloads,
        reading,
        peak_hours,
        page_loads,
        comebacks,
    }
}
