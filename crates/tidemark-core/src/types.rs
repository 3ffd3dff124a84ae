use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::category::Category;

// =============================================================================
// Enums
// =============================================================================

/// The closed set of activity kinds the event log accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "navigation")]
    Navigation,
    #[serde(rename = "tab.activated")]
    TabActivated,
    #[serde(rename = "bookmark.created")]
    BookmarkCreated,
    #[serde(rename = "download.completed")]
    DownloadCompleted,
    #[serde(rename = "idle")]
    Idle,
    #[serde(rename = "user.comeback")]
    UserComeback,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Navigation,
        EventKind::TabActivated,
        EventKind::BookmarkCreated,
        EventKind::DownloadCompleted,
        EventKind::Idle,
        EventKind::UserComeback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Navigation => "navigation",
            Self::TabActivated => "tab.activated",
            Self::BookmarkCreated => "bookmark.created",
            Self::DownloadCompleted => "download.completed",
            Self::Idle => "idle",
            Self::UserComeback => "user.comeback",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// Idle transitions carry no page visit.
    pub fn is_presence(&self) -> bool {
        matches!(self, Self::Idle | Self::UserComeback)
    }
}

/// Device idle state as reported by the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleState {
    #[default]
    Active,
    Idle,
    Locked,
}

// =============================================================================
// Events
// =============================================================================

/// Kind-specific event data, reduced to the fields worth keeping.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    #[default]
    Empty,
    Navigation {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transition: Option<String>,
    },
    Bookmark {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        folder: Option<String>,
    },
    Download {
        filename: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size_bytes: Option<u64>,
    },
    Idle {
        state: IdleState,
    },
    Comeback {
        away_secs: u64,
    },
}

impl EventPayload {
    /// Keep only the fields relevant to `kind`; everything else is discarded.
    pub fn compact(kind: EventKind, raw: &serde_json::Value) -> Self {
        match kind {
            EventKind::Navigation => EventPayload::Navigation {
                transition: str_field(raw, &["transition", "transitionType"]),
            },
            EventKind::TabActivated => EventPayload::Empty,
            EventKind::BookmarkCreated => EventPayload::Bookmark {
                folder: str_field(raw, &["folder", "parentTitle"]),
            },
            EventKind::DownloadCompleted => EventPayload::Download {
                filename: str_field(raw, &["filename"])
                    .map(|f| base_name(&f).to_string())
                    .unwrap_or_default(),
                mime: str_field(raw, &["mime", "mimeType"]),
                size_bytes: u64_field(raw, &["size_bytes", "fileSize", "totalBytes"]),
            },
            EventKind::Idle => EventPayload::Idle {
                state: match str_field(raw, &["state"]).as_deref() {
                    Some("locked") => IdleState::Locked,
                    _ => IdleState::Idle,
                },
            },
            EventKind::UserComeback => EventPayload::Comeback {
                away_secs: u64_field(raw, &["away_secs"])
                    .or_else(|| u64_field(raw, &["away_ms", "awayMs"]).map(|ms| ms / 1000))
                    .unwrap_or(0),
            },
        }
    }
}

fn str_field(raw: &serde_json::Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| raw.get(*k).and_then(|v| v.as_str()))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn u64_field(raw: &serde_json::Value, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|k| {
        let v = raw.get(*k)?;
        v.as_u64()
            .or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
    })
}

/// Strip any directory components from a download path.
fn base_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// An activity signal as received, before validation and sanitization.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RawEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            ..Self::default()
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// A stored activity event. Immutable once appended.
///
/// `url` and `domain` have always passed privacy sanitization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub domain: String,
    pub category: Category,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub payload: EventPayload,
}

// =============================================================================
// Sessions and page content
// =============================================================================

/// Opaque identifier of the tab (or frame) a session is displayed in.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SessionHandle(pub i64);

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Descriptive metadata found on an extracted page.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageMeta {
    pub title: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub publish_date: Option<String>,
}

/// Readable content returned by the extraction collaborator.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedPage {
    pub text: String,
    #[serde(default)]
    pub meta: PageMeta,
    #[serde(default)]
    pub word_count: usize,
}

/// One day's stored content for a single URL.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PageContentEntry {
    pub url: String,
    pub title: String,
    pub time_spent_secs: u64,
    pub text: String,
    #[serde(default)]
    pub meta: PageMeta,
    #[serde(default)]
    pub word_count: usize,
    pub captured_at: DateTime<Utc>,
}

// =============================================================================
// Calendar helpers
// =============================================================================

/// The `[start, end)` instant range covering one calendar day in some zone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DayWindow {
    pub date: NaiveDate,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DayWindow {
    /// The window of `date` in the host's local time zone.
    pub fn local(date: NaiveDate) -> Self {
        Self::in_zone(date, &Local)
    }

    pub fn in_zone<Tz: TimeZone>(date: NaiveDate, tz: &Tz) -> Self {
        let next = date.succ_opt().unwrap_or(date);
        Self {
            date,
            start: zone_midnight(date, tz),
            end: zone_midnight(next, tz),
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

fn zone_midnight<Tz: TimeZone>(date: NaiveDate, tz: &Tz) -> DateTime<Utc> {
    let naive = date.and_time(NaiveTime::MIN);
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| naive.and_utc())
}

/// The local calendar day an instant falls on.
pub fn local_date(ts: DateTime<Utc>) -> NaiveDate {
    ts.with_timezone(&Local).date_naive()
}

/// Truncate to at most `max` characters without splitting a code point.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
