//! The "current page" session state machine.
//!
//! At most one session is open at a time. Every page change, idle transition
//! or restart closes it out: the duration is clamped, folded into the dwell
//! accumulator when long enough, and checked for content-worthiness. The
//! tracker is driven entirely by explicit `now` values and never touches the
//! clock itself, so it can be snapshotted, killed and restored at any instant.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use tidemark_core::config::TrackerConfig;
use tidemark_core::privacy::{PrivacyDecision, PrivacyFilter};
use tidemark_core::types::{truncate_chars, SessionHandle};

use crate::dwell::{DwellAccumulator, DwellEntry};

/// Session timing rules.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerSettings {
    pub min_duration_secs: u64,
    pub max_duration_secs: u64,
    pub content_min_secs: u64,
    pub content_max_secs: u64,
    pub resume_grace_secs: u64,
    pub max_title_chars: usize,
}

impl TrackerSettings {
    pub fn from_config(config: &TrackerConfig) -> Self {
        Self {
            min_duration_secs: config.min_duration_secs,
            max_duration_secs: config.max_duration_secs,
            content_min_secs: config.content_min_secs,
            content_max_secs: config.content_max_secs,
            resume_grace_secs: config.resume_grace_secs,
            max_title_chars: config.max_title_chars,
        }
    }
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self::from_config(&TrackerConfig::default())
    }
}

/// The page currently being viewed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub url: String,
    pub domain: String,
    pub title: String,
    pub started_at: DateTime<Utc>,
    pub handle: SessionHandle,
}

/// A session that has just ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedSession {
    pub url: String,
    pub domain: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Duration clamped to `[0, max_duration_secs]`.
    pub duration_secs: u64,
    /// Whether the session was long enough to count toward dwell.
    pub counted: bool,
}

/// Ask the extraction collaborator for the readable content of a page that
/// was just left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRequest {
    pub url: String,
    pub title: String,
    pub handle: SessionHandle,
    pub time_spent_secs: u64,
    pub ended_at: DateTime<Utc>,
}

/// Everything a single tracker transition produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseOut {
    pub closed: Option<ClosedSession>,
    pub content_request: Option<ContentRequest>,
    /// Seconds spent idle, reported when a resume ends an idle period.
    pub away_secs: Option<u64>,
}

/// Durable tracker state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerSnapshot {
    pub session: Option<Session>,
    #[serde(default)]
    pub dwell: DwellAccumulator,
    #[serde(default)]
    pub idle_since: Option<DateTime<Utc>>,
    pub snapshot_at: DateTime<Utc>,
}

/// Single-session tracker with per-domain dwell accounting.
pub struct SessionTracker {
    settings: TrackerSettings,
    privacy: PrivacyFilter,
    session: Option<Session>,
    dwell: DwellAccumulator,
    captured: HashSet<String>,
    /// URLs with a content request out and no result yet.
    capturing: HashSet<String>,
    idle_since: Option<DateTime<Utc>>,
}

impl SessionTracker {
    pub fn new(settings: TrackerSettings, privacy: PrivacyFilter) -> Self {
        Self {
            settings,
            privacy,
            session: None,
            dwell: DwellAccumulator::new(),
            captured: HashSet::new(),
            capturing: HashSet::new(),
            idle_since: None,
        }
    }

    pub fn reload(&mut self, settings: TrackerSettings, privacy: PrivacyFilter) {
        self.settings = settings;
        self.privacy = privacy;
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    pub fn current(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn is_idle(&self) -> bool {
        self.idle_since.is_some()
    }

    pub fn idle_since(&self) -> Option<DateTime<Utc>> {
        self.idle_since
    }

    pub fn dwell(&self) -> &DwellAccumulator {
        &self.dwell
    }

    pub fn dwell_for(&self, domain: &str) -> Option<DwellEntry> {
        self.dwell.get(domain)
    }

    /// Drop the dwell a delivered digest reported. Dwell folded in after
    /// `reported` was taken stays for the next digest.
    pub fn settle_dwell(&mut self, reported: &BTreeMap<String, DwellEntry>) {
        self.dwell.subtract(reported);
    }

    /// Record that `url` had its content captured; it will not be
    /// requested again for the rest of the process lifetime.
    pub fn mark_captured(&mut self, url: &str) {
        self.capturing.remove(url);
        self.captured.insert(url.to_string());
    }

    /// A capture for `url` ended without storing anything. A later visit may
    /// request it again.
    pub fn release_capture(&mut self, url: &str) {
        self.capturing.remove(url);
    }

    pub fn is_captured(&self, url: &str) -> bool {
        self.captured.contains(url)
    }

    pub fn is_capturing(&self, url: &str) -> bool {
        self.capturing.contains(url)
    }

    /// The viewed page changed. Close the current session and open a new one
    /// if `url` may be tracked.
    pub fn on_page_change(
        &mut self,
        url: &str,
        title: &str,
        handle: SessionHandle,
        now: DateTime<Utc>,
    ) -> CloseOut {
        let out = self.close_out(now);
        self.open(url, title, handle, now);
        out
    }

    /// The user went idle or locked the screen.
    pub fn on_idle(&mut self, now: DateTime<Utc>) -> CloseOut {
        let out = self.close_out(now);
        if self.idle_since.is_none() {
            self.idle_since = Some(now);
        }
        out
    }

    /// The user is back. Reports how long they were away and, when the
    /// foreground page is known, opens a session for it.
    pub fn on_resume(
        &mut self,
        page: Option<(&str, &str, SessionHandle)>,
        now: DateTime<Utc>,
    ) -> CloseOut {
        let away_secs = self
            .idle_since
            .take()
            .map(|since| non_negative_secs(now - since));

        let mut out = match page {
            Some((url, title, handle)) => self.on_page_change(url, title, handle, now),
            None => self.close_out(now),
        };
        out.away_secs = away_secs;
        out
    }

    /// Capture durable state as of `now`.
    pub fn snapshot(&self, now: DateTime<Utc>) -> TrackerSnapshot {
        TrackerSnapshot {
            session: self.session.clone(),
            dwell: self.dwell.clone(),
            idle_since: self.idle_since,
            snapshot_at: now,
        }
    }

    /// Reinstate a snapshot taken by a previous process.
    ///
    /// A session whose snapshot is older than `resume_grace_secs` is closed
    /// as ending at the snapshot instant; otherwise it carries on with its
    /// original start time.
    pub fn restore(&mut self, snapshot: TrackerSnapshot, now: DateTime<Utc>) -> Option<ClosedSession> {
        self.dwell = snapshot.dwell;
        self.idle_since = snapshot.idle_since;
        self.session = snapshot.session;

        let gap = now - snapshot.snapshot_at;
        if gap <= Duration::seconds(self.settings.resume_grace_secs as i64) {
            if let Some(session) = &self.session {
                info!(url = %session.url, gap_secs = gap.num_seconds(), "Resumed tracker session");
            }
            return None;
        }

        let closed = self.close_session(snapshot.snapshot_at).map(|(closed, _)| closed);
        if let Some(closed) = &closed {
            info!(
                url = %closed.url,
                duration_secs = closed.duration_secs,
                gap_secs = gap.num_seconds(),
                "Closed stale session from snapshot"
            );
        }
        closed
    }

    fn open(&mut self, url: &str, title: &str, handle: SessionHandle, now: DateTime<Utc>) {
        match self.privacy.check(url) {
            PrivacyDecision::Track { url, domain } => {
                debug!(url = %url, handle = %handle, "Session opened");
                self.session = Some(Session {
                    url,
                    domain,
                    title: truncate_chars(title.trim(), self.settings.max_title_chars),
                    started_at: now,
                    handle,
                });
            }
            PrivacyDecision::Skip { reason } => {
                debug!(reason = %reason, "Page not tracked; no session");
            }
        }
    }

    fn close_out(&mut self, now: DateTime<Utc>) -> CloseOut {
        match self.close_session(now) {
            Some((closed, content_request)) => CloseOut {
                closed: Some(closed),
                content_request,
                away_secs: None,
            },
            None => CloseOut::default(),
        }
    }

    fn close_session(&mut self, ended_at: DateTime<Utc>) -> Option<(ClosedSession, Option<ContentRequest>)> {
        let session = self.session.take()?;

        let raw_secs = non_negative_secs(ended_at - session.started_at);
        let duration_secs = raw_secs.min(self.settings.max_duration_secs);
        let counted = duration_secs >= self.settings.min_duration_secs && !session.domain.is_empty();
        if counted {
            self.dwell.add(&session.domain, duration_secs);
        }

        let content_worthy = (self.settings.content_min_secs..=self.settings.content_max_secs)
            .contains(&raw_secs)
            && !self.captured.contains(&session.url)
            && !self.capturing.contains(&session.url);
        if content_worthy {
            self.capturing.insert(session.url.clone());
        }
        let content_request = content_worthy.then(|| ContentRequest {
            url: session.url.clone(),
            title: session.title.clone(),
            handle: session.handle,
            time_spent_secs: duration_secs,
            ended_at,
        });

        debug!(
            url = %session.url,
            duration_secs,
            counted,
            content_worthy,
            "Session closed"
        );

        Some((
            ClosedSession {
                url: session.url,
                domain: session.domain,
                started_at: session.started_at,
                ended_at,
                duration_secs,
                counted,
            },
            content_request,
        ))
    }
}

fn non_negative_secs(d: Duration) -> u64 {
    d.num_seconds().max(0) as u64
}
