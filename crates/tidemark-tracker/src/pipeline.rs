//! The single writer.
//!
//! `ActivityPipeline` owns the session tracker and the event store and is
//! the only thing that mutates either. Browser signals are handled one at a
//! time to completion; content capture runs outside the lock and reports
//! back when it finishes.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tidemark_core::config::TidemarkConfig;
use tidemark_core::error::Result;
use tidemark_core::privacy::PrivacyFilter;
use tidemark_core::types::{local_date, EventKind, IdleState, RawEvent, SessionHandle};
use tidemark_storage::blob::{read_json, write_json};
use tidemark_storage::content::ContentMerge;
use tidemark_storage::{keys, AppendOutcome, BlobStore, EventStore, FlushReport, StoreSettings};

use crate::capture::{CaptureOutcome, CaptureSettings, ContentCapture};
use crate::dwell::DwellEntry;
use crate::session::{
    ClosedSession, CloseOut, ContentRequest, SessionTracker, TrackerSettings, TrackerSnapshot,
};

/// A browser activity signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Signal {
    #[serde(rename = "navigation")]
    Navigation {
        url: String,
        #[serde(default)]
        title: String,
        #[serde(default)]
        handle: SessionHandle,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
        #[serde(default)]
        payload: Value,
    },
    #[serde(rename = "tab.activated")]
    TabActivated {
        url: String,
        #[serde(default)]
        title: String,
        #[serde(default)]
        handle: SessionHandle,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    #[serde(rename = "bookmark.created")]
    BookmarkCreated {
        url: String,
        #[serde(default)]
        title: String,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
        #[serde(default)]
        payload: Value,
    },
    #[serde(rename = "download.completed")]
    DownloadCompleted {
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
        #[serde(default)]
        payload: Value,
    },
    /// Idle state transition. On `active` the foreground page, when known,
    /// starts a new session.
    #[serde(rename = "idle.changed")]
    IdleChanged {
        state: IdleState,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        title: String,
        #[serde(default)]
        handle: SessionHandle,
    },
}

impl Signal {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Signal::Navigation { timestamp, .. }
            | Signal::TabActivated { timestamp, .. }
            | Signal::BookmarkCreated { timestamp, .. }
            | Signal::DownloadCompleted { timestamp, .. }
            | Signal::IdleChanged { timestamp, .. } => *timestamp,
        }
    }
}

/// What handling one signal did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SignalOutcome {
    pub accepted: usize,
    pub rejected: Vec<String>,
    pub closed: Option<ClosedSession>,
    pub away_secs: Option<u64>,
    pub content_requests: Vec<ContentRequest>,
}

/// Owner of all mutable tracking state.
pub struct ActivityPipeline {
    tracker: SessionTracker,
    store: EventStore,
    blobs: Arc<dyn BlobStore>,
    capture_settings: CaptureSettings,
}

impl ActivityPipeline {
    /// Load the event store and restore the tracker from its last snapshot.
    pub fn open(config: &TidemarkConfig, blobs: Arc<dyn BlobStore>, now: DateTime<Utc>) -> Result<Self> {
        let privacy = PrivacyFilter::new(config.privacy.clone());
        let store = EventStore::load(
            blobs.clone(),
            privacy.clone(),
            StoreSettings::from_config(&config.storage, &config.tracker),
        )?;

        let mut tracker = SessionTracker::new(TrackerSettings::from_config(&config.tracker), privacy);
        if let Some(snapshot) = read_json::<TrackerSnapshot>(blobs.as_ref(), keys::TRACKER_SNAPSHOT)? {
            tracker.restore(snapshot, now);
        }

        Ok(Self {
            tracker,
            store,
            blobs,
            capture_settings: CaptureSettings::from_config(&config.tracker),
        })
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut EventStore {
        &mut self.store
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut SessionTracker {
        &mut self.tracker
    }

    pub fn blobs(&self) -> Arc<dyn BlobStore> {
        self.blobs.clone()
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        self.capture_settings
    }

    pub fn dwell_totals(&self) -> BTreeMap<String, DwellEntry> {
        self.tracker.dwell().totals().clone()
    }

    /// Apply a new configuration to every component.
    pub fn reload(&mut self, config: &TidemarkConfig) -> Result<()> {
        let privacy = PrivacyFilter::new(config.privacy.clone());
        self.tracker
            .reload(TrackerSettings::from_config(&config.tracker), privacy.clone());
        self.store.reload(
            StoreSettings::from_config(&config.storage, &config.tracker),
            privacy,
        )?;
        self.capture_settings = CaptureSettings::from_config(&config.tracker);
        info!("Pipeline configuration reloaded");
        Ok(())
    }

    /// Handle one signal to completion.
    pub fn handle(&mut self, signal: Signal, now: DateTime<Utc>) -> SignalOutcome {
        let at = signal.timestamp().unwrap_or(now);
        let mut outcome = SignalOutcome::default();

        match signal {
            Signal::Navigation {
                url,
                title,
                handle,
                payload,
                ..
            } => {
                self.page_change(&url, &title, handle, at, now, &mut outcome);
                let raw = RawEvent::new(EventKind::Navigation)
                    .url(url)
                    .title(title)
                    .payload(payload)
                    .at(at);
                self.append(raw, now, &mut outcome);
            }
            Signal::TabActivated {
                url, title, handle, ..
            } => {
                self.page_change(&url, &title, handle, at, now, &mut outcome);
                let raw = RawEvent::new(EventKind::TabActivated)
                    .url(url)
                    .title(title)
                    .at(at);
                self.append(raw, now, &mut outcome);
            }
            Signal::BookmarkCreated {
                url,
                title,
                payload,
                ..
            } => {
                let raw = RawEvent::new(EventKind::BookmarkCreated)
                    .url(url)
                    .title(title)
                    .payload(payload)
                    .at(at);
                self.append(raw, now, &mut outcome);
            }
            Signal::DownloadCompleted { url, payload, .. } => {
                let mut raw = RawEvent::new(EventKind::DownloadCompleted)
                    .payload(payload)
                    .at(at);
                raw.url = url;
                self.append(raw, now, &mut outcome);
            }
            Signal::IdleChanged {
                state: IdleState::Active,
                url,
                title,
                handle,
                ..
            } => {
                let page = url.as_deref().map(|u| (u, title.as_str(), handle));
                if self.tracker.is_idle() {
                    let close = self.tracker.on_resume(page, at);
                    self.absorb(close, at, now, &mut outcome);
                } else if let Some((u, t, h)) = page.filter(|_| self.tracker.current().is_none()) {
                    let close = self.tracker.on_page_change(u, t, h, at);
                    self.absorb(close, at, now, &mut outcome);
                }
            }
            Signal::IdleChanged { state, .. } => {
                let close = self.tracker.on_idle(at);
                self.absorb(close, at, now, &mut outcome);
                let raw = RawEvent::new(EventKind::Idle)
                    .payload(json!({ "state": state }))
                    .at(at);
                self.append(raw, now, &mut outcome);
            }
        }

        outcome
    }

    /// A navigation while idle doubles as the user coming back.
    fn page_change(
        &mut self,
        url: &str,
        title: &str,
        handle: SessionHandle,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
        outcome: &mut SignalOutcome,
    ) {
        let close = if self.tracker.is_idle() {
            self.tracker.on_resume(Some((url, title, handle)), at)
        } else {
            self.tracker.on_page_change(url, title, handle, at)
        };
        self.absorb(close, at, now, outcome);
    }

    fn absorb(&mut self, close: CloseOut, at: DateTime<Utc>, now: DateTime<Utc>, outcome: &mut SignalOutcome) {
        if let Some(away_secs) = close.away_secs {
            let raw = RawEvent::new(EventKind::UserComeback)
                .payload(json!({ "away_secs": away_secs }))
                .at(at);
            self.append(raw, now, outcome);
            outcome.away_secs = Some(away_secs);
        }
        if close.closed.is_some() {
            outcome.closed = close.closed;
        }
        outcome.content_requests.extend(close.content_request);
    }

    fn append(&mut self, raw: RawEvent, now: DateTime<Utc>, outcome: &mut SignalOutcome) {
        match self.store.append(raw, now) {
            AppendOutcome::Appended { .. } => outcome.accepted += 1,
            AppendOutcome::Rejected { reason } => outcome.rejected.push(reason),
        }
    }

    /// Store the result of a finished capture.
    pub fn record_capture(
        &mut self,
        request: &ContentRequest,
        outcome: CaptureOutcome,
    ) -> Result<Option<ContentMerge>> {
        let entry = match outcome {
            CaptureOutcome::Captured(entry) => entry,
            other => {
                debug!(url = %request.url, outcome = ?other, "Nothing captured");
                self.tracker.release_capture(&request.url);
                return Ok(None);
            }
        };
        match self.store.add_page_content(local_date(request.ended_at), entry) {
            Ok(merge) => {
                self.tracker.mark_captured(&request.url);
                Ok(Some(merge))
            }
            Err(e) => {
                self.tracker.release_capture(&request.url);
                Err(e)
            }
        }
    }

    pub fn persist_snapshot(&self, now: DateTime<Utc>) -> Result<()> {
        write_json(
            self.blobs.as_ref(),
            keys::TRACKER_SNAPSHOT,
            &self.tracker.snapshot(now),
        )
    }

    /// Periodic housekeeping: flush the store and snapshot the tracker.
    /// Both run even when the other fails.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<FlushReport> {
        let flushed = self.store.flush(now);
        let snapshot = self.persist_snapshot(now);
        let report = flushed?;
        snapshot?;
        Ok(report)
    }

    /// Final flush and snapshot before the process exits. The open session
    /// stays open so a quick restart resumes it.
    pub fn shutdown(&mut self, now: DateTime<Utc>) -> Result<()> {
        let report = self.tick(now)?;
        info!(retained = report.retained, "Pipeline flushed for shutdown");
        Ok(())
    }
}

/// Shared handle to the pipeline plus the capture runner.
#[derive(Clone)]
pub struct SharedPipeline {
    inner: Arc<Mutex<ActivityPipeline>>,
    capture: Arc<ContentCapture>,
}

impl SharedPipeline {
    pub fn new(pipeline: ActivityPipeline, capture: ContentCapture) -> Self {
        Self {
            inner: Arc::new(Mutex::new(pipeline)),
            capture: Arc::new(capture),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, ActivityPipeline> {
        self.inner.lock().await
    }

    /// Handle a signal now and start any content captures it triggered.
    pub async fn submit(&self, signal: Signal) -> SignalOutcome {
        let (outcome, settings) = {
            let mut pipeline = self.inner.lock().await;
            (pipeline.handle(signal, Utc::now()), pipeline.capture_settings())
        };
        for request in &outcome.content_requests {
            self.spawn_capture(request.clone(), settings);
        }
        outcome
    }

    fn spawn_capture(&self, request: ContentRequest, settings: CaptureSettings) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let capture = self.capture.clone();
        tokio::spawn(async move {
            let result = capture.capture(&request, settings).await;
            let mut pipeline = inner.lock().await;
            if let Err(e) = pipeline.record_capture(&request, result) {
                warn!(url = %request.url, error = %e, "Failed to store captured content");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    use chrono::Duration;
    use tidemark_core::types::{EventPayload, ExtractedPage};
    use tidemark_storage::MemoryBlobStore;

    use crate::capture::MailboxExtractor;

    fn open(blobs: Arc<MemoryBlobStore>, now: DateTime<Utc>) -> ActivityPipeline {
        ActivityPipeline::open(&TidemarkConfig::default(), blobs, now).unwrap()
    }

    fn nav(url: &str, at: DateTime<Utc>) -> Signal {
        Signal::Navigation {
            url: url.to_string(),
            title: format!("Title of {}", url),
            handle: SessionHandle(1),
            timestamp: Some(at),
            payload: Value::Null,
        }
    }

    fn idle(state: IdleState, at: DateTime<Utc>) -> Signal {
        Signal::IdleChanged {
            state,
            timestamp: Some(at),
            url: Some("https://example.com/".into()),
            title: "Example".into(),
            handle: SessionHandle(1),
        }
    }

    #[test]
    fn test_signal_deserializes_from_browser_json() {
        let signal: Signal = serde_json::from_str(
            r#"{"type":"navigation","url":"https://github.com/","handle":4,"payload":{"transition":"typed"}}"#,
        )
        .unwrap();
        assert!(matches!(signal, Signal::Navigation { handle: SessionHandle(4), .. }));

        let signal: Signal =
            serde_json::from_str(r#"{"type":"idle.changed","state":"locked"}"#).unwrap();
        assert!(matches!(signal, Signal::IdleChanged { state: IdleState::Locked, .. }));
    }

    #[test]
    fn test_navigation_appends_and_tracks() {
        let now = Utc::now();
        let mut pipeline = open(Arc::new(MemoryBlobStore::new()), now);

        let outcome = pipeline.handle(nav("https://example.com/a", now - Duration::seconds(40)), now);
        assert_eq!(outcome.accepted, 1);
        assert!(outcome.closed.is_none());

        let outcome = pipeline.handle(nav("https://github.com/", now), now);
        let closed = outcome.closed.unwrap();
        assert_eq!(closed.domain, "example.com");
        assert_eq!(closed.duration_secs, 40);
        assert_eq!(outcome.content_requests.len(), 1);
        assert_eq!(pipeline.dwell_totals()["example.com"].total_secs, 40);
        assert_eq!(pipeline.store().events().len(), 2);
    }

    #[test]
    fn test_untracked_navigation_rejected_but_closes_session() {
        let now = Utc::now();
        let mut pipeline = open(Arc::new(MemoryBlobStore::new()), now);
        pipeline.handle(nav("https://example.com/", now - Duration::seconds(20)), now);

        let outcome = pipeline.handle(nav("chrome://newtab/", now), now);
        assert_eq!(outcome.accepted, 0);
        assert_eq!(outcome.rejected.len(), 1);
        assert!(outcome.closed.is_some());
        assert!(pipeline.tracker().current().is_none());
    }

    #[test]
    fn test_idle_and_comeback_events() {
        let now = Utc::now();
        let t0 = now - Duration::minutes(30);
        let mut pipeline = open(Arc::new(MemoryBlobStore::new()), now);

        pipeline.handle(nav("https://example.com/", t0), now);
        let outcome = pipeline.handle(idle(IdleState::Idle, t0 + Duration::seconds(60)), now);
        assert_eq!(outcome.closed.unwrap().duration_secs, 60);

        let outcome = pipeline.handle(idle(IdleState::Active, t0 + Duration::seconds(660)), now);
        assert_eq!(outcome.away_secs, Some(600));
        assert!(pipeline.tracker().current().is_some());

        let kinds: Vec<_> = pipeline.store().events().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::Navigation, EventKind::Idle, EventKind::UserComeback]
        );
        assert_eq!(
            pipeline.store().events()[2].payload,
            EventPayload::Comeback { away_secs: 600 }
        );
    }

    #[test]
    fn test_navigation_while_idle_counts_as_comeback() {
        let now = Utc::now();
        let t0 = now - Duration::minutes(30);
        let mut pipeline = open(Arc::new(MemoryBlobStore::new()), now);

        pipeline.handle(idle(IdleState::Locked, t0), now);
        let outcome = pipeline.handle(nav("https://github.com/", t0 + Duration::seconds(90)), now);
        assert_eq!(outcome.away_secs, Some(90));
        assert_eq!(outcome.accepted, 2);
        assert!(!pipeline.tracker().is_idle());
    }

    #[test]
    fn test_record_capture_stores_and_dedups() {
        let now = Utc::now();
        let mut pipeline = open(Arc::new(MemoryBlobStore::new()), now);
        pipeline.handle(nav("https://read.example/post", now - Duration::seconds(60)), now);
        let outcome = pipeline.handle(nav("https://github.com/", now), now);
        let request = outcome.content_requests[0].clone();

        let entry = tidemark_core::types::PageContentEntry {
            url: request.url.clone(),
            title: request.title.clone(),
            time_spent_secs: request.time_spent_secs,
            text: "body".into(),
            meta: Default::default(),
            word_count: 1,
            captured_at: now,
        };
        let merge = pipeline
            .record_capture(&request, CaptureOutcome::Captured(entry))
            .unwrap();
        assert_eq!(merge, Some(ContentMerge::Inserted));
        assert!(pipeline.tracker().is_captured("https://read.example/post"));

        let stored = pipeline.store().page_content(local_date(request.ended_at)).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].time_spent_secs, 60);
    }

    #[test]
    fn test_one_capture_per_url_while_in_flight() {
        let now = Utc::now();
        let mut pipeline = open(Arc::new(MemoryBlobStore::new()), now);
        let post = "https://read.example/post";

        // Two reads of the same post, both closed before any capture
        // reports back.
        let start = now - Duration::seconds(200);
        pipeline.handle(nav(post, start), now);
        let first = pipeline.handle(nav("https://github.com/", start + Duration::seconds(60)), now);
        pipeline.handle(nav(post, start + Duration::seconds(70)), now);
        let second = pipeline.handle(nav("https://github.com/", start + Duration::seconds(130)), now);

        assert_eq!(first.content_requests.len(), 1);
        assert!(second.content_requests.is_empty());
        assert!(pipeline.tracker().is_capturing(post));
    }

    #[test]
    fn test_failed_capture_can_be_requested_again() {
        let now = Utc::now();
        let mut pipeline = open(Arc::new(MemoryBlobStore::new()), now);
        let post = "https://read.example/post";

        pipeline.handle(nav(post, now - Duration::seconds(200)), now);
        let outcome = pipeline.handle(nav("https://github.com/", now - Duration::seconds(140)), now);
        let request = outcome.content_requests[0].clone();
        let stored = pipeline.record_capture(&request, CaptureOutcome::TimedOut).unwrap();
        assert!(stored.is_none());
        assert!(!pipeline.tracker().is_capturing(post));

        pipeline.handle(nav(post, now - Duration::seconds(100)), now);
        let again = pipeline.handle(nav("https://github.com/", now - Duration::seconds(40)), now);
        assert_eq!(again.content_requests.len(), 1);
    }

    #[test]
    fn test_tick_persists_and_reopen_restores() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let now = Utc::now();
        {
            let mut pipeline = open(blobs.clone(), now);
            pipeline.handle(nav("https://example.com/", now - Duration::seconds(100)), now);
            pipeline.handle(nav("https://github.com/", now - Duration::seconds(60)), now);
            pipeline.tick(now).unwrap();
        }

        let reopened = open(blobs, now + Duration::seconds(30));
        assert_eq!(reopened.store().events().len(), 2);
        assert_eq!(reopened.dwell_totals()["example.com"].total_secs, 40);
        assert_eq!(reopened.tracker().current().unwrap().domain, "github.com");
    }

    #[test]
    fn test_reload_applies_new_privacy_rules() {
        let now = Utc::now();
        let mut pipeline = open(Arc::new(MemoryBlobStore::new()), now);

        let mut config = TidemarkConfig::default();
        config.privacy.blocked_domains.push("github.com".into());
        pipeline.reload(&config).unwrap();

        let outcome = pipeline.handle(nav("https://github.com/", now), now);
        assert_eq!(outcome.accepted, 0);
        assert!(pipeline.tracker().current().is_none());
    }

    #[tokio::test]
    async fn test_shared_pipeline_captures_in_background() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let now = Utc::now();
        let mailbox = Arc::new(MailboxExtractor::new());
        let shared = SharedPipeline::new(open(blobs, now), ContentCapture::new(mailbox.clone()));

        mailbox
            .deposit(
                SessionHandle(1),
                "https://read.example/post",
                ExtractedPage {
                    text: "A long and careful read".into(),
                    ..ExtractedPage::default()
                },
            )
            .unwrap();

        shared
            .submit(nav("https://read.example/post", now - Duration::seconds(90)))
            .await;
        let outcome = shared.submit(nav("https://github.com/", now)).await;
        assert_eq!(outcome.content_requests.len(), 1);

        let day = local_date(now);
        let mut stored = Vec::new();
        for _ in 0..100 {
            stored = shared.lock().await.store().page_content(day).unwrap();
            if !stored.is_empty() {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].word_count, 5);
        assert!(shared.lock().await.tracker().is_captured("https://read.example/post"));
    }
}
