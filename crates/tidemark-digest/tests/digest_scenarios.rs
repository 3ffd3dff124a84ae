//! End-to-end digest scenarios.
//!
//! Signals go through the real pipeline into an in-memory store; the digest
//! is delivered to a file sink in a temporary directory.

use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};
use serde_json::{json, Value};

use tidemark_core::config::TidemarkConfig;
use tidemark_core::types::{PageContentEntry, PageMeta, SessionHandle};
use tidemark_digest::{DigestBuilder, DigestOutcome, DigestService, DigestSink, DigestTrigger, FileSink};
use tidemark_storage::MemoryBlobStore;
use tidemark_tracker::{ActivityPipeline, ContentCapture, MailboxExtractor, SharedPipeline, Signal};

// =============================================================================
// Helpers
// =============================================================================

fn day() -> NaiveDate {
    Local::now().date_naive() - chrono::Duration::days(1)
}

fn at(hour: u32, min: u32, sec: u32) -> DateTime<Utc> {
    Local
        .from_local_datetime(&day().and_hms_opt(hour, min, sec).unwrap())
        .earliest()
        .unwrap()
        .with_timezone(&Utc)
}

/// Bullet lines under the `## heading` section.
fn section(text: &str, heading: &str) -> Vec<String> {
    let marker = format!("## {}", heading);
    text.lines()
        .skip_while(|l| *l != marker)
        .skip(1)
        .take_while(|l| !l.starts_with("## "))
        .filter(|l| l.starts_with("- "))
        .map(str::to_string)
        .collect()
}

struct Harness {
    pipeline: SharedPipeline,
    service: DigestService,
    dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        let blobs = Arc::new(MemoryBlobStore::new());
        let pipeline = ActivityPipeline::open(&TidemarkConfig::default(), blobs.clone(), Utc::now()).unwrap();
        let pipeline = SharedPipeline::new(
            pipeline,
            ContentCapture::new(Arc::new(MailboxExtractor::new())),
        );
        let dir = tempfile::tempdir().unwrap();
        let sink: Arc<dyn DigestSink> = Arc::new(FileSink::new(dir.path()));
        let service = DigestService::new(pipeline.clone(), blobs, DigestBuilder::new(10), vec![sink]);
        Self {
            pipeline,
            service,
            dir,
        }
    }

    async fn send(&self, signal: Signal) {
        let mut pipeline = self.pipeline.lock().await;
        let outcome = pipeline.handle(signal, Utc::now());
        assert!(outcome.rejected.is_empty(), "rejected: {:?}", outcome.rejected);
    }

    async fn navigate(&self, url: &str, title: &str, ts: DateTime<Utc>) {
        self.send(Signal::Navigation {
            url: url.into(),
            title: title.into(),
            handle: SessionHandle(7),
            timestamp: Some(ts),
            payload: Value::Null,
        })
        .await;
    }

    async fn dwell_secs(&self, domain: &str) -> u64 {
        let pipeline = self.pipeline.lock().await;
        pipeline.tracker().dwell_for(domain).map(|d| d.total_secs).unwrap_or(0)
    }

    fn written(&self) -> String {
        let path = self.dir.path().join(format!("{}.md", day().format("%Y-%m-%d")));
        std::fs::read_to_string(path).unwrap()
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_report_lists_site_bookmark_and_download() {
    let h = Harness::new();
    h.navigate("https://github.com/rust-lang/rust", "rust-lang/rust", at(9, 0, 0)).await;
    h.send(Signal::BookmarkCreated {
        url: "https://github.com/x".into(),
        title: "X".into(),
        timestamp: Some(at(9, 5, 0)),
        payload: Value::Null,
    })
    .await;
    h.send(Signal::DownloadCompleted {
        url: Some("https://github.com/files/report.pdf".into()),
        timestamp: Some(at(9, 10, 0)),
        payload: json!({ "filename": "/home/me/Downloads/report.pdf", "fileSize": 1048576 }),
    })
    .await;

    let outcome = h.service.run(day(), DigestTrigger::Scheduled, Utc::now()).await.unwrap();
    assert!(outcome.is_delivered(), "{:?}", outcome);

    let text = h.written();
    assert!(section(&text, "Top Sites").iter().any(|l| l.contains("github.com")), "{}", text);
    assert!(section(&text, "Bookmarked").iter().any(|l| l.contains("X")), "{}", text);
    assert_eq!(section(&text, "Downloads"), vec!["- report.pdf (1.0 MB)"], "{}", text);
}

#[tokio::test]
async fn test_dwell_accumulates_into_report() {
    let h = Harness::new();
    h.navigate("https://example.com/a", "A", at(10, 0, 0)).await;
    h.navigate("https://other.org/", "Other", at(10, 0, 40)).await;
    h.navigate("https://example.com/b", "B", at(10, 1, 0)).await;
    h.navigate("https://other.org/", "Other", at(10, 1, 20)).await;

    assert_eq!(h.dwell_secs("example.com").await, 60);

    let outcome = h.service.run(day(), DigestTrigger::Manual, Utc::now()).await.unwrap();
    assert!(outcome.is_delivered());
    assert!(section(&h.written(), "Top Sites").contains(&"- example.com (2 visits, 1m)".to_string()));
}

#[tokio::test]
async fn test_scheduled_digest_is_idempotent_with_single_dwell_reset() {
    let h = Harness::new();
    h.navigate("https://example.com/a", "A", at(11, 0, 0)).await;
    h.navigate("https://other.org/", "Other", at(11, 0, 30)).await;
    assert_eq!(h.dwell_secs("example.com").await, 30);

    let first = h.service.run(day(), DigestTrigger::Scheduled, Utc::now()).await.unwrap();
    assert!(first.is_delivered());
    assert_eq!(h.service.last_sent().unwrap(), Some(day()));
    assert_eq!(h.dwell_secs("example.com").await, 0);

    // New dwell after the digest must survive a repeated scheduled run.
    h.navigate("https://example.com/c", "C", at(11, 5, 0)).await;
    h.navigate("https://other.org/", "Other", at(11, 5, 15)).await;
    assert_eq!(h.dwell_secs("example.com").await, 15);

    let second = h.service.run(day(), DigestTrigger::Scheduled, Utc::now()).await.unwrap();
    assert_eq!(second, DigestOutcome::AlreadySent { date: day() });
    assert_eq!(h.dwell_secs("example.com").await, 15);

    let manual = h.service.run(day(), DigestTrigger::Manual, Utc::now()).await.unwrap();
    assert!(manual.is_delivered());
}

#[tokio::test]
async fn test_reading_section_from_captured_content() {
    let h = Harness::new();
    h.navigate("https://blog.example/post", "A Post", at(20, 0, 0)).await;
    {
        let mut pipeline = h.pipeline.lock().await;
        pipeline
            .store_mut()
            .add_page_content(
                day(),
                PageContentEntry {
                    url: "https://blog.example/post".into(),
                    title: "A Post".into(),
                    time_spent_secs: 240,
                    text: "Long form text about tides.".into(),
                    meta: PageMeta {
                        author: Some("Ada".into()),
                        ..PageMeta::default()
                    },
                    word_count: 5,
                    captured_at: at(20, 4, 0),
                },
            )
            .unwrap();
    }

    let outcome = h.service.run(day(), DigestTrigger::Manual, Utc::now()).await.unwrap();
    match outcome {
        DigestOutcome::Delivered { event_count, .. } => assert_eq!(event_count, 1),
        other => panic!("unexpected outcome {:?}", other),
    }

    let text = h.written();
    assert!(text.contains("## Reading"));
    assert!(text.contains("### A Post (4 min)"));
    assert!(text.contains("*Ada*"));
    assert!(text.contains("Long form text about tides."));
}

#[tokio::test]
async fn test_other_days_do_not_leak_into_report() {
    let h = Harness::new();
    h.navigate("https://github.com/", "GitHub", at(9, 0, 0)).await;

    let today = Local::now().date_naive();
    let outcome = h.service.run(today, DigestTrigger::Scheduled, Utc::now()).await.unwrap();
    assert_eq!(outcome, DigestOutcome::NoEvents { date: today });
}
