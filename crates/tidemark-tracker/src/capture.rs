//! Page content capture.
//!
//! Extraction is delegated to a collaborator that lives next to the page
//! (the browser side). The built-in `MailboxExtractor` receives extraction
//! results deposited per session handle and hands them to whoever asks.
//! Every capture runs under a timeout; failures come back as values.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, warn};

use tidemark_core::config::TrackerConfig;
use tidemark_core::error::{Result, TidemarkError};
use tidemark_core::types::{truncate_chars, ExtractedPage, PageContentEntry, SessionHandle};

use crate::session::ContentRequest;

/// Source of readable page content.
#[async_trait]
pub trait ContentExtractor: Send + Sync {
    /// Extract the readable content of `url` as displayed in `handle`.
    async fn extract(&self, handle: SessionHandle, url: &str) -> Result<ExtractedPage>;
}

const MAILBOX_CAPACITY: usize = 64;

struct Deposit {
    url: String,
    page: ExtractedPage,
    at: Instant,
}

/// Extractor fed by deposits from the browser side.
///
/// One deposit is kept per handle; a newer deposit for the same handle
/// replaces the older one. `extract` waits for a matching deposit until the
/// caller's timeout cancels it.
pub struct MailboxExtractor {
    deposits: std::sync::Mutex<HashMap<SessionHandle, Deposit>>,
    arrived: Notify,
}

impl Default for MailboxExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl MailboxExtractor {
    pub fn new() -> Self {
        Self {
            deposits: std::sync::Mutex::new(HashMap::new()),
            arrived: Notify::new(),
        }
    }

    /// Leave extracted content for `url` shown in `handle`.
    pub fn deposit(&self, handle: SessionHandle, url: &str, page: ExtractedPage) -> Result<()> {
        {
            let mut deposits = self.lock()?;
            deposits.insert(
                handle,
                Deposit {
                    url: url.to_string(),
                    page,
                    at: Instant::now(),
                },
            );
            if deposits.len() > MAILBOX_CAPACITY {
                if let Some(oldest) = deposits
                    .iter()
                    .min_by_key(|(_, d)| d.at)
                    .map(|(h, _)| *h)
                {
                    deposits.remove(&oldest);
                }
            }
        }
        debug!(handle = %handle, url, "Content deposited");
        self.arrived.notify_waiters();
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.lock().map(|d| d.len()).unwrap_or(0)
    }

    fn take(&self, handle: SessionHandle, url: &str) -> Result<Option<ExtractedPage>> {
        let mut deposits = self.lock()?;
        match deposits.get(&handle) {
            Some(d) if d.url == url => Ok(deposits.remove(&handle).map(|d| d.page)),
            _ => Ok(None),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<SessionHandle, Deposit>>> {
        self.deposits
            .lock()
            .map_err(|e| TidemarkError::Extraction(format!("Mailbox lock poisoned: {}", e)))
    }
}

#[async_trait]
impl ContentExtractor for MailboxExtractor {
    async fn extract(&self, handle: SessionHandle, url: &str) -> Result<ExtractedPage> {
        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(page) = self.take(handle, url)? {
                return Ok(page);
            }
            notified.await;
        }
    }
}

/// Limits applied to one capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSettings {
    pub timeout: Duration,
    pub max_text_chars: usize,
}

impl CaptureSettings {
    pub fn from_config(config: &TrackerConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.extraction_timeout_ms),
            max_text_chars: config.max_text_chars,
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self::from_config(&TrackerConfig::default())
    }
}

/// Result of a capture attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    Captured(PageContentEntry),
    Empty,
    Failed(String),
    TimedOut,
}

/// Runs extraction requests against a `ContentExtractor`.
pub struct ContentCapture {
    extractor: std::sync::Arc<dyn ContentExtractor>,
}

impl ContentCapture {
    pub fn new(extractor: std::sync::Arc<dyn ContentExtractor>) -> Self {
        Self { extractor }
    }

    /// Extract the page behind `request` and shape it into a content entry.
    pub async fn capture(&self, request: &ContentRequest, settings: CaptureSettings) -> CaptureOutcome {
        let call = self.extractor.extract(request.handle, &request.url);
        let page = match tokio::time::timeout(settings.timeout, call).await {
            Ok(Ok(page)) => page,
            Ok(Err(e)) => {
                warn!(url = %request.url, error = %e, "Content extraction failed");
                return CaptureOutcome::Failed(e.to_string());
            }
            Err(_) => {
                debug!(
                    url = %request.url,
                    timeout_ms = settings.timeout.as_millis() as u64,
                    "Content extraction timed out"
                );
                return CaptureOutcome::TimedOut;
            }
        };

        let text = page.text.trim();
        if text.is_empty() {
            return CaptureOutcome::Empty;
        }
        let word_count = if page.word_count > 0 {
            page.word_count
        } else {
            text.split_whitespace().count()
        };
        let title = if request.title.is_empty() {
            page.meta.title.clone().unwrap_or_default()
        } else {
            request.title.clone()
        };

        CaptureOutcome::Captured(PageContentEntry {
            url: request.url.clone(),
            title,
            time_spent_secs: request.time_spent_secs,
            text: truncate_chars(text, settings.max_text_chars),
            meta: page.meta,
            word_count,
            captured_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tidemark_core::types::PageMeta;

    struct FailingExtractor;

    #[async_trait]
    impl ContentExtractor for FailingExtractor {
        async fn extract(&self, _handle: SessionHandle, _url: &str) -> Result<ExtractedPage> {
            Err(TidemarkError::Extraction("tab closed".into()))
        }
    }

    fn request(url: &str) -> ContentRequest {
        ContentRequest {
            url: url.to_string(),
            title: "Post".to_string(),
            handle: SessionHandle(3),
            time_spent_secs: 45,
            ended_at: Utc::now(),
        }
    }

    fn page(text: &str) -> ExtractedPage {
        ExtractedPage {
            text: text.to_string(),
            meta: PageMeta {
                author: Some("Ada".into()),
                ..PageMeta::default()
            },
            word_count: 0,
        }
    }

    fn settings(timeout_ms: u64) -> CaptureSettings {
        CaptureSettings {
            timeout: Duration::from_millis(timeout_ms),
            max_text_chars: 10,
        }
    }

    #[tokio::test]
    async fn test_capture_from_mailbox_deposit() {
        let mailbox = Arc::new(MailboxExtractor::new());
        mailbox
            .deposit(SessionHandle(3), "https://read.example/post", page("one two three four five six"))
            .unwrap();

        let capture = ContentCapture::new(mailbox.clone());
        let outcome = capture.capture(&request("https://read.example/post"), settings(500)).await;

        match outcome {
            CaptureOutcome::Captured(entry) => {
                assert_eq!(entry.text, "one two th");
                assert_eq!(entry.word_count, 6);
                assert_eq!(entry.time_spent_secs, 45);
                assert_eq!(entry.meta.author.as_deref(), Some("Ada"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(mailbox.pending(), 0);
    }

    #[tokio::test]
    async fn test_capture_waits_for_late_deposit() {
        let mailbox = Arc::new(MailboxExtractor::new());
        let capture = ContentCapture::new(mailbox.clone());

        let depositor = mailbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            depositor
                .deposit(SessionHandle(3), "https://read.example/post", page("late body"))
                .unwrap();
        });

        let outcome = capture.capture(&request("https://read.example/post"), settings(2000)).await;
        assert!(matches!(outcome, CaptureOutcome::Captured(_)));
    }

    #[tokio::test]
    async fn test_mismatched_url_times_out() {
        let mailbox = Arc::new(MailboxExtractor::new());
        mailbox
            .deposit(SessionHandle(3), "https://other.example/", page("body"))
            .unwrap();

        let capture = ContentCapture::new(mailbox.clone());
        let outcome = capture.capture(&request("https://read.example/post"), settings(30)).await;
        assert_eq!(outcome, CaptureOutcome::TimedOut);
        assert_eq!(mailbox.pending(), 1);
    }

    #[tokio::test]
    async fn test_extractor_error_is_a_value() {
        let capture = ContentCapture::new(Arc::new(FailingExtractor));
        let outcome = capture.capture(&request("https://read.example/post"), settings(500)).await;
        assert!(matches!(outcome, CaptureOutcome::Failed(msg) if msg.contains("tab closed")));
    }

    #[tokio::test]
    async fn test_blank_page_is_empty() {
        let mailbox = Arc::new(MailboxExtractor::new());
        mailbox
            .deposit(SessionHandle(3), "https://read.example/post", page("   "))
            .unwrap();
        let capture = ContentCapture::new(mailbox);
        let outcome = capture.capture(&request("https://read.example/post"), settings(500)).await;
        assert_eq!(outcome, CaptureOutcome::Empty);
    }

    #[test]
    fn test_mailbox_capacity_evicts_oldest() {
        let mailbox = MailboxExtractor::new();
        for i in 0..(MAILBOX_CAPACITY as i64 + 5) {
            mailbox
                .deposit(SessionHandle(i), "https://e.example/", page("x"))
                .unwrap();
        }
        assert_eq!(mailbox.pending(), MAILBOX_CAPACITY);
    }
}
