//! Digest delivery sinks.
//!
//! A sink reports plain success or failure; it does no retries or
//! bookkeeping of its own. The service decides what a set of results means.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use tidemark_core::config::{expand_home, DigestConfig};

use crate::error::DigestError;
use crate::types::DigestReport;

/// Somewhere a finished digest can be sent.
#[async_trait]
pub trait DigestSink: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, report: &DigestReport) -> Result<(), DigestError>;
}

/// Writes each digest to `<dir>/<YYYY-MM-DD>.md`.
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, report: &DigestReport) -> PathBuf {
        self.dir.join(format!("{}.md", report.date.format("%Y-%m-%d")))
    }
}

#[async_trait]
impl DigestSink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn deliver(&self, report: &DigestReport) -> Result<(), DigestError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(report);
        tokio::fs::write(&path, report.text.as_bytes()).await?;
        info!(path = %path.display(), "Digest written");
        Ok(())
    }
}

/// POSTs each digest as JSON to a fixed URL. Any non-2xx status is a failure.
pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DigestError> {
        let url = url.into();
        reqwest::Url::parse(&url)
            .map_err(|e| DigestError::Config(format!("invalid webhook url '{}': {}", url, e)))?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl DigestSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, report: &DigestReport) -> Result<(), DigestError> {
        let payload = json!({
            "date": report.date,
            "text": report.text,
            "event_count": report.event_count,
            "domain_count": report.domain_count,
            "content_count": report.content_count,
            "generated_at": report.generated_at,
        });

        let response = self.client.post(&self.url).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DigestError::Delivery {
                sink: self.name().to_string(),
                message: format!("HTTP {}", status),
            });
        }
        debug!(status = %status, "Digest posted to webhook");
        Ok(())
    }
}

/// Build the sinks the configuration asks for. An empty list means delivery
/// is not configured.
pub fn sinks_from_config(config: &DigestConfig) -> Result<Vec<Arc<dyn DigestSink>>, DigestError> {
    let mut sinks: Vec<Arc<dyn DigestSink>> = Vec::new();

    if let Some(dir) = config.output_dir.as_deref().filter(|d| !d.trim().is_empty()) {
        sinks.push(Arc::new(FileSink::new(expand_home(dir))));
    }
    if let Some(url) = config.webhook_url.as_deref().filter(|u| !u.trim().is_empty()) {
        sinks.push(Arc::new(WebhookSink::new(
            url,
            Duration::from_secs(config.delivery_timeout_secs),
        )?));
    }
    Ok(sinks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn report() -> DigestReport {
        DigestReport {
            date: NaiveDate::from_ymd_opt(2026, 5, 2).unwrap(),
            text: "# Daily Digest".to_string(),
            event_count: 3,
            domain_count: 1,
            content_count: 0,
            generated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_file_sink_writes_dated_markdown() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("digests"));
        sink.deliver(&report()).await.unwrap();

        let written = std::fs::read_to_string(dir.path().join("digests").join("2026-05-02.md")).unwrap();
        assert_eq!(written, "# Daily Digest");
    }

    #[tokio::test]
    async fn test_webhook_posts_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("content-type", "application/json"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sink = WebhookSink::new(format!("{}/hook", server.uri()), Duration::from_secs(5)).unwrap();
        sink.deliver(&report()).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["date"], "2026-05-02");
        assert_eq!(body["event_count"], 3);
        assert_eq!(body["domain_count"], 1);
        assert_eq!(body["text"], "# Daily Digest");
    }

    #[tokio::test]
    async fn test_webhook_server_error_fails_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let sink = WebhookSink::new(format!("{}/hook", server.uri()), Duration::from_secs(5)).unwrap();
        let err = sink.deliver(&report()).await.unwrap_err();
        assert!(matches!(err, DigestError::Delivery { .. }));
        assert!(err.to_string().contains("500"));
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_webhook_unreachable_fails() {
        let server = MockServer::start().await;
        let url = format!("{}/hook", server.uri());
        drop(server);

        let sink = WebhookSink::new(url, Duration::from_secs(2)).unwrap();
        assert!(sink.deliver(&report()).await.is_err());
    }

    #[test]
    fn test_invalid_webhook_url_rejected() {
        assert!(matches!(
            WebhookSink::new("not a url", Duration::from_secs(1)),
            Err(DigestError::Config(_))
        ));
    }

    #[test]
    fn test_sinks_from_config() {
        let none = DigestConfig {
            output_dir: None,
            webhook_url: None,
            ..DigestConfig::default()
        };
        assert!(sinks_from_config(&none).unwrap().is_empty());

        let both = DigestConfig {
            output_dir: Some("/tmp/tidemark-digests".into()),
            webhook_url: Some("https://hooks.example.com/digest".into()),
            ..DigestConfig::default()
        };
        let names: Vec<String> = sinks_from_config(&both)
            .unwrap()
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(names, vec!["file", "webhook"]);
    }
}
