//! Application state shared across all route handlers.
//!
//! AppState holds references to the pipeline, the content mailbox and the
//! digest service. It is passed to handlers via axum's State extractor.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;

use tidemark_core::config::TidemarkConfig;
use tidemark_digest::DigestService;
use tidemark_tracker::{MailboxExtractor, SharedPipeline};

/// Shared application state.
///
/// All fields use `Arc` (or are themselves cheap handles) for cloning
/// across handler tasks.
#[derive(Clone)]
pub struct AppState {
    /// Current configuration. Updates are published to every subscriber.
    pub config: Arc<watch::Sender<TidemarkConfig>>,
    /// Where `PUT /config` persists changes. `None` keeps them in memory.
    pub config_path: Option<PathBuf>,
    /// The single writer for events, sessions and page content.
    pub pipeline: SharedPipeline,
    /// Receives page extractions posted by the browser side.
    pub mailbox: Arc<MailboxExtractor>,
    pub digest: Arc<DigestService>,
    /// Bearer token every protected route checks.
    pub api_token: String,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: TidemarkConfig,
        pipeline: SharedPipeline,
        mailbox: Arc<MailboxExtractor>,
        digest: Arc<DigestService>,
    ) -> Self {
        let (config_tx, _) = watch::channel(config);
        Self {
            config: Arc::new(config_tx),
            config_path: None,
            pipeline,
            mailbox,
            digest,
            api_token: crate::auth::generate_token(),
            start_time: Instant::now(),
        }
    }

    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = token.into();
        self
    }

    /// Snapshot of the current configuration.
    pub fn current_config(&self) -> TidemarkConfig {
        self.config.borrow().clone()
    }

    /// Receive every configuration change made through the API.
    pub fn subscribe_config(&self) -> watch::Receiver<TidemarkConfig> {
        self.config.subscribe()
    }
}
