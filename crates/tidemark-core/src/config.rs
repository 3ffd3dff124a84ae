use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, TidemarkError};

/// Top-level configuration for the Tidemark application.
///
/// Loaded from `~/.tidemark/config.toml` by default. Each section corresponds
/// to one component of the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TidemarkConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub privacy: PrivacyConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub digest: DigestConfig,
}

impl TidemarkConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TidemarkConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| TidemarkError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Names of the sections that differ between `self` and `other`.
    pub fn changed_sections(&self, other: &TidemarkConfig) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.general != other.general {
            changed.push("general");
        }
        if self.privacy != other.privacy {
            changed.push("privacy");
        }
        if self.tracker != other.tracker {
            changed.push("tracker");
        }
        if self.storage != other.storage {
            changed.push("storage");
        }
        if self.digest != other.digest {
            changed.push("digest");
        }
        changed
    }
}

/// General application settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory for the SQLite database and digest output.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
    /// Local API port.
    pub port: u16,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.tidemark/data".to_string(),
            log_level: "info".to_string(),
            port: 4040,
        }
    }
}

impl GeneralConfig {
    /// The data directory with a leading `~` expanded.
    pub fn data_path(&self) -> PathBuf {
        expand_home(&self.data_dir)
    }

    /// Location of the SQLite database.
    pub fn database_path(&self) -> PathBuf {
        self.data_path().join("tidemark.db")
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix('~') {
        Some(rest) => {
            let home = std::env::var("HOME")
                .or_else(|_| std::env::var("USERPROFILE"))
                .unwrap_or_else(|_| ".".to_string());
            PathBuf::from(format!("{}{}", home, rest))
        }
        None => PathBuf::from(path),
    }
}

/// URL admission and sanitization rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    /// Domains that are never tracked. Subdomains match too.
    pub blocked_domains: Vec<String>,
    /// Query parameters stripped from every URL. A trailing `*` matches a prefix.
    pub tracking_params: Vec<String>,
    /// URL schemes eligible for tracking.
    pub allowed_schemes: Vec<String>,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            blocked_domains: vec![
                "localhost".to_string(),
                "127.0.0.1".to_string(),
                "accounts.google.com".to_string(),
            ],
            tracking_params: vec![
                "utm_*".to_string(),
                "fbclid".to_string(),
                "gclid".to_string(),
                "dclid".to_string(),
                "msclkid".to_string(),
                "mc_cid".to_string(),
                "mc_eid".to_string(),
                "igshid".to_string(),
                "ref_src".to_string(),
                "_hsenc".to_string(),
                "_hsmi".to_string(),
            ],
            allowed_schemes: vec!["http".to_string(), "https".to_string()],
        }
    }
}

/// Session tracking and dwell accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Sessions shorter than this contribute no dwell time.
    pub min_duration_secs: u64,
    /// Sessions are capped at this duration.
    pub max_duration_secs: u64,
    /// Shortest session that triggers content extraction.
    pub content_min_secs: u64,
    /// Longest session that triggers content extraction.
    pub content_max_secs: u64,
    /// Interval between durable tracker snapshots and store flushes.
    pub snapshot_interval_secs: u64,
    /// A restored session older than this is closed at its snapshot time.
    pub resume_grace_secs: u64,
    /// Upper bound on a single content extraction call.
    pub extraction_timeout_ms: u64,
    /// Titles are truncated to this many characters.
    pub max_title_chars: usize,
    /// Extracted text is truncated to this many characters.
    pub max_text_chars: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_duration_secs: 3,
            max_duration_secs: 1800,
            content_min_secs: 10,
            content_max_secs: 1800,
            snapshot_interval_secs: 30,
            resume_grace_secs: 120,
            extraction_timeout_ms: 5000,
            max_title_chars: 200,
            max_text_chars: 5000,
        }
    }
}

/// Event log retention and persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Events older than this many days are dropped on every flush.
    pub retention_days: u32,
    /// Number of appends buffered before the log is persisted.
    pub flush_every: usize,
    /// Events kept when a persist hits the storage quota.
    pub overflow_tail: usize,
    /// Maximum serialized size of a single stored blob.
    pub quota_bytes: usize,
    /// Extracted page-content entries kept per day.
    pub max_content_per_day: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            retention_days: 90,
            flush_every: 10,
            overflow_tail: 1000,
            quota_bytes: 5 * 1024 * 1024,
            max_content_per_day: 50,
        }
    }
}

/// Daily digest generation and delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DigestConfig {
    /// Whether the daily digest is scheduled.
    pub enabled: bool,
    /// Local time of day the digest fires, `HH:MM`.
    pub send_time: String,
    /// Number of domains listed under "Top Sites".
    pub top_domains: usize,
    /// Directory receiving one Markdown file per digest.
    pub output_dir: Option<String>,
    /// Webhook receiving the digest as JSON.
    pub webhook_url: Option<String>,
    /// Timeout for a single delivery attempt.
    pub delivery_timeout_secs: u64,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            send_time: "21:00".to_string(),
            top_domains: 10,
            output_dir: Some("~/.tidemark/digests".to_string()),
            webhook_url: None,
            delivery_timeout_secs: 15,
        }
    }
}

impl DigestConfig {
    /// Parse `send_time` into a local time of day.
    pub fn parse_send_time(&self) -> Result<chrono::NaiveTime> {
        chrono::NaiveTime::parse_from_str(&self.send_time, "%H:%M").map_err(|e| {
            TidemarkError::Config(format!("invalid send_time '{}': {}", self.send_time, e))
        })
    }
}
