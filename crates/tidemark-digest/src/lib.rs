//! Tidemark Digest crate - daily report generation and delivery.
//!
//! Aggregates one day of activity (events, dwell totals, captured page
//! content) into a markdown report, delivers it to the configured sinks and
//! keeps the last-sent marker that makes scheduled runs idempotent. The
//! durable alarm scheduler that drives the daily run lives here too.

pub mod aggregate;
pub mod builder;
pub mod delivery;
pub mod error;
pub mod render;
pub mod scheduler;
pub mod service;
pub mod types;

pub use aggregate::{summarize, DaySummary};
pub use builder::DigestBuilder;
pub use delivery::{sinks_from_config, DigestSink, FileSink, WebhookSink};
pub use error::DigestError;
pub use scheduler::{
    ensure_daily, ensure_interval, next_occurrence, AlarmFired, Scheduler, DIGEST_ALARM, TICK_ALARM,
};
pub use service::DigestService;
pub use types::{DigestInput, DigestOutcome, DigestReport, DigestStatus, DigestTrigger};
