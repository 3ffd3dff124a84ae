//! Tidemark Storage crate - SQLite persistence, event log, retention.
//!
//! Provides a WAL-mode SQLite database with migrations, a key/value blob
//! store with a per-value quota, the append-only activity event store with
//! its per-day page-content side table, and the durable alarm table that
//! backs recurring work across restarts.

pub mod alarms;
pub mod blob;
pub mod content;
pub mod db;
pub mod event_store;
pub mod migrations;

pub use alarms::{Alarm, AlarmRepository, DAY_SECS};
pub use blob::{keys, BlobStore, MemoryBlobStore, SqliteBlobStore};
pub use content::{merge_page_content, ContentMerge};
pub use db::Database;
pub use event_store::{
    AppendOutcome, DomainAggregate, EventStore, FlushReport, StoreMeta, StoreSettings, StoreStats,
};
