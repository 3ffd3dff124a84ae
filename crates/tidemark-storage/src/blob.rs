//! Key/value blob persistence.
//!
//! Every piece of durable engine state is a single serialized value under a
//! well-known key. Writes larger than the configured quota fail with
//! `TidemarkError::QuotaExceeded`, which callers treat as a recoverable
//! signal to shrink what they store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rusqlite::OptionalExtension;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use tidemark_core::error::{Result, TidemarkError};

use crate::db::Database;

/// Well-known blob keys.
pub mod keys {
    use chrono::NaiveDate;

    pub const EVENTS_LOG: &str = "events.log";
    pub const EVENTS_META: &str = "events.meta";
    pub const CONTENT_PREFIX: &str = "content:";
    pub const TRACKER_SNAPSHOT: &str = "tracker.snapshot";
    pub const DIGEST_LAST_SENT: &str = "digest.last_sent";
    /// Scheduled digest days that have not reached a final outcome yet.
    pub const DIGEST_PENDING: &str = "digest.pending";
    pub const RETENTION_DAYS: &str = "settings.retention_days";

    /// Key of the page-content table for one calendar day.
    pub fn content(date: NaiveDate) -> String {
        format!("{}{}", CONTENT_PREFIX, date.format("%Y-%m-%d"))
    }

    /// Parse the day back out of a page-content key.
    pub fn content_date(key: &str) -> Option<NaiveDate> {
        let day = key.strip_prefix(CONTENT_PREFIX)?;
        NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
    }
}

/// Durable key/value storage for serialized engine state.
pub trait BlobStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: &str) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Read and deserialize a blob. A corrupt value is logged and treated as absent.
pub fn read_json<T: DeserializeOwned>(store: &dyn BlobStore, key: &str) -> Result<Option<T>> {
    let Some(raw) = store.get(key)? else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!(key, error = %e, "Discarding unreadable blob");
            Ok(None)
        }
    }
}

/// Serialize and store a blob.
pub fn write_json<T: Serialize + ?Sized>(store: &dyn BlobStore, key: &str, value: &T) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    store.put(key, &raw)
}

fn check_quota(value: &str, quota: Option<usize>) -> Result<()> {
    match quota {
        Some(limit) if value.len() > limit => Err(TidemarkError::QuotaExceeded {
            size: value.len(),
            limit,
        }),
        _ => Ok(()),
    }
}

/// Blob store backed by the `blobs` table.
pub struct SqliteBlobStore {
    db: Arc<Database>,
    quota_bytes: Option<usize>,
}

impl SqliteBlobStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            quota_bytes: None,
        }
    }

    /// Reject any single value larger than `bytes`.
    pub fn with_quota(mut self, bytes: usize) -> Self {
        self.quota_bytes = Some(bytes);
        self
    }
}

impl BlobStore for SqliteBlobStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM blobs WHERE key = ?1",
                rusqlite::params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| TidemarkError::Storage(format!("Failed to read blob {}: {}", key, e)))
        })
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        check_quota(value, self.quota_bytes)?;
        let limit = self.quota_bytes.unwrap_or(0);
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO blobs (key, value, updated_at) VALUES (?1, ?2, strftime('%s', 'now'))
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                rusqlite::params![key, value],
            )
            .map_err(|e| match e.sqlite_error_code() {
                Some(rusqlite::ErrorCode::DiskFull) | Some(rusqlite::ErrorCode::TooBig) => {
                    TidemarkError::QuotaExceeded {
                        size: value.len(),
                        limit,
                    }
                }
                _ => TidemarkError::Storage(format!("Failed to write blob {}: {}", key, e)),
            })?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM blobs WHERE key = ?1", rusqlite::params![key])
                .map_err(|e| TidemarkError::Storage(format!("Failed to delete blob {}: {}", key, e)))?;
            Ok(())
        })
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT key FROM blobs WHERE substr(key, 1, ?2) = ?1 ORDER BY key")
                .map_err(|e| TidemarkError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(rusqlite::params![prefix, prefix.len() as i64], |row| {
                    row.get::<_, String>(0)
                })
                .map_err(|e| TidemarkError::Storage(e.to_string()))?;

            let mut keys = Vec::new();
            for row in rows {
                keys.push(row.map_err(|e| TidemarkError::Storage(e.to_string()))?);
            }
            Ok(keys)
        })
    }
}

/// In-process blob store.
///
/// Supports an optional quota and a counter of upcoming writes to reject,
/// so quota recovery paths can be exercised deterministically.
#[derive(Default)]
pub struct MemoryBlobStore {
    values: Mutex<BTreeMap<String, String>>,
    quota_bytes: Option<usize>,
    reject_puts: AtomicUsize,
    puts: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(mut self, bytes: usize) -> Self {
        self.quota_bytes = Some(bytes);
        self
    }

    /// Fail the next `n` writes with a quota error.
    pub fn reject_next_puts(&self, n: usize) {
        self.reject_puts.store(n, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
        self.values
            .lock()
            .map_err(|e| TidemarkError::Storage(format!("Blob store lock poisoned: {}", e)))
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let rejected = self
            .reject_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(TidemarkError::QuotaExceeded {
                size: value.len(),
                limit: self.quota_bytes.unwrap_or(0),
            });
        }
        check_quota(value, self.quota_bytes)?;
        self.lock()?.insert(key.to_string(), value.to_string());
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sqlite_store() -> SqliteBlobStore {
        SqliteBlobStore::new(Arc::new(Database::in_memory().unwrap()))
    }

    #[test]
    fn test_sqlite_put_get_overwrite() {
        let store = sqlite_store();
        assert_eq!(store.get("a").unwrap(), None);

        store.put("a", "1").unwrap();
        store.put("a", "2").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("2"));

        store.delete("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
    }

    #[test]
    fn test_sqlite_prefix_listing() {
        let store = sqlite_store();
        store.put("content:2026-01-02", "[]").unwrap();
        store.put("content:2026-01-01", "[]").unwrap();
        store.put("events.log", "[]").unwrap();

        let keys = store.keys_with_prefix(keys::CONTENT_PREFIX).unwrap();
        assert_eq!(keys, vec!["content:2026-01-01", "content:2026-01-02"]);
    }

    #[test]
    fn test_sqlite_quota() {
        let store = sqlite_store().with_quota(4);
        store.put("k", "1234").unwrap();
        let err = store.put("k", "12345").unwrap_err();
        assert!(err.is_quota());
        assert_eq!(store.get("k").unwrap().as_deref(), Some("1234"));
    }

    #[test]
    fn test_memory_reject_next_puts() {
        let store = MemoryBlobStore::new();
        store.reject_next_puts(1);
        assert!(store.put("k", "v").unwrap_err().is_quota());
        store.put("k", "v").unwrap();
        assert_eq!(store.put_count(), 1);
    }

    #[test]
    fn test_read_json_discards_corrupt_value() {
        let store = MemoryBlobStore::new();
        store.put("x", "{not json").unwrap();
        let value: Option<Vec<u32>> = read_json(&store, "x").unwrap();
        assert!(value.is_none());

        write_json(&store, "y", &vec![1u32, 2]).unwrap();
        let value: Option<Vec<u32>> = read_json(&store, "y").unwrap();
        assert_eq!(value, Some(vec![1, 2]));
    }

    #[test]
    fn test_content_key_round_trip() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let key = keys::content(date);
        assert_eq!(key, "content:2026-10-19");
        assert_eq!(keys::content_date(&key), Some(date));
        assert_eq!(keys::content_date("events.log"), None);
    }
}
