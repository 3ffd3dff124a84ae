//! Database schema migrations.
//!
//! The schema is deliberately small: a key/value `blobs` table holding the
//! serialized event log, metadata, per-day page content and tracker
//! snapshots, and an `alarms` table for restart-durable recurring triggers.

use rusqlite::Connection;
use tracing::info;

use tidemark_core::error::TidemarkError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), TidemarkError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| TidemarkError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| TidemarkError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: initial_schema");
    }

    Ok(())
}

/// Version 1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<(), TidemarkError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS blobs (
            key         TEXT PRIMARY KEY NOT NULL,
            value       TEXT NOT NULL,
            updated_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );

        CREATE TABLE IF NOT EXISTS alarms (
            name            TEXT PRIMARY KEY NOT NULL,
            next_fire_at    INTEGER NOT NULL,
            period_secs     INTEGER NOT NULL CHECK (period_secs >= 0),
            wall_time       TEXT,
            last_fired_at   INTEGER,
            created_at      INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );

        CREATE INDEX IF NOT EXISTS idx_alarms_next_fire
            ON alarms (next_fire_at ASC);

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (1, 'initial_schema');
        ",
    )
    .map_err(|e| TidemarkError::Storage(format!("Failed to apply migration v1: {}", e)))?;

    Ok(())
}
