//! Durable recurring alarms.
//!
//! An alarm is a named trigger with a next fire instant and an optional
//! period. Alarms survive restarts; a periodic alarm whose fire instants were
//! missed while the process was down fires once and then resumes its cadence.
//! A daily alarm also remembers the local time of day it is anchored to, so
//! its owner can recompute the next instant across DST changes.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};

use tidemark_core::error::{Result, TidemarkError};

use crate::db::Database;

/// Period of a daily alarm.
pub const DAY_SECS: i64 = 24 * 60 * 60;

const WALL_TIME_FORMAT: &str = "%H:%M:%S";

/// A named, restart-durable trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alarm {
    pub name: String,
    pub next_fire_at: DateTime<Utc>,
    /// Zero for a one-shot alarm.
    pub period_secs: i64,
    /// Local time of day for a daily alarm.
    pub wall_time: Option<NaiveTime>,
    pub last_fired_at: Option<DateTime<Utc>>,
}

impl Alarm {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_fire_at <= now
    }

    /// The first occurrence strictly after `now`, skipping missed periods.
    /// `None` for a one-shot alarm.
    pub fn following(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.period_secs <= 0 {
            return None;
        }
        if self.next_fire_at > now {
            return Some(self.next_fire_at);
        }
        let elapsed = (now - self.next_fire_at).num_seconds();
        let periods = elapsed / self.period_secs + 1;
        Some(self.next_fire_at + Duration::seconds(periods * self.period_secs))
    }
}

/// Repository for the `alarms` table.
pub struct AlarmRepository {
    db: Arc<Database>,
}

impl AlarmRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Create or replace an alarm.
    pub fn upsert(&self, name: &str, next_fire_at: DateTime<Utc>, period_secs: i64) -> Result<()> {
        self.save(name, next_fire_at, period_secs, None)
    }

    /// Create or replace a daily alarm anchored to local `wall_time`.
    pub fn upsert_daily(&self, name: &str, next_fire_at: DateTime<Utc>, wall_time: NaiveTime) -> Result<()> {
        self.save(name, next_fire_at, DAY_SECS, Some(wall_time))
    }

    fn save(
        &self,
        name: &str,
        next_fire_at: DateTime<Utc>,
        period_secs: i64,
        wall_time: Option<NaiveTime>,
    ) -> Result<()> {
        let wall_time = wall_time.map(|t| t.format(WALL_TIME_FORMAT).to_string());
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO alarms (name, next_fire_at, period_secs, wall_time) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(name) DO UPDATE SET
                    next_fire_at = excluded.next_fire_at,
                    period_secs = excluded.period_secs,
                    wall_time = excluded.wall_time",
                rusqlite::params![name, next_fire_at.timestamp(), period_secs, wall_time],
            )
            .map_err(|e| TidemarkError::Storage(format!("Failed to save alarm {}: {}", name, e)))?;
            Ok(())
        })
    }

    pub fn get(&self, name: &str) -> Result<Option<Alarm>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT name, next_fire_at, period_secs, last_fired_at, wall_time FROM alarms WHERE name = ?1",
                rusqlite::params![name],
                row_to_alarm,
            )
            .optional()
            .map_err(|e| TidemarkError::Storage(e.to_string()))
        })
    }

    /// All alarms, soonest first.
    pub fn list(&self) -> Result<Vec<Alarm>> {
        self.query("SELECT name, next_fire_at, period_secs, last_fired_at, wall_time FROM alarms ORDER BY next_fire_at ASC", None)
    }

    /// Alarms whose fire instant is at or before `now`, soonest first.
    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<Alarm>> {
        self.query(
            "SELECT name, next_fire_at, period_secs, last_fired_at, wall_time FROM alarms
             WHERE next_fire_at <= ?1 ORDER BY next_fire_at ASC",
            Some(now.timestamp()),
        )
    }

    /// Record that an alarm fired. Periodic alarms advance to their next
    /// future occurrence; one-shot alarms are removed.
    pub fn mark_fired(&self, name: &str, fired_at: DateTime<Utc>) -> Result<Option<Alarm>> {
        let Some(alarm) = self.get(name)? else {
            return Ok(None);
        };

        match alarm.following(fired_at) {
            Some(next) => {
                self.db.with_conn(|conn| {
                    conn.execute(
                        "UPDATE alarms SET next_fire_at = ?2, last_fired_at = ?3 WHERE name = ?1",
                        rusqlite::params![name, next.timestamp(), fired_at.timestamp()],
                    )
                    .map_err(|e| {
                        TidemarkError::Storage(format!("Failed to advance alarm {}: {}", name, e))
                    })?;
                    Ok(())
                })?;
                Ok(Some(Alarm {
                    next_fire_at: next,
                    last_fired_at: Some(fired_at),
                    ..alarm
                }))
            }
            None => {
                self.delete(name)?;
                Ok(None)
            }
        }
    }

    /// Record that an alarm fired and move it to `next`, which its owner
    /// computed. Used for daily alarms, whose next instant depends on the
    /// local zone.
    pub fn reschedule(&self, name: &str, next: DateTime<Utc>, fired_at: DateTime<Utc>) -> Result<Option<Alarm>> {
        let updated = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE alarms SET next_fire_at = ?2, last_fired_at = ?3 WHERE name = ?1",
                rusqlite::params![name, next.timestamp(), fired_at.timestamp()],
            )
            .map_err(|e| TidemarkError::Storage(format!("Failed to reschedule alarm {}: {}", name, e)))
        })?;
        if updated == 0 {
            return Ok(None);
        }
        self.get(name)
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM alarms WHERE name = ?1", rusqlite::params![name])
                .map_err(|e| TidemarkError::Storage(format!("Failed to delete alarm {}: {}", name, e)))?;
            Ok(())
        })
    }

    fn query(&self, sql: &str, bound: Option<i64>) -> Result<Vec<Alarm>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(sql)
                .map_err(|e| TidemarkError::Storage(e.to_string()))?;
            let rows = match bound {
                Some(ts) => stmt.query_map(rusqlite::params![ts], row_to_alarm),
                None => stmt.query_map([], row_to_alarm),
            }
            .map_err(|e| TidemarkError::Storage(e.to_string()))?;

            let mut alarms = Vec::new();
            for row in rows {
                alarms.push(row.map_err(|e| TidemarkError::Storage(e.to_string()))?);
            }
            Ok(alarms)
        })
    }
}

fn row_to_alarm(row: &rusqlite::Row<'_>) -> rusqlite::Result<Alarm> {
    let next: i64 = row.get(1)?;
    let last: Option<i64> = row.get(3)?;
    let wall_time: Option<String> = row.get(4)?;
    Ok(Alarm {
        name: row.get(0)?,
        next_fire_at: from_unix(next),
        period_secs: row.get(2)?,
        wall_time: wall_time.and_then(|t| NaiveTime::parse_from_str(&t, WALL_TIME_FORMAT).ok()),
        last_fired_at: last.map(from_unix),
    })
}

fn from_unix(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> AlarmRepository {
        AlarmRepository::new(Arc::new(Database::in_memory().unwrap()))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_upsert_replaces() {
        let repo = repo();
        repo.upsert("digest", at(1_000), 86_400).unwrap();
        repo.upsert("digest", at(2_000), 86_400).unwrap();

        let alarms = repo.list().unwrap();
        assert_eq!(alarms.len(), 1);
        assert_eq!(alarms[0].next_fire_at, at(2_000));
    }

    #[test]
    fn test_due_filters_by_instant() {
        let repo = repo();
        repo.upsert("early", at(100), 60).unwrap();
        repo.upsert("late", at(500), 60).unwrap();

        let due = repo.due(at(200)).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].name, "early");
        assert!(repo.due(at(50)).unwrap().is_empty());
    }

    #[test]
    fn test_mark_fired_skips_missed_periods() {
        let repo = repo();
        repo.upsert("digest", at(1_000), 100).unwrap();

        // Three and a half periods late.
        let advanced = repo.mark_fired("digest", at(1_350)).unwrap().unwrap();
        assert_eq!(advanced.next_fire_at, at(1_400));
        assert_eq!(advanced.last_fired_at, Some(at(1_350)));

        let stored = repo.get("digest").unwrap().unwrap();
        assert_eq!(stored, advanced);
    }

    #[test]
    fn test_mark_fired_on_exact_boundary_moves_forward() {
        let repo = repo();
        repo.upsert("tick", at(1_000), 100).unwrap();
        let advanced = repo.mark_fired("tick", at(1_000)).unwrap().unwrap();
        assert_eq!(advanced.next_fire_at, at(1_100));
    }

    #[test]
    fn test_one_shot_alarm_removed_after_firing() {
        let repo = repo();
        repo.upsert("once", at(10), 0).unwrap();
        assert!(repo.mark_fired("once", at(20)).unwrap().is_none());
        assert!(repo.get("once").unwrap().is_none());
    }

    #[test]
    fn test_daily_alarm_keeps_wall_time() {
        let repo = repo();
        let nine_pm = NaiveTime::from_hms_opt(21, 0, 0).unwrap();
        repo.upsert_daily("digest", at(5_000), nine_pm).unwrap();

        let alarm = repo.get("digest").unwrap().unwrap();
        assert_eq!(alarm.wall_time, Some(nine_pm));
        assert_eq!(alarm.period_secs, DAY_SECS);

        // A plain upsert drops the anchor.
        repo.upsert("digest", at(6_000), 60).unwrap();
        assert_eq!(repo.get("digest").unwrap().unwrap().wall_time, None);
    }

    #[test]
    fn test_reschedule_sets_owner_computed_instant() {
        let repo = repo();
        let nine_pm = NaiveTime::from_hms_opt(21, 0, 0).unwrap();
        repo.upsert_daily("digest", at(1_000), nine_pm).unwrap();

        let moved = repo.reschedule("digest", at(1_000 + DAY_SECS - 3600), at(1_010)).unwrap().unwrap();
        assert_eq!(moved.next_fire_at, at(1_000 + DAY_SECS - 3600));
        assert_eq!(moved.last_fired_at, Some(at(1_010)));
        assert_eq!(moved.wall_time, Some(nine_pm));

        assert!(repo.reschedule("missing", at(1), at(1)).unwrap().is_none());
    }

    #[test]
    fn test_alarms_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alarms.db");
        {
            let repo = AlarmRepository::new(Arc::new(Database::new(&path).unwrap()));
            repo.upsert("digest", at(5_000), 86_400).unwrap();
        }
        let repo = AlarmRepository::new(Arc::new(Database::new(&path).unwrap()));
        assert_eq!(repo.get("digest").unwrap().unwrap().period_secs, 86_400);
    }
}
