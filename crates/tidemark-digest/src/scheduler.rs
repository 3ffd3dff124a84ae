//! Restart-durable alarm scheduler.
//!
//! Alarms live in SQLite, so a trigger survives the process being killed.
//! The loop fires every due alarm (including ones missed while the process
//! was down), advances it to its next future occurrence, and reports it on a
//! channel. Whoever owns the receiver decides what each alarm means. Daily
//! alarms advance to the next local occurrence of their wall time rather than
//! by a fixed 24 hours, so they follow DST changes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveTime, TimeZone, Utc};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use tidemark_storage::{Alarm, AlarmRepository, DAY_SECS};

use crate::error::DigestError;

/// Alarm driving the daily digest.
pub const DIGEST_ALARM: &str = "digest.daily";
/// Alarm driving the store flush and tracker snapshot.
pub const TICK_ALARM: &str = "pipeline.tick";

/// The next instant, strictly after `now`, at which the wall clock in `tz`
/// reads `target`. Today if that is still ahead, otherwise tomorrow.
pub fn next_occurrence_in<Tz: TimeZone>(target: NaiveTime, now: DateTime<Utc>, tz: &Tz) -> DateTime<Utc> {
    let local_now = now.with_timezone(tz);
    let mut date = local_now.date_naive();
    // Two days covers a target that falls in a skipped DST hour today.
    for _ in 0..3 {
        let candidate = tz
            .from_local_datetime(&date.and_time(target))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc));
        if let Some(at) = candidate.filter(|at| *at > now) {
            return at;
        }
        date = match date.succ_opt() {
            Some(next) => next,
            None => break,
        };
    }
    now + chrono::Duration::seconds(DAY_SECS)
}

/// `next_occurrence_in` for the host's local time zone.
pub fn next_occurrence(target: NaiveTime, now: DateTime<Utc>) -> DateTime<Utc> {
    next_occurrence_in(target, now, &Local)
}

/// Make sure the daily alarm `name` fires at `target` local time.
///
/// An existing alarm already anchored to that time is left alone so a fire
/// missed while the process was down still happens on startup.
pub fn ensure_daily(
    alarms: &AlarmRepository,
    name: &str,
    target: NaiveTime,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, DigestError> {
    if let Some(existing) = alarms.get(name)? {
        if existing.wall_time == Some(target) {
            return Ok(existing.next_fire_at);
        }
    }

    let next = next_occurrence(target, now);
    alarms.upsert_daily(name, next, target)?;
    info!(alarm = name, next_fire_at = %next, "Daily alarm scheduled");
    Ok(next)
}

/// Make sure the repeating alarm `name` exists with `period`.
pub fn ensure_interval(
    alarms: &AlarmRepository,
    name: &str,
    period: Duration,
    now: DateTime<Utc>,
) -> Result<(), DigestError> {
    let period_secs = period.as_secs().max(1) as i64;
    match alarms.get(name)? {
        Some(existing) if existing.period_secs == period_secs => Ok(()),
        _ => {
            alarms.upsert(name, now + chrono::Duration::seconds(period_secs), period_secs)?;
            Ok(())
        }
    }
}

/// A fired alarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmFired {
    pub name: String,
    /// The instant the alarm was due, which may be well before `fired_at`.
    pub scheduled_for: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
}

/// Background loop that turns due alarms into `AlarmFired` messages.
pub struct Scheduler {
    alarms: Arc<AlarmRepository>,
    tx: mpsc::Sender<AlarmFired>,
    shutdown: Arc<Notify>,
    wake: Arc<Notify>,
    max_sleep: Duration,
}

impl Scheduler {
    pub fn new(alarms: Arc<AlarmRepository>, tx: mpsc::Sender<AlarmFired>) -> Self {
        Self {
            alarms,
            tx,
            shutdown: Arc::new(Notify::new()),
            wake: Arc::new(Notify::new()),
            max_sleep: Duration::from_secs(60),
        }
    }

    /// Upper bound on a single sleep. Wall-clock alarms are re-checked at
    /// least this often.
    pub fn with_max_sleep(mut self, max_sleep: Duration) -> Self {
        self.max_sleep = max_sleep;
        self
    }

    /// Start the scheduler loop. Returns on shutdown or when the receiver
    /// is gone.
    pub async fn run(&self) {
        info!("Scheduler started");
        loop {
            let now = Utc::now();
            let due = match self.alarms.due(now) {
                Ok(due) => due,
                Err(e) => {
                    warn!(error = %e, "Failed to read due alarms");
                    Vec::new()
                }
            };

            for alarm in due {
                if !self.fire(alarm, now).await {
                    info!("Alarm receiver closed; scheduler stopping");
                    return;
                }
            }

            let delay = self.next_delay(now);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.wake.notified() => {
                    debug!("Scheduler woken to re-read alarms");
                }
                _ = self.shutdown.notified() => {
                    info!("Scheduler stopped");
                    return;
                }
            }
        }
    }

    async fn fire(&self, alarm: Alarm, now: DateTime<Utc>) -> bool {
        let advanced = match alarm.wall_time {
            Some(wall_time) => self
                .alarms
                .reschedule(&alarm.name, next_occurrence(wall_time, now), now),
            None => self.alarms.mark_fired(&alarm.name, now),
        };
        if let Err(e) = advanced {
            warn!(alarm = %alarm.name, error = %e, "Failed to advance alarm");
        }
        debug!(alarm = %alarm.name, scheduled_for = %alarm.next_fire_at, "Alarm fired");
        self.tx
            .send(AlarmFired {
                name: alarm.name,
                scheduled_for: alarm.next_fire_at,
                fired_at: now,
            })
            .await
            .is_ok()
    }

    fn next_delay(&self, now: DateTime<Utc>) -> Duration {
        let next = match self.alarms.list() {
            Ok(alarms) => alarms.first().map(|a| a.next_fire_at),
            Err(e) => {
                warn!(error = %e, "Failed to list alarms");
                None
            }
        };
        next.map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(self.max_sleep)
            .min(self.max_sleep)
    }

    /// Re-read alarms now, e.g. after one was rescheduled.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Signal the scheduler to shut down gracefully.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}
