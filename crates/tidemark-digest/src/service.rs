//! Digest orchestration: guard, gather, build, deliver, mark.
//!
//! A scheduled day is recorded as pending before anything is built and only
//! leaves that set on a final outcome, so a failed delivery or a crash
//! mid-delivery is picked up again by `retry_pending`.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use tidemark_core::config::DigestConfig;
use tidemark_core::types::DayWindow;
use tidemark_storage::blob::{read_json, write_json};
use tidemark_storage::{keys, AlarmRepository, BlobStore};
use tidemark_tracker::SharedPipeline;

use crate::builder::DigestBuilder;
use crate::delivery::{sinks_from_config, DigestSink};
use crate::error::DigestError;
use crate::scheduler::DIGEST_ALARM;
use crate::types::{DigestInput, DigestOutcome, DigestReport, DigestStatus, DigestTrigger};

const MIN_RETRY_SECS: i64 = 60;
const MAX_RETRY_SECS: i64 = 60 * 60;

struct ServiceState {
    enabled: bool,
    builder: DigestBuilder,
    sinks: Vec<Arc<dyn DigestSink>>,
}

/// Backoff between retries of pending days. Held for the length of a run so
/// runs never overlap.
struct RetryState {
    delay: Duration,
    not_before: Option<DateTime<Utc>>,
}

impl Default for RetryState {
    fn default() -> Self {
        Self {
            delay: Duration::seconds(MIN_RETRY_SECS),
            not_before: None,
        }
    }
}

/// Runs digests against the shared pipeline.
pub struct DigestService {
    pipeline: SharedPipeline,
    blobs: Arc<dyn BlobStore>,
    alarms: Option<Arc<AlarmRepository>>,
    state: RwLock<ServiceState>,
    runs: Mutex<RetryState>,
}

impl DigestService {
    pub fn new(
        pipeline: SharedPipeline,
        blobs: Arc<dyn BlobStore>,
        builder: DigestBuilder,
        sinks: Vec<Arc<dyn DigestSink>>,
    ) -> Self {
        Self {
            pipeline,
            blobs,
            alarms: None,
            state: RwLock::new(ServiceState {
                enabled: true,
                builder,
                sinks,
            }),
            runs: Mutex::new(RetryState::default()),
        }
    }

    pub fn from_config(
        pipeline: SharedPipeline,
        blobs: Arc<dyn BlobStore>,
        config: &DigestConfig,
    ) -> Result<Self, DigestError> {
        let mut service = Self::new(
            pipeline,
            blobs,
            DigestBuilder::from_config(config),
            sinks_from_config(config)?,
        );
        service.state.get_mut().enabled = config.enabled;
        Ok(service)
    }

    /// Report `next_run_at` from the durable digest alarm.
    pub fn with_alarms(mut self, alarms: Arc<AlarmRepository>) -> Self {
        self.alarms = Some(alarms);
        self
    }

    /// Swap in new sinks and settings. Nothing changes if the new sinks
    /// cannot be built.
    pub async fn reload(&self, config: &DigestConfig) -> Result<(), DigestError> {
        let sinks = sinks_from_config(config)?;
        let mut state = self.state.write().await;
        state.enabled = config.enabled;
        state.builder = DigestBuilder::from_config(config);
        state.sinks = sinks;
        info!(sinks = state.sinks.len(), enabled = config.enabled, "Digest configuration reloaded");
        Ok(())
    }

    /// The last day a digest was delivered for.
    pub fn last_sent(&self) -> Result<Option<NaiveDate>, DigestError> {
        Ok(read_json(self.blobs.as_ref(), keys::DIGEST_LAST_SENT)?)
    }

    /// Scheduled days that still need delivering, oldest first.
    pub fn pending(&self) -> Result<BTreeSet<NaiveDate>, DigestError> {
        Ok(read_json(self.blobs.as_ref(), keys::DIGEST_PENDING)?.unwrap_or_default())
    }

    fn set_pending(&self, date: NaiveDate, pending: bool) -> Result<(), DigestError> {
        let mut dates = self.pending()?;
        let changed = if pending {
            dates.insert(date)
        } else {
            dates.remove(&date)
        };
        if changed {
            write_json(self.blobs.as_ref(), keys::DIGEST_PENDING, &dates)?;
        }
        Ok(())
    }

    pub async fn status(&self) -> Result<DigestStatus, DigestError> {
        let next_run_at = match &self.alarms {
            Some(alarms) => alarms.get(DIGEST_ALARM)?.map(|a| a.next_fire_at),
            None => None,
        };
        let state = self.state.read().await;
        Ok(DigestStatus {
            enabled: state.enabled,
            last_sent: self.last_sent()?,
            next_run_at,
            pending: self.pending()?.into_iter().collect(),
            sinks: state.sinks.iter().map(|s| s.name().to_string()).collect(),
        })
    }

    /// Collect everything a digest for `date` needs, under the pipeline lock.
    pub async fn gather(&self, date: NaiveDate) -> Result<DigestInput, DigestError> {
        let pipeline = self.pipeline.lock().await;
        let store = pipeline.store();
        Ok(DigestInput {
            date,
            events: store.query(&DayWindow::local(date)).to_vec(),
            dwell: pipeline.dwell_totals(),
            content: store.page_content(date)?,
        })
    }

    /// Build the report for `date` without delivering it or touching any
    /// state. `None` when the day has no events.
    pub async fn preview(&self, date: NaiveDate, now: DateTime<Utc>) -> Result<Option<DigestReport>, DigestError> {
        let input = self.gather(date).await?;
        if input.events.is_empty() {
            return Ok(None);
        }
        let builder = self.state.read().await.builder.clone();
        Ok(Some(builder.build(&input, now)))
    }

    /// Build and deliver the digest for `date`.
    pub async fn run(
        &self,
        date: NaiveDate,
        trigger: DigestTrigger,
        now: DateTime<Utc>,
    ) -> Result<DigestOutcome, DigestError> {
        let _running = self.runs.lock().await;
        self.run_locked(date, trigger, now).await
    }

    /// Re-run every pending scheduled day. Skipped while backing off after a
    /// failed round, or while there is nowhere to deliver to.
    pub async fn retry_pending(&self, now: DateTime<Utc>) -> Result<Vec<DigestOutcome>, DigestError> {
        let mut retry = self.runs.lock().await;
        if retry.not_before.is_some_and(|at| now < at) {
            return Ok(Vec::new());
        }
        {
            let state = self.state.read().await;
            if !state.enabled || state.sinks.is_empty() {
                return Ok(Vec::new());
            }
        }
        let dates = self.pending()?;
        if dates.is_empty() {
            return Ok(Vec::new());
        }

        let mut outcomes = Vec::with_capacity(dates.len());
        let mut failed = false;
        for date in dates {
            info!(%date, "Retrying pending digest");
            match self.run_locked(date, DigestTrigger::Scheduled, now).await {
                Ok(outcome) => {
                    failed |= !outcome.is_final();
                    outcomes.push(outcome);
                }
                Err(e) => {
                    warn!(%date, error = %e, "Pending digest retry failed");
                    failed = true;
                }
            }
        }

        if failed {
            retry.not_before = Some(now + retry.delay);
            debug!(delay_secs = retry.delay.num_seconds(), "Backing off pending digest retries");
            retry.delay = (retry.delay * 2).min(Duration::seconds(MAX_RETRY_SECS));
        } else {
            *retry = RetryState::default();
        }
        Ok(outcomes)
    }

    async fn run_locked(
        &self,
        date: NaiveDate,
        trigger: DigestTrigger,
        now: DateTime<Utc>,
    ) -> Result<DigestOutcome, DigestError> {
        if trigger == DigestTrigger::Scheduled {
            if self.last_sent()? == Some(date) {
                debug!(%date, "Digest already sent");
                self.set_pending(date, false)?;
                return Ok(DigestOutcome::AlreadySent { date });
            }
            self.set_pending(date, true)?;
        }

        let input = self.gather(date).await?;
        if input.events.is_empty() {
            info!(%date, "No events; digest skipped");
            self.set_pending(date, false)?;
            return Ok(DigestOutcome::NoEvents { date });
        }

        let (enabled, builder, sinks) = {
            let state = self.state.read().await;
            (state.enabled, state.builder.clone(), state.sinks.clone())
        };
        if sinks.is_empty() || (trigger == DigestTrigger::Scheduled && !enabled) {
            info!(%date, "No digest sink configured");
            return Ok(DigestOutcome::NotConfigured { date });
        }

        let report = builder.build(&input, now);
        let mut delivered_to = Vec::new();
        let mut failed = Vec::new();
        for sink in &sinks {
            match sink.deliver(&report).await {
                Ok(()) => delivered_to.push(sink.name().to_string()),
                Err(e) => {
                    warn!(sink = sink.name(), error = %e, "Digest delivery failed");
                    failed.push(format!("{}: {}", sink.name(), e));
                }
            }
        }

        if delivered_to.is_empty() {
            return Ok(DigestOutcome::DeliveryFailed { date, errors: failed });
        }

        write_json(self.blobs.as_ref(), keys::DIGEST_LAST_SENT, &date)?;
        self.set_pending(date, false)?;
        {
            // Sessions that closed while the sinks were busy stay counted.
            let mut pipeline = self.pipeline.lock().await;
            pipeline.tracker_mut().settle_dwell(&input.dwell);
            if let Err(e) = pipeline.persist_snapshot(now) {
                warn!(error = %e, "Failed to snapshot tracker after digest");
            }
        }

        info!(
            %date,
            events = report.event_count,
            delivered = delivered_to.len(),
            failed = failed.len(),
            "Digest delivered"
        );
        Ok(DigestOutcome::Delivered {
            date,
            delivered_to,
            failed,
            event_count: report.event_count,
        })
    }
}
