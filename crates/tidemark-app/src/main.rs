//! Tidemark application binary - composition root.
//!
//! Ties together all Tidemark crates into a single executable:
//! 1. Load configuration from TOML and apply CLI overrides
//! 2. Open storage (SQLite blobs + durable alarms)
//! 3. Restore the activity pipeline and build the digest service
//! 4. Run the alarm scheduler (flush/snapshot tick, daily digest, retries
//!    of scheduled digests that did not go out)
//! 5. Serve the local REST API until Ctrl-C, then flush and snapshot

mod cli;

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use tidemark_api::{load_or_generate_token, start_server, AppState, TOKEN_FILE};
use tidemark_core::config::TidemarkConfig;
use tidemark_core::types::local_date;
use tidemark_digest::{
    ensure_daily, ensure_interval, AlarmFired, DigestService, DigestTrigger, Scheduler, DIGEST_ALARM,
    TICK_ALARM,
};
use tidemark_storage::{AlarmRepository, BlobStore, Database, SqliteBlobStore};
use tidemark_tracker::{ActivityPipeline, ContentCapture, MailboxExtractor, SharedPipeline};

use cli::{CliArgs, Command};

type AppResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Everything the subcommands share.
struct Runtime {
    config: TidemarkConfig,
    alarms: Arc<AlarmRepository>,
    mailbox: Arc<MailboxExtractor>,
    pipeline: SharedPipeline,
    digest: Arc<DigestService>,
}

impl Runtime {
    fn open(config: TidemarkConfig) -> AppResult<Self> {
        let data_dir = config.general.data_path();
        std::fs::create_dir_all(&data_dir).map_err(|e| {
            tracing::error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
            e
        })?;

        let db_path = config.general.database_path();
        let db = Arc::new(Database::new(&db_path)?);
        info!(path = %db_path.display(), "SQLite database opened");

        let blobs: Arc<dyn BlobStore> =
            Arc::new(SqliteBlobStore::new(Arc::clone(&db)).with_quota(config.storage.quota_bytes));
        let alarms = Arc::new(AlarmRepository::new(Arc::clone(&db)));

        let mailbox = Arc::new(MailboxExtractor::new());
        let pipeline = ActivityPipeline::open(&config, Arc::clone(&blobs), Utc::now())?;
        let pipeline = SharedPipeline::new(pipeline, ContentCapture::new(mailbox.clone()));

        let digest = DigestService::from_config(pipeline.clone(), blobs, &config.digest)?
            .with_alarms(Arc::clone(&alarms));

        Ok(Self {
            config,
            alarms,
            mailbox,
            pipeline,
            digest: Arc::new(digest),
        })
    }

    /// Final flush and snapshot.
    async fn close(&self) -> AppResult<()> {
        self.pipeline.lock().await.shutdown(Utc::now())?;
        Ok(())
    }
}

fn init_tracing(args: &CliArgs, config: &TidemarkConfig) {
    // --log-level > RUST_LOG > config file.
    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level)),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Make the durable alarms match the configuration.
fn sync_alarms(alarms: &AlarmRepository, config: &TidemarkConfig) -> AppResult<()> {
    let now = Utc::now();
    if config.digest.enabled {
        let send_time = config.digest.parse_send_time()?;
        let next = ensure_daily(alarms, DIGEST_ALARM, send_time, now)?;
        info!(next_run_at = %next, "Daily digest scheduled");
    } else {
        alarms.delete(DIGEST_ALARM)?;
        info!("Daily digest disabled");
    }
    ensure_interval(
        alarms,
        TICK_ALARM,
        Duration::from_secs(config.tracker.snapshot_interval_secs),
        now,
    )?;
    Ok(())
}

/// Act on fired alarms until the scheduler goes away.
async fn alarm_loop(mut rx: mpsc::Receiver<AlarmFired>, pipeline: SharedPipeline, digest: Arc<DigestService>) {
    while let Some(fired) = rx.recv().await {
        match fired.name.as_str() {
            DIGEST_ALARM => {
                let date = local_date(fired.scheduled_for);
                match digest.run(date, DigestTrigger::Scheduled, Utc::now()).await {
                    Ok(outcome) => info!(outcome = ?outcome, "Scheduled digest finished"),
                    Err(e) => warn!(%date, error = %e, "Scheduled digest failed"),
                }
            }
            TICK_ALARM => {
                match pipeline.lock().await.tick(Utc::now()) {
                    Ok(report) => debug!(retained = report.retained, expired = report.expired, "Tick"),
                    Err(e) => warn!(error = %e, "Tick flush failed"),
                }
                retry_pending_digests(&digest).await;
            }
            other => debug!(alarm = other, "Ignoring unknown alarm"),
        }
    }
}

/// Deliver scheduled days whose digest failed or was cut short.
async fn retry_pending_digests(digest: &DigestService) {
    match digest.retry_pending(Utc::now()).await {
        Ok(outcomes) => {
            for outcome in outcomes {
                info!(outcome = ?outcome, "Pending digest retried");
            }
        }
        Err(e) => warn!(error = %e, "Failed to retry pending digests"),
    }
}

/// Re-sync alarms whenever the configuration changes through the API.
async fn config_watch(
    mut rx: watch::Receiver<TidemarkConfig>,
    alarms: Arc<AlarmRepository>,
    scheduler: Arc<Scheduler>,
) {
    while rx.changed().await.is_ok() {
        let config = rx.borrow_and_update().clone();
        match sync_alarms(&alarms, &config) {
            Ok(()) => scheduler.wake(),
            Err(e) => warn!(error = %e, "Failed to reschedule alarms after config change"),
        }
    }
}

async fn serve(runtime: Runtime, config_file: std::path::PathBuf) -> AppResult<()> {
    sync_alarms(&runtime.alarms, &runtime.config)?;

    {
        let digest = Arc::clone(&runtime.digest);
        tokio::spawn(async move { retry_pending_digests(&digest).await });
    }

    let (alarm_tx, alarm_rx) = mpsc::channel(16);
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&runtime.alarms), alarm_tx));
    let scheduler_task = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run().await })
    };
    tokio::spawn(alarm_loop(
        alarm_rx,
        runtime.pipeline.clone(),
        Arc::clone(&runtime.digest),
    ));

    let state = AppState::new(
        runtime.config.clone(),
        runtime.pipeline.clone(),
        Arc::clone(&runtime.mailbox),
        Arc::clone(&runtime.digest),
    )
    .with_config_path(config_file)
    .with_api_token(load_or_generate_token(
        &runtime.config.general.data_path().join(TOKEN_FILE),
    ));
    tokio::spawn(config_watch(
        state.subscribe_config(),
        Arc::clone(&runtime.alarms),
        Arc::clone(&scheduler),
    ));

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };

    let port = runtime.config.general.port;
    let served = start_server(port, state, shutdown).await;
    if let Err(e) = &served {
        tracing::error!(port, error = %e, "API server stopped; is another instance running?");
    }

    scheduler.shutdown();
    if let Err(e) = scheduler_task.await {
        warn!(error = %e, "Scheduler task ended abnormally");
    }
    runtime.close().await?;
    info!("Tidemark stopped");
    served.map_err(Into::into)
}

#[tokio::main]
async fn main() -> AppResult<()> {
    let args = CliArgs::parse();

    let config_file = args.resolve_config_path();
    let (mut config, load_error) = match TidemarkConfig::load(&config_file) {
        Ok(config) => (config, None),
        Err(e) => (TidemarkConfig::default(), Some(e)),
    };
    args.apply_overrides(&mut config);

    init_tracing(&args, &config);
    info!("Starting Tidemark v{}", env!("CARGO_PKG_VERSION"));
    match load_error {
        None => info!(path = %config_file.display(), "Configuration loaded"),
        Some(_) if !config_file.exists() => {
            info!(path = %config_file.display(), "No configuration file; using defaults")
        }
        Some(e) => warn!(path = %config_file.display(), error = %e, "Invalid configuration; using defaults"),
    }

    let runtime = Runtime::open(config)?;

    match args.command() {
        Command::Serve => serve(runtime, config_file).await,
        Command::Digest { date, dry_run } => {
            let date = date.unwrap_or_else(|| Local::now().date_naive());
            if dry_run {
                match runtime.digest.preview(date, Utc::now()).await? {
                    Some(report) => println!("{}", report.text),
                    None => println!("No events recorded on {}", date),
                }
            } else {
                let outcome = runtime
                    .digest
                    .run(date, DigestTrigger::Manual, Utc::now())
                    .await?;
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            }
            runtime.close().await
        }
        Command::Stats => {
            let (stats, dwell) = {
                let pipeline = runtime.pipeline.lock().await;
                (pipeline.store().stats(), pipeline.dwell_totals())
            };
            let report = serde_json::json!({ "store": stats, "dwell": dwell });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Clear { yes } => {
            if !yes {
                return Err("refusing to delete all events without --yes".into());
            }
            let cleared = {
                let mut pipeline = runtime.pipeline.lock().await;
                let count = pipeline.store().events().len();
                pipeline.store_mut().clear()?;
                count
            };
            println!("Cleared {} events", cleared);
            runtime.close().await
        }
    }
}
