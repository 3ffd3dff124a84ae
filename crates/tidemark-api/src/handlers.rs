//! Route handler functions for all API endpoints.
//!
//! Each handler extracts query/path parameters via axum extractors,
//! interacts with the shared pipeline or digest service, and returns JSON.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use tidemark_core::config::TidemarkConfig;
use tidemark_core::types::{ActivityEvent, DayWindow, ExtractedPage, PageMeta, SessionHandle};
use tidemark_digest::{DigestOutcome, DigestReport, DigestStatus, DigestTrigger};
use tidemark_storage::StoreStats;
use tidemark_tracker::{DwellEntry, Signal, SignalOutcome};

use crate::error::ApiError;
use crate::state::AppState;

// =============================================================================
// Query parameter types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct DateParams {
    /// `YYYY-MM-DD`; defaults to today in local time.
    pub date: Option<String>,
}

impl DateParams {
    fn resolve(&self) -> Result<NaiveDate, ApiError> {
        match self.date.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
            Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| {
                ApiError::BadRequest(format!("Invalid date '{}': {} (expected YYYY-MM-DD)", raw, e))
            }),
            None => Ok(Local::now().date_naive()),
        }
    }
}

// =============================================================================
// Request / response types
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub event_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventsResponse {
    pub date: NaiveDate,
    pub count: usize,
    pub events: Vec<ActivityEvent>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearResponse {
    pub cleared: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DwellResponse {
    pub total_secs: u64,
    pub domains: BTreeMap<String, DwellEntry>,
}

/// Body of `POST /content/{handle}`: one page extraction from the browser.
#[derive(Debug, Deserialize)]
pub struct ContentDeposit {
    pub url: String,
    pub text: String,
    #[serde(default)]
    pub meta: PageMeta,
    #[serde(default)]
    pub word_count: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ContentAccepted {
    pub handle: i64,
    pub pending: usize,
}

// =============================================================================
// Handlers
// =============================================================================

/// GET /health - health check.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let event_count = state.pipeline.lock().await.store().events().len();
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        event_count,
    })
}

/// POST /signals - feed one browser signal through the pipeline.
pub async fn submit_signal(
    State(state): State<AppState>,
    Json(signal): Json<Signal>,
) -> Json<SignalOutcome> {
    Json(state.pipeline.submit(signal).await)
}

/// POST /content/{handle} - deposit a page extraction for a session.
pub async fn deposit_content(
    State(state): State<AppState>,
    Path(handle): Path<i64>,
    Json(body): Json<ContentDeposit>,
) -> Result<(StatusCode, Json<ContentAccepted>), ApiError> {
    if body.url.trim().is_empty() {
        return Err(ApiError::BadRequest("url must not be empty".to_string()));
    }
    let word_count = body
        .word_count
        .unwrap_or_else(|| body.text.split_whitespace().count());
    let page = ExtractedPage {
        text: body.text,
        meta: body.meta,
        word_count,
    };
    state.mailbox.deposit(SessionHandle(handle), &body.url, page)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ContentAccepted {
            handle,
            pending: state.mailbox.pending(),
        }),
    ))
}

/// GET /events?date= - one local day's events in chronological order.
pub async fn events(
    State(state): State<AppState>,
    Query(params): Query<DateParams>,
) -> Result<Json<EventsResponse>, ApiError> {
    let date = params.resolve()?;
    let pipeline = state.pipeline.lock().await;
    let events = pipeline.store().query(&DayWindow::local(date)).to_vec();
    Ok(Json(EventsResponse {
        date,
        count: events.len(),
        events,
    }))
}

/// DELETE /events - drop every stored event and all page content.
pub async fn clear_events(State(state): State<AppState>) -> Result<Json<ClearResponse>, ApiError> {
    let mut pipeline = state.pipeline.lock().await;
    let cleared = pipeline.store().events().len();
    pipeline.store_mut().clear()?;
    info!(cleared, "Event store cleared via API");
    Ok(Json(ClearResponse { cleared }))
}

/// GET /stats - event store statistics.
pub async fn stats(State(state): State<AppState>) -> Json<StoreStats> {
    Json(state.pipeline.lock().await.store().stats())
}

/// GET /dwell - accumulated dwell per domain since the last digest.
pub async fn dwell(State(state): State<AppState>) -> Json<DwellResponse> {
    let domains = state.pipeline.lock().await.dwell_totals();
    Json(DwellResponse {
        total_secs: domains.values().map(|d| d.total_secs).sum(),
        domains,
    })
}

/// GET /digest/status - last sent day, next run, configured sinks.
pub async fn digest_status(State(state): State<AppState>) -> Result<Json<DigestStatus>, ApiError> {
    Ok(Json(state.digest.status().await?))
}

/// POST /digest/build?date= - build and deliver now, bypassing the
/// already-sent guard.
pub async fn build_digest(
    State(state): State<AppState>,
    Query(params): Query<DateParams>,
) -> Result<Json<DigestOutcome>, ApiError> {
    let date = params.resolve()?;
    let outcome = state
        .digest
        .run(date, DigestTrigger::Manual, Utc::now())
        .await?;
    Ok(Json(outcome))
}

/// GET /digest/preview?date= - render without delivering.
pub async fn preview_digest(
    State(state): State<AppState>,
    Query(params): Query<DateParams>,
) -> Result<Json<DigestReport>, ApiError> {
    let date = params.resolve()?;
    state
        .digest
        .preview(date, Utc::now())
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No events recorded on {}", date)))
}

/// GET /config - get config.
pub async fn get_config(State(state): State<AppState>) -> Json<TidemarkConfig> {
    Json(state.current_config())
}

/// PUT /config - merge a partial update, apply it and publish it.
pub async fn update_config(
    State(state): State<AppState>,
    Json(partial): Json<serde_json::Value>,
) -> Result<Json<TidemarkConfig>, ApiError> {
    let current_config = state.current_config();
    let mut current = serde_json::to_value(&current_config)
        .map_err(|e| ApiError::Internal(format!("Failed to serialize config: {}", e)))?;

    let Some(partial_obj) = partial.as_object() else {
        return Err(ApiError::BadRequest(
            "Request body must be a JSON object".to_string(),
        ));
    };
    let Some(current_obj) = current.as_object_mut() else {
        return Err(ApiError::Internal("Config is not a JSON object".to_string()));
    };
    for (key, value) in partial_obj {
        let Some(existing) = current_obj.get_mut(key) else {
            return Err(ApiError::BadRequest(format!(
                "Unknown configuration section: '{}'",
                key
            )));
        };
        match (existing.as_object_mut(), value.as_object()) {
            (Some(existing_obj), Some(value_obj)) => {
                for (k, v) in value_obj {
                    existing_obj.insert(k.clone(), v.clone());
                }
            }
            _ => *existing = value.clone(),
        }
    }

    let updated: TidemarkConfig = serde_json::from_value(current)
        .map_err(|e| ApiError::BadRequest(format!("Invalid configuration value: {}", e)))?;
    updated.digest.parse_send_time()?;

    let changed = updated.changed_sections(&current_config);
    if changed.is_empty() {
        return Ok(Json(updated));
    }

    // Digest sinks are validated first so a bad webhook URL leaves the
    // pipeline untouched too.
    state.digest.reload(&updated.digest).await?;
    state.pipeline.lock().await.reload(&updated)?;

    if let Some(path) = &state.config_path {
        if let Err(e) = updated.save(path) {
            warn!(error = %e, path = %path.display(), "Failed to save config to disk");
        }
    }

    info!(sections = ?changed, "Configuration updated via API");
    state.config.send_replace(updated.clone());
    Ok(Json(updated))
}
