//! Router setup with all API routes and middleware.
//!
//! Configures the axum Router with CORS, tracing, compression,
//! bearer-token auth on everything but `/health`, and all endpoint handlers.

use std::future::Future;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, request::Parts, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use tidemark_core::error::TidemarkError;

use crate::handlers;
use crate::state::AppState;

const EXTENSION_SCHEMES: [&str; 3] = ["chrome-extension://", "moz-extension://", "safari-web-extension://"];

/// Whether a browser origin may call the API: the local dashboard on
/// `port` or any browser extension.
pub fn origin_allowed(origin: &HeaderValue, port: u16) -> bool {
    let Ok(origin) = origin.to_str() else {
        return false;
    };
    if EXTENSION_SCHEMES.iter().any(|s| origin.starts_with(s)) {
        return true;
    }
    [
        format!("http://127.0.0.1:{}", port),
        format!("http://localhost:{}", port),
    ]
    .iter()
    .any(|allowed| origin == allowed)
}

/// Create the axum Router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let port = state.config.borrow().general.port;
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _: &Parts| {
            origin_allowed(origin, port)
        }))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT]);

    let public_routes = Router::new().route("/health", get(handlers::health));

    let protected_routes = Router::new()
        .route("/signals", post(handlers::submit_signal))
        .route("/content/{handle}", post(handlers::deposit_content))
        .route(
            "/events",
            get(handlers::events).delete(handlers::clear_events),
        )
        .route("/stats", get(handlers::stats))
        .route("/dwell", get(handlers::dwell))
        .route("/digest/status", get(handlers::digest_status))
        .route("/digest/build", post(handlers::build_digest))
        .route("/digest/preview", get(handlers::preview_digest))
        .route(
            "/config",
            get(handlers::get_config)
                .put(handlers::update_config)
                .layer(DefaultBodyLimit::max(64 * 1024)), // 64KB for config
        )
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::auth::require_auth,
        ));

    public_routes
        .merge(protected_routes)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB for page content
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the API on 127.0.0.1 (localhost only) until `shutdown` resolves.
pub async fn start_server<F>(port: u16, state: AppState, shutdown: F) -> Result<(), TidemarkError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("127.0.0.1:{}", port);
    let router = create_router(state);

    tracing::info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| TidemarkError::Api(format!("Failed to bind {}: {}", addr, e)))?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| TidemarkError::Api(format!("Server error: {}", e)))?;

    Ok(())
}
