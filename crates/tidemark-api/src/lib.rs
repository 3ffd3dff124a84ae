//! Tidemark API crate - axum HTTP server and route handlers.
//!
//! Provides the local REST API: the browser side posts activity signals and
//! page extractions, UI surfaces read store stats, dwell totals and digest
//! status, and can trigger a digest or change configuration.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use auth::{load_or_generate_token, TOKEN_FILE};
pub use error::ApiError;
pub use routes::{create_router, start_server};
pub use state::AppState;
