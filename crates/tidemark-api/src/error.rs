//! API error types and JSON error response formatting.
//!
//! ApiError provides a consistent JSON error response format across all
//! endpoints, mapping internal errors to appropriate HTTP status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use tidemark_core::error::TidemarkError;
use tidemark_digest::DigestError;

/// JSON error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Machine-readable error code (e.g., "bad_request", "not_found").
    pub error: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type that maps to HTTP status codes and JSON responses.
#[derive(Debug)]
pub enum ApiError {
    /// 400 Bad Request - missing or invalid parameters.
    BadRequest(String),
    /// 404 Not Found - nothing exists for the request.
    NotFound(String),
    /// 507 Insufficient Storage - the blob quota was hit.
    InsufficientStorage(String),
    /// 500 Internal Server Error - unexpected server error.
    Internal(String),
    /// 502 Bad Gateway - an outbound delivery failed.
    BadGateway(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::InsufficientStorage(msg) => {
                (StatusCode::INSUFFICIENT_STORAGE, "insufficient_storage", msg)
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, "bad_gateway", msg),
        };

        let body = ErrorBody {
            error: error_code.to_string(),
            message,
        };

        (status, Json(body)).into_response()
    }
}

impl From<TidemarkError> for ApiError {
    fn from(err: TidemarkError) -> Self {
        match &err {
            TidemarkError::Config(msg) | TidemarkError::InvalidEvent(msg) => {
                ApiError::BadRequest(msg.clone())
            }
            TidemarkError::QuotaExceeded { .. } => ApiError::InsufficientStorage(err.to_string()),
            TidemarkError::Delivery(msg) => ApiError::BadGateway(msg.clone()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<DigestError> for ApiError {
    fn from(err: DigestError) -> Self {
        TidemarkError::from(err).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_maps_to_507() {
        let err: ApiError = TidemarkError::QuotaExceeded { size: 10, limit: 5 }.into();
        assert_eq!(err.into_response().status(), StatusCode::INSUFFICIENT_STORAGE);
    }

    #[test]
    fn test_config_maps_to_400() {
        let err: ApiError = TidemarkError::Config("bad send_time".into()).into();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_digest_config_error_maps_to_400() {
        let err: ApiError = DigestError::Config("invalid webhook url".into()).into();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
