//! API authentication via bearer tokens.
//!
//! Every route except `/health` requires `Authorization: Bearer <token>`.
//! The token lives in a file next to the database so the browser extension
//! and the CLI can read it.

use std::path::Path;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use rand::Rng;

use crate::error::ErrorBody;
use crate::state::AppState;

/// File name of the token inside the data directory.
pub const TOKEN_FILE: &str = "api_token";

/// Generate a random 32-character hex token.
pub fn generate_token() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    hex::encode(bytes)
}

/// Load the token from `token_path`, or generate one and save it there
/// readable by the owner only.
pub fn load_or_generate_token(token_path: &Path) -> String {
    if let Ok(contents) = std::fs::read_to_string(token_path) {
        let token = contents.trim().to_string();
        if !token.is_empty() {
            tracing::info!(path = %token_path.display(), "API token loaded");
            return token;
        }
    }

    let token = generate_token();
    if let Some(parent) = token_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!(error = %e, path = %parent.display(), "Failed to create token directory");
        }
    }
    match std::fs::write(token_path, &token) {
        Ok(()) => {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) =
                    std::fs::set_permissions(token_path, std::fs::Permissions::from_mode(0o600))
                {
                    tracing::warn!(error = %e, "Failed to restrict API token permissions");
                }
            }
            tracing::info!(path = %token_path.display(), "API token saved");
        }
        Err(e) => {
            tracing::warn!(error = %e, path = %token_path.display(), "Failed to save API token");
        }
    }
    token
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorBody {
            error: "unauthorized".to_string(),
            message: message.to_string(),
        }),
    )
        .into_response()
}

/// Middleware that rejects requests without the right bearer token.
pub async fn require_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(value) = req.headers().get(header::AUTHORIZATION) else {
        return unauthorized("Missing Authorization header");
    };
    let Ok(value) = value.to_str() else {
        return unauthorized("Invalid Authorization header encoding");
    };
    match value.strip_prefix("Bearer ") {
        Some(token) if token == state.api_token.as_str() => next.run(req).await,
        _ => unauthorized("Invalid bearer token"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_token_is_hex() {
        let token = generate_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_token());
    }

    #[test]
    fn test_token_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(TOKEN_FILE);

        let first = load_or_generate_token(&path);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first);
        assert_eq!(load_or_generate_token(&path), first);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_blank_token_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(TOKEN_FILE);
        std::fs::write(&path, "  \n").unwrap();

        let token = load_or_generate_token(&path);
        assert_eq!(token.len(), 32);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), token);
    }
}
