//! Authentication middleware
//!
//! Protected endpoints accept the API key in `x-api-key` or as
//! `Authorization: Bearer <key>`.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};
use tracing::warn;

use crate::error::ApiError;
use crate::server::AppState;

/// Header carrying the API key
pub const API_KEY_HEADER: &str = "x-api-key";

/// API key authentication middleware
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let expected = state.config.api.key.as_deref().filter(|k| !k.is_empty());
    let provided = extract_api_key(request.headers());

    if validate_api_key(provided, expected) {
        return Ok(next.run(request).await);
    }

    warn!(
        "Rejected {} {}: {} API key",
        request.method(),
        request.uri().path(),
        if provided.is_some() { "invalid" } else { "missing" }
    );
    Err(ApiError::AuthFailed)
}

/// API key from `x-api-key`, falling back to a bearer token
pub fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
        })
        .map(str::trim)
        .filter(|key| !key.is_empty())
}

/// Simple API key validation
pub fn validate_api_key(provided: Option<&str>, expected: Option<&str>) -> bool {
    match (provided, expected) {
        (Some(p), Some(e)) => p == e,
        (_, None) => true, // No key configured, allow
        (None, Some(_)) => false,
    }
}
