//! Master-key authentication middleware.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;

use super::AppState;
use crate::error::Error;

/// Paths reachable without the master key.
const PUBLIC_PATHS: &[&str] = &["/health"];

/// Require `Authorization: Bearer <master_key>` when a master key is configured.
pub async fn require_master_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(master_key) = &state.master_key else {
        return next.run(request).await;
    };
    if PUBLIC_PATHS.contains(&request.uri().path()) {
        return next.run(request).await;
    }

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(key) if bool::from(key.as_bytes().ct_eq(master_key.expose_secret().as_bytes())) => {
            next.run(request).await
        }
        _ => {
            tracing::debug!(path = %request.uri().path(), "Rejected request without valid master key");
            Error::Unauthorized.into_response()
        }
    }
}
