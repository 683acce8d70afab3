//! Bearer-token authentication guard.
//!
//! The core does not define user/account administration -- this is the
//! full extent of "authentication": a single shared-secret
//! token compared against the `Authorization: Bearer <token>` header on
//! every `/api/*` route. An empty configured token disables the guard,
//! which is the default for local development and for every test server
//! in this crate.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::state::AppState;

/// Axum middleware: reject requests missing or mismatching the bearer
/// token, unless [`crate::state::WebConfig::auth_token`] is empty.
pub async fn require_bearer_token(
    State(state): State<Arc<AppState>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if state.config.auth_token.is_empty() {
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == state.config.auth_token => next.run(request).await,
        _ => (StatusCode::UNAUTHORIZED, "missing or invalid bearer token").into_response(),
    }
}
