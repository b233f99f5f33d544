//! Shared-secret auth middleware: `X-API-Key` header or `Authorization:
//! Bearer <key>`, checked against the single configured `API_KEY` (spec
//! §4.7). The matched key is stashed as a request extension so handlers
//! downstream (the dispatcher, keyed rate limiting) don't re-parse headers.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::Response,
};

use super::AppState;

#[derive(Debug, Clone)]
pub struct ApiKey(pub String);

fn extract_key(request: &Request<Body>) -> Option<String> {
    if let Some(value) = request.headers().get("x-api-key") {
        return value.to_str().ok().map(str::to_string);
    }
    let header_value = request.headers().get(header::AUTHORIZATION)?;
    let raw = header_value.to_str().ok()?;
    raw.strip_prefix("Bearer ").map(str::to_string)
}

pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let provided = extract_key(&request).ok_or(StatusCode::UNAUTHORIZED)?;
    if provided != state.config.api_key {
        return Err(StatusCode::UNAUTHORIZED);
    }
    request.extensions_mut().insert(ApiKey(provided));
    Ok(next.run(request).await)
}
