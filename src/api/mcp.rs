//! MCP session handshake over HTTP (C13, spec §4.10): `POST /mcp`
//! provisions a session id, `GET /mcp` touches it to keep it alive,
//! `DELETE /mcp` closes it early. The session id travels in the
//! `Mcp-Session-Id` header both directions.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use super::AppState;

static SESSION_HEADER: HeaderName = HeaderName::from_static("mcp-session-id");

fn session_id_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get(&SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

pub async fn post_mcp(State(state): State<Arc<AppState>>) -> Response {
    let session_id = state.mcp.provision();
    let mut response = Json(json!({ "session_id": session_id })).into_response();
    if let Ok(value) = HeaderValue::from_str(&session_id) {
        response.headers_mut().insert(SESSION_HEADER.clone(), value);
    }
    response
}

pub async fn get_mcp(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(session_id) = session_id_from(&headers) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match state.mcp.touch(&session_id) {
        Ok(()) => Json(json!({ "status": "alive" })).into_response(),
        Err(_) => (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid session id" }))).into_response(),
    }
}

pub async fn delete_mcp(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(session_id) = session_id_from(&headers) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    state.mcp.close(&session_id);
    StatusCode::NO_CONTENT.into_response()
}
