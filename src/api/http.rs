//! Plain request/response endpoints: agent dispatch, OpenAPI generation,
//! health checks (spec §4.7, §4.9).

use std::sync::Arc;

use axum::{
    extract::{Extension, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::BridgeResult;
use crate::signals::SignalInput;

use super::auth::ApiKey;
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct AgentRequest {
    pub action: String,
    #[serde(default = "default_params")]
    pub params: Value,
}

fn default_params() -> Value {
    json!({})
}

pub async fn post_agent(
    State(state): State<Arc<AppState>>,
    Extension(ApiKey(api_key)): Extension<ApiKey>,
    Json(request): Json<AgentRequest>,
) -> Result<Json<Value>, crate::error::BridgeError> {
    let result = state
        .dispatcher
        .dispatch(&api_key, &request.action, request.params, state.dispatch_context.clone())
        .await?;
    Ok(Json(result))
}

/// Accepts an externally-sourced trade idea (C9) and folds it into the
/// durable event log so the dispatcher's `trigger_evaluation` action can
/// pick it up as context.
pub async fn post_signal(
    State(state): State<Arc<AppState>>,
    Json(input): Json<SignalInput>,
) -> Result<Json<Value>, crate::error::BridgeError> {
    let signal_id = state.signals.ingest(input).await?;
    Ok(Json(json!({ "signal_id": signal_id })))
}

#[derive(Debug, Deserialize)]
pub struct OpenApiQuery {
    #[serde(default)]
    pub lite: bool,
}

pub async fn get_openapi(State(state): State<Arc<AppState>>, Query(query): Query<OpenApiQuery>) -> Json<Value> {
    Json(crate::dispatcher::openapi::generate(
        state.dispatcher.registry(),
        query.lite,
    ))
}

pub async fn get_health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Readiness additionally reports broker connectivity and whether the
/// database is reachable, so an orchestrator can distinguish "process is up"
/// from "bridge can actually trade" (spec §4.9).
pub async fn get_health_ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let db_ok = db_reachable(&state).is_ok();
    let broker_connected = state.broker.is_connected();
    let status = if db_ok { "ready" } else { "degraded" };
    let body = Json(json!({
        "status": status,
        "broker_connected": broker_connected,
        "database_ok": db_ok,
        "subscription_count": state.subscriptions.len(),
    }));
    if db_ok {
        (StatusCode::OK, body)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body)
    }
}

fn db_reachable(state: &AppState) -> BridgeResult<()> {
    state
        .db
        .with_conn(|conn| conn.query_row("SELECT 1", [], |_| Ok(())))
        .map_err(crate::error::BridgeError::from)
}
