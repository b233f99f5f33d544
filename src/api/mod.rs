//! HTTP surface (spec §4.7-4.9): the agent dispatch endpoint, OpenAPI
//! generation, the outbound WebSocket stream, the MCP session handshake,
//! and health checks. Router assembly mirrors the teacher's `main.rs`
//! pattern of one `Router` per concern merged into a single app.

pub mod auth;
pub mod http;
pub mod mcp;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    http::Request,
    middleware as axum_mw,
    middleware::Next,
    response::Response,
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::availability::AvailabilitySampler;
use crate::broker::{BrokerSession, SubscriptionRegistry};
use crate::config::Config;
use crate::db::Database;
use crate::dispatcher::{DispatchContext, Dispatcher};
use crate::mcp::McpSessionLayer;
use crate::signals::SignalIngester;
use crate::stream::OutboundStream;

/// Everything the HTTP layer needs, bundled once at startup.
pub struct AppState {
    pub config: Config,
    pub dispatcher: Dispatcher,
    pub dispatch_context: Arc<DispatchContext>,
    pub outbound: Arc<OutboundStream>,
    pub mcp: Arc<McpSessionLayer>,
    pub broker: Arc<BrokerSession>,
    pub subscriptions: Arc<SubscriptionRegistry>,
    pub availability: Arc<AvailabilitySampler>,
    pub signals: Arc<SignalIngester>,
    pub db: Database,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/api/agent", post(http::post_agent))
        .route("/api/signals", post(http::post_signal))
        .route("/stream", get(ws::stream_handler))
        .route("/mcp", post(mcp::post_mcp))
        .route("/mcp", get(mcp::get_mcp))
        .route("/mcp", delete(mcp::delete_mcp))
        .route_layer(axum_mw::from_fn_with_state(state.clone(), auth::require_api_key));

    let public = Router::new()
        .route("/health", get(http::get_health))
        .route("/health/ready", get(http::get_health_ready))
        .route("/openapi.json", get(http::get_openapi));

    Router::new()
        .merge(protected)
        .merge(public)
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(log_requests))
        .with_state(state)
}

/// Logs every bridge request with latency; skips health checks to keep
/// liveness polling out of the log (spec §4.9 "/health" is unauthenticated
/// and high-frequency).
async fn log_requests(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    if path == "/health" || path == "/health/ready" {
        return next.run(request).await;
    }

    let start = Instant::now();
    let response = next.run(request).await;
    let latency_ms = start.elapsed().as_millis();
    let status = response.status().as_u16();

    if status >= 500 {
        warn!(%method, %path, status, latency_ms, "bridge request failed");
    } else {
        info!(%method, %path, status, latency_ms, "bridge request completed");
    }

    response
}

/// Wraps the router so `ConnectInfo<SocketAddr>` is available to any
/// middleware that wants the peer address.
pub fn into_make_service(router: Router) -> axum::extract::connect_info::IntoMakeServiceWithConnectInfo<Router, SocketAddr> {
    router.into_make_service_with_connect_info::<SocketAddr>()
}
