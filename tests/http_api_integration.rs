//! End-to-end coverage of the HTTP surface: binds the real router to a
//! loopback port and drives it with an HTTP client, the way the teacher's
//! own integration test exercises a built binary rather than a bare
//! function call.

use std::sync::Arc;
use std::time::Duration;

use betterbridge::api::{self, AppState};
use betterbridge::availability::{AlwaysHealthy, AvailabilitySampler};
use betterbridge::broker::{BrokerSession, SubscriptionRegistry};
use betterbridge::config::Config;
use betterbridge::db::Database;
use betterbridge::dispatcher::actions::{register_default_actions, DispatchContext};
use betterbridge::dispatcher::{ActionRegistry, Dispatcher};
use betterbridge::ensemble::Ensemble;
use betterbridge::events::EventStore;
use betterbridge::mcp::McpSessionLayer;
use betterbridge::readmodel::session_state::{Session, SessionLimits};
use betterbridge::readmodel::ReadModels;
use betterbridge::risk::gate::RiskGate;
use betterbridge::signals::SignalIngester;
use betterbridge::stream::OutboundStream;
use betterbridge::weights::{WeightStore, Weights};

fn limits() -> SessionLimits {
    SessionLimits {
        max_position_pct: 0.1,
        max_daily_loss_pct: 0.02,
        max_concentration_pct: 0.25,
        volatility_scalar: 1.0,
        max_daily_trades: 50,
        consecutive_loss_limit: 5,
    }
}

fn test_config() -> Config {
    Config {
        database_path: ":memory:".into(),
        http_port: 0,
        api_key: "test-secret".into(),
        broker_host: "127.0.0.1".into(),
        broker_port: 0,
        broker_client_id: 1,
        broker_min_version: 100,
        claude_api_key: None,
        gpt4o_api_key: None,
        gemini_api_key: None,
        claude_model: "claude-sonnet".into(),
        gpt4o_model: "gpt-4o".into(),
        gemini_model: "gemini-1.5-pro".into(),
        model_timeout: Duration::from_secs(5),
        weights_path: "/tmp/betterbridge-test-weights.json".into(),
        weights_reload_interval: Duration::from_secs(3600),
        flatten_time_hhmm: "16:00".into(),
        flatten_timezone: "America/New_York".parse().unwrap(),
        max_position_pct: 0.1,
        max_daily_loss_pct: 0.02,
        max_concentration_pct: 0.25,
        max_daily_trades: 50,
        consecutive_loss_limit: 5,
        subscription_cap: 50,
        mcp_idle_ttl: Duration::from_secs(1800),
        outbound_stream_buffer: 100,
    }
}

async fn spawn_test_server() -> (String, Config) {
    let config = test_config();
    let db = Database::open_in_memory().unwrap();
    let event_store = Arc::new(EventStore::new(db.clone()).unwrap());
    let read_models = Arc::new(ReadModels::new(100_000.0, limits(), db.clone()));
    read_models.hydrate_and_subscribe(Arc::clone(&event_store)).unwrap();
    let session = Arc::new(parking_lot::RwLock::new(Session::new(
        chrono::Utc::now().date_naive(),
        100_000.0,
        limits(),
    )));
    let risk_gate = Arc::new(RiskGate::new(session));
    let broker = Arc::new(BrokerSession::new_disconnected());
    let subscriptions = Arc::new(SubscriptionRegistry::new());
    let weight_store = Arc::new(WeightStore::new(Weights::default_uniform(), &config.weights_path, db.clone()).unwrap());
    let ensemble = Arc::new(Ensemble::new(vec![], config.model_timeout));
    let signals = Arc::new(SignalIngester::new(db.clone(), Arc::clone(&event_store), Duration::from_secs(60)));
    let availability = Arc::new(AvailabilitySampler::new(db.clone(), Arc::new(AlwaysHealthy)));

    let mut registry = ActionRegistry::new();
    register_default_actions(&mut registry);
    let dispatcher = Dispatcher::new(registry);

    let dispatch_context = Arc::new(DispatchContext {
        read_models,
        risk_gate,
        broker: Arc::clone(&broker),
        subscriptions: Arc::clone(&subscriptions),
        event_store,
        ensemble,
        weight_store,
        db: db.clone(),
        availability: Arc::clone(&availability),
        order_req_ids: parking_lot::Mutex::new(std::collections::HashMap::new()),
    });

    let state = Arc::new(AppState {
        config: config.clone(),
        dispatcher,
        dispatch_context,
        outbound: Arc::new(OutboundStream::new(config.outbound_stream_buffer)),
        mcp: Arc::new(McpSessionLayer::new(config.mcp_idle_ttl)),
        broker,
        subscriptions,
        availability,
        signals,
        db,
    });

    let router = api::build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, api::into_make_service(router)).await.unwrap();
    });

    (format!("http://{addr}"), config)
}

#[tokio::test]
async fn health_endpoint_requires_no_auth() {
    let (base_url, _config) = spawn_test_server().await;
    let response = reqwest::get(format!("{base_url}/health")).await.unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn agent_endpoint_rejects_missing_api_key() {
    let (base_url, _config) = spawn_test_server().await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base_url}/api/agent"))
        .json(&serde_json::json!({"action": "get_status", "params": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn agent_endpoint_dispatches_get_status_with_valid_key() {
    let (base_url, config) = spawn_test_server().await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base_url}/api/agent"))
        .header("X-API-Key", &config.api_key)
        .json(&serde_json::json!({"action": "get_status", "params": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["broker_connected"], serde_json::json!(false));
}

#[tokio::test]
async fn openapi_document_lists_registered_actions() {
    let (base_url, _config) = spawn_test_server().await;
    let response = reqwest::get(format!("{base_url}/openapi.json")).await.unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["paths"]["/api/agent#get_status"].is_object());
}

#[tokio::test]
async fn signal_endpoint_accepts_a_valid_signal() {
    let (base_url, config) = spawn_test_server().await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base_url}/api/signals"))
        .header("X-API-Key", &config.api_key)
        .json(&serde_json::json!({
            "source": "tradingview",
            "symbol": "AAPL",
            "description": "breakout above resistance",
            "confidence": 0.8,
            "metadata": null
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["signal_id"].is_string());
}
