//! betterbridge - agent-facing trading intelligence bridge.
//! Wires the broker session, event log, read models, risk gate, ensemble,
//! and HTTP surface together and starts serving.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock as ParkingRwLock;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use betterbridge::api::{self, AppState};
use betterbridge::availability::{AvailabilitySampler, HealthProbe};
use betterbridge::broker::{BrokerSession, SubscriptionRegistry};
use betterbridge::config::Config;
use betterbridge::db::Database;
use betterbridge::dispatcher::actions::{register_default_actions, DispatchContext};
use betterbridge::dispatcher::{ActionRegistry, Dispatcher};
use betterbridge::ensemble::provider::{HttpChatProvider, ModelProvider};
use betterbridge::ensemble::Ensemble;
use betterbridge::events::EventStore;
use betterbridge::mcp::McpSessionLayer;
use betterbridge::readmodel::session_state::{Session, SessionLimits};
use betterbridge::readmodel::ReadModels;
use betterbridge::risk::flatten::FlattenScheduler;
use betterbridge::risk::gate::RiskGate;
use betterbridge::signals::SignalIngester;
use betterbridge::stream::OutboundStream;
use betterbridge::weights::WeightStore;

const STARTING_EQUITY: f64 = 100_000.0;
const FLATTEN_TICK_INTERVAL: Duration = Duration::from_secs(30);
const AVAILABILITY_SAMPLE_INTERVAL: Duration = Duration::from_secs(60);
const AVAILABILITY_PRUNE_INTERVAL: Duration = Duration::from_secs(3600);
const AVAILABILITY_OUTAGE_SCAN_INTERVAL: Duration = Duration::from_secs(300);
const BROKER_RECONNECT_MAX_ATTEMPTS: u32 = 10;

/// Reports actual broker connectivity; bridge and tunnel health are
/// reported healthy once the process is serving traffic at all.
struct BrokerHealthProbe {
    broker: Arc<BrokerSession>,
}

impl HealthProbe for BrokerHealthProbe {
    fn bridge_ok(&self) -> bool {
        true
    }

    fn broker_ok(&self) -> bool {
        self.broker.is_connected()
    }

    fn tunnel_ok(&self) -> bool {
        true
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "betterbridge=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn session_limits(config: &Config) -> SessionLimits {
    SessionLimits {
        max_position_pct: config.max_position_pct,
        max_daily_loss_pct: config.max_daily_loss_pct,
        max_concentration_pct: config.max_concentration_pct,
        volatility_scalar: 1.0,
        max_daily_trades: config.max_daily_trades,
        consecutive_loss_limit: config.consecutive_loss_limit,
    }
}

fn build_ensemble(config: &Config) -> Ensemble {
    let providers: Vec<(String, Arc<dyn ModelProvider>)> = vec![
        (
            "claude".to_string(),
            Arc::new(HttpChatProvider::claude(config.claude_api_key.clone(), config.claude_model.clone())),
        ),
        (
            "gpt4o".to_string(),
            Arc::new(HttpChatProvider::gpt4o(config.gpt4o_api_key.clone(), config.gpt4o_model.clone())),
        ),
        (
            "gemini".to_string(),
            Arc::new(HttpChatProvider::gemini(config.gemini_api_key.clone(), config.gemini_model.clone())),
        ),
    ];
    Ensemble::new(providers, config.model_timeout)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("loading configuration")?;
    info!(port = config.http_port, "starting betterbridge");

    let db = Database::open(&config.database_path).context("opening database")?;

    let event_store = Arc::new(EventStore::new(db.clone()).context("initializing event store")?);

    let limits = session_limits(&config);
    db.with_conn(|conn| {
        conn.execute(
            "INSERT OR REPLACE INTO risk_config (key, value_json, updated_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                "session_limits",
                serde_json::to_string(&limits).expect("SessionLimits always serializes"),
                chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            ],
        )
    })
    .context("persisting session risk_config")?;
    let read_models = Arc::new(ReadModels::new(STARTING_EQUITY, limits.clone(), db.clone()));
    // The spawned task keeps applying live events for the process lifetime;
    // dropping the handle doesn't stop it, so there's nothing to hold onto.
    read_models
        .hydrate_and_subscribe(Arc::clone(&event_store))
        .context("replaying event log into read models")?;

    let session = Arc::new(ParkingRwLock::new(Session::new(
        chrono::Utc::now().date_naive(),
        STARTING_EQUITY,
        limits,
    )));
    let risk_gate = Arc::new(RiskGate::new(session));

    let broker = Arc::new(BrokerSession::new(
        config.broker_host.clone(),
        config.broker_port,
        config.broker_client_id,
        config.broker_min_version,
    ));
    let subscriptions = Arc::new(SubscriptionRegistry::new());

    {
        let broker_for_callback = Arc::clone(&broker);
        let subscriptions_for_callback = Arc::clone(&subscriptions);
        broker.on_reconnect(Box::new(move || {
            subscriptions_for_callback.resurrect(|_key| broker_for_callback.allocate_req_id());
        }));
    }
    {
        // The response loop demuxes the fresh socket's frames; it must be
        // restarted on every reconnect, not just the initial connect.
        let broker_for_loop = Arc::clone(&broker);
        broker.on_reconnect(Box::new(move || {
            broker_for_loop.spawn_response_loop();
        }));
    }

    match broker.connect().await {
        Ok(()) => {
            info!("connected to broker gateway");
            broker.spawn_response_loop();
        }
        Err(e) => {
            warn!(error = %e, "initial broker connection failed, will retry in background");
            let broker_for_retry = Arc::clone(&broker);
            tokio::spawn(async move {
                if let Err(e) = broker_for_retry.reconnect_with_backoff(BROKER_RECONNECT_MAX_ATTEMPTS).await {
                    warn!(error = %e, "broker reconnect exhausted retries");
                }
            });
        }
    }

    let flatten_scheduler = Arc::new(
        FlattenScheduler::new(
            &config.flatten_time_hhmm,
            config.flatten_timezone,
            Arc::clone(&read_models),
            Arc::clone(&event_store),
            Arc::clone(&broker),
        )
        .context("initializing flatten scheduler")?,
    );
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(FLATTEN_TICK_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = flatten_scheduler.tick().await {
                warn!(error = %e, "flatten scheduler tick failed");
            }
        }
    });

    let weight_store = Arc::new(
        WeightStore::load_or_default(&config.weights_path, db.clone()).context("loading model weights")?,
    );
    Arc::clone(&weight_store).spawn_reload_task(config.weights_reload_interval);

    let ensemble = Arc::new(build_ensemble(&config));

    let signal_ingester = Arc::new(SignalIngester::new(
        db.clone(),
        Arc::clone(&event_store),
        Duration::from_secs(60),
    ));

    let availability = Arc::new(AvailabilitySampler::new(
        db.clone(),
        Arc::new(BrokerHealthProbe { broker: Arc::clone(&broker) }),
    ));
    {
        let availability_for_sampling = Arc::clone(&availability);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(AVAILABILITY_SAMPLE_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = availability_for_sampling.sample_now() {
                    warn!(error = %e, "availability sample failed");
                }
            }
        });
        let availability_for_pruning = Arc::clone(&availability);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(AVAILABILITY_PRUNE_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = availability_for_pruning.prune_old_samples() {
                    warn!(error = %e, "availability prune failed");
                }
            }
        });
        let availability_for_outages = Arc::clone(&availability);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(AVAILABILITY_OUTAGE_SCAN_INTERVAL);
            loop {
                ticker.tick().await;
                match availability_for_outages.detect_and_persist_outages(chrono::Duration::hours(24)) {
                    Ok(outages) if !outages.is_empty() => info!(count = outages.len(), "recorded new outage(s)"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "outage detection failed"),
                }
            }
        });
    }

    let mut registry = ActionRegistry::new();
    register_default_actions(&mut registry);
    let dispatcher = Dispatcher::new(registry);

    let dispatch_context = Arc::new(DispatchContext {
        read_models: Arc::clone(&read_models),
        risk_gate,
        broker: Arc::clone(&broker),
        subscriptions: Arc::clone(&subscriptions),
        event_store: Arc::clone(&event_store),
        ensemble,
        weight_store,
        db: db.clone(),
        availability: Arc::clone(&availability),
        order_req_ids: parking_lot::Mutex::new(std::collections::HashMap::new()),
    });

    let outbound = Arc::new(OutboundStream::new(config.outbound_stream_buffer));
    let mcp = Arc::new(McpSessionLayer::new(config.mcp_idle_ttl));

    let state = Arc::new(AppState {
        config: config.clone(),
        dispatcher,
        dispatch_context,
        outbound,
        mcp,
        broker,
        subscriptions,
        availability,
        signals: signal_ingester,
        db,
    });

    let router = api::build_router(state);
    let listener = TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("binding to port {}", config.http_port))?;
    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, api::into_make_service(router))
        .await
        .context("server error")?;

    Ok(())
}
