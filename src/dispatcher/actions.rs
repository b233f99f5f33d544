//! Representative action set exposed through the dispatcher (spec §4.7
//! "the dispatcher exposes a representative slice of bridge capabilities,
//! not an exhaustive one"). Each handler borrows the already-built
//! components rather than reimplementing their logic.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::availability::AvailabilitySampler;
use crate::broker::{
    protocol, BrokerRequest, BrokerSession, RequestHandlers, SubscriptionKey, SubscriptionKind, SubscriptionRegistry,
};
use crate::db::Database;
use crate::ensemble::Ensemble;
use crate::error::{BridgeError, BridgeResult};
use crate::events::model::{EventPayload, ExecutionReceivedPayload, OutcomeRecordedPayload, Regime, Side, SessionLockedPayload};
use crate::events::EventStore;
use crate::features::{FeatureSource, SuppliedFeatureSource};
use crate::readmodel::ReadModels;
use crate::risk::gate::{OrderIntent, RiskGate};
use crate::weights::WeightStore;

use super::{ActionFuture, ActionHandler, ActionRegistry, ActionSpec, ParamKind, ParamSpec, RateLimitClass};

/// Everything a handler needs, bundled so the registry stays decoupled
/// from any one component's constructor order.
pub struct DispatchContext {
    pub read_models: Arc<ReadModels>,
    pub risk_gate: Arc<RiskGate>,
    pub broker: Arc<BrokerSession>,
    pub subscriptions: Arc<SubscriptionRegistry>,
    pub event_store: Arc<EventStore>,
    pub ensemble: Arc<Ensemble>,
    pub weight_store: Arc<WeightStore>,
    pub db: Database,
    pub availability: Arc<AvailabilitySampler>,
    /// Tracks which broker reqId a given (still-open) order id was
    /// submitted under, so `cancel_order` can address the same request
    /// the gateway is tracking (spec §4.1 correlation by reqId).
    pub order_req_ids: Mutex<HashMap<String, i64>>,
}

/// Bridges the broker's synchronous `RequestHandlers` callbacks for one
/// order back into the event-sourced world: a real execution becomes an
/// `ExecutionReceived` event, and a fill that closes out a position also
/// becomes an `OutcomeRecorded` event that feeds the risk gate and the
/// ensemble's weight updater (spec §4.1 C1, §4.3 C4, §4.5 C5, §4.6 C8).
struct OrderFillHandlers {
    order_id: String,
    symbol: String,
    side: Side,
    read_models: Arc<ReadModels>,
    event_store: Arc<EventStore>,
    risk_gate: Arc<RiskGate>,
    weight_store: Arc<WeightStore>,
}

impl RequestHandlers for OrderFillHandlers {
    fn on_event(&self, _req_id: i64, payload: &[u8]) {
        let Ok(value) = serde_json::from_slice::<Value>(payload) else {
            return;
        };
        match value.get("kind").and_then(Value::as_str) {
            Some("execution") => self.handle_execution(&value),
            Some("order_status") => self.handle_status(&value),
            _ => {}
        }
    }

    fn on_complete(&self, _req_id: i64) {}

    fn on_error(&self, req_id: i64, code: i32, message: &str) {
        tracing::warn!(req_id, code, message, order_id = %self.order_id, "broker rejected order");
    }
}

impl OrderFillHandlers {
    /// A real gateway reports a fill as a JSON event body (this adapter's
    /// own simplification of the IB execution-report fields); netting is
    /// computed here against the pre-fill position snapshot rather than
    /// waiting on the read model's own (async) subscriber, since the two
    /// would otherwise race.
    fn handle_execution(&self, value: &Value) {
        let Some(shares) = value.get("shares").and_then(Value::as_f64) else {
            return;
        };
        let Some(price) = value.get("price").and_then(Value::as_f64) else {
            return;
        };
        let execution_id = value
            .get("execution_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let position_snapshot = self
            .read_models
            .positions
            .read()
            .get(&self.symbol)
            .cloned()
            .unwrap_or_else(|| crate::events::model::Position::new(self.symbol.clone()));
        let netting = crate::readmodel::positions::apply_execution(&position_snapshot, self.side, shares, price);

        let exec_payload = ExecutionReceivedPayload {
            execution_id,
            order_id: self.order_id.clone(),
            symbol: self.symbol.clone(),
            side: self.side,
            shares,
            price,
        };
        let outcome_payload = (netting.closed_qty > 0.0).then(|| OutcomeRecordedPayload {
            order_id: self.order_id.clone(),
            symbol: self.symbol.clone(),
            side: self.side,
            entry_price: position_snapshot.avg_price,
            exit_price: price,
            qty: netting.closed_qty,
            realized_pnl: netting.closing_realized_pnl,
            r_multiple: None,
        });

        let event_store = Arc::clone(&self.event_store);
        let risk_gate = Arc::clone(&self.risk_gate);
        let weight_store = Arc::clone(&self.weight_store);
        let order_id = self.order_id.clone();

        tokio::spawn(async move {
            if let Err(e) = event_store.append(EventPayload::ExecutionReceived(exec_payload)).await {
                tracing::warn!(error = %e, order_id, "failed to append execution event");
                return;
            }
            let Some(outcome) = outcome_payload else {
                return;
            };
            let pnl = outcome.realized_pnl;
            if let Err(e) = event_store.append(EventPayload::OutcomeRecorded(outcome)).await {
                tracing::warn!(error = %e, order_id, "failed to append outcome event");
                return;
            }
            if let Some(reason) = risk_gate.record_outcome(pnl) {
                tracing::warn!(reason, "risk gate locked the session after trade outcome");
            }
            // Per-provider attribution needs an evaluation-to-order link
            // this data model doesn't carry; a win/loss across all three
            // models is the coarsest faithful signal available here.
            let won = pnl > 0.0;
            if let Err(e) = weight_store.record_outcome_for_regime(Regime::Normal, [won, won, won], pnl) {
                tracing::warn!(error = %e, "ensemble weight update skipped");
            }
        });
    }

    fn handle_status(&self, value: &Value) {
        let Some(status_str) = value.get("status").and_then(Value::as_str) else {
            return;
        };
        let status = match status_str {
            "submitted" => crate::events::model::OrderStatus::Submitted,
            "partial" => crate::events::model::OrderStatus::Partial,
            "filled" => crate::events::model::OrderStatus::Filled,
            "cancelled" => crate::events::model::OrderStatus::Cancelled,
            "rejected" => crate::events::model::OrderStatus::Rejected,
            _ => return,
        };
        let payload = crate::events::model::OrderStatusChangedPayload {
            order_id: self.order_id.clone(),
            status,
        };
        let event_store = Arc::clone(&self.event_store);
        let order_id = self.order_id.clone();
        tokio::spawn(async move {
            if let Err(e) = event_store.append(EventPayload::OrderStatusChanged(payload)).await {
                tracing::warn!(error = %e, order_id, "failed to append order status event");
            }
        });
    }
}

fn handler<F>(f: F) -> ActionHandler
where
    F: Fn(Value, Arc<DispatchContext>) -> ActionFuture + Send + Sync + 'static,
{
    Arc::new(f)
}

fn field_str(params: &Value, name: &str) -> BridgeResult<String> {
    params
        .get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BridgeError::validation(name, "missing required parameter"))
}

fn field_f64(params: &Value, name: &str) -> BridgeResult<f64> {
    params
        .get(name)
        .and_then(Value::as_f64)
        .ok_or_else(|| BridgeError::validation(name, "missing required parameter"))
}

fn parse_side(raw: &str) -> BridgeResult<Side> {
    match raw {
        "buy" => Ok(Side::Buy),
        "sell" => Ok(Side::Sell),
        _ => Err(BridgeError::validation("side", "must be 'buy' or 'sell'")),
    }
}

fn parse_subscription_kind(raw: &str) -> BridgeResult<SubscriptionKind> {
    match raw {
        "real_time_bars" => Ok(SubscriptionKind::RealTimeBars),
        "market_depth" => Ok(SubscriptionKind::MarketDepth),
        "account_updates" => Ok(SubscriptionKind::AccountUpdates),
        "quote_snapshot" => Ok(SubscriptionKind::QuoteSnapshot),
        other => Err(BridgeError::validation("kind", format!("unknown subscription kind {other}"))),
    }
}

/// Registers the full representative action set into `registry`.
pub fn register_default_actions(registry: &mut ActionRegistry) {
    registry.register(ActionSpec {
        name: "get_status",
        description: "Bridge, broker, and session snapshot.",
        params: vec![],
        rate_limit_class: RateLimitClass::Global,
        handler: handler(|_params, ctx| {
            Box::pin(async move {
                let session = ctx.read_models.session.read().clone();
                Ok(json!({
                    "broker_connected": ctx.broker.is_connected(),
                    "subscription_count": ctx.subscriptions.len(),
                    "session": {
                        "lifecycle": session.lifecycle,
                        "locked": session.locked,
                        "lock_reason": session.lock_reason,
                        "realized_pnl": session.realized_pnl,
                        "trade_count": session.trade_count,
                        "consecutive_losses": session.consecutive_losses,
                    },
                }))
            })
        }),
    });

    registry.register(ActionSpec {
        name: "check_risk",
        description: "Run an order intent through the pre-trade risk gate without submitting it.",
        params: vec![
            ParamSpec { name: "symbol", required: true, kind: ParamKind::String },
            ParamSpec { name: "notional", required: true, kind: ParamKind::Number },
            ParamSpec { name: "concentration_pct", required: true, kind: ParamKind::Number },
        ],
        rate_limit_class: RateLimitClass::Global,
        handler: handler(|params, ctx| {
            Box::pin(async move {
                let intent = OrderIntent {
                    symbol: field_str(&params, "symbol")?,
                    notional: field_f64(&params, "notional")?,
                    concentration_pct: field_f64(&params, "concentration_pct")?,
                };
                let check = ctx.risk_gate.check_risk(&intent);
                Ok(serde_json::to_value(check).unwrap())
            })
        }),
    });

    registry.register(ActionSpec {
        name: "submit_order",
        description: "Submit an order if the risk gate allows it, then record it in the event log.",
        params: vec![
            ParamSpec { name: "symbol", required: true, kind: ParamKind::String },
            ParamSpec { name: "side", required: true, kind: ParamKind::String },
            ParamSpec { name: "qty", required: true, kind: ParamKind::Number },
            ParamSpec { name: "notional", required: true, kind: ParamKind::Number },
            ParamSpec { name: "concentration_pct", required: true, kind: ParamKind::Number },
        ],
        rate_limit_class: RateLimitClass::Orders,
        handler: handler(|params, ctx| {
            Box::pin(async move {
                let symbol = field_str(&params, "symbol")?;
                let side = parse_side(&field_str(&params, "side")?)?;
                let qty = field_f64(&params, "qty")?;
                let intent = OrderIntent {
                    symbol: symbol.clone(),
                    notional: field_f64(&params, "notional")?,
                    concentration_pct: field_f64(&params, "concentration_pct")?,
                };

                let check = ctx.risk_gate.check_risk(&intent);
                if !check.allowed {
                    return Err(BridgeError::RiskVeto(
                        check.reason.unwrap_or_else(|| "risk_gate_declined".to_string()),
                    ));
                }

                let order_id = uuid::Uuid::new_v4().to_string();
                let body = serde_json::to_vec(&json!({
                    "order_id": order_id,
                    "symbol": symbol,
                    "side": field_str(&params, "side")?,
                    "qty": qty,
                }))
                .expect("order body always serializes");
                let handlers: Arc<dyn RequestHandlers> = Arc::new(OrderFillHandlers {
                    order_id: order_id.clone(),
                    symbol: symbol.clone(),
                    side,
                    read_models: Arc::clone(&ctx.read_models),
                    event_store: Arc::clone(&ctx.event_store),
                    risk_gate: Arc::clone(&ctx.risk_gate),
                    weight_store: Arc::clone(&ctx.weight_store),
                });
                let req_id = ctx
                    .broker
                    .submit(BrokerRequest { message_id: protocol::outgoing::PLACE_ORDER, body }, handlers)
                    .await
                    .map_err(BridgeError::from)?;
                ctx.order_req_ids.lock().insert(order_id.clone(), req_id);

                ctx.event_store
                    .append(EventPayload::OrderPlaced(crate::events::model::OrderPlacedPayload {
                        order_id: order_id.clone(),
                        symbol,
                        side,
                        original_qty: qty,
                        parent_correlation_id: None,
                        oca_group: None,
                    }))
                    .await?;

                Ok(json!({ "order_id": order_id, "warnings": check.warnings }))
            })
        }),
    });

    registry.register(ActionSpec {
        name: "cancel_order",
        description: "Cancel a known open order.",
        params: vec![ParamSpec { name: "order_id", required: true, kind: ParamKind::String }],
        rate_limit_class: RateLimitClass::Orders,
        handler: handler(|params, ctx| {
            Box::pin(async move {
                let order_id = field_str(&params, "order_id")?;
                if ctx.read_models.orders.read().get(&order_id).is_none() {
                    return Err(BridgeError::validation("order_id", "unknown order"));
                }
                let req_id = ctx.order_req_ids.lock().remove(&order_id);
                if let Some(req_id) = req_id {
                    ctx.broker.cancel(req_id).await.map_err(BridgeError::from)?;
                }
                ctx.event_store
                    .append(EventPayload::OrderStatusChanged(crate::events::model::OrderStatusChangedPayload {
                        order_id: order_id.clone(),
                        status: crate::events::model::OrderStatus::Cancelled,
                    }))
                    .await?;
                Ok(json!({ "order_id": order_id, "status": "cancelled" }))
            })
        }),
    });

    registry.register(ActionSpec {
        name: "trigger_evaluation",
        description: "Build a feature vector from supplied values and run it through the ensemble.",
        params: vec![
            ParamSpec { name: "symbol", required: true, kind: ParamKind::String },
            ParamSpec { name: "direction", required: true, kind: ParamKind::String },
            ParamSpec { name: "features", required: true, kind: ParamKind::Object },
        ],
        rate_limit_class: RateLimitClass::Evals,
        handler: handler(|params, ctx| {
            Box::pin(async move {
                let symbol = field_str(&params, "symbol")?;
                let direction = parse_side(&field_str(&params, "direction")?)?;
                let features_obj = params
                    .get("features")
                    .and_then(Value::as_object)
                    .ok_or_else(|| BridgeError::validation("features", "must be an object of numbers"))?;

                let mut snapshot = BTreeMap::new();
                for (name, value) in features_obj {
                    let number = value
                        .as_f64()
                        .ok_or_else(|| BridgeError::validation("features", format!("{name} is not numeric")))?;
                    snapshot.insert(name.clone(), number);
                }

                let regime = Regime::Normal;
                let source = SuppliedFeatureSource::new(snapshot);
                let feature_vector = source.compute(&symbol, direction, regime);

                let weights = ctx.weight_store.current().active_for_regime(regime);
                let evaluation_id = uuid::Uuid::new_v4().to_string();
                let (evaluation, result) = ctx
                    .ensemble
                    .evaluate(&evaluation_id, feature_vector, &weights, &ctx.db)
                    .await?;

                Ok(json!({
                    "evaluation_id": evaluation.evaluation_id,
                    "ensemble_score": result.ensemble_score,
                    "ensemble_confidence": result.ensemble_confidence,
                    "ensemble_should_trade": result.ensemble_should_trade,
                    "compliant_count": result.compliant_count,
                }))
            })
        }),
    });

    registry.register(ActionSpec {
        name: "get_weights",
        description: "Current ensemble weights document, including any regime overrides.",
        params: vec![],
        rate_limit_class: RateLimitClass::Global,
        handler: handler(|_params, ctx| {
            Box::pin(async move { Ok(serde_json::to_value(ctx.weight_store.current().as_ref()).unwrap()) })
        }),
    });

    registry.register(ActionSpec {
        name: "subscribe_market_data",
        description: "Subscribe to a (kind, symbol, exchange) market data stream.",
        params: vec![
            ParamSpec { name: "kind", required: true, kind: ParamKind::String },
            ParamSpec { name: "symbol", required: true, kind: ParamKind::String },
            ParamSpec { name: "exchange", required: true, kind: ParamKind::String },
        ],
        rate_limit_class: RateLimitClass::Collab,
        handler: handler(|params, ctx| {
            Box::pin(async move {
                let kind = parse_subscription_kind(&field_str(&params, "kind")?)?;
                let key = SubscriptionKey {
                    kind,
                    symbol: field_str(&params, "symbol")?,
                    exchange: field_str(&params, "exchange")?,
                };
                let req_id = ctx.broker.allocate_req_id();
                let assigned = ctx.subscriptions.subscribe(key, req_id)?;
                Ok(json!({ "req_id": assigned }))
            })
        }),
    });

    registry.register(ActionSpec {
        name: "unsubscribe_market_data",
        description: "Unsubscribe a previously-subscribed market data stream.",
        params: vec![
            ParamSpec { name: "kind", required: true, kind: ParamKind::String },
            ParamSpec { name: "symbol", required: true, kind: ParamKind::String },
            ParamSpec { name: "exchange", required: true, kind: ParamKind::String },
        ],
        rate_limit_class: RateLimitClass::Collab,
        handler: handler(|params, ctx| {
            Box::pin(async move {
                let kind = parse_subscription_kind(&field_str(&params, "kind")?)?;
                let key = SubscriptionKey {
                    kind,
                    symbol: field_str(&params, "symbol")?,
                    exchange: field_str(&params, "exchange")?,
                };
                let removed = ctx.subscriptions.unsubscribe(&key);
                Ok(json!({ "unsubscribed": removed.is_some() }))
            })
        }),
    });

    registry.register(ActionSpec {
        name: "get_availability",
        description: "Standard SLA windows (1h/24h/7d/30d) from the availability sampler.",
        params: vec![],
        rate_limit_class: RateLimitClass::Global,
        handler: handler(|_params, ctx| {
            Box::pin(async move {
                let windows = ctx.availability.standard_windows()?;
                Ok(serde_json::to_value(windows).unwrap())
            })
        }),
    });

    registry.register(ActionSpec {
        name: "lock_session",
        description: "Manually lock the trading session, vetoing further orders.",
        params: vec![ParamSpec { name: "reason", required: true, kind: ParamKind::String }],
        rate_limit_class: RateLimitClass::Global,
        handler: handler(|params, ctx| {
            Box::pin(async move {
                let reason = field_str(&params, "reason")?;
                ctx.event_store
                    .append(EventPayload::SessionLocked(SessionLockedPayload { reason: reason.clone() }))
                    .await?;
                Ok(json!({ "locked": true, "reason": reason }))
            })
        }),
    });

    registry.register(ActionSpec {
        name: "unlock_session",
        description: "Manually unlock a locked trading session.",
        params: vec![],
        rate_limit_class: RateLimitClass::Global,
        handler: handler(|_params, ctx| {
            Box::pin(async move {
                ctx.risk_gate.unlock();
                Ok(json!({ "locked": false }))
            })
        }),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerSession;
    use crate::db::Database;
    use crate::ensemble::Ensemble;
    use crate::readmodel::session_state::SessionLimits;
    use crate::weights::Weights;
    use parking_lot::RwLock;
    use std::time::Duration;

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

    async fn test_context() -> Arc<DispatchContext> {
        test_context_with_broker(Arc::new(BrokerSession::new_disconnected())).await
    }

    async fn test_context_with_broker(broker: Arc<BrokerSession>) -> Arc<DispatchContext> {
        let db = Database::open_in_memory().unwrap();
        let store = Arc::new(EventStore::new(db.clone()).unwrap());
        let read_models = Arc::new(ReadModels::new(100_000.0, limits(), Database::open_in_memory().unwrap()));
        read_models.hydrate_and_subscribe(Arc::clone(&store)).unwrap();
        let session = Arc::new(RwLock::new(crate::readmodel::session_state::Session::new(
            chrono::Utc::now().date_naive(),
            100_000.0,
            limits(),
        )));
        Arc::new(DispatchContext {
            read_models,
            risk_gate: Arc::new(RiskGate::new(session)),
            broker,
            subscriptions: Arc::new(SubscriptionRegistry::new()),
            event_store: store,
            ensemble: Arc::new(Ensemble::new(vec![], Duration::from_secs(1))),
            weight_store: Arc::new(
                WeightStore::new(Weights::default_uniform(), "/tmp/nonexistent-weights.json", Database::open_in_memory().unwrap())
                    .unwrap(),
            ),
            db,
            availability: Arc::new(AvailabilitySampler::new(
                Database::open_in_memory().unwrap(),
                Arc::new(crate::availability::AlwaysHealthy),
            )),
            order_req_ids: Mutex::new(HashMap::new()),
        })
    }

    /// Spins up a loopback gateway stub that acks every frame it reads with
    /// a `REQUEST_COMPLETE` response carrying the same reqId, and returns a
    /// `BrokerSession` already connected to it with its response loop running.
    async fn connected_test_broker() -> Arc<BrokerSession> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            loop {
                match protocol::read_frame(&mut socket).await {
                    Ok(Some((_message_id, req_id, _body))) => {
                        use tokio::io::AsyncWriteExt;
                        let ack = protocol::encode_frame(protocol::incoming::REQUEST_COMPLETE, req_id, &[]);
                        if socket.write_all(&ack).await.is_err() {
                            return;
                        }
                    }
                    _ => return,
                }
            }
        });
        let broker = Arc::new(BrokerSession::new(addr.ip().to_string(), addr.port(), 1, protocol::DEFAULT_MIN_VERSION));
        broker.connect().await.unwrap();
        broker.spawn_response_loop();
        broker
    }

    #[tokio::test]
    async fn get_status_reports_disconnected_broker() {
        let mut registry = ActionRegistry::new();
        register_default_actions(&mut registry);
        let ctx = test_context().await;
        let spec = registry.get("get_status").unwrap();
        let result = (spec.handler)(json!({}), ctx).await.unwrap();
        assert_eq!(result["broker_connected"], json!(false));
    }

    #[tokio::test]
    async fn submit_order_appends_event_when_risk_allows() {
        let mut registry = ActionRegistry::new();
        register_default_actions(&mut registry);
        let ctx = test_context_with_broker(connected_test_broker().await).await;
        let spec = registry.get("submit_order").unwrap();
        let result = (spec.handler)(
            json!({"symbol": "AAPL", "side": "buy", "qty": 10.0, "notional": 1000.0, "concentration_pct": 0.05}),
            ctx,
        )
        .await
        .unwrap();
        assert!(result["order_id"].is_string());
    }

    #[tokio::test]
    async fn submit_order_fails_when_broker_disconnected() {
        let mut registry = ActionRegistry::new();
        register_default_actions(&mut registry);
        let ctx = test_context().await;
        let spec = registry.get("submit_order").unwrap();
        let result = (spec.handler)(
            json!({"symbol": "AAPL", "side": "buy", "qty": 10.0, "notional": 1000.0, "concentration_pct": 0.05}),
            ctx,
        )
        .await;
        assert!(matches!(result, Err(BridgeError::Disconnected)));
    }

    #[tokio::test]
    async fn cancel_unknown_order_is_validation_error() {
        let mut registry = ActionRegistry::new();
        register_default_actions(&mut registry);
        let ctx = test_context().await;
        let spec = registry.get("cancel_order").unwrap();
        let result = (spec.handler)(json!({"order_id": "nope"}), ctx).await;
        assert!(matches!(result, Err(BridgeError::Validation { .. })));
    }
}
