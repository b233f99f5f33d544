//! In-memory read-model projections (C4): orders, positions, session.
//! Hydrated by replaying the event log at startup, then kept current by a
//! live subscription. Projection is a pure function `(state, event) -> state`.

pub mod exit_plan;
pub mod orders;
pub mod positions;
pub mod session_state;

use crate::db::Database;
use crate::events::model::{Event, EventPayload, OutcomeRecordedPayload, Position, Side};
use crate::events::EventStore;
use chrono::Utc;
use orders::OrderBook;
use parking_lot::RwLock;
use session_state::{Session, SessionLimits};
use std::collections::HashMap;
use std::sync::Arc;

/// The full in-memory system state, read-mostly with a lock per map
/// (spec §5 "Shared-resource policy").
pub struct ReadModels {
    pub orders: RwLock<OrderBook>,
    pub positions: RwLock<HashMap<String, Position>>,
    pub session: RwLock<Session>,
    pub trade_journal: RwLock<Vec<OutcomeRecordedPayload>>,
    db: Database,
}

impl ReadModels {
    pub fn new(initial_equity: f64, limits: SessionLimits, db: Database) -> Self {
        Self {
            orders: RwLock::new(OrderBook::default()),
            positions: RwLock::new(HashMap::new()),
            session: RwLock::new(Session::new(Utc::now().date_naive(), initial_equity, limits)),
            trade_journal: RwLock::new(Vec::new()),
            db,
        }
    }

    /// Apply a single event to the in-memory projections. Deterministic:
    /// the same event sequence always reproduces the same state.
    pub fn apply(&self, event: &Event) {
        match &event.payload {
            EventPayload::OrderPlaced(p) => {
                self.orders.write().apply_placed(p);
            }
            EventPayload::ExecutionReceived(p) => {
                self.orders.write().apply_execution(p);
                let mut positions = self.positions.write();
                let position = positions
                    .entry(p.symbol.clone())
                    .or_insert_with(|| Position::new(p.symbol.clone()));
                let outcome = positions::apply_execution(position, p.side, p.shares, p.price);
                *position = outcome.position;
            }
            EventPayload::OrderStatusChanged(p) => {
                self.orders.write().apply_status_change(p);
            }
            EventPayload::RegimeShifted(_) => {}
            EventPayload::RiskLimitBreached(p) => {
                self.session.write().lock(p.reason.clone());
            }
            EventPayload::SessionLocked(p) => {
                self.session.write().lock(p.reason.clone());
            }
            EventPayload::SessionFlattened(_) => {}
            EventPayload::SignalReceived(_) => {}
            EventPayload::OutcomeRecorded(p) => {
                self.session.write().record_trade_outcome(p.realized_pnl);
                self.trade_journal.write().push(p.clone());
                self.persist_trade_journal(p);
            }
        }
    }

    /// Mirrors a closed trade into the durable `trade_journal` table.
    /// `order_id` is that table's primary key, so replaying the log never
    /// inserts the same closed trade twice.
    fn persist_trade_journal(&self, p: &OutcomeRecordedPayload) {
        let closed_at = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let side = match p.side {
            Side::Buy => "buy",
            Side::Sell => "sell",
        };
        let result = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO trade_journal \
                 (order_id, symbol, side, entry_price, exit_price, qty, realized_pnl, r_multiple, opened_at, closed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    p.order_id,
                    p.symbol,
                    side,
                    p.entry_price,
                    p.exit_price,
                    p.qty,
                    p.realized_pnl,
                    p.r_multiple,
                    closed_at,
                    closed_at,
                ],
            )
        });
        if let Err(e) = result {
            tracing::warn!(error = %e, order_id = %p.order_id, "failed to persist trade journal entry");
        }
    }

    /// Hydrate from the durable log, then return a background task handle
    /// the caller should keep alive to apply live events as they arrive.
    pub fn hydrate_and_subscribe(
        self: &Arc<Self>,
        store: Arc<EventStore>,
    ) -> crate::error::BridgeResult<tokio::task::JoinHandle<()>> {
        for event in store.replay(0)? {
            self.apply(&event);
        }

        let models = Arc::clone(self);
        let mut rx = store.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => models.apply(&event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::model::{ExecutionReceivedPayload, OrderPlacedPayload, Side};

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

    #[test]
    fn replay_is_deterministic() {
        let models = ReadModels::new(100_000.0, limits(), Database::open_in_memory().unwrap());
        let events = vec![
            Event {
                sequence_id: 1,
                timestamp: Utc::now(),
                payload: EventPayload::OrderPlaced(OrderPlacedPayload {
                    order_id: "o1".into(),
                    symbol: "AAPL".into(),
                    side: Side::Buy,
                    original_qty: 100.0,
                    parent_correlation_id: None,
                    oca_group: None,
                }),
            },
            Event {
                sequence_id: 2,
                timestamp: Utc::now(),
                payload: EventPayload::ExecutionReceived(ExecutionReceivedPayload {
                    execution_id: "e1".into(),
                    order_id: "o1".into(),
                    symbol: "AAPL".into(),
                    side: Side::Buy,
                    shares: 100.0,
                    price: 150.0,
                }),
            },
        ];
        for e in &events {
            models.apply(e);
        }
        let position = models.positions.read().get("AAPL").cloned().unwrap();
        assert_eq!(position.signed_qty, 100.0);
        assert_eq!(position.avg_price, 150.0);
    }
}
