//! Canonical event and read-model data types (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Submitted,
    Partial,
    Filled,
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPlacedPayload {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub original_qty: f64,
    pub parent_correlation_id: Option<String>,
    pub oca_group: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReceivedPayload {
    pub execution_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub shares: f64,
    pub price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatusChangedPayload {
    pub order_id: String,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    Low,
    Normal,
    High,
    Trending,
    Chop,
    Volatile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeShiftedPayload {
    pub regime: Regime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimitBreachedPayload {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLockedPayload {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionFlattenedPayload {
    pub closed_order_ids: Vec<String>,
    pub cancelled_order_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalReceivedPayload {
    pub signal_id: String,
    pub source: String,
    pub symbol: Option<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRecordedPayload {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub qty: f64,
    pub realized_pnl: f64,
    pub r_multiple: Option<f64>,
}

/// The tagged-variant payload of a domain event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    OrderPlaced(OrderPlacedPayload),
    ExecutionReceived(ExecutionReceivedPayload),
    OrderStatusChanged(OrderStatusChangedPayload),
    RegimeShifted(RegimeShiftedPayload),
    RiskLimitBreached(RiskLimitBreachedPayload),
    SessionLocked(SessionLockedPayload),
    SessionFlattened(SessionFlattenedPayload),
    SignalReceived(SignalReceivedPayload),
    OutcomeRecorded(OutcomeRecordedPayload),
}

impl EventPayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            EventPayload::OrderPlaced(_) => "OrderPlaced",
            EventPayload::ExecutionReceived(_) => "ExecutionReceived",
            EventPayload::OrderStatusChanged(_) => "OrderStatusChanged",
            EventPayload::RegimeShifted(_) => "RegimeShifted",
            EventPayload::RiskLimitBreached(_) => "RiskLimitBreached",
            EventPayload::SessionLocked(_) => "SessionLocked",
            EventPayload::SessionFlattened(_) => "SessionFlattened",
            EventPayload::SignalReceived(_) => "SignalReceived",
            EventPayload::OutcomeRecorded(_) => "OutcomeRecorded",
        }
    }
}

/// The canonical append-only record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub sequence_id: i64,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub original_qty: f64,
    pub filled_qty: f64,
    pub avg_price: f64,
    pub status: OrderStatus,
    pub last_updated: DateTime<Utc>,
    pub parent_correlation_id: Option<String>,
    pub oca_group: Option<String>,
}

impl Order {
    pub fn is_filled_consistent(&self) -> bool {
        if self.filled_qty > self.original_qty + 1e-9 {
            return false;
        }
        if self.status == OrderStatus::Filled {
            return (self.filled_qty - self.original_qty).abs() < 1e-9;
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Position {
    pub symbol: String,
    pub signed_qty: f64,
    pub avg_price: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
}

impl Position {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            ..Default::default()
        }
    }

    pub fn is_flat(&self) -> bool {
        self.signed_qty.abs() < 1e-9
    }
}
