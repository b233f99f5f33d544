//! SQLite-backed persistence.
//! Single process owns the database file; WAL mode for concurrent reads
//! during the single writer's appends, mirroring the teacher's
//! `signals/db_storage.rs` pragma set.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::sync::Arc;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS events (
    sequence_id INTEGER PRIMARY KEY,
    event_type  TEXT NOT NULL,
    timestamp_ns INTEGER NOT NULL,
    payload_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS orders (
    order_id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    original_qty REAL NOT NULL,
    filled_qty REAL NOT NULL,
    avg_price REAL NOT NULL,
    status TEXT NOT NULL,
    last_updated INTEGER NOT NULL,
    parent_correlation_id TEXT,
    oca_group TEXT
);

CREATE TABLE IF NOT EXISTS executions (
    execution_id TEXT PRIMARY KEY,
    order_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    shares REAL NOT NULL,
    price REAL NOT NULL,
    executed_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS evaluations (
    evaluation_id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    direction TEXT NOT NULL,
    feature_vector_json TEXT NOT NULL,
    ensemble_score REAL NOT NULL,
    ensemble_confidence REAL NOT NULL,
    ensemble_should_trade INTEGER NOT NULL,
    prompt_hash TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS model_outputs (
    id TEXT PRIMARY KEY,
    evaluation_id TEXT NOT NULL REFERENCES evaluations(evaluation_id),
    provider TEXT NOT NULL,
    compliant INTEGER NOT NULL,
    score REAL,
    should_trade INTEGER,
    confidence REAL,
    reasoning TEXT,
    failure_reason TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS outcomes (
    id TEXT PRIMARY KEY,
    evaluation_id TEXT NOT NULL REFERENCES evaluations(evaluation_id),
    r_multiple REAL NOT NULL,
    won INTEGER NOT NULL,
    recorded_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS exit_plans (
    plan_id TEXT PRIMARY KEY,
    order_id TEXT NOT NULL,
    state TEXT NOT NULL,
    hard_stop REAL,
    tp_ladder_json TEXT NOT NULL,
    runner_policy_json TEXT NOT NULL,
    protect_trigger_r REAL,
    giveback_max_ratio REAL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS exit_events (
    id TEXT PRIMARY KEY,
    plan_id TEXT NOT NULL REFERENCES exit_plans(plan_id),
    field TEXT NOT NULL,
    old_value TEXT NOT NULL,
    new_value TEXT NOT NULL,
    reason TEXT NOT NULL,
    notes TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS trade_journal (
    order_id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    entry_price REAL NOT NULL,
    exit_price REAL NOT NULL,
    qty REAL NOT NULL,
    realized_pnl REAL NOT NULL,
    r_multiple REAL,
    opened_at INTEGER NOT NULL,
    closed_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS risk_config (
    key TEXT PRIMARY KEY,
    value_json TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS signals (
    signal_id TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    symbol TEXT,
    description TEXT NOT NULL,
    confidence REAL NOT NULL,
    metadata_json TEXT,
    dedup_key TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_signals_dedup ON signals(dedup_key, created_at DESC);

CREATE TABLE IF NOT EXISTS weight_history (
    id TEXT PRIMARY KEY,
    weights_json TEXT NOT NULL,
    source TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS ops_availability (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sampled_at INTEGER NOT NULL,
    bridge_ok INTEGER NOT NULL,
    broker_ok INTEGER NOT NULL,
    tunnel_ok INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ops_availability_time ON ops_availability(sampled_at DESC);

CREATE TABLE IF NOT EXISTS ops_outages (
    id TEXT PRIMARY KEY,
    started_at INTEGER NOT NULL,
    ended_at INTEGER,
    duration_secs INTEGER,
    affected_components_json TEXT NOT NULL
);
"#;

/// Thin wrapper around a single connection, serialized with a mutex.
/// Mirrors the teacher's choice of `parking_lot::Mutex<Connection>` over a
/// pool, since the spec does not require multi-writer access.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("opening database {path}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("applying schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> rusqlite::Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }
}
