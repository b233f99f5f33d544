//! Signal Ingester (C9): alert-stream import with a dedup window and
//! optional auto-evaluation trigger, grounded on the teacher's
//! `signals/db_storage.rs` row-shaped persistence pattern.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::{BridgeError, BridgeResult};
use crate::events::model::{EventPayload, SignalReceivedPayload};
use crate::events::EventStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalInput {
    pub source: String,
    pub symbol: Option<String>,
    pub description: String,
    pub confidence: f64,
    pub metadata: Option<serde_json::Value>,
}

impl SignalInput {
    fn dedup_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.source,
            self.symbol.as_deref().unwrap_or("-"),
            self.description
        )
    }
}

struct SeenEntry {
    key: String,
    seen_at: chrono::DateTime<Utc>,
}

/// Drops signals that repeat (same source, symbol, description) within
/// `dedup_window`; everything else is persisted and appended to the event
/// log. Optional auto-evaluation is left to the caller (the dispatcher
/// decides whether a given signal warrants triggering the ensemble).
pub struct SignalIngester {
    db: Database,
    store: std::sync::Arc<EventStore>,
    dedup_window: Duration,
    recent: Mutex<VecDeque<SeenEntry>>,
}

impl SignalIngester {
    pub fn new(db: Database, store: std::sync::Arc<EventStore>, dedup_window: Duration) -> Self {
        Self {
            db,
            store,
            dedup_window,
            recent: Mutex::new(VecDeque::new()),
        }
    }

    fn is_duplicate(&self, key: &str) -> bool {
        let now = Utc::now();
        let mut recent = self.recent.lock();
        while let Some(front) = recent.front() {
            if now.signed_duration_since(front.seen_at).to_std().unwrap_or_default() > self.dedup_window {
                recent.pop_front();
            } else {
                break;
            }
        }
        recent.iter().any(|entry| entry.key == key)
    }

    pub async fn ingest(&self, input: SignalInput) -> BridgeResult<String> {
        if !(0.0..=1.0).contains(&input.confidence) {
            return Err(BridgeError::validation(
                "confidence",
                "must be in [0,1]",
            ));
        }

        let key = input.dedup_key();
        if self.is_duplicate(&key) {
            return Err(BridgeError::RateLimited {
                bucket: "signal_dedup".into(),
                retry_after_secs: self.dedup_window.as_secs(),
            });
        }

        let signal_id = uuid::Uuid::new_v4().to_string();
        let metadata_json = input
            .metadata
            .as_ref()
            .map(|v| v.to_string());

        self.db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO signals (signal_id, source, symbol, description, confidence, \
                     metadata_json, dedup_key, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        signal_id,
                        input.source,
                        input.symbol,
                        input.description,
                        input.confidence,
                        metadata_json,
                        key,
                        Utc::now().timestamp_nanos_opt().unwrap_or_default(),
                    ],
                )
            })
            .map_err(BridgeError::from)?;

        self.store
            .append(EventPayload::SignalReceived(SignalReceivedPayload {
                signal_id: signal_id.clone(),
                source: input.source,
                symbol: input.symbol,
                confidence: input.confidence,
            }))
            .await?;

        self.recent.lock().push_back(SeenEntry { key, seen_at: Utc::now() });

        Ok(signal_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SignalInput {
        SignalInput {
            source: "tradingview".into(),
            symbol: Some("AAPL".into()),
            description: "breakout above resistance".into(),
            confidence: 0.7,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn duplicate_within_window_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        let store = std::sync::Arc::new(EventStore::new(db.clone()).unwrap());
        let ingester = SignalIngester::new(db, store, Duration::from_secs(60));

        ingester.ingest(sample()).await.unwrap();
        let second = ingester.ingest(sample()).await;
        assert!(matches!(second, Err(BridgeError::RateLimited { .. })));
    }

    #[tokio::test]
    async fn distinct_signals_both_succeed() {
        let db = Database::open_in_memory().unwrap();
        let store = std::sync::Arc::new(EventStore::new(db.clone()).unwrap());
        let ingester = SignalIngester::new(db, store, Duration::from_secs(60));

        ingester.ingest(sample()).await.unwrap();
        let mut other = sample();
        other.description = "breakdown below support".into();
        assert!(ingester.ingest(other).await.is_ok());
    }

    #[tokio::test]
    async fn out_of_range_confidence_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        let store = std::sync::Arc::new(EventStore::new(db.clone()).unwrap());
        let ingester = SignalIngester::new(db, store, Duration::from_secs(60));
        let mut input = sample();
        input.confidence = 1.5;
        assert!(matches!(
            ingester.ingest(input).await,
            Err(BridgeError::Validation { .. })
        ));
    }
}
