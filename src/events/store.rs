//! Append-only Event Store (C3).
//!
//! `append` is linearized behind a single `tokio::sync::Mutex` so
//! sequence_ids are assigned contiguously even under concurrent callers.
//! `replay` is a lazy, finite, ordered iterator over the durable log.
//! `subscribe` hands back a `broadcast::Receiver` fed by the same append
//! path, giving at-most-once delivery per subscriber from the moment they
//! subscribe (spec §4.3).

use crate::db::Database;
use crate::error::{BridgeError, BridgeResult};
use crate::events::model::{Event, EventPayload};
use chrono::Utc;
use tokio::sync::{broadcast, Mutex};

pub struct EventStore {
    db: Database,
    write_lock: Mutex<()>,
    tail: std::sync::atomic::AtomicI64,
    live: broadcast::Sender<Event>,
}

impl EventStore {
    pub fn new(db: Database) -> BridgeResult<Self> {
        let tail = db
            .with_conn(|c| {
                c.query_row("SELECT COALESCE(MAX(sequence_id), 0) FROM events", [], |r| {
                    r.get::<_, i64>(0)
                })
            })
            .map_err(BridgeError::from)?;
        let (live, _rx) = broadcast::channel(4096);
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
            tail: std::sync::atomic::AtomicI64::new(tail),
            live,
        })
    }

    /// Append a new event, returning its assigned sequence_id.
    /// A storage failure here is fatal to the originating operation (spec §4.3).
    pub async fn append(&self, payload: EventPayload) -> BridgeResult<i64> {
        let _guard = self.write_lock.lock().await;
        let timestamp = Utc::now();
        let next_seq = self.tail.load(std::sync::atomic::Ordering::SeqCst) + 1;

        let payload_json = serde_json::to_string(&payload)
            .map_err(|e| BridgeError::Storage(format!("serialize event: {e}")))?;

        self.db
            .with_conn(|c| {
                c.execute(
                    "INSERT INTO events (sequence_id, event_type, timestamp_ns, payload_json) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![
                        next_seq,
                        payload.type_name(),
                        timestamp.timestamp_nanos_opt().unwrap_or_default(),
                        payload_json
                    ],
                )
            })
            .map_err(BridgeError::from)?;

        self.tail.store(next_seq, std::sync::atomic::Ordering::SeqCst);

        let event = Event {
            sequence_id: next_seq,
            timestamp,
            payload,
        };
        // Best-effort fan-out; a lagging/absent subscriber never blocks the writer.
        let _ = self.live.send(event);
        Ok(next_seq)
    }

    pub fn current_tail(&self) -> i64 {
        self.tail.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Lazy, ordered, finite replay from `from` (inclusive) to the current tail.
    /// Non-restartable: each call re-queries the log as of the call time.
    pub fn replay(&self, from: i64) -> BridgeResult<Vec<Event>> {
        self.db
            .with_conn(|c| {
                let mut stmt = c.prepare(
                    "SELECT sequence_id, timestamp_ns, payload_json FROM events WHERE sequence_id >= ?1 ORDER BY sequence_id ASC",
                )?;
                let rows = stmt.query_map([from], |row| {
                    let seq: i64 = row.get(0)?;
                    let ts_ns: i64 = row.get(1)?;
                    let payload_json: String = row.get(2)?;
                    Ok((seq, ts_ns, payload_json))
                })?;
                let mut out = Vec::new();
                for r in rows {
                    let (seq, ts_ns, payload_json) = r?;
                    out.push((seq, ts_ns, payload_json));
                }
                Ok(out)
            })
            .map_err(BridgeError::from)?
            .into_iter()
            .map(|(seq, ts_ns, payload_json)| {
                let payload: EventPayload = serde_json::from_str(&payload_json)
                    .map_err(|e| BridgeError::Storage(format!("deserialize event {seq}: {e}")))?;
                let timestamp = chrono::DateTime::from_timestamp_nanos(ts_ns);
                Ok(Event {
                    sequence_id: seq,
                    timestamp,
                    payload,
                })
            })
            .collect()
    }

    /// Live subscription starting from whatever the caller already knows
    /// about (replay everything, then attach this to avoid missing events
    /// appended between the replay and the subscribe call).
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.live.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::model::{OrderPlacedPayload, Side};

    fn sample_payload(order_id: &str) -> EventPayload {
        EventPayload::OrderPlaced(OrderPlacedPayload {
            order_id: order_id.to_string(),
            symbol: "AAPL".to_string(),
            side: Side::Buy,
            original_qty: 100.0,
            parent_correlation_id: None,
            oca_group: None,
        })
    }

    #[tokio::test]
    async fn sequence_ids_are_contiguous() {
        let db = Database::open_in_memory().unwrap();
        let store = EventStore::new(db).unwrap();
        let s1 = store.append(sample_payload("o1")).await.unwrap();
        let s2 = store.append(sample_payload("o2")).await.unwrap();
        let s3 = store.append(sample_payload("o3")).await.unwrap();
        assert_eq!([s1, s2, s3], [1, 2, 3]);
    }

    #[tokio::test]
    async fn replay_twice_is_byte_equal() {
        let db = Database::open_in_memory().unwrap();
        let store = EventStore::new(db).unwrap();
        store.append(sample_payload("o1")).await.unwrap();
        store.append(sample_payload("o2")).await.unwrap();

        let first = store.replay(0).unwrap();
        let second = store.replay(0).unwrap();
        let j1 = serde_json::to_string(&first).unwrap();
        let j2 = serde_json::to_string(&second).unwrap();
        assert_eq!(j1, j2);
    }

    #[tokio::test]
    async fn subscriber_sees_events_after_subscribe() {
        let db = Database::open_in_memory().unwrap();
        let store = EventStore::new(db).unwrap();
        let mut rx = store.subscribe();
        store.append(sample_payload("o1")).await.unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.sequence_id, 1);
    }
}
