//! Subscription Registry (C2). Deduplicates subscriptions by
//! (kind, symbol, exchange), keeps a bounded ring buffer of the latest
//! payloads per subscription, and resurrects everything after a broker
//! reconnect (spec §4.2).

use std::collections::VecDeque;
use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

const RING_BUFFER_CAP: usize = 300;
const SUBSCRIPTION_CAP: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionKind {
    RealTimeBars,
    MarketDepth,
    AccountUpdates,
    QuoteSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub kind: SubscriptionKind,
    pub symbol: String,
    pub exchange: String,
}

struct SubscriptionEntry {
    req_id: i64,
    buffer: VecDeque<serde_json::Value>,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: RwLock<HashMap<SubscriptionKey, SubscriptionEntry>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing req_id if this (kind, symbol, exchange) is
    /// already subscribed, otherwise registers a new one. Enforces the
    /// subscription cap (spec §4.2: `TooManySubscriptions`).
    pub fn subscribe(&self, key: SubscriptionKey, req_id: i64) -> BridgeResult<i64> {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&key) {
            return Ok(existing.req_id);
        }
        if entries.len() >= SUBSCRIPTION_CAP {
            return Err(BridgeError::RateLimited {
                bucket: "subscriptions".into(),
                retry_after_secs: 0,
            });
        }
        entries.insert(
            key,
            SubscriptionEntry {
                req_id,
                buffer: VecDeque::with_capacity(RING_BUFFER_CAP),
            },
        );
        Ok(req_id)
    }

    pub fn unsubscribe(&self, key: &SubscriptionKey) -> Option<i64> {
        self.entries.write().remove(key).map(|e| e.req_id)
    }

    pub fn push(&self, key: &SubscriptionKey, payload: serde_json::Value) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(key) {
            if entry.buffer.len() == RING_BUFFER_CAP {
                entry.buffer.pop_front();
            }
            entry.buffer.push_back(payload);
        }
    }

    pub fn get_buffer(&self, key: &SubscriptionKey) -> Vec<serde_json::Value> {
        self.entries
            .read()
            .get(key)
            .map(|e| e.buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn list(&self) -> Vec<SubscriptionKey> {
        self.entries.read().keys().cloned().collect()
    }

    /// After a reconnect, replay every live subscription against the new
    /// session so the gateway re-sends market data for all of them.
    pub fn resurrect(&self, mut resubscribe: impl FnMut(&SubscriptionKey) -> i64) {
        let mut entries = self.entries.write();
        for (key, entry) in entries.iter_mut() {
            entry.req_id = resubscribe(key);
            entry.buffer.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(symbol: &str) -> SubscriptionKey {
        SubscriptionKey {
            kind: SubscriptionKind::RealTimeBars,
            symbol: symbol.into(),
            exchange: "SMART".into(),
        }
    }

    #[test]
    fn duplicate_subscribe_returns_same_req_id() {
        let registry = SubscriptionRegistry::new();
        let first = registry.subscribe(key("AAPL"), 10).unwrap();
        let second = registry.subscribe(key("AAPL"), 99).unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn exceeding_cap_is_rate_limited() {
        let registry = SubscriptionRegistry::new();
        for i in 0..SUBSCRIPTION_CAP {
            registry
                .subscribe(key(&format!("SYM{i}")), i as i64)
                .unwrap();
        }
        let result = registry.subscribe(key("ONE_TOO_MANY"), 999);
        assert!(matches!(result, Err(BridgeError::RateLimited { .. })));
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let registry = SubscriptionRegistry::new();
        let k = key("AAPL");
        registry.subscribe(k.clone(), 1).unwrap();
        for i in 0..(RING_BUFFER_CAP + 10) {
            registry.push(&k, serde_json::json!({ "tick": i }));
        }
        let buffer = registry.get_buffer(&k);
        assert_eq!(buffer.len(), RING_BUFFER_CAP);
        assert_eq!(buffer[0]["tick"], 10);
    }

    #[test]
    fn resurrect_reassigns_req_ids_and_clears_buffers() {
        let registry = SubscriptionRegistry::new();
        let k = key("AAPL");
        registry.subscribe(k.clone(), 1).unwrap();
        registry.push(&k, serde_json::json!({ "tick": 1 }));

        registry.resurrect(|_| 42);

        assert!(registry.get_buffer(&k).is_empty());
        assert_eq!(registry.subscribe(k.clone(), 7).unwrap(), 42);
    }
}
