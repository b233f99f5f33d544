//! Feature Pipeline (C6). The bridge is handed a feature vector per
//! evaluation request; computing the individual feature formulas (vendor
//! market-data transforms) is out of scope here, but the pipeline's
//! contract — a stable, named, numeric feature vector feeding the
//! ensemble prompt builder — is implemented end-to-end.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::model::{Regime, Side};

/// A named, numeric feature vector for one (symbol, direction) candidate.
/// Keys are feature names (e.g. `"rsi_14"`, `"atr_pct"`); values are
/// whatever the upstream feature source computed. `BTreeMap` keeps prompt
/// construction deterministic (stable key order), which matters for the
/// ensemble's `prompt_hash`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureVector {
    pub symbol: String,
    pub direction: Side,
    pub regime: Regime,
    pub values: BTreeMap<String, f64>,
    pub computed_at: DateTime<Utc>,
}

impl FeatureVector {
    pub fn new(symbol: impl Into<String>, direction: Side, regime: Regime) -> Self {
        Self {
            symbol: symbol.into(),
            direction,
            regime,
            values: BTreeMap::new(),
            computed_at: Utc::now(),
        }
    }

    pub fn with_value(mut self, name: impl Into<String>, value: f64) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    /// Stable textual rendering used by the ensemble prompt builder; key
    /// order follows the `BTreeMap`'s natural (lexicographic) order.
    pub fn render(&self) -> String {
        let mut lines = Vec::with_capacity(self.values.len());
        for (name, value) in &self.values {
            lines.push(format!("{name}={value:.6}"));
        }
        lines.join("\n")
    }
}

/// Source of feature vectors for a (symbol, direction) pair. A real
/// deployment backs this with vendor market-data transforms; those
/// formulas are outside this crate's scope, so the default implementation
/// below only guarantees the contract (a populated, well-formed vector).
pub trait FeatureSource: Send + Sync {
    fn compute(&self, symbol: &str, direction: Side, regime: Regime) -> FeatureVector;
}

/// Feature source that reads from a caller-supplied snapshot rather than
/// fetching from a vendor, used by the dispatcher's evaluation-trigger
/// action and by tests: the caller already has the numbers (from its own
/// market-data feed) and just needs them carried through the pipeline
/// contract.
pub struct SuppliedFeatureSource {
    snapshot: BTreeMap<String, f64>,
}

impl SuppliedFeatureSource {
    pub fn new(snapshot: BTreeMap<String, f64>) -> Self {
        Self { snapshot }
    }
}

impl FeatureSource for SuppliedFeatureSource {
    fn compute(&self, symbol: &str, direction: Side, regime: Regime) -> FeatureVector {
        let mut vector = FeatureVector::new(symbol, direction, regime);
        vector.values = self.snapshot.clone();
        vector
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_is_deterministic_regardless_of_insertion_order() {
        let a = FeatureVector::new("AAPL", Side::Buy, Regime::Normal)
            .with_value("rsi_14", 61.2)
            .with_value("atr_pct", 0.014);
        let b = FeatureVector::new("AAPL", Side::Buy, Regime::Normal)
            .with_value("atr_pct", 0.014)
            .with_value("rsi_14", 61.2);
        assert_eq!(a.render(), b.render());
    }

    #[test]
    fn supplied_source_carries_snapshot_through() {
        let mut snapshot = BTreeMap::new();
        snapshot.insert("rsi_14".to_string(), 72.0);
        let source = SuppliedFeatureSource::new(snapshot);
        let vector = source.compute("MSFT", Side::Sell, Regime::High);
        assert_eq!(vector.get("rsi_14"), Some(72.0));
        assert_eq!(vector.symbol, "MSFT");
    }
}
