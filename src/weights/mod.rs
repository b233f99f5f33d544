//! Weight Store (C8). Persists the ensemble's per-provider weights as a
//! small JSON document, hot-reloads it on an interval, validates the
//! weight simplex on every write, and runs the Dirichlet-posterior
//! updater that drifts expected weights toward empirically successful
//! models per volatility regime (spec §4.6).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::{BridgeError, BridgeResult};
use crate::events::model::Regime;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelWeights {
    pub claude: f64,
    pub gpt4o: f64,
    pub gemini: f64,
    pub k: f64,
}

impl ModelWeights {
    pub fn sum(&self) -> f64 {
        self.claude + self.gpt4o + self.gemini
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if (self.sum() - 1.0).abs() > 0.01 {
            return Err(BridgeError::validation(
                "weights",
                format!("model weights sum to {:.4}, expected 1.0 ± 0.01", self.sum()),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Weights {
    #[serde(flatten)]
    pub base: ModelWeights,
    pub updated_at: DateTime<Utc>,
    pub sample_size: u64,
    pub source: String,
    #[serde(default)]
    pub regime_overrides: HashMap<String, ModelWeights>,
}

impl Weights {
    pub fn default_uniform() -> Self {
        Self {
            base: ModelWeights {
                claude: 1.0 / 3.0,
                gpt4o: 1.0 / 3.0,
                gemini: 1.0 / 3.0,
                k: 1.0,
            },
            updated_at: Utc::now(),
            sample_size: 0,
            source: "default".into(),
            regime_overrides: HashMap::new(),
        }
    }

    pub fn validate(&self) -> BridgeResult<()> {
        self.base.validate()?;
        for (regime, weights) in &self.regime_overrides {
            weights
                .validate()
                .map_err(|_| BridgeError::validation("regime_overrides", format!("{regime} weights invalid")))?;
        }
        Ok(())
    }

    fn regime_key(regime: Regime) -> &'static str {
        match regime {
            Regime::Low => "low",
            Regime::Normal => "normal",
            Regime::High => "high",
            Regime::Trending => "trending",
            Regime::Chop => "chop",
            Regime::Volatile => "volatile",
        }
    }

    /// Resolve the active weights for `regime`: an explicit override if
    /// present, otherwise the base weights.
    pub fn active_for_regime(&self, regime: Regime) -> ModelWeights {
        self.regime_overrides
            .get(Self::regime_key(regime))
            .copied()
            .unwrap_or(self.base)
    }
}

const ALPHA_DECAY: f64 = 0.98;
const ALPHA_EPSILON: f64 = 0.05;

/// Publishes the current weights as an immutable snapshot; readers take a
/// reference good for the duration of one evaluation, writers install a
/// new snapshot after validation (spec §9 "Ensemble weights as shared
/// mutable state"). Also owns the Dirichlet posterior used to drift those
/// weights as trade outcomes come in (spec §4.6).
pub struct WeightStore {
    current: ArcSwap<Weights>,
    path: PathBuf,
    updater: DirichletUpdater,
    db: Database,
}

impl WeightStore {
    pub fn new(initial: Weights, path: impl Into<PathBuf>, db: Database) -> BridgeResult<Self> {
        initial.validate()?;
        Ok(Self {
            current: ArcSwap::from_pointee(initial),
            path: path.into(),
            updater: DirichletUpdater::new(),
            db,
        })
    }

    pub fn load_or_default(path: impl Into<PathBuf>, db: Database) -> BridgeResult<Self> {
        let path = path.into();
        let initial = Self::read_file(&path).unwrap_or_else(|_| Weights::default_uniform());
        Self::new(initial, path, db)
    }

    fn read_file(path: &PathBuf) -> BridgeResult<Weights> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Storage(format!("reading weights file: {e}")))?;
        let weights: Weights = serde_json::from_str(&contents)
            .map_err(|e| BridgeError::validation("weights_file", e.to_string()))?;
        weights.validate()?;
        Ok(weights)
    }

    pub fn current(&self) -> Arc<Weights> {
        self.current.load_full()
    }

    pub fn install(&self, weights: Weights) -> BridgeResult<()> {
        weights.validate()?;
        self.persist_history(&weights);
        self.current.store(Arc::new(weights));
        Ok(())
    }

    /// Append the weight document being installed into the durable
    /// `weight_history` audit trail; a failure to record history must not
    /// block the weight swap itself.
    fn persist_history(&self, weights: &Weights) {
        let Ok(weights_json) = serde_json::to_string(weights) else {
            return;
        };
        let result = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO weight_history (id, weights_json, source, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    uuid::Uuid::new_v4().to_string(),
                    weights_json,
                    weights.source,
                    weights.updated_at.timestamp_nanos_opt().unwrap_or_default(),
                ],
            )
        });
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to persist weight history entry");
        }
    }

    /// Re-read the backing file and install it if changed and valid.
    /// Invalid or unreadable files are logged and skipped — a bad write
    /// to the weights file must not crash the reload loop.
    pub fn reload(&self) {
        match Self::read_file(&self.path) {
            Ok(weights) => {
                if weights.updated_at != self.current().updated_at {
                    self.current.store(Arc::new(weights));
                }
            }
            Err(e) => tracing::warn!(error = %e, "weights reload skipped"),
        }
    }

    pub fn spawn_reload_task(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.reload();
            }
        })
    }

    /// Feed a just-closed trade's outcome into the Dirichlet posterior for
    /// `regime` and install the resulting expected weights as that regime's
    /// override, leaving the base weights and other regimes untouched.
    pub fn record_outcome_for_regime(&self, regime: Regime, correct: [bool; 3], r_multiple: f64) -> BridgeResult<()> {
        let alpha = self.updater.update(regime, correct, r_multiple, ALPHA_DECAY, ALPHA_EPSILON);
        let expected = DirichletUpdater::expected_weights(alpha);

        let mut weights = (*self.current()).clone();
        weights
            .regime_overrides
            .insert(Weights::regime_key(regime).to_string(), expected);
        weights.updated_at = Utc::now();
        weights.sample_size += 1;
        weights.source = "dirichlet_update".to_string();
        self.install(weights)
    }
}

/// Maintains per-regime Dirichlet concentration parameters (one triple
/// `[claude, gpt4o, gemini]` per regime) and derives expected weights from
/// them (spec §4.6).
pub struct DirichletUpdater {
    alpha: Mutex<HashMap<String, [f64; 3]>>,
}

impl Default for DirichletUpdater {
    fn default() -> Self {
        Self::new()
    }
}

impl DirichletUpdater {
    pub fn new() -> Self {
        Self {
            alpha: Mutex::new(HashMap::new()),
        }
    }

    /// Apply decay, reward models whose predicted direction matched the
    /// realized outcome, floor at `epsilon`, and return the updated alpha
    /// triple for `regime`.
    pub fn update(
        &self,
        regime: Regime,
        correct: [bool; 3],
        r_multiple: f64,
        decay: f64,
        epsilon: f64,
    ) -> [f64; 3] {
        let key = Weights::regime_key(regime).to_string();
        let mut guard = self.alpha.lock();
        let alpha = guard.entry(key).or_insert([1.0, 1.0, 1.0]);

        for a in alpha.iter_mut() {
            *a *= decay;
        }

        let bump = r_multiple.abs().min(5.0);
        for (i, was_correct) in correct.iter().enumerate() {
            if *was_correct {
                alpha[i] += bump;
            }
        }

        for a in alpha.iter_mut() {
            if *a < epsilon {
                *a = epsilon;
            }
        }

        *alpha
    }

    pub fn expected_weights(alpha: [f64; 3]) -> ModelWeights {
        let sum: f64 = alpha.iter().sum();
        ModelWeights {
            claude: alpha[0] / sum,
            gpt4o: alpha[1] / sum,
            gemini: alpha[2] / sum,
            k: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_sum_to_one() {
        let weights = Weights::default_uniform();
        assert!((weights.base.sum() - 1.0).abs() < 0.01);
    }

    #[test]
    fn invalid_sum_is_rejected() {
        let mut weights = Weights::default_uniform();
        weights.base.claude = 0.9;
        assert!(weights.validate().is_err());
    }

    #[test]
    fn dirichlet_alpha_stays_above_floor() {
        let updater = DirichletUpdater::new();
        let mut alpha = [1.0, 1.0, 1.0];
        for _ in 0..500 {
            alpha = updater.update(Regime::Normal, [false, false, false], 2.0, 0.99, 0.1);
        }
        assert!(alpha.iter().all(|&a| a >= 0.1 - 1e-9));
    }

    #[test]
    fn correct_model_gains_weight_over_time() {
        let updater = DirichletUpdater::new();
        let mut alpha = [1.0, 1.0, 1.0];
        for _ in 0..20 {
            alpha = updater.update(Regime::Trending, [true, false, false], 1.5, 0.99, 0.1);
        }
        let expected = DirichletUpdater::expected_weights(alpha);
        assert!(expected.claude > expected.gpt4o);
        assert!(expected.claude > expected.gemini);
        assert!((expected.claude + expected.gpt4o + expected.gemini - 1.0).abs() < 1e-9);
    }

    #[test]
    fn regime_override_is_preferred_over_base() {
        let mut weights = Weights::default_uniform();
        weights.regime_overrides.insert(
            "volatile".to_string(),
            ModelWeights {
                claude: 0.6,
                gpt4o: 0.3,
                gemini: 0.1,
                k: 2.0,
            },
        );
        let active = weights.active_for_regime(Regime::Volatile);
        assert_eq!(active.claude, 0.6);
        let base = weights.active_for_regime(Regime::Normal);
        assert!((base.claude - 1.0 / 3.0).abs() < 1e-9);
    }
}
