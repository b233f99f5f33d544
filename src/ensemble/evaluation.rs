//! Evaluation persistence: the evaluation row, its per-model output rows,
//! and the deterministic prompt hash used for drift detection (spec §4.5
//! steps 1 and 4).

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::db::Database;
use crate::error::{BridgeError, BridgeResult};
use crate::events::model::Side;
use crate::features::FeatureVector;

use super::aggregate::EnsembleResult;
use super::provider::{ComplianceFailure, ModelOutput};

pub fn prompt_hash(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hex::encode(hasher.finalize())
}

/// Deterministic prompt text built from a feature vector; the same
/// feature vector always renders to the same prompt, which is what makes
/// `prompt_hash` useful for drift detection.
pub fn build_prompt(feature_vector: &FeatureVector) -> String {
    format!(
        "symbol={}\ndirection={:?}\nregime={:?}\n{}",
        feature_vector.symbol,
        feature_vector.direction,
        feature_vector.regime,
        feature_vector.render(),
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ModelRecord {
    Compliant { provider: String, output: ModelOutput },
    NonCompliant { provider: String, reason: String, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub evaluation_id: String,
    pub symbol: String,
    pub direction: Side,
    pub feature_vector: FeatureVector,
    pub prompt_hash: String,
    pub models: Vec<ModelRecord>,
    pub ensemble_score: f64,
    pub ensemble_confidence: f64,
    pub ensemble_should_trade: bool,
    pub created_at: DateTime<Utc>,
}

impl Evaluation {
    pub fn new(
        evaluation_id: impl Into<String>,
        feature_vector: FeatureVector,
        prompt_hash: String,
        models: Vec<ModelRecord>,
        ensemble: &EnsembleResult,
    ) -> Self {
        Self {
            evaluation_id: evaluation_id.into(),
            symbol: feature_vector.symbol.clone(),
            direction: feature_vector.direction,
            feature_vector,
            prompt_hash,
            models,
            ensemble_score: ensemble.ensemble_score,
            ensemble_confidence: ensemble.ensemble_confidence,
            ensemble_should_trade: ensemble.ensemble_should_trade,
            created_at: Utc::now(),
        }
    }

    pub fn record_for(provider: &str, result: &Result<ModelOutput, ComplianceFailure>) -> ModelRecord {
        match result {
            Ok(output) => ModelRecord::Compliant {
                provider: provider.to_string(),
                output: output.clone(),
            },
            Err(failure) => ModelRecord::NonCompliant {
                provider: provider.to_string(),
                reason: format!("{:?}", failure.reason),
                message: failure.message.clone(),
            },
        }
    }

    /// Atomically persist the evaluation row and every per-model output
    /// row (spec §4.5 step 4).
    pub fn persist(&self, db: &Database) -> BridgeResult<()> {
        let feature_json = serde_json::to_string(&self.feature_vector)
            .map_err(|e| BridgeError::Storage(e.to_string()))?;

        db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO evaluations (evaluation_id, symbol, direction, feature_vector_json, \
                 ensemble_score, ensemble_confidence, ensemble_should_trade, prompt_hash, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    self.evaluation_id,
                    self.symbol,
                    format!("{:?}", self.direction),
                    feature_json,
                    self.ensemble_score,
                    self.ensemble_confidence,
                    self.ensemble_should_trade as i64,
                    self.prompt_hash,
                    self.created_at.timestamp_nanos_opt().unwrap_or_default(),
                ],
            )?;

            for (idx, record) in self.models.iter().enumerate() {
                let id = format!("{}-{idx}", self.evaluation_id);
                match record {
                    ModelRecord::Compliant { provider, output } => {
                        tx.execute(
                            "INSERT INTO model_outputs (id, evaluation_id, provider, compliant, score, \
                             should_trade, confidence, reasoning, failure_reason, created_at) \
                             VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?7, NULL, ?8)",
                            rusqlite::params![
                                id,
                                self.evaluation_id,
                                provider,
                                output.trade_score,
                                output.should_trade as i64,
                                output.confidence,
                                output.rationale,
                                self.created_at.timestamp_nanos_opt().unwrap_or_default(),
                            ],
                        )?;
                    }
                    ModelRecord::NonCompliant { provider, reason, message } => {
                        tx.execute(
                            "INSERT INTO model_outputs (id, evaluation_id, provider, compliant, score, \
                             should_trade, confidence, reasoning, failure_reason, created_at) \
                             VALUES (?1, ?2, ?3, 0, NULL, NULL, NULL, NULL, ?4, ?5)",
                            rusqlite::params![
                                id,
                                self.evaluation_id,
                                provider,
                                format!("{reason}: {message}"),
                                self.created_at.timestamp_nanos_opt().unwrap_or_default(),
                            ],
                        )?;
                    }
                }
            }

            tx.commit()
        })
        .map_err(BridgeError::from)
    }

    /// Reload an evaluation's feature vector and recorded score fields by
    /// id; used by the round-trip test (spec §8: persisting and reloading
    /// preserves all fields and recomputes the same ensemble score).
    pub fn reload(db: &Database, evaluation_id: &str) -> BridgeResult<Option<(FeatureVector, f64)>> {
        db.with_conn(|conn| {
            conn.query_row(
                "SELECT feature_vector_json, ensemble_score FROM evaluations WHERE evaluation_id = ?1",
                rusqlite::params![evaluation_id],
                |row| {
                    let json: String = row.get(0)?;
                    let score: f64 = row.get(1)?;
                    Ok((json, score))
                },
            )
            .optional()
        })
        .map_err(BridgeError::from)?
        .map(|(json, score)| {
            let vector: FeatureVector =
                serde_json::from_str(&json).map_err(|e| BridgeError::Storage(e.to_string()))?;
            Ok((vector, score))
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::model::Regime;

    #[test]
    fn prompt_hash_is_stable_for_identical_prompt() {
        let a = prompt_hash("hello");
        let b = prompt_hash("hello");
        assert_eq!(a, b);
    }

    #[test]
    fn prompt_hash_changes_with_content() {
        assert_ne!(prompt_hash("a"), prompt_hash("b"));
    }

    #[test]
    fn persist_and_reload_round_trips_feature_vector_and_score() {
        let db = Database::open_in_memory().unwrap();
        let feature_vector = FeatureVector::new("AAPL", Side::Buy, Regime::Normal).with_value("rsi_14", 61.0);
        let prompt = build_prompt(&feature_vector);
        let hash = prompt_hash(&prompt);

        let output = ModelOutput {
            trade_score: 72.0,
            should_trade: true,
            confidence: 0.8,
            rationale: "ok".into(),
        };
        let models = vec![ModelRecord::Compliant {
            provider: "claude".into(),
            output,
        }];
        let ensemble = EnsembleResult {
            ensemble_score: 72.0,
            ensemble_confidence: 0.8,
            ensemble_should_trade: true,
            weighted_mean: 72.0,
            dispersion: 0.0,
            compliant_count: 1,
        };

        let evaluation = Evaluation::new("eval-1", feature_vector.clone(), hash, models, &ensemble);
        evaluation.persist(&db).unwrap();

        let (reloaded_vector, reloaded_score) = Evaluation::reload(&db, "eval-1").unwrap().unwrap();
        assert_eq!(reloaded_vector.symbol, feature_vector.symbol);
        assert_eq!(reloaded_score, 72.0);
    }
}
