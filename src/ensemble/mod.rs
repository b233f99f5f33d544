//! LLM Ensemble (C7): fan out to three providers in parallel, aggregate,
//! persist. See `provider` for the model trait, `aggregate` for the pure
//! scoring function, and `evaluation` for the persisted record shape.

pub mod aggregate;
pub mod evaluation;
pub mod provider;

use std::sync::Arc;
use std::time::Duration;

use crate::db::Database;
use crate::error::BridgeResult;
use crate::features::FeatureVector;
use crate::weights::ModelWeights;

use aggregate::{aggregate as aggregate_outputs, CompliantOutput, EnsembleResult};
use evaluation::{build_prompt, prompt_hash, Evaluation, ModelRecord};
use provider::ModelProvider;

/// A cheap, model-free check over the feature vector alone. When it
/// blocks an evaluation, the ensemble is still computed for observability
/// but `should_trade` is forced false (spec §4.5 "Guardrails").
pub trait Prefilter: Send + Sync {
    fn check(&self, feature_vector: &FeatureVector) -> PrefilterResult;
}

#[derive(Debug, Clone, Default)]
pub struct PrefilterResult {
    pub allowed: bool,
    pub flags: Vec<String>,
}

pub struct NoopPrefilter;
impl Prefilter for NoopPrefilter {
    fn check(&self, _feature_vector: &FeatureVector) -> PrefilterResult {
        PrefilterResult { allowed: true, flags: Vec::new() }
    }
}

pub struct Ensemble {
    providers: Vec<(String, Arc<dyn ModelProvider>)>,
    prefilter: Arc<dyn Prefilter>,
    timeout: Duration,
}

impl Ensemble {
    pub fn new(providers: Vec<(String, Arc<dyn ModelProvider>)>, timeout: Duration) -> Self {
        Self {
            providers,
            prefilter: Arc::new(NoopPrefilter),
            timeout,
        }
    }

    pub fn with_prefilter(mut self, prefilter: Arc<dyn Prefilter>) -> Self {
        self.prefilter = prefilter;
        self
    }

    pub async fn evaluate(
        &self,
        evaluation_id: &str,
        feature_vector: FeatureVector,
        weights: &ModelWeights,
        db: &Database,
    ) -> BridgeResult<(Evaluation, EnsembleResult)> {
        let prefilter_result = self.prefilter.check(&feature_vector);

        let prompt = build_prompt(&feature_vector);
        let hash = prompt_hash(&prompt);

        let mut handles = Vec::with_capacity(self.providers.len());
        for (name, provider) in &self.providers {
            let provider = Arc::clone(provider);
            let prompt = prompt.clone();
            let timeout = self.timeout;
            let name = name.clone();
            handles.push(tokio::spawn(async move {
                let result = provider.evaluate(&prompt, timeout).await;
                (name, result)
            }));
        }

        let mut records = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok((name, result)) => records.push(Evaluation::record_for(&name, &result)),
                Err(_) => continue,
            }
        }

        let compliant_outputs: Vec<(&str, f64, &provider::ModelOutput)> = records
            .iter()
            .filter_map(|record| match record {
                ModelRecord::Compliant { provider, output } => {
                    Some((provider.as_str(), weight_for(provider, weights), output))
                }
                ModelRecord::NonCompliant { .. } => None,
            })
            .collect();

        let compliant: Vec<CompliantOutput> = compliant_outputs
            .iter()
            .map(|(provider, weight, output)| CompliantOutput {
                provider,
                weight: *weight,
                output,
            })
            .collect();

        let mut result = aggregate_outputs(&compliant, weights, aggregate::DEFAULT_TRADE_THRESHOLD);
        if !prefilter_result.allowed {
            result.ensemble_should_trade = false;
        }

        let evaluation = Evaluation::new(evaluation_id, feature_vector, hash, records, &result);
        evaluation.persist(db)?;

        Ok((evaluation, result))
    }
}

fn weight_for(provider: &str, weights: &ModelWeights) -> f64 {
    match provider {
        "claude" => weights.claude,
        "gpt4o" => weights.gpt4o,
        "gemini" => weights.gemini,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use provider::{ComplianceFailure, ComplianceReason, ModelOutput};

    struct FixedProvider {
        name: &'static str,
        output: Result<ModelOutput, ComplianceReason>,
    }

    #[async_trait]
    impl ModelProvider for FixedProvider {
        fn name(&self) -> &str {
            self.name
        }
        async fn evaluate(&self, _prompt: &str, _timeout: Duration) -> Result<ModelOutput, ComplianceFailure> {
            self.output.clone().map_err(|reason| ComplianceFailure {
                reason,
                message: "fixed failure".into(),
            })
        }
    }

    #[tokio::test]
    async fn non_compliant_provider_contributes_zero_weight() {
        let providers: Vec<(String, Arc<dyn ModelProvider>)> = vec![
            (
                "claude".into(),
                Arc::new(FixedProvider {
                    name: "claude",
                    output: Ok(ModelOutput { trade_score: 80.0, should_trade: true, confidence: 0.9, rationale: "x".into() }),
                }),
            ),
            (
                "gpt4o".into(),
                Arc::new(FixedProvider { name: "gpt4o", output: Err(ComplianceReason::Timeout) }),
            ),
        ];
        let ensemble = Ensemble::new(providers, Duration::from_secs(1));
        let db = Database::open_in_memory().unwrap();
        let feature_vector = FeatureVector::new("AAPL", crate::events::model::Side::Buy, crate::events::model::Regime::Normal);
        let weights = ModelWeights { claude: 0.5, gpt4o: 0.5, gemini: 0.0, k: 1.0 };

        let (evaluation, result) = ensemble
            .evaluate("eval-x", feature_vector, &weights, &db)
            .await
            .unwrap();

        assert_eq!(result.compliant_count, 1);
        assert_eq!(evaluation.models.len(), 2);
    }
}
