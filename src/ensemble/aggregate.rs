//! Ensemble aggregation (spec §4.5 step 3). A pure function: given the
//! same per-model outputs and weights, the result is bit-identical.

use statrs::statistics::Statistics;

use super::provider::ModelOutput;
use crate::weights::ModelWeights;

/// Trade-score threshold above which the ensemble recommends trading,
/// absent a configured override.
pub const DEFAULT_TRADE_THRESHOLD: f64 = 60.0;

#[derive(Debug, Clone)]
pub struct CompliantOutput<'a> {
    pub provider: &'a str,
    pub weight: f64,
    pub output: &'a ModelOutput,
}

#[derive(Debug, Clone)]
pub struct EnsembleResult {
    pub ensemble_score: f64,
    pub ensemble_confidence: f64,
    pub ensemble_should_trade: bool,
    pub weighted_mean: f64,
    pub dispersion: f64,
    pub compliant_count: usize,
}

/// Aggregate compliant model outputs per spec §4.5. `weights` supplies
/// `k` (the disagreement penalty); non-compliant providers simply don't
/// appear in `compliant`.
pub fn aggregate(compliant: &[CompliantOutput], weights: &ModelWeights, threshold: f64) -> EnsembleResult {
    if compliant.is_empty() {
        return EnsembleResult {
            ensemble_score: 0.0,
            ensemble_confidence: 0.0,
            ensemble_should_trade: false,
            weighted_mean: 0.0,
            dispersion: 0.0,
            compliant_count: 0,
        };
    }

    let weight_sum: f64 = compliant.iter().map(|c| c.weight).sum();
    let weighted_mean = if weight_sum > 0.0 {
        compliant.iter().map(|c| c.weight * c.output.trade_score).sum::<f64>() / weight_sum
    } else {
        compliant.iter().map(|c| c.output.trade_score).mean()
    };

    let scores: Vec<f64> = compliant.iter().map(|c| c.output.trade_score).collect();
    let dispersion = if scores.len() > 1 {
        scores.as_slice().population_std_dev()
    } else {
        0.0
    };

    let ensemble_score = (weighted_mean * (1.0 - weights.k * dispersion / 50.0)).clamp(0.0, 100.0);

    let trade_votes = compliant.iter().filter(|c| c.output.should_trade).count();
    let majority_agrees = trade_votes * 2 > compliant.len();
    let ensemble_should_trade = ensemble_score >= threshold && majority_agrees;

    let ensemble_confidence = if weight_sum > 0.0 {
        compliant.iter().map(|c| c.weight * c.output.confidence).sum::<f64>() / weight_sum
    } else {
        compliant.iter().map(|c| c.output.confidence).mean()
    };

    EnsembleResult {
        ensemble_score,
        ensemble_confidence,
        ensemble_should_trade,
        weighted_mean,
        dispersion,
        compliant_count: compliant.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(trade_score: f64, should_trade: bool, confidence: f64) -> ModelOutput {
        ModelOutput {
            trade_score,
            should_trade,
            confidence,
            rationale: String::new(),
        }
    }

    #[test]
    fn scenario_2_ensemble_aggregation() {
        let claude = output(80.0, true, 0.7);
        let gpt4o = output(60.0, true, 0.6);
        let gemini = output(70.0, false, 0.5);
        let compliant = vec![
            CompliantOutput { provider: "claude", weight: 0.4, output: &claude },
            CompliantOutput { provider: "gpt4o", weight: 0.4, output: &gpt4o },
            CompliantOutput { provider: "gemini", weight: 0.2, output: &gemini },
        ];
        let weights = ModelWeights { claude: 0.4, gpt4o: 0.4, gemini: 0.2, k: 1.5 };

        let result = aggregate(&compliant, &weights, DEFAULT_TRADE_THRESHOLD);

        assert!((result.weighted_mean - 70.0).abs() < 1e-9);
        assert!((result.dispersion - 8.164965809).abs() < 1e-6);
        assert!((result.ensemble_score - 52.90415).abs() < 1e-3);
    }

    #[test]
    fn empty_compliant_set_yields_no_trade() {
        let weights = ModelWeights { claude: 0.4, gpt4o: 0.4, gemini: 0.2, k: 1.5 };
        let result = aggregate(&[], &weights, DEFAULT_TRADE_THRESHOLD);
        assert_eq!(result.compliant_count, 0);
        assert!(!result.ensemble_should_trade);
    }

    #[test]
    fn minority_should_trade_votes_do_not_trigger_trade() {
        let a = output(90.0, false, 0.9);
        let b = output(90.0, true, 0.9);
        let c = output(90.0, false, 0.9);
        let compliant = vec![
            CompliantOutput { provider: "claude", weight: 1.0, output: &a },
            CompliantOutput { provider: "gpt4o", weight: 1.0, output: &b },
            CompliantOutput { provider: "gemini", weight: 1.0, output: &c },
        ];
        let weights = ModelWeights { claude: 0.34, gpt4o: 0.33, gemini: 0.33, k: 0.0 };
        let result = aggregate(&compliant, &weights, DEFAULT_TRADE_THRESHOLD);
        assert!(!result.ensemble_should_trade);
    }
}
