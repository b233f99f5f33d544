//! Kelly-derived position sizing (spec §4.4), grounded on the teacher's
//! `vault/kelly.rs` fractional-Kelly shape but reworked around the spec's
//! risk/capital/margin triple-constraint sizer.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingConstraint {
    Risk,
    Capital,
    Margin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingInput {
    pub entry: f64,
    pub stop: f64,
    pub equity: f64,
    pub available_funds: f64,
    pub risk_pct: f64,
    pub risk_amount: Option<f64>,
    pub max_capital_pct: f64,
    pub margin_multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingResult {
    pub recommended_shares: u64,
    pub binding_constraint: Option<BindingConstraint>,
    pub warnings: Vec<String>,
}

/// `f* = (bp - q) / b`, the full-Kelly fraction for a binary win/loss bet
/// with payoff ratio implied by `risk_per_share`/`reward_per_share`.
pub fn kelly_fraction(win_probability: f64, payoff_ratio: f64) -> f64 {
    let p = win_probability.clamp(0.001, 0.999);
    let q = 1.0 - p;
    if payoff_ratio <= 0.0 {
        return 0.0;
    }
    ((payoff_ratio * p - q) / payoff_ratio).max(0.0)
}

pub fn recommend_position_size(input: &SizingInput) -> SizingResult {
    let mut warnings = Vec::new();

    let risk_per_share = (input.entry - input.stop).abs();
    if risk_per_share <= 0.0 {
        warnings.push("no risk buffer".to_string());
        return SizingResult {
            recommended_shares: 0,
            binding_constraint: None,
            warnings,
        };
    }

    let gap_pct = risk_per_share / input.entry.abs().max(1e-9);

    let risk_budget = input
        .risk_amount
        .unwrap_or(input.equity * input.risk_pct)
        .min(input.equity * input.risk_pct);

    let mut shares_by_risk = (risk_budget / risk_per_share).floor();

    if gap_pct > 0.20 {
        warnings.push(format!(
            "gap_pct {:.1}% exceeds 20% threshold; halving risk-based size",
            gap_pct * 100.0
        ));
        shares_by_risk = (shares_by_risk / 2.0).floor();
    }

    let shares_by_capital = ((input.equity * input.max_capital_pct) / input.entry).floor();
    let shares_by_margin =
        (input.available_funds / (input.entry * input.margin_multiplier)).floor();

    let candidates = [
        (BindingConstraint::Risk, shares_by_risk),
        (BindingConstraint::Capital, shares_by_capital),
        (BindingConstraint::Margin, shares_by_margin),
    ];

    let (binding, recommended) = candidates
        .iter()
        .copied()
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
        .unwrap();

    let recommended = recommended.max(0.0);

    SizingResult {
        recommended_shares: recommended as u64,
        binding_constraint: if recommended > 0.0 { Some(binding) } else { None },
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_input() -> SizingInput {
        SizingInput {
            entry: 100.0,
            stop: 98.0,
            equity: 100_000.0,
            available_funds: 50_000.0,
            risk_pct: 0.01,
            risk_amount: None,
            max_capital_pct: 0.2,
            margin_multiplier: 1.0,
        }
    }

    #[test]
    fn zero_risk_per_share_returns_zero_with_warning() {
        let mut input = base_input();
        input.stop = input.entry;
        let result = recommend_position_size(&input);
        assert_eq!(result.recommended_shares, 0);
        assert!(result.warnings.iter().any(|w| w.contains("no risk buffer")));
    }

    #[test]
    fn large_gap_halves_risk_based_size() {
        let mut input = base_input();
        input.stop = 70.0; // 30% gap
        let with_gap = recommend_position_size(&input);
        input.risk_pct = 0.01;
        assert!(with_gap
            .warnings
            .iter()
            .any(|w| w.contains("gap_pct")));
    }

    #[test]
    fn binding_constraint_is_reported() {
        let input = base_input();
        let result = recommend_position_size(&input);
        assert!(result.binding_constraint.is_some());
    }
}
