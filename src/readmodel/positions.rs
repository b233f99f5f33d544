//! Position netting projection (spec §4.3, the critical piece).

use crate::events::model::{Position, Side};

/// Result of applying one execution to a position: the updated position
/// plus, if a closing portion occurred, the realized pnl and r-multiple
/// context needed by the trade journal.
pub struct NettingOutcome {
    pub position: Position,
    pub closed_qty: f64,
    pub closing_realized_pnl: f64,
}

/// Apply a single execution (symbol already matches `position.symbol`).
pub fn apply_execution(position: &Position, side: Side, shares: f64, price: f64) -> NettingOutcome {
    let mut pos = position.clone();
    let exec_signed = match side {
        Side::Buy => shares,
        Side::Sell => -shares,
    };

    let same_direction = pos.signed_qty == 0.0 || pos.signed_qty.signum() == exec_signed.signum();

    if same_direction {
        let old_qty_abs = pos.signed_qty.abs();
        let new_qty_abs = old_qty_abs + shares;
        pos.avg_price = if new_qty_abs > 0.0 {
            (old_qty_abs * pos.avg_price + shares * price) / new_qty_abs
        } else {
            0.0
        };
        pos.signed_qty += exec_signed;
        return NettingOutcome {
            position: pos,
            closed_qty: 0.0,
            closing_realized_pnl: 0.0,
        };
    }

    // Opposing direction: this execution closes some or all of the position.
    let old_qty_abs = pos.signed_qty.abs();
    let closing = shares.min(old_qty_abs);
    let was_long = pos.signed_qty > 0.0;

    let closing_pnl = if was_long {
        closing * (price - pos.avg_price)
    } else {
        closing * (pos.avg_price - price)
    };
    pos.realized_pnl += closing_pnl;

    let residual = shares - closing;
    pos.signed_qty += exec_signed;

    if pos.signed_qty.abs() < 1e-9 {
        // Exactly closed: residual (if any) becomes a fresh position at execution price.
        pos.signed_qty = 0.0;
        pos.avg_price = 0.0;
        if residual > 1e-9 {
            pos.signed_qty = match side {
                Side::Buy => residual,
                Side::Sell => -residual,
            };
            pos.avg_price = price;
        }
    } else {
        // Sign flipped: residual starts a fresh position at the execution price.
        pos.avg_price = price;
    }

    NettingOutcome {
        position: pos,
        closed_qty: closing,
        closing_realized_pnl: closing_pnl,
    }
}

/// r-multiple for a closed trade: (exit - entry) / |entry - stop|, sign-adjusted for side.
/// Centralizes spec §9 Open Question (a).
pub fn r_multiple(entry: f64, exit: f64, stop: f64, side: Side) -> Option<f64> {
    let risk_per_share = (entry - stop).abs();
    if risk_per_share <= 0.0 {
        return None;
    }
    let directional = match side {
        Side::Buy => exit - entry,
        Side::Sell => entry - exit,
    };
    Some(directional / risk_per_share)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flip_long_to_short_scenario() {
        // Events: BUY 100 AAPL @ 150; SELL 150 AAPL @ 160.
        let mut pos = Position::new("AAPL");
        let r1 = apply_execution(&pos, Side::Buy, 100.0, 150.0);
        pos = r1.position;
        assert_eq!(pos.signed_qty, 100.0);
        assert_eq!(pos.avg_price, 150.0);

        let r2 = apply_execution(&pos, Side::Sell, 150.0, 160.0);
        pos = r2.position;

        assert!((pos.realized_pnl - 1000.0).abs() < 1e-6);
        assert_eq!(pos.signed_qty, -50.0);
        assert_eq!(pos.avg_price, 160.0);
    }

    #[test]
    fn exact_close_resets_avg_price() {
        let mut pos = Position::new("MSFT");
        pos = apply_execution(&pos, Side::Buy, 10.0, 100.0).position;
        let outcome = apply_execution(&pos, Side::Sell, 10.0, 110.0);
        assert!(outcome.position.is_flat());
        assert_eq!(outcome.position.avg_price, 0.0);
        assert!((outcome.closing_realized_pnl - 100.0).abs() < 1e-6);
    }

    #[test]
    fn same_direction_weighted_average() {
        let mut pos = Position::new("TSLA");
        pos = apply_execution(&pos, Side::Buy, 10.0, 100.0).position;
        pos = apply_execution(&pos, Side::Buy, 10.0, 120.0).position;
        assert_eq!(pos.signed_qty, 20.0);
        assert_eq!(pos.avg_price, 110.0);
    }

    #[test]
    fn r_multiple_long_winner() {
        let r = r_multiple(100.0, 110.0, 95.0, Side::Buy).unwrap();
        assert!((r - 2.0).abs() < 1e-9);
    }

    #[test]
    fn r_multiple_zero_risk_is_none() {
        assert!(r_multiple(100.0, 110.0, 100.0, Side::Buy).is_none());
    }
}
