//! Risk Gate (C5): pre-trade veto + session lock transitions.
//! Grounded on the teacher's `risk.rs::RiskManager` shape (guardrail flags,
//! drawdown-aware multiplier) but wired to the spec's session state machine
//! instead of the teacher's standalone Kelly/VaR bankroll tracker.

use crate::readmodel::session_state::Session;
use crate::risk::sizing::{recommend_position_size, SizingInput, SizingResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub symbol: String,
    pub notional: f64,
    pub concentration_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskCheck {
    pub allowed: bool,
    pub reason: Option<String>,
    pub warnings: Vec<String>,
}

pub struct RiskGate {
    session: Arc<RwLock<Session>>,
}

impl RiskGate {
    pub fn new(session: Arc<RwLock<Session>>) -> Self {
        Self { session }
    }

    /// All order submissions funnel through here (spec §4.4).
    pub fn check_risk(&self, intent: &OrderIntent) -> RiskCheck {
        let mut warnings = Vec::new();
        {
            let session = self.session.read();
            if session.locked {
                return RiskCheck {
                    allowed: false,
                    reason: Some(
                        session
                            .lock_reason
                            .clone()
                            .unwrap_or_else(|| "session_locked".to_string()),
                    ),
                    warnings,
                };
            }
            if session.trade_count >= session.limits.max_daily_trades {
                return RiskCheck {
                    allowed: false,
                    reason: Some("max_daily_trades_exceeded".to_string()),
                    warnings,
                };
            }
            if intent.concentration_pct > session.limits.max_concentration_pct {
                return RiskCheck {
                    allowed: false,
                    reason: Some("concentration_limit_exceeded".to_string()),
                    warnings,
                };
            }
            if intent.notional / session.equity.max(1.0) > session.limits.max_position_pct {
                warnings.push("position size near max_position_pct".to_string());
            }
        }
        RiskCheck {
            allowed: true,
            reason: None,
            warnings,
        }
    }

    /// Observe a just-closed trade's pnl; may transition the session to `locked`.
    pub fn record_outcome(&self, pnl: f64) -> Option<String> {
        let mut session = self.session.write();
        session.record_trade_outcome(pnl);

        if session.daily_loss_pct() > session.limits.max_daily_loss_pct {
            let reason = "daily_loss_exceeded".to_string();
            session.lock(reason.clone());
            return Some(reason);
        }
        if session.consecutive_losses >= session.limits.consecutive_loss_limit {
            let reason = "consecutive_loss_limit".to_string();
            session.lock(reason.clone());
            return Some(reason);
        }
        None
    }

    pub fn size_position(&self, input: &SizingInput) -> SizingResult {
        recommend_position_size(input)
    }

    pub fn unlock(&self) {
        self.session.write().unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readmodel::session_state::SessionLimits;
    use chrono::Utc;

    fn gate_with_equity(equity: f64) -> RiskGate {
        let limits = SessionLimits {
            max_position_pct: 0.1,
            max_daily_loss_pct: 0.02,
            max_concentration_pct: 0.25,
            volatility_scalar: 1.0,
            max_daily_trades: 50,
            consecutive_loss_limit: 5,
        };
        let session = Arc::new(RwLock::new(Session::new(
            Utc::now().date_naive(),
            equity,
            limits,
        )));
        RiskGate::new(session)
    }

    #[test]
    fn daily_loss_breach_locks_session() {
        let gate = gate_with_equity(100_000.0);
        let reason = gate.record_outcome(-2500.0);
        assert_eq!(reason.as_deref(), Some("daily_loss_exceeded"));

        let check = gate.check_risk(&OrderIntent {
            symbol: "AAPL".into(),
            notional: 1000.0,
            concentration_pct: 0.05,
        });
        assert!(!check.allowed);
        assert_eq!(check.reason.as_deref(), Some("daily_loss_exceeded"));
    }

    #[test]
    fn consecutive_losses_lock_session() {
        let gate = gate_with_equity(100_000.0);
        for _ in 0..5 {
            gate.record_outcome(-1.0);
        }
        let check = gate.check_risk(&OrderIntent {
            symbol: "AAPL".into(),
            notional: 1000.0,
            concentration_pct: 0.05,
        });
        assert!(!check.allowed);
    }
}
