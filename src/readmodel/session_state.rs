//! Session read model (spec §3 "Session") + state machine (spec §4.4).

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SessionLimits {
    pub max_position_pct: f64,
    pub max_daily_loss_pct: f64,
    pub max_concentration_pct: f64,
    pub volatility_scalar: f64,
    pub max_daily_trades: u32,
    pub consecutive_loss_limit: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionLifecycle {
    Open,
    Locked,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub date: NaiveDate,
    pub lifecycle: SessionLifecycle,
    pub realized_pnl: f64,
    pub trade_count: u32,
    pub consecutive_losses: u32,
    pub locked: bool,
    pub lock_reason: Option<String>,
    pub limits: SessionLimits,
    pub equity: f64,
    pub flatten_fired_today: bool,
}

impl Session {
    pub fn new(date: NaiveDate, equity: f64, limits: SessionLimits) -> Self {
        Self {
            date,
            lifecycle: SessionLifecycle::Open,
            realized_pnl: 0.0,
            trade_count: 0,
            consecutive_losses: 0,
            locked: false,
            lock_reason: None,
            limits,
            equity,
            flatten_fired_today: false,
        }
    }

    pub fn lock(&mut self, reason: impl Into<String>) {
        self.locked = true;
        self.lifecycle = SessionLifecycle::Locked;
        self.lock_reason = Some(reason.into());
    }

    pub fn unlock(&mut self) {
        self.locked = false;
        self.lifecycle = SessionLifecycle::Open;
        self.lock_reason = None;
    }

    /// Calendar rollover in the configured timezone: close out, start a fresh `open` session.
    pub fn rollover<Tz: TimeZone>(&mut self, new_date: NaiveDate, now: DateTime<Tz>) {
        let _ = now;
        self.lifecycle = SessionLifecycle::Closed;
        *self = Session::new(new_date, self.equity, self.limits);
    }

    pub fn record_trade_outcome(&mut self, pnl: f64) {
        self.realized_pnl += pnl;
        self.equity += pnl;
        self.trade_count += 1;
        if pnl < 0.0 {
            self.consecutive_losses += 1;
        } else {
            self.consecutive_losses = 0;
        }
    }

    pub fn daily_loss_pct(&self) -> f64 {
        if self.equity - self.realized_pnl <= 0.0 {
            return 0.0;
        }
        let starting_equity = self.equity - self.realized_pnl;
        (-self.realized_pnl / starting_equity).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_limits() -> SessionLimits {
        SessionLimits {
            max_position_pct: 0.1,
            max_daily_loss_pct: 0.02,
            max_concentration_pct: 0.25,
            volatility_scalar: 1.0,
            max_daily_trades: 50,
            consecutive_loss_limit: 5,
        }
    }

    #[test]
    fn rollover_resets_state() {
        let mut s = Session::new(
            NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
            100_000.0,
            default_limits(),
        );
        s.lock("daily_loss_exceeded");
        s.rollover(
            NaiveDate::from_ymd_opt(2026, 8, 2).unwrap(),
            Utc::now(),
        );
        assert_eq!(s.lifecycle, SessionLifecycle::Open);
        assert!(!s.locked);
        assert_eq!(s.trade_count, 0);
    }
}
