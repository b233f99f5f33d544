//! ExitPlan state machine and append-only override log (spec §3, §9).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitPlanState {
    Draft,
    Active,
    Protecting,
    Scaling,
    Exited,
    Cancelled,
}

impl ExitPlanState {
    fn can_transition_to(self, next: ExitPlanState) -> bool {
        if next == ExitPlanState::Cancelled {
            return self != ExitPlanState::Exited && self != ExitPlanState::Cancelled;
        }
        matches!(
            (self, next),
            (ExitPlanState::Draft, ExitPlanState::Active)
                | (ExitPlanState::Active, ExitPlanState::Protecting)
                | (ExitPlanState::Protecting, ExitPlanState::Scaling)
                | (ExitPlanState::Scaling, ExitPlanState::Exited)
                | (ExitPlanState::Active, ExitPlanState::Exited)
                | (ExitPlanState::Protecting, ExitPlanState::Exited)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideReason {
    Revenge,
    TooEarly,
    TooLate,
    Freeze,
    Tilt,
    News,
    Technical,
    Sizing,
    ManualOverride,
    SystemError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TpRung {
    pub label: String,
    pub price: f64,
    pub qty_fraction: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RunnerPolicy {
    TrailPct(f64),
    AtrMultiple(f64),
    TimeStop { minutes: i64 },
    BreakevenTrail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideEvent {
    pub field: String,
    pub old_value: String,
    pub new_value: String,
    pub reason: OverrideReason,
    pub notes: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitPlan {
    pub plan_id: String,
    pub order_id: String,
    pub state: ExitPlanState,
    pub hard_stop: f64,
    pub tp_ladder: Vec<TpRung>,
    pub runner_policy: RunnerPolicy,
    pub protect_trigger_r: f64,
    pub giveback_max_ratio: f64,
    pub overrides: Vec<OverrideEvent>,
}

#[derive(Debug, thiserror::Error)]
pub enum ExitPlanError {
    #[error("invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ExitPlanState,
        to: ExitPlanState,
    },
    #[error("tp ladder qty_fraction sum {sum} exceeds 1.0")]
    LadderOverAllocated { sum: f64 },
}

impl ExitPlan {
    pub fn new(
        order_id: impl Into<String>,
        hard_stop: f64,
        tp_ladder: Vec<TpRung>,
        runner_policy: RunnerPolicy,
        protect_trigger_r: f64,
        giveback_max_ratio: f64,
    ) -> Result<Self, ExitPlanError> {
        let sum: f64 = tp_ladder.iter().map(|r| r.qty_fraction).sum();
        if sum > 1.0 + 1e-9 {
            return Err(ExitPlanError::LadderOverAllocated { sum });
        }
        Ok(Self {
            plan_id: Uuid::new_v4().to_string(),
            order_id: order_id.into(),
            state: ExitPlanState::Draft,
            hard_stop,
            tp_ladder,
            runner_policy,
            protect_trigger_r,
            giveback_max_ratio,
            overrides: Vec::new(),
        })
    }

    pub fn transition(&mut self, next: ExitPlanState) -> Result<(), ExitPlanError> {
        if !self.state.can_transition_to(next) {
            return Err(ExitPlanError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.record_override(
            "state",
            &format!("{:?}", self.state),
            &format!("{:?}", next),
            OverrideReason::Technical,
            None,
        );
        self.state = next;
        Ok(())
    }

    /// Append an override event. The override log is append-only: callers
    /// never mutate or remove a prior entry, only append a new one.
    pub fn record_override(
        &mut self,
        field: &str,
        old_value: &str,
        new_value: &str,
        reason: OverrideReason,
        notes: Option<String>,
    ) {
        self.overrides.push(OverrideEvent {
            field: field.to_string(),
            old_value: old_value.to_string(),
            new_value: new_value.to_string(),
            reason,
            notes,
            timestamp: Utc::now(),
        });
    }

    /// Fraction of max-favorable-excursion conceded before exit.
    pub fn giveback_ratio(mfe: f64, realized: f64) -> Option<f64> {
        if mfe <= 0.0 {
            return None;
        }
        Some(((mfe - realized) / mfe).clamp(0.0, 1.0))
    }
}
