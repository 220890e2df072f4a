//! Shared record types for the recovery controller.
//!
//! These are the wire/document shapes exchanged with the surrounding
//! pipeline: execution and signal evidence (read-only inputs), incidents
//! and decisions (append-only outputs), and the staged-restart vocabulary
//! used by the planner and gates.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Capital-admission stage of the staged-restart state machine.
///
/// Each stage maps to a fixed sizing throttle. The planner only ever
/// advances one stage per cycle and retreats to `Frozen` in a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Frozen,
    StageA,
    StageB,
    StageC,
    Full,
}

impl Stage {
    /// Fractional position-sizing multiplier for this stage.
    pub fn throttle(self) -> f64 {
        match self {
            Stage::Frozen => 0.0,
            Stage::StageA => 0.25,
            Stage::StageB => 0.50,
            Stage::StageC => 0.75,
            Stage::Full => 1.00,
        }
    }

    /// The stage granted by a clean gate pass from this stage.
    pub fn next(self) -> Stage {
        match self {
            Stage::Frozen => Stage::StageA,
            Stage::StageA => Stage::StageB,
            Stage::StageB => Stage::StageC,
            Stage::StageC => Stage::Full,
            Stage::Full => Stage::Full,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Frozen => write!(f, "frozen"),
            Stage::StageA => write!(f, "stage_a"),
            Stage::StageB => write!(f, "stage_b"),
            Stage::StageC => write!(f, "stage_c"),
            Stage::Full => write!(f, "full"),
        }
    }
}

/// Trade side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

/// A realized trade produced by the execution subsystem. Read-only input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub side: Side,
    /// Realized return of the trade as a fraction (e.g. 0.002 = +0.2%).
    pub pnl_pct: f64,
    /// Realized net PnL in currency units.
    pub net_pnl: Decimal,
    /// Fees paid, currency units.
    pub fees: Decimal,
    /// Slippage versus the quoted price, as a fraction.
    pub slippage: f64,
    /// Leverage in effect for the trade.
    pub leverage: f64,
}

/// Per-component outcome produced by the signal subsystem. Read-only input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalOutcomeRecord {
    pub timestamp: DateTime<Utc>,
    pub component_name: String,
    /// Realized return attributed to the component, as a fraction.
    pub return_pct: f64,
}

/// An opportunity the pipeline declined to take, with its counterfactual
/// edge estimate. Feeds the allocation ledger's missed-profit signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedOpportunity {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    /// Estimated value of the opportunity had it been taken.
    pub estimated_value: Decimal,
    /// Modeled fee plus slippage cost for the opportunity.
    pub modeled_cost: Decimal,
}

impl BlockedOpportunity {
    /// Counterfactual edge net of modeled costs.
    pub fn edge(&self) -> Decimal {
        self.estimated_value - self.modeled_cost
    }
}

/// Kind of logged anomaly requiring attention outside the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    StaleMetrics,
    FeeMismatch,
    Drawdown,
    FillQuality,
    Schema,
}

impl fmt::Display for IncidentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IncidentKind::StaleMetrics => write!(f, "stale_metrics"),
            IncidentKind::FeeMismatch => write!(f, "fee_mismatch"),
            IncidentKind::Drawdown => write!(f, "drawdown"),
            IncidentKind::FillQuality => write!(f, "fill_quality"),
            IncidentKind::Schema => write!(f, "schema"),
        }
    }
}

/// Append-only anomaly record. Created by the diagnoser/reconciler,
/// never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: IncidentKind,
    pub details: String,
}

impl Incident {
    pub fn new(kind: IncidentKind, details: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp,
            kind,
            details: details.into(),
        }
    }
}

/// Record of a quarantined signal component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub component_name: String,
    pub quarantined_at: DateTime<Utc>,
    pub reason: QuarantineReason,
    pub z_score: f64,
    pub win_rate: f64,
}

/// Why a component was quarantined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineReason {
    /// CUSUM detected a sustained upward shift in standardized outcomes.
    CusumShiftUp,
    /// CUSUM detected a sustained downward shift.
    CusumShiftDown,
    /// Direct failure: win rate below floor with significant z-score.
    DirectFailure,
}

impl fmt::Display for QuarantineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuarantineReason::CusumShiftUp => write!(f, "cusum_shift_up"),
            QuarantineReason::CusumShiftDown => write!(f, "cusum_shift_down"),
            QuarantineReason::DirectFailure => write!(f, "direct_failure"),
        }
    }
}

/// Classification bucket for a symbol from recent realized trades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cohort {
    Winner,
    BreakEven,
    Loser,
    Mixed,
    InsufficientData,
}

impl fmt::Display for Cohort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cohort::Winner => write!(f, "winner"),
            Cohort::BreakEven => write!(f, "break_even"),
            Cohort::Loser => write!(f, "loser"),
            Cohort::Mixed => write!(f, "mixed"),
            Cohort::InsufficientData => write!(f, "insufficient_data"),
        }
    }
}

/// Annotation attached to an allocation decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationNote {
    /// Symbol had enough positive-edge blocked opportunities to warrant
    /// loosened admission review. Does not force-enable the symbol.
    MissedProfitCandidate,
}

/// Per-symbol allocation decision, recomputed every cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationDecision {
    pub symbol: String,
    pub cohort: Cohort,
    pub size_multiplier: f64,
    pub notes: Vec<AllocationNote>,
}

/// Trailing short-window verdict from realized performance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceVerdict {
    Winning,
    Neutral,
    Losing,
}

/// Per-cycle gate evaluation result. Ephemeral.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateVerdict {
    pub profit_ok: bool,
    pub risk_ok: bool,
    pub verdict: PerformanceVerdict,
    pub expectancy: f64,
    pub avg_pnl_short: f64,
    pub exposure: f64,
    pub max_leverage: f64,
    pub max_drawdown_24h: f64,
}

impl GateVerdict {
    /// Both gates passed.
    pub fn all_ok(&self) -> bool {
        self.profit_ok && self.risk_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn stage_throttle_mapping() {
        assert_eq!(Stage::Frozen.throttle(), 0.0);
        assert_eq!(Stage::StageA.throttle(), 0.25);
        assert_eq!(Stage::StageB.throttle(), 0.50);
        assert_eq!(Stage::StageC.throttle(), 0.75);
        assert_eq!(Stage::Full.throttle(), 1.00);
    }

    #[test]
    fn stage_advances_one_step_and_saturates() {
        assert_eq!(Stage::Frozen.next(), Stage::StageA);
        assert_eq!(Stage::StageC.next(), Stage::Full);
        assert_eq!(Stage::Full.next(), Stage::Full);
    }

    #[test]
    fn stage_serde_wire_names() {
        let json = serde_json::to_string(&Stage::StageB).unwrap();
        assert_eq!(json, "\"stage_b\"");
        let back: Stage = serde_json::from_str("\"frozen\"").unwrap();
        assert_eq!(back, Stage::Frozen);
    }

    #[test]
    fn blocked_opportunity_edge() {
        let opp = BlockedOpportunity {
            timestamp: Utc::now(),
            symbol: "BTC-USD".to_string(),
            estimated_value: dec!(2.50),
            modeled_cost: dec!(0.75),
        };
        assert_eq!(opp.edge(), dec!(1.75));
    }
}
