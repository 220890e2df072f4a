//! Post-change profit guard.
//!
//! After a cycle that changed the runtime state or applied new allocation
//! decisions, the guard watches the next short window of executions. If
//! performance degrades it reverts the most recently applied intents to
//! their prior values. The guard carries no state across cycles beyond the
//! last applied intents, bounding the blast radius of any single bad
//! automatic decision.

use crate::types::{AllocationDecision, ExecutionRecord, Stage};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::fmt;
use tracing::warn;

/// Executions observed after a change before the guard can judge it.
const OBSERVATION_TRADES: usize = 10;

/// Degradation thresholds over the observation window.
const DEGRADED_WIN_RATE: f64 = 0.40;
const DEGRADED_NET_PNL: f64 = -10.0;

/// Why a reversal was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReversalReason {
    ProfitGuardDegradation,
}

impl fmt::Display for ReversalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReversalReason::ProfitGuardDegradation => write!(f, "profit_guard_degradation"),
        }
    }
}

/// The state a cycle replaced, retained so it can be restored.
#[derive(Debug, Clone)]
pub struct AppliedIntents {
    pub applied_at: DateTime<Utc>,
    pub prior_stage: Stage,
    pub prior_throttle: f64,
    pub prior_allowed_symbols: BTreeSet<String>,
    pub prior_allocations: Vec<AllocationDecision>,
}

/// A reversal prescription: restore these prior values.
#[derive(Debug, Clone)]
pub struct Reversal {
    pub reason: ReversalReason,
    pub intents: AppliedIntents,
    pub window_win_rate: f64,
    pub window_net_pnl: f64,
}

/// Watches short post-change windows and prescribes reversals.
#[derive(Debug, Default)]
pub struct RevertGuard {
    last_applied: Option<AppliedIntents>,
}

impl RevertGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the intents a cycle just replaced. Overwrites any earlier
    /// record: only the most recent change is guarded.
    pub fn record_applied(&mut self, intents: AppliedIntents) {
        self.last_applied = Some(intents);
    }

    /// Whether a change is currently under observation.
    pub fn watching(&self) -> bool {
        self.last_applied.is_some()
    }

    /// Judge the most recent change against executions that followed it.
    ///
    /// Returns a reversal when the observation window is complete and
    /// degraded. Completing the window cleanly discharges the guard;
    /// an incomplete window leaves it watching.
    pub fn evaluate(&mut self, records: &[ExecutionRecord]) -> Option<Reversal> {
        let intents = self.last_applied.as_ref()?;

        let window: Vec<&ExecutionRecord> = records
            .iter()
            .filter(|r| r.timestamp > intents.applied_at)
            .take(OBSERVATION_TRADES)
            .collect();
        if window.len() < OBSERVATION_TRADES {
            return None;
        }

        let wins = window.iter().filter(|r| r.net_pnl > Decimal::ZERO).count();
        let win_rate = wins as f64 / window.len() as f64;
        let net_pnl = window
            .iter()
            .map(|r| r.net_pnl)
            .sum::<Decimal>()
            .to_f64()
            .unwrap_or(0.0);

        let intents = self.last_applied.take()?;

        if win_rate < DEGRADED_WIN_RATE || net_pnl < DEGRADED_NET_PNL {
            warn!(
                win_rate,
                net_pnl,
                reason = %ReversalReason::ProfitGuardDegradation,
                "Post-change window degraded, reverting last applied intents"
            );
            Some(Reversal {
                reason: ReversalReason::ProfitGuardDegradation,
                intents,
                window_win_rate: win_rate,
                window_net_pnl: net_pnl,
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn trade(ts: DateTime<Utc>, net_pnl: Decimal) -> ExecutionRecord {
        ExecutionRecord {
            timestamp: ts,
            symbol: "BTC-USD".to_string(),
            side: Side::Buy,
            pnl_pct: 0.0,
            net_pnl,
            fees: dec!(0.1),
            slippage: 0.0001,
            leverage: 1.0,
        }
    }

    fn intents(applied_at: DateTime<Utc>) -> AppliedIntents {
        AppliedIntents {
            applied_at,
            prior_stage: Stage::StageA,
            prior_throttle: 0.25,
            prior_allowed_symbols: ["BTC-USD".to_string()].into_iter().collect(),
            prior_allocations: vec![],
        }
    }

    #[test]
    fn degraded_window_triggers_reversal() {
        let mut guard = RevertGuard::new();
        let t0 = Utc::now();
        guard.record_applied(intents(t0));

        // 10 trades: 2 wins, net -50.
        let records: Vec<_> = (0..10)
            .map(|i| {
                let net = if i < 2 { dec!(2) } else { dec!(-6.75) };
                trade(t0 + Duration::minutes(i + 1), net)
            })
            .collect();

        let reversal = guard.evaluate(&records).expect("reversal expected");
        assert_eq!(reversal.reason, ReversalReason::ProfitGuardDegradation);
        assert!(reversal.window_win_rate < 0.40);
        assert!(reversal.window_net_pnl < -10.0);
        assert_eq!(reversal.intents.prior_stage, Stage::StageA);
        assert!(!guard.watching());
    }

    #[test]
    fn healthy_window_discharges_guard() {
        let mut guard = RevertGuard::new();
        let t0 = Utc::now();
        guard.record_applied(intents(t0));

        let records: Vec<_> = (0..10)
            .map(|i| trade(t0 + Duration::minutes(i + 1), dec!(1)))
            .collect();

        assert!(guard.evaluate(&records).is_none());
        assert!(!guard.watching());
    }

    #[test]
    fn incomplete_window_keeps_watching() {
        let mut guard = RevertGuard::new();
        let t0 = Utc::now();
        guard.record_applied(intents(t0));

        let records: Vec<_> = (0..5)
            .map(|i| trade(t0 + Duration::minutes(i + 1), dec!(-5)))
            .collect();

        assert!(guard.evaluate(&records).is_none());
        assert!(guard.watching());
    }

    #[test]
    fn pre_change_trades_are_ignored() {
        let mut guard = RevertGuard::new();
        let t0 = Utc::now();
        guard.record_applied(intents(t0));

        // Losses before the change, wins after: guard must judge only the
        // post-change window.
        let mut records: Vec<_> = (0..10)
            .map(|i| trade(t0 - Duration::minutes(10 - i), dec!(-20)))
            .collect();
        records.extend((0..10).map(|i| trade(t0 + Duration::minutes(i + 1), dec!(1))));

        assert!(guard.evaluate(&records).is_none());
    }
}
