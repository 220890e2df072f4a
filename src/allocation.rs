//! Symbol allocation ledger.
//!
//! Classifies each traded symbol into a cohort from the trailing window of
//! realized trades, producing the allow-list basis for staged re-admission.
//! The output is recomputed in full every cycle - no incremental merge - so
//! a classification can never drift away from the evidence it claims to
//! summarize.

use crate::types::{
    AllocationDecision, AllocationNote, BlockedOpportunity, Cohort, ExecutionRecord,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;

/// Minimum trades in the window before a symbol can be classified.
const MIN_TRADES: usize = 20;

/// Winner thresholds.
const WINNER_WIN_RATE: f64 = 0.52;

/// Loser thresholds.
const LOSER_WIN_RATE: f64 = 0.35;

/// Blocked opportunities with positive edge before a symbol is tagged for
/// loosened admission review.
const MISSED_PROFIT_MIN_BLOCKED: usize = 10;

/// Overall performance regime of the trailing window, used to scale
/// cohort multipliers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    /// Window net PnL non-negative: size winners up more aggressively.
    Favorable,
    /// Window net PnL negative: tighter multipliers in both directions.
    Defensive,
}

#[derive(Debug, Default)]
struct SymbolTally {
    trades: usize,
    wins: usize,
    net_pnl: Decimal,
}

/// Classifies symbols from recent execution evidence.
pub struct AllocationLedger {
    loser_pnl_floor: Decimal,
    break_even_band: Decimal,
}

impl Default for AllocationLedger {
    fn default() -> Self {
        Self {
            loser_pnl_floor: dec!(-10),
            break_even_band: dec!(5),
        }
    }
}

impl AllocationLedger {
    /// Classify every symbol present in the trailing window.
    ///
    /// Pure function of its inputs: re-running on the same snapshot yields
    /// the same decisions. Symbols with fewer than 20 trades are
    /// `InsufficientData` and keep a neutral multiplier.
    pub fn classify(
        &self,
        records: &[ExecutionRecord],
        blocked: &[BlockedOpportunity],
    ) -> Vec<AllocationDecision> {
        let mut tallies: BTreeMap<&str, SymbolTally> = BTreeMap::new();
        let mut window_pnl = Decimal::ZERO;
        for record in records {
            let tally = tallies.entry(record.symbol.as_str()).or_default();
            tally.trades += 1;
            if record.net_pnl > Decimal::ZERO {
                tally.wins += 1;
            }
            tally.net_pnl += record.net_pnl;
            window_pnl += record.net_pnl;
        }

        let regime = if window_pnl >= Decimal::ZERO {
            Regime::Favorable
        } else {
            Regime::Defensive
        };

        let mut positive_edge_blocked: BTreeMap<&str, usize> = BTreeMap::new();
        for opp in blocked {
            if opp.edge() > Decimal::ZERO {
                *positive_edge_blocked.entry(opp.symbol.as_str()).or_default() += 1;
            }
        }

        tallies
            .into_iter()
            .map(|(symbol, tally)| {
                let (cohort, size_multiplier) = self.cohort_for(&tally, regime);
                let mut notes = Vec::new();
                if positive_edge_blocked.get(symbol).copied().unwrap_or(0)
                    >= MISSED_PROFIT_MIN_BLOCKED
                {
                    notes.push(AllocationNote::MissedProfitCandidate);
                }
                AllocationDecision {
                    symbol: symbol.to_string(),
                    cohort,
                    size_multiplier,
                    notes,
                }
            })
            .collect()
    }

    fn cohort_for(&self, tally: &SymbolTally, regime: Regime) -> (Cohort, f64) {
        if tally.trades < MIN_TRADES {
            return (Cohort::InsufficientData, 1.0);
        }

        let win_rate = tally.wins as f64 / tally.trades as f64;
        let net = tally.net_pnl;

        if win_rate >= WINNER_WIN_RATE && net >= Decimal::ZERO {
            let multiplier = match regime {
                Regime::Favorable => 1.20,
                Regime::Defensive => 1.10,
            };
            (Cohort::Winner, multiplier)
        } else if win_rate <= LOSER_WIN_RATE && net <= self.loser_pnl_floor {
            let multiplier = match regime {
                Regime::Favorable => 0.90,
                Regime::Defensive => 0.80,
            };
            (Cohort::Loser, multiplier)
        } else if net.abs() <= self.break_even_band {
            (Cohort::BreakEven, 0.95)
        } else {
            (Cohort::Mixed, 1.0)
        }
    }
}

/// Symbols in the winner cohort.
pub fn winners(decisions: &[AllocationDecision]) -> Vec<String> {
    decisions
        .iter()
        .filter(|d| d.cohort == Cohort::Winner)
        .map(|d| d.symbol.clone())
        .collect()
}

/// Symbols in the winner or break-even cohorts.
pub fn winners_and_break_even(decisions: &[AllocationDecision]) -> Vec<String> {
    decisions
        .iter()
        .filter(|d| matches!(d.cohort, Cohort::Winner | Cohort::BreakEven))
        .map(|d| d.symbol.clone())
        .collect()
}

/// All classified symbols outside the loser cohort.
pub fn non_losers(decisions: &[AllocationDecision]) -> Vec<String> {
    decisions
        .iter()
        .filter(|d| d.cohort != Cohort::Loser)
        .map(|d| d.symbol.clone())
        .collect()
}

/// Window-wide win rate across all records, `None` when empty.
pub fn window_win_rate(records: &[ExecutionRecord]) -> Option<f64> {
    if records.is_empty() {
        return None;
    }
    let wins = records
        .iter()
        .filter(|r| r.net_pnl > Decimal::ZERO)
        .count();
    Some(wins as f64 / records.len() as f64)
}

/// Window-wide net PnL as f64 for threshold comparisons.
pub fn window_net_pnl(records: &[ExecutionRecord]) -> f64 {
    records
        .iter()
        .map(|r| r.net_pnl)
        .sum::<Decimal>()
        .to_f64()
        .unwrap_or(0.0)
}
