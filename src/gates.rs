//! Profitability and risk gates.
//!
//! Both gates must pass for the planner to advance a stage; either failing
//! degrades straight to `Frozen`. Gate failures are verdicts, not errors.
//!
//! Exposure here is a trade-count concentration proxy over the trailing
//! 4-hour window (sum of squared per-symbol shares), not a margin or
//! notional calculation. The semantics are preserved from the source
//! system deliberately.

use crate::config::ControllerConfig;
use crate::diagnose::drawdown_24h;
use crate::types::{ExecutionRecord, GateVerdict, PerformanceVerdict};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::info;

/// Trailing window for the exposure concentration proxy.
const EXPOSURE_WINDOW_HOURS: i64 = 4;

/// Number of most recent trades in the short PnL window.
const SHORT_WINDOW_TRADES: usize = 10;

/// Win-rate bounds for the performance verdict.
const WINNING_WIN_RATE: f64 = 0.55;
const LOSING_WIN_RATE: f64 = 0.45;

/// Evaluates the profit and risk gates for one cycle.
pub struct GateEvaluator<'a> {
    config: &'a ControllerConfig,
}

impl<'a> GateEvaluator<'a> {
    pub fn new(config: &'a ControllerConfig) -> Self {
        Self { config }
    }

    /// Evaluate both gates against the trailing 24h of executions.
    pub fn evaluate(&self, records_24h: &[ExecutionRecord], now: DateTime<Utc>) -> GateVerdict {
        let expectancy = expectancy(records_24h);
        let verdict = performance_verdict(records_24h, expectancy);
        let avg_pnl_short = short_window_avg_pnl(records_24h);

        let profit_ok = verdict == PerformanceVerdict::Winning
            && expectancy >= self.config.min_expectancy
            && avg_pnl_short >= 0.0;

        let exposure = exposure_concentration(records_24h, now);
        let max_leverage = records_24h.iter().map(|r| r.leverage).fold(0.0, f64::max);
        let max_drawdown_24h = drawdown_24h(records_24h);

        let limits = &self.config.capital_limits;
        let risk_ok = exposure <= limits.max_exposure
            && max_leverage <= limits.max_leverage
            && max_drawdown_24h <= limits.max_drawdown_24h;

        info!(
            profit_ok,
            risk_ok,
            expectancy,
            avg_pnl_short,
            exposure,
            max_leverage,
            drawdown = max_drawdown_24h,
            "Gates evaluated"
        );

        GateVerdict {
            profit_ok,
            risk_ok,
            verdict,
            expectancy,
            avg_pnl_short,
            exposure,
            max_leverage,
            max_drawdown_24h,
        }
    }
}

/// Expectancy: fraction of profitable trades over the window.
fn expectancy(records: &[ExecutionRecord]) -> f64 {
    if records.is_empty() {
        return 0.0;
    }
    let wins = records
        .iter()
        .filter(|r| r.net_pnl > Decimal::ZERO)
        .count();
    wins as f64 / records.len() as f64
}

/// Performance verdict from window win rate and net PnL. Empty evidence
/// reads as `Losing`: the profit gate fails closed.
fn performance_verdict(records: &[ExecutionRecord], win_rate: f64) -> PerformanceVerdict {
    if records.is_empty() {
        return PerformanceVerdict::Losing;
    }
    let net: Decimal = records.iter().map(|r| r.net_pnl).sum();
    if win_rate >= WINNING_WIN_RATE && net > Decimal::ZERO {
        PerformanceVerdict::Winning
    } else if win_rate <= LOSING_WIN_RATE || net < Decimal::ZERO {
        PerformanceVerdict::Losing
    } else {
        PerformanceVerdict::Neutral
    }
}

/// Mean trade return over the most recent trades.
fn short_window_avg_pnl(records: &[ExecutionRecord]) -> f64 {
    let start = records.len().saturating_sub(SHORT_WINDOW_TRADES);
    let recent = &records[start..];
    if recent.is_empty() {
        return 0.0;
    }
    recent.iter().map(|r| r.pnl_pct).sum::<f64>() / recent.len() as f64
}

/// Sum of squared per-symbol trade-count shares over the trailing 4 hours.
/// Ranges from near 0 (many evenly traded symbols) to 1.0 (all activity in
/// one symbol). No trades in the window reads as fully concentrated.
fn exposure_concentration(records: &[ExecutionRecord], now: DateTime<Utc>) -> f64 {
    let cutoff = now - Duration::hours(EXPOSURE_WINDOW_HOURS);
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    let mut total = 0usize;
    for record in records.iter().filter(|r| r.timestamp >= cutoff) {
        *counts.entry(record.symbol.as_str()).or_default() += 1;
        total += 1;
    }
    if total == 0 {
        return 1.0;
    }
    counts
        .values()
        .map(|&c| {
            let share = c as f64 / total as f64;
            share * share
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use rust_decimal_macros::dec;

    fn trade(
        ts: DateTime<Utc>,
        symbol: &str,
        pnl_pct: f64,
        net_pnl: Decimal,
        leverage: f64,
    ) -> ExecutionRecord {
        ExecutionRecord {
            timestamp: ts,
            symbol: symbol.to_string(),
            side: Side::Buy,
            pnl_pct,
            net_pnl,
            fees: dec!(0.1),
            slippage: 0.0001,
            leverage,
        }
    }

    /// Evenly spread winning evidence across several symbols.
    fn winning_records(now: DateTime<Utc>) -> Vec<ExecutionRecord> {
        let symbols = ["BTC-USD", "ETH-USD", "SOL-USD", "ADA-USD"];
        let mut records = Vec::new();
        for i in 0..40 {
            let symbol = symbols[i % symbols.len()];
            // 60% winners.
            let (pnl_pct, net) = if i % 5 < 3 {
                (0.002, dec!(2))
            } else {
                (-0.001, dec!(-1))
            };
            records.push(trade(
                now - Duration::minutes(i as i64),
                symbol,
                pnl_pct,
                net,
                2.0,
            ));
        }
        records
    }

    #[test]
    fn both_gates_pass_on_healthy_evidence() {
        let config = ControllerConfig::default();
        let now = Utc::now();
        let verdict = GateEvaluator::new(&config).evaluate(&winning_records(now), now);

        assert!(verdict.profit_ok);
        assert!(verdict.risk_ok);
        assert_eq!(verdict.verdict, PerformanceVerdict::Winning);
        assert!(verdict.expectancy >= 0.55);
        // Four evenly traded symbols: concentration 0.25.
        assert!((verdict.exposure - 0.25).abs() < 1e-9);
    }

    #[test]
    fn empty_evidence_fails_closed() {
        let config = ControllerConfig::default();
        let verdict = GateEvaluator::new(&config).evaluate(&[], Utc::now());
        assert!(!verdict.profit_ok);
        assert!(!verdict.risk_ok);
        assert_eq!(verdict.exposure, 1.0);
    }

    #[test]
    fn risk_gate_fails_on_leverage() {
        let config = ControllerConfig::default();
        let now = Utc::now();
        let mut records = winning_records(now);
        records.push(trade(now, "BTC-USD", 0.001, dec!(1), 8.0));

        let verdict = GateEvaluator::new(&config).evaluate(&records, now);
        assert!(!verdict.risk_ok);
        assert_eq!(verdict.max_leverage, 8.0);
    }

    #[test]
    fn risk_gate_fails_on_concentration() {
        let config = ControllerConfig::default();
        let now = Utc::now();
        // All activity in a single symbol.
        let records: Vec<_> = (0..30)
            .map(|i| {
                trade(
                    now - Duration::minutes(i),
                    "BTC-USD",
                    0.002,
                    dec!(2),
                    2.0,
                )
            })
            .collect();

        let verdict = GateEvaluator::new(&config).evaluate(&records, now);
        assert!((verdict.exposure - 1.0).abs() < 1e-9);
        assert!(!verdict.risk_ok);
    }

    #[test]
    fn profit_gate_fails_on_negative_short_window() {
        let config = ControllerConfig::default();
        let now = Utc::now();
        let mut records = winning_records(now);
        // Ten most recent trades all negative: short-window average < 0.
        for i in 0..10 {
            records.push(trade(
                now + Duration::seconds(i),
                "ETH-USD",
                -0.002,
                dec!(2),
                2.0,
            ));
        }

        let verdict = GateEvaluator::new(&config).evaluate(&records, now);
        assert!(verdict.avg_pnl_short < 0.0);
        assert!(!verdict.profit_ok);
    }
}
