//! Kill-switch cause diagnosis.
//!
//! Inspects health signals (per-feed evidence ages, fee-mismatch
//! accumulator, 24h drawdown, trailing loss cluster, per-symbol fill
//! quality) and produces a causes list from a closed taxonomy. The
//! diagnoser only observes; clearing recoverable causes and recording
//! incidents is the reconciler's job.

use crate::config::ControllerConfig;
use crate::types::{ExecutionRecord, IncidentKind};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// Trailing window for the loss-cluster check.
const LOSS_CLUSTER_MINUTES: i64 = 30;

/// Loss-cluster thresholds.
const LOSS_CLUSTER_WIN_RATE: f64 = 0.40;
const LOSS_CLUSTER_NET_PNL: f64 = -10.0;

/// Fill-quality averages are computed over this many most recent trades.
const FILL_QUALITY_TRADES: usize = 1000;

/// A diagnosed cause for the protective halt.
#[derive(Debug, Clone, PartialEq)]
pub enum Cause {
    /// An evidence feed is older than its configured limit.
    StaleMetrics { feed: String, age_secs: i64 },
    /// Accumulated fee discrepancy crossed the configured limit.
    FeeMismatch { accumulated: Decimal },
    /// 24h drawdown exceeds the configured ceiling.
    HighDrawdown { drawdown: f64 },
    /// Trailing 30-minute performance shows a loss cluster.
    RecentLossCluster { win_rate: f64, net_pnl: f64 },
    /// Symbols whose average fee or slippage is an outlier.
    FillQualityOutliers { symbols: Vec<String> },
    /// Evidence lines that did not match the expected record schema.
    SchemaMismatch { malformed_lines: usize },
}

impl Cause {
    /// Recoverable causes are transient measurement noise the reconciler
    /// clears directly. The rest require upstream correction and must not
    /// be silently cleared.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            Cause::StaleMetrics { .. }
                | Cause::FeeMismatch { .. }
                | Cause::HighDrawdown { .. }
                | Cause::RecentLossCluster { .. }
        )
    }

    /// The incident kind recorded for a chronic (non-recoverable) cause.
    pub fn incident_kind(&self) -> Option<IncidentKind> {
        match self {
            Cause::FillQualityOutliers { .. } => Some(IncidentKind::FillQuality),
            Cause::SchemaMismatch { .. } => Some(IncidentKind::Schema),
            _ => None,
        }
    }

    /// Human-readable detail string for incident records and audit triples.
    pub fn details(&self) -> String {
        match self {
            Cause::StaleMetrics { feed, age_secs } => {
                format!("feed '{feed}' stale for {age_secs}s")
            }
            Cause::FeeMismatch { accumulated } => {
                format!("accumulated fee discrepancy {accumulated}")
            }
            Cause::HighDrawdown { drawdown } => format!("24h drawdown {drawdown:.4}"),
            Cause::RecentLossCluster { win_rate, net_pnl } => {
                format!("30m win rate {win_rate:.2}, net pnl {net_pnl:.2}")
            }
            Cause::FillQualityOutliers { symbols } => {
                format!("fill quality outliers: {}", symbols.join(", "))
            }
            Cause::SchemaMismatch { malformed_lines } => {
                format!("{malformed_lines} malformed evidence lines")
            }
        }
    }
}

/// Health signals assembled by the driver before diagnosis.
#[derive(Debug, Clone, Default)]
pub struct HealthSnapshot {
    /// Age of the newest execution record, `None` when no evidence exists.
    pub execution_age_secs: Option<i64>,
    /// Age of the newest signal outcome record.
    pub signal_age_secs: Option<i64>,
    /// Accumulated fee discrepancy carried in the runtime state.
    pub fee_mismatch_accumulated: Decimal,
    /// Evidence lines skipped as unparseable this cycle.
    pub malformed_lines: usize,
}

/// Produces the causes list for one cycle.
pub struct Diagnoser<'a> {
    config: &'a ControllerConfig,
}

impl<'a> Diagnoser<'a> {
    pub fn new(config: &'a ControllerConfig) -> Self {
        Self { config }
    }

    /// Diagnose against the snapshot and the trailing 24h of executions.
    pub fn diagnose(
        &self,
        snapshot: &HealthSnapshot,
        records_24h: &[ExecutionRecord],
        now: DateTime<Utc>,
    ) -> Vec<Cause> {
        let mut causes = Vec::new();
        let limits = &self.config.feed_age_limits;

        if let Some(age) = snapshot.execution_age_secs {
            if age > limits.executed_trades_secs {
                causes.push(Cause::StaleMetrics {
                    feed: "executed_trades".to_string(),
                    age_secs: age,
                });
            }
        }
        if let Some(age) = snapshot.signal_age_secs {
            if age > limits.strategy_signals_secs {
                causes.push(Cause::StaleMetrics {
                    feed: "strategy_signals".to_string(),
                    age_secs: age,
                });
            }
        }

        let fee_accumulated = snapshot
            .fee_mismatch_accumulated
            .to_f64()
            .unwrap_or(f64::MAX);
        if fee_accumulated >= self.config.fee_mismatch_limit {
            causes.push(Cause::FeeMismatch {
                accumulated: snapshot.fee_mismatch_accumulated,
            });
        }

        let drawdown = drawdown_24h(records_24h);
        if drawdown > self.config.capital_limits.max_drawdown_24h {
            causes.push(Cause::HighDrawdown { drawdown });
        }

        if let Some((win_rate, net_pnl)) = loss_cluster_stats(records_24h, now) {
            if win_rate < LOSS_CLUSTER_WIN_RATE || net_pnl < LOSS_CLUSTER_NET_PNL {
                causes.push(Cause::RecentLossCluster { win_rate, net_pnl });
            }
        }

        let outliers = fill_quality_outliers(
            records_24h,
            self.config.fill_fee_limit,
            self.config.fill_slippage_limit,
        );
        if !outliers.is_empty() {
            causes.push(Cause::FillQualityOutliers { symbols: outliers });
        }

        if snapshot.malformed_lines > 0 {
            causes.push(Cause::SchemaMismatch {
                malformed_lines: snapshot.malformed_lines,
            });
        }

        causes
    }
}

/// Peak-to-trough drawdown of cumulative trade returns over the window,
/// as a positive fraction.
pub fn drawdown_24h(records: &[ExecutionRecord]) -> f64 {
    let mut cumulative = 0.0;
    let mut peak = 0.0f64;
    let mut max_drawdown = 0.0f64;
    for record in records {
        cumulative += record.pnl_pct;
        peak = peak.max(cumulative);
        max_drawdown = max_drawdown.max(peak - cumulative);
    }
    max_drawdown
}

/// Win rate and net PnL over the trailing 30 minutes, `None` when that
/// window holds no trades.
fn loss_cluster_stats(records: &[ExecutionRecord], now: DateTime<Utc>) -> Option<(f64, f64)> {
    let cutoff = now - Duration::minutes(LOSS_CLUSTER_MINUTES);
    let recent: Vec<&ExecutionRecord> = records.iter().filter(|r| r.timestamp >= cutoff).collect();
    if recent.is_empty() {
        return None;
    }
    let wins = recent.iter().filter(|r| r.net_pnl > Decimal::ZERO).count();
    let win_rate = wins as f64 / recent.len() as f64;
    let net_pnl = recent
        .iter()
        .map(|r| r.net_pnl)
        .sum::<Decimal>()
        .to_f64()
        .unwrap_or(0.0);
    Some((win_rate, net_pnl))
}

/// Symbols whose average fee or slippage over the last 1000 trades exceeds
/// the configured limits.
fn fill_quality_outliers(
    records: &[ExecutionRecord],
    fee_limit: f64,
    slippage_limit: f64,
) -> Vec<String> {
    let start = records.len().saturating_sub(FILL_QUALITY_TRADES);
    let mut sums: BTreeMap<&str, (f64, f64, usize)> = BTreeMap::new();
    for record in &records[start..] {
        let entry = sums.entry(record.symbol.as_str()).or_insert((0.0, 0.0, 0));
        entry.0 += record.fees.to_f64().unwrap_or(0.0);
        entry.1 += record.slippage;
        entry.2 += 1;
    }
    sums.into_iter()
        .filter_map(|(symbol, (fees, slippage, n))| {
            let avg_fee = fees / n as f64;
            let avg_slippage = slippage / n as f64;
            if avg_fee > fee_limit || avg_slippage > slippage_limit {
                Some(symbol.to_string())
            } else {
                None
            }
        })
        .collect()
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
        fees: Decimal,
        slippage: f64,
    ) -> ExecutionRecord {
        ExecutionRecord {
            timestamp: ts,
            symbol: symbol.to_string(),
            side: Side::Buy,
            pnl_pct,
            net_pnl,
            fees,
            slippage,
            leverage: 1.0,
        }
    }

    #[test]
    fn drawdown_tracks_peak_to_trough() {
        let now = Utc::now();
        let records: Vec<_> = [0.02, 0.01, -0.03, -0.02, 0.01]
            .iter()
            .map(|p| trade(now, "BTC-USD", *p, dec!(0), dec!(0.1), 0.0001))
            .collect();
        // Peak at +0.03, trough at -0.02: drawdown 0.05.
        let dd = drawdown_24h(&records);
        assert!((dd - 0.05).abs() < 1e-9);
    }

    #[test]
    fn stale_feeds_raise_causes() {
        let config = ControllerConfig::default();
        let diagnoser = Diagnoser::new(&config);
        let now = Utc::now();

        let snapshot = HealthSnapshot {
            execution_age_secs: Some(900),
            signal_age_secs: Some(400),
            ..Default::default()
        };

        let causes = diagnoser.diagnose(&snapshot, &[], now);
        let stale: Vec<_> = causes
            .iter()
            .filter(|c| matches!(c, Cause::StaleMetrics { .. }))
            .collect();
        assert_eq!(stale.len(), 2);
    }

    #[test]
    fn feed_age_limits_apply_per_feed() {
        let config = ControllerConfig::default();
        let diagnoser = Diagnoser::new(&config);

        // 450s is within the executed-trades limit but past the signal one.
        let snapshot = HealthSnapshot {
            execution_age_secs: Some(450),
            signal_age_secs: Some(450),
            ..Default::default()
        };

        let causes = diagnoser.diagnose(&snapshot, &[], Utc::now());
        let stale: Vec<_> = causes
            .iter()
            .filter_map(|c| match c {
                Cause::StaleMetrics { feed, .. } => Some(feed.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(stale, vec!["strategy_signals"]);
    }

    #[test]
    fn fee_mismatch_at_limit() {
        let config = ControllerConfig::default();
        let diagnoser = Diagnoser::new(&config);
        let snapshot = HealthSnapshot {
            fee_mismatch_accumulated: dec!(10),
            ..Default::default()
        };
        let causes = diagnoser.diagnose(&snapshot, &[], Utc::now());
        assert!(causes
            .iter()
            .any(|c| matches!(c, Cause::FeeMismatch { .. })));
    }

    #[test]
    fn loss_cluster_detected_in_recent_window() {
        let config = ControllerConfig::default();
        let diagnoser = Diagnoser::new(&config);
        let now = Utc::now();

        // 10 recent trades, 2 wins: win rate 0.2.
        let mut records = Vec::new();
        for i in 0..10 {
            let net = if i < 2 { dec!(1) } else { dec!(-1) };
            records.push(trade(
                now - Duration::minutes(i),
                "BTC-USD",
                0.0,
                net,
                dec!(0.1),
                0.0001,
            ));
        }

        let causes = diagnoser.diagnose(&HealthSnapshot::default(), &records, now);
        assert!(causes
            .iter()
            .any(|c| matches!(c, Cause::RecentLossCluster { .. })));
    }

    #[test]
    fn fill_quality_outlier_by_fee() {
        let config = ControllerConfig::default();
        let diagnoser = Diagnoser::new(&config);
        let now = Utc::now();

        // Old trades so the loss-cluster check stays quiet.
        let records: Vec<_> = (0..5)
            .map(|_| {
                trade(
                    now - Duration::hours(2),
                    "SHIB-USD",
                    0.0,
                    dec!(1),
                    dec!(2.5),
                    0.0001,
                )
            })
            .collect();

        let causes = diagnoser.diagnose(&HealthSnapshot::default(), &records, now);
        match causes
            .iter()
            .find(|c| matches!(c, Cause::FillQualityOutliers { .. }))
        {
            Some(Cause::FillQualityOutliers { symbols }) => {
                assert_eq!(symbols, &vec!["SHIB-USD".to_string()])
            }
            other => panic!("expected fill quality cause, got {other:?}"),
        }
    }

    #[test]
    fn recoverable_partition() {
        assert!(Cause::StaleMetrics {
            feed: "x".into(),
            age_secs: 999
        }
        .recoverable());
        assert!(!Cause::SchemaMismatch { malformed_lines: 3 }.recoverable());
        assert_eq!(
            Cause::FillQualityOutliers { symbols: vec![] }.incident_kind(),
            Some(IncidentKind::FillQuality)
        );
    }
}
