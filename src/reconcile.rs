//! Fault reconciliation.
//!
//! Clears recoverable faults directly (stale flag reset, fee-mismatch
//! accumulator zeroing) and records incidents for chronic faults that need
//! human or upstream attention. Auto-fixable conditions are transient
//! measurement noise; the rest must not be silently cleared.
//!
//! While the manual override window is active the reconciler is read-only:
//! it reports what it would do but applies no writes.

use crate::diagnose::Cause;
use crate::evidence::{EvidenceError, JsonlAppender, KnowledgeTriple};
use crate::state::RuntimeState;
use crate::types::Incident;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, warn};

/// Errors raised while persisting reconciliation outputs.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to record incident: {0}")]
    Append(#[from] EvidenceError),
}

/// What one reconciliation pass did.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Causes cleared in place this cycle.
    pub cleared: Vec<Cause>,
    /// Incidents recorded for chronic causes.
    pub incidents: Vec<Incident>,
    /// Causes that remain outstanding: self-resolving conditions that decay
    /// with fresh evidence, plus every chronic cause.
    pub outstanding: Vec<Cause>,
    /// True when the manual override suppressed all writes.
    pub override_active: bool,
}

impl ReconcileReport {
    /// Whether the cycle ended with unresolved causes.
    pub fn has_failed_causes(&self) -> bool {
        !self.outstanding.is_empty()
    }
}

/// Clears recoverable faults and records incidents for chronic ones.
pub struct Reconciler<'a> {
    incident_log: &'a JsonlAppender,
    graph_log: &'a JsonlAppender,
}

impl<'a> Reconciler<'a> {
    pub fn new(incident_log: &'a JsonlAppender, graph_log: &'a JsonlAppender) -> Self {
        Self {
            incident_log,
            graph_log,
        }
    }

    /// Reconcile the diagnosed causes against the runtime state.
    pub fn reconcile(
        &self,
        causes: &[Cause],
        state: &mut RuntimeState,
        now: DateTime<Utc>,
    ) -> Result<ReconcileReport, ReconcileError> {
        let mut report = ReconcileReport::default();

        if state.override_active(now) {
            info!("Manual override active, reconciler running read-only");
            report.override_active = true;
            report.outstanding = causes.to_vec();
            return Ok(report);
        }

        let any_stale = causes.iter().any(|c| matches!(c, Cause::StaleMetrics { .. }));

        for cause in causes {
            match cause {
                Cause::StaleMetrics { feed, age_secs } => {
                    // Flag the condition; it clears below once evidence
                    // freshens (no stale cause diagnosed).
                    state.stale_metrics_flag = true;
                    warn!(feed = %feed, age_secs, "Stale metrics diagnosed");
                    report.outstanding.push(cause.clone());
                }
                Cause::FeeMismatch { accumulated } => {
                    info!(
                        accumulated = %accumulated,
                        "Clearing transient fee-mismatch accumulator"
                    );
                    state.fee_mismatch_accumulated = Decimal::ZERO;
                    report.cleared.push(cause.clone());
                }
                Cause::HighDrawdown { .. } | Cause::RecentLossCluster { .. } => {
                    // Self-resolving: no direct fix exists, the gates hold
                    // the system frozen until the evidence window recovers.
                    report.outstanding.push(cause.clone());
                }
                Cause::FillQualityOutliers { .. } | Cause::SchemaMismatch { .. } => {
                    let kind = cause
                        .incident_kind()
                        .unwrap_or(crate::types::IncidentKind::Schema);
                    let incident = Incident::new(kind, cause.details(), now);
                    warn!(kind = %kind, details = %incident.details, "Recording incident");
                    self.incident_log.append(&incident)?;
                    self.graph_log.append(&KnowledgeTriple::new(
                        now,
                        format!("incident:{}", incident.id),
                        "raised_for",
                        cause.details(),
                    ))?;
                    report.incidents.push(incident);
                    report.outstanding.push(cause.clone());
                }
            }
        }

        if !any_stale && state.stale_metrics_flag {
            info!("Evidence fresh again, clearing stale-metrics flag");
            state.stale_metrics_flag = false;
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CapitalLimits;
    use crate::evidence::{EvidenceReader, INCIDENTS_FILE, KNOWLEDGE_GRAPH_FILE};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    struct Fixture {
        _dir: tempfile::TempDir,
        incident_log: JsonlAppender,
        graph_log: JsonlAppender,
        reader: EvidenceReader,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let incident_log = JsonlAppender::new(dir.path(), INCIDENTS_FILE);
        let graph_log = JsonlAppender::new(dir.path(), KNOWLEDGE_GRAPH_FILE);
        let reader = EvidenceReader::new(dir.path());
        Fixture {
            _dir: dir,
            incident_log,
            graph_log,
            reader,
        }
    }

    #[test]
    fn fee_mismatch_cleared() {
        let f = fixture();
        let reconciler = Reconciler::new(&f.incident_log, &f.graph_log);
        let mut state = RuntimeState::initial(CapitalLimits::default());
        state.fee_mismatch_accumulated = dec!(12.50);

        let causes = vec![Cause::FeeMismatch {
            accumulated: dec!(12.50),
        }];
        let report = reconciler
            .reconcile(&causes, &mut state, Utc::now())
            .unwrap();

        assert_eq!(state.fee_mismatch_accumulated, Decimal::ZERO);
        assert_eq!(report.cleared.len(), 1);
        assert!(!report.has_failed_causes());
    }

    #[test]
    fn stale_flag_set_then_cleared_when_fresh() {
        let f = fixture();
        let reconciler = Reconciler::new(&f.incident_log, &f.graph_log);
        let mut state = RuntimeState::initial(CapitalLimits::default());
        let now = Utc::now();

        let causes = vec![Cause::StaleMetrics {
            feed: "executed_trades".to_string(),
            age_secs: 900,
        }];
        let report = reconciler.reconcile(&causes, &mut state, now).unwrap();
        assert!(state.stale_metrics_flag);
        assert!(report.has_failed_causes());

        // Next cycle with fresh evidence: flag clears.
        let report = reconciler.reconcile(&[], &mut state, now).unwrap();
        assert!(!state.stale_metrics_flag);
        assert!(!report.has_failed_causes());
    }

    #[test]
    fn chronic_causes_become_incidents() {
        let f = fixture();
        let reconciler = Reconciler::new(&f.incident_log, &f.graph_log);
        let mut state = RuntimeState::initial(CapitalLimits::default());

        let causes = vec![
            Cause::FillQualityOutliers {
                symbols: vec!["SHIB-USD".to_string()],
            },
            Cause::SchemaMismatch { malformed_lines: 4 },
        ];
        let report = reconciler
            .reconcile(&causes, &mut state, Utc::now())
            .unwrap();

        assert_eq!(report.incidents.len(), 2);
        assert!(report.has_failed_causes());
        assert_eq!(f.reader.incidents(10).len(), 2);
    }

    #[test]
    fn override_suppresses_all_writes() {
        let f = fixture();
        let reconciler = Reconciler::new(&f.incident_log, &f.graph_log);
        let mut state = RuntimeState::initial(CapitalLimits::default());
        let now = Utc::now();
        state.override_disable_until = Some(now + Duration::hours(1));
        state.fee_mismatch_accumulated = dec!(20);

        let causes = vec![
            Cause::FeeMismatch {
                accumulated: dec!(20),
            },
            Cause::SchemaMismatch { malformed_lines: 1 },
        ];
        let report = reconciler.reconcile(&causes, &mut state, now).unwrap();

        assert!(report.override_active);
        assert_eq!(state.fee_mismatch_accumulated, dec!(20));
        assert!(report.incidents.is_empty());
        assert!(f.reader.incidents(10).is_empty());
    }
}
