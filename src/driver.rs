//! Control-loop driver.
//!
//! Owns the periodic tick and the strict stage ordering within a cycle:
//! evidence capture → drift update → revert check → diagnose → reconcile →
//! gates → plan → apply. All runtime-state mutation funnels through this
//! driver; no other component writes the state document.
//!
//! Component failures inside a cycle are caught and logged as cycle
//! errors; the daemon continues to the next tick. Repeated consecutive
//! cycle errors freeze the system as a fail-safe.

use crate::allocation::AllocationLedger;
use crate::config::{ConfigError, ControllerConfig};
use crate::diagnose::{Diagnoser, HealthSnapshot};
use crate::drift::DriftQuarantineEngine;
use crate::evidence::{
    DecisionLogEntry, EvidenceError, EvidenceReader, JsonlAppender, KnowledgeTriple,
    INCIDENTS_FILE, KNOWLEDGE_GRAPH_FILE, LEARNING_UPDATES_FILE,
};
use crate::gates::GateEvaluator;
use crate::planner::StagedRestartPlanner;
use crate::reconcile::{ReconcileError, Reconciler};
use crate::revert::{AppliedIntents, RevertGuard};
use crate::state::{RuntimeState, RuntimeStateStore, StateError};
use crate::types::{AllocationDecision, ExecutionRecord, GateVerdict, Stage};
use chrono::{DateTime, Duration, Utc};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{error, info, warn};

/// Trailing evidence window for diagnosis, gates, and allocation.
const EVIDENCE_WINDOW_HOURS: i64 = 24;

/// Trailing window for signal-outcome ingestion on a cold start.
const SIGNAL_BACKFILL_DAYS: i64 = 7;

/// Fatal startup errors. The driver refuses to run on any of these.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("failed to create data directory '{path}': {source}")]
    DataDir {
        path: String,
        source: std::io::Error,
    },
}

/// Errors contained within a single cycle.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Evidence(#[from] EvidenceError),
}

/// Summary of one completed cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub stage: Stage,
    pub throttle: f64,
    pub gate_verdict: GateVerdict,
    /// Causes left outstanding after reconciliation.
    pub failed_causes: usize,
    /// Incidents recorded this cycle.
    pub incidents: usize,
    /// Whether the revert guard rolled back the previous change.
    pub reverted: bool,
    /// Whether the manual override suppressed all writes.
    pub override_active: bool,
}

impl CycleReport {
    /// Whether the cycle ended clean: nothing outstanding, nothing reverted.
    pub fn clean(&self) -> bool {
        self.failed_causes == 0 && !self.reverted
    }
}

/// Ties the recovery components into a periodic tick.
pub struct ControlLoopDriver {
    config: ControllerConfig,
    config_path: Option<PathBuf>,
    store: RuntimeStateStore,
    reader: EvidenceReader,
    decision_log: JsonlAppender,
    graph_log: JsonlAppender,
    incident_log: JsonlAppender,
    drift: DriftQuarantineEngine,
    ledger: AllocationLedger,
    guard: RevertGuard,
    last_signal_ingested: Option<DateTime<Utc>>,
    last_allocations: Vec<AllocationDecision>,
    consecutive_cycle_errors: u32,
}

impl ControlLoopDriver {
    /// Build the driver, initializing the data directory and state
    /// document. Fatal configuration or state errors are returned rather
    /// than deferred: the controller must not run on undefined state.
    pub fn new(
        config: ControllerConfig,
        config_path: Option<PathBuf>,
    ) -> Result<Self, DriverError> {
        let data_dir = PathBuf::from(&config.data_dir);
        std::fs::create_dir_all(&data_dir).map_err(|source| DriverError::DataDir {
            path: data_dir.display().to_string(),
            source,
        })?;

        let store = RuntimeStateStore::new(data_dir.join("runtime_state.json"));
        let state = store.load_or_init(config.capital_limits.clone())?;

        let drift = DriftQuarantineEngine::new(
            config.cusum.clone(),
            config.quarantine_cooldown_hours,
            config.quarantine_multiplier,
        )
        .with_quarantine(state.quarantine.clone());

        Ok(Self {
            reader: EvidenceReader::new(&data_dir),
            decision_log: JsonlAppender::new(&data_dir, LEARNING_UPDATES_FILE),
            graph_log: JsonlAppender::new(&data_dir, KNOWLEDGE_GRAPH_FILE),
            incident_log: JsonlAppender::new(&data_dir, INCIDENTS_FILE),
            drift,
            ledger: AllocationLedger::default(),
            guard: RevertGuard::new(),
            last_signal_ingested: None,
            last_allocations: Vec::new(),
            consecutive_cycle_errors: 0,
            config,
            config_path,
            store,
        })
    }

    /// The current persisted state, for `status` reporting.
    pub fn current_state(&self) -> Result<RuntimeState, StateError> {
        self.store.load()
    }

    /// Short-period health probe: true when any evidence feed has gone
    /// stale, which triggers an immediate full cycle.
    pub fn health_degraded(&self, now: DateTime<Utc>) -> bool {
        let limits = &self.config.feed_age_limits;
        let stale = |latest: Option<DateTime<Utc>>, max_age: i64| {
            latest
                .map(|ts| (now - ts).num_seconds() > max_age)
                .unwrap_or(false)
        };
        stale(self.reader.latest_execution_at(), limits.executed_trades_secs)
            || stale(self.reader.latest_signal_at(), limits.strategy_signals_secs)
    }

    /// Run one full diagnose → reconcile → gate → plan → apply cycle.
    ///
    /// The five stages execute strictly sequentially; evidence is captured
    /// once at the top and each stage observes its predecessor's effects.
    pub fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<CycleReport, CycleError> {
        let mut state = self.store.load()?;
        let pre_cycle = state.clone();
        let override_active = state.override_active(now);

        // Evidence capture.
        let window_start = now - Duration::hours(EVIDENCE_WINDOW_HOURS);
        let exec_batch = self.reader.executions(Some(window_start));
        let mut executions = exec_batch.records;
        executions.sort_by_key(|r| r.timestamp);

        // Exclusive cursor past the last ingested outcome, so records
        // sharing one timestamp are all ingested exactly once.
        let signal_since = self
            .last_signal_ingested
            .map(|ts| ts + Duration::microseconds(1))
            .unwrap_or(now - Duration::days(SIGNAL_BACKFILL_DAYS));
        let signal_batch = self.reader.signal_outcomes(Some(signal_since));
        let blocked_batch = self.reader.blocked_opportunities(Some(window_start));
        let malformed_lines =
            exec_batch.malformed_lines + signal_batch.malformed_lines + blocked_batch.malformed_lines;

        // Drift monitor update.
        let mut signals = signal_batch.records;
        signals.sort_by_key(|r| r.timestamp);
        for signal in &signals {
            self.drift
                .update(&signal.component_name, signal.return_pct, signal.timestamp);
            self.last_signal_ingested = Some(signal.timestamp);
        }
        let quarantine_outcome = if override_active {
            Default::default()
        } else {
            self.drift.reconcile(now)
        };

        // Revert guard: judge the previous cycle's change before planning
        // a new one.
        let reverted = self.apply_pending_revert(&mut state, &executions, now)?;

        // Allocation ledger.
        let allocations = self.ledger.classify(&executions, &blocked_batch.records);

        // Diagnose.
        let snapshot = self.health_snapshot(&state, now, malformed_lines);
        let causes = Diagnoser::new(&self.config).diagnose(&snapshot, &executions, now);

        // Reconcile.
        let reconciler = Reconciler::new(&self.incident_log, &self.graph_log);
        let report = reconciler.reconcile(&causes, &mut state, now)?;

        // Gates.
        let verdict = GateEvaluator::new(&self.config).evaluate(&executions, now);

        // Plan and apply.
        let mut plan_applied = false;
        if !reverted {
            let plan = StagedRestartPlanner.plan(
                state.mode,
                state.clean_passes,
                &verdict,
                &allocations,
                override_active,
            );
            if let Some(plan) = plan {
                let transition = plan.stage != state.mode
                    || plan.allowed_symbols != state.allowed_symbols;
                if transition {
                    self.guard.record_applied(AppliedIntents {
                        applied_at: now,
                        prior_stage: state.mode,
                        prior_throttle: state.throttle,
                        prior_allowed_symbols: state.allowed_symbols.clone(),
                        prior_allocations: self.last_allocations.clone(),
                    });
                    self.graph_log.append(&KnowledgeTriple::new(
                        now,
                        format!("stage:{}", state.mode),
                        "transitioned_to",
                        format!("stage:{}", plan.stage),
                    ))?;
                }

                let from = state.mode;
                state.mode = plan.stage;
                state.throttle = plan.throttle;
                state.allowed_symbols = plan.allowed_symbols;
                state.clean_passes = plan.clean_passes;
                state.protective_mode = plan.stage == Stage::Frozen;
                plan_applied = true;

                if from != state.mode {
                    info!(from = %from, to = %state.mode, throttle = state.throttle, "Stage applied");
                }
            }
        }

        // Persist outside the plan branch: a reverted cycle still carries
        // quarantine changes and reconciler effects that must reach the
        // document. Only the override window and an unchanged state skip
        // the write.
        if !override_active {
            state.quarantine = self.drift.quarantine().clone();
            if state != pre_cycle {
                state.last_recovery_timestamp = Some(now);
                self.store.save(&mut state)?;

                if plan_applied {
                    self.decision_log.append(&DecisionLogEntry {
                        timestamp: now,
                        stage: state.mode,
                        throttle: state.throttle,
                        allowed_symbols: state.allowed_symbols.iter().cloned().collect(),
                        gate_verdict: verdict.clone(),
                        allocations: allocations.clone(),
                        quarantined_now: quarantine_outcome
                            .quarantined_now
                            .iter()
                            .map(|q| q.component_name.clone())
                            .collect(),
                        restored_now: quarantine_outcome.restored_now.clone(),
                    })?;
                }
            }
        }

        self.last_allocations = allocations;

        Ok(CycleReport {
            stage: state.mode,
            throttle: state.throttle,
            gate_verdict: verdict,
            failed_causes: report.outstanding.len(),
            incidents: report.incidents.len(),
            reverted,
            override_active,
        })
    }

    /// Run a cycle, containing any failure as a `cycle_error`. Consecutive
    /// failures beyond the configured budget freeze the system.
    pub fn run_cycle_guarded(&mut self, now: DateTime<Utc>) -> Option<CycleReport> {
        match self.run_cycle(now) {
            Ok(report) => {
                self.consecutive_cycle_errors = 0;
                Some(report)
            }
            Err(e) => {
                self.consecutive_cycle_errors += 1;
                error!(
                    error = %e,
                    consecutive = self.consecutive_cycle_errors,
                    "cycle_error: cycle failed, continuing to next tick"
                );
                if self.consecutive_cycle_errors >= self.config.max_consecutive_cycle_errors {
                    self.freeze_fail_safe(now);
                }
                None
            }
        }
    }

    /// Continuous daemon loop: health probe on a short period, full cycle
    /// on the long period or immediately on a degraded probe. Shutdown is
    /// checked only between cycles, never mid-cycle.
    pub async fn run_daemon(&mut self, cycle_interval_secs: u64) {
        let mut cycle_timer =
            tokio::time::interval(std::time::Duration::from_secs(cycle_interval_secs.max(1)));
        let mut health_timer = tokio::time::interval(std::time::Duration::from_secs(
            self.config.health_interval_secs.max(1),
        ));
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        info!(
            cycle_interval_secs,
            health_interval_secs = self.config.health_interval_secs,
            "Control loop daemon started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received, stopping after completed cycle");
                    break;
                }
                _ = cycle_timer.tick() => {
                    self.reload_thresholds();
                    self.run_cycle_guarded(Utc::now());
                }
                _ = health_timer.tick() => {
                    let now = Utc::now();
                    if self.health_degraded(now) {
                        warn!("Health probe degraded, triggering immediate cycle");
                        self.run_cycle_guarded(now);
                    }
                }
            }
        }

        info!("Control loop daemon stopped");
    }

    fn apply_pending_revert(
        &mut self,
        state: &mut RuntimeState,
        executions: &[ExecutionRecord],
        now: DateTime<Utc>,
    ) -> Result<bool, CycleError> {
        let Some(reversal) = self.guard.evaluate(executions) else {
            return Ok(false);
        };

        if state.override_active(now) {
            // Override suppresses all writes; the moment has passed, so
            // the intents are simply dropped.
            return Ok(false);
        }

        warn!(
            win_rate = reversal.window_win_rate,
            net_pnl = reversal.window_net_pnl,
            restoring_stage = %reversal.intents.prior_stage,
            "Reverting last applied intents"
        );
        state.mode = reversal.intents.prior_stage;
        state.throttle = reversal.intents.prior_throttle;
        state.allowed_symbols = reversal.intents.prior_allowed_symbols.clone();
        state.protective_mode = state.mode == Stage::Frozen;
        self.last_allocations = reversal.intents.prior_allocations.clone();

        self.graph_log.append(&KnowledgeTriple::new(
            now,
            format!("stage:{}", state.mode),
            "reverted_for",
            reversal.reason.to_string(),
        ))?;

        Ok(true)
    }

    fn health_snapshot(
        &self,
        state: &RuntimeState,
        now: DateTime<Utc>,
        malformed_lines: usize,
    ) -> HealthSnapshot {
        let age = |latest: Option<DateTime<Utc>>| latest.map(|ts| (now - ts).num_seconds());
        HealthSnapshot {
            execution_age_secs: age(self.reader.latest_execution_at()),
            signal_age_secs: age(self.reader.latest_signal_at()),
            fee_mismatch_accumulated: state.fee_mismatch_accumulated,
            malformed_lines,
        }
    }

    /// Best-effort freeze after repeated cycle errors.
    fn freeze_fail_safe(&mut self, now: DateTime<Utc>) {
        error!("Consecutive cycle error budget exhausted, freezing as fail-safe");
        match self.store.load() {
            Ok(mut state) => {
                state.mode = Stage::Frozen;
                state.throttle = Stage::Frozen.throttle();
                state.allowed_symbols.clear();
                state.protective_mode = true;
                state.clean_passes = 0;
                state.last_recovery_timestamp = Some(now);
                if let Err(e) = self.store.save(&mut state) {
                    error!(error = %e, "Failed to persist fail-safe freeze");
                }
            }
            Err(e) => error!(error = %e, "Failed to load state for fail-safe freeze"),
        }
    }

    fn reload_thresholds(&mut self) {
        let Some(path) = self.config_path.clone() else {
            return;
        };
        match self.config.reload_thresholds(&path) {
            Ok(()) => self.drift.set_params(self.config.cusum.clone()),
            Err(e) => warn!(error = %e, "Threshold hot-reload failed, keeping current values"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{JsonlAppender, EXECUTED_TRADES_FILE};
    use crate::types::Side;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn driver_in(dir: &std::path::Path) -> ControlLoopDriver {
        let config = ControllerConfig {
            data_dir: dir.display().to_string(),
            ..ControllerConfig::default()
        };
        ControlLoopDriver::new(config, None).unwrap()
    }

    fn write_trades(dir: &std::path::Path, now: DateTime<Utc>, wins: usize, losses: usize) {
        let appender = JsonlAppender::new(dir, EXECUTED_TRADES_FILE);
        // Three symbols against a loss period of four keeps losses rotating
        // evenly across symbols instead of piling onto one.
        let symbols = ["BTC-USD", "ETH-USD", "SOL-USD"];
        let total = wins + losses;
        // Losses evenly interleaved so no trailing loss cluster forms.
        let period = (total / losses.max(1)).max(1);
        for i in 0..total {
            let winning = i % period != period - 1;
            let record = ExecutionRecord {
                timestamp: now - Duration::minutes((total - i) as i64),
                symbol: symbols[i % symbols.len()].to_string(),
                side: Side::Buy,
                pnl_pct: if winning { 0.002 } else { -0.001 },
                net_pnl: if winning { dec!(2) } else { dec!(-1) },
                fees: dec!(0.1),
                slippage: 0.0001,
                leverage: 2.0,
            };
            appender.append(&record).unwrap();
        }
    }

    #[test]
    fn empty_evidence_keeps_frozen() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = driver_in(dir.path());

        let report = driver.run_cycle(Utc::now()).unwrap();
        assert_eq!(report.stage, Stage::Frozen);
        assert_eq!(report.throttle, 0.0);
        assert!(!report.gate_verdict.all_ok());
    }

    #[test]
    fn healthy_evidence_advances_to_stage_a() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        write_trades(dir.path(), now, 90, 30);

        let mut driver = driver_in(dir.path());
        let report = driver.run_cycle(now).unwrap();
        assert_eq!(report.stage, Stage::StageA);
        assert_eq!(report.throttle, 0.25);

        let state = driver.current_state().unwrap();
        assert!(!state.allowed_symbols.is_empty());
        assert!(!state.protective_mode);
    }

    #[test]
    fn run_cycle_is_idempotent_on_unchanged_evidence() {
        // Failing fixed point: no evidence keeps the gates shut and the
        // document byte-identical across repeated cycles.
        let dir = tempfile::tempdir().unwrap();
        let mut driver = driver_in(dir.path());
        driver.run_cycle(Utc::now()).unwrap();
        let first = driver.current_state().unwrap();
        driver.run_cycle(Utc::now()).unwrap();
        assert_eq!(driver.current_state().unwrap(), first);

        // Passing fixed point: once at full admission, further clean
        // cycles change nothing.
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        write_trades(dir.path(), now, 90, 30);
        let mut driver = driver_in(dir.path());
        for _ in 0..5 {
            driver.run_cycle(now).unwrap();
        }
        let settled = driver.current_state().unwrap();
        assert_eq!(settled.mode, Stage::Full);
        driver.run_cycle(now).unwrap();
        assert_eq!(driver.current_state().unwrap(), settled);
    }

    #[test]
    fn override_blocks_all_writes() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        write_trades(dir.path(), now, 90, 30);

        let mut driver = driver_in(dir.path());
        let mut state = driver.current_state().unwrap();
        state.override_disable_until = Some(now + Duration::hours(1));
        driver.store.save(&mut state).unwrap();
        let version_before = driver.current_state().unwrap().version;

        let report = driver.run_cycle(now).unwrap();
        assert!(report.override_active);
        assert_eq!(report.stage, Stage::Frozen);

        let after = driver.current_state().unwrap();
        assert_eq!(after.version, version_before);
        assert_eq!(after.mode, Stage::Frozen);
    }

    #[test]
    fn cycle_error_budget_freezes() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = driver_in(dir.path());

        // Advance out of frozen first.
        let now = Utc::now();
        write_trades(dir.path(), now, 90, 30);
        driver.run_cycle(now).unwrap();
        assert_eq!(driver.current_state().unwrap().mode, Stage::StageA);

        // Corrupt the state document so every cycle fails.
        std::fs::write(driver.store.path(), "{broken").unwrap();
        for _ in 0..driver.config.max_consecutive_cycle_errors {
            assert!(driver.run_cycle_guarded(Utc::now()).is_none());
        }
        // The fail-safe could not save either (document still corrupt),
        // but the attempt must not panic. Restore and verify a clean run
        // resets the error counter.
        let _ = std::fs::remove_file(driver.store.path());
        driver
            .store
            .load_or_init(driver.config.capital_limits.clone())
            .unwrap();
        assert!(driver.run_cycle_guarded(Utc::now()).is_some());
        assert_eq!(driver.consecutive_cycle_errors, 0);
    }
}
