//! Signal-component drift detection and quarantine.
//!
//! Each monitored component gets a CUSUM change detector over its
//! standardized outcome returns plus an independent direct-failure test
//! (trailing 7-day win rate below the floor with a significant z-score).
//! Components that trip either test are quarantined: their weight
//! multiplier drops to 0.1 until a 48-hour cool-down elapses *and* their
//! current statistics pass again.
//!
//! With fewer than the minimum samples in the trailing window a component
//! has "no data": it is never quarantined and never restored, and both
//! tests are no-ops until evidence accumulates.

use crate::config::CusumParams;
use crate::types::{QuarantineReason, QuarantineRecord};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, VecDeque};
use tracing::{info, warn};

/// Minimum trailing-window samples before either test is live.
const MIN_WINDOW_SAMPLES: usize = 10;

/// Trailing window length for the direct-failure test.
const WINDOW_DAYS: i64 = 7;

/// Win-rate floor for the direct-failure test.
const DIRECT_FAILURE_WIN_RATE: f64 = 0.35;

/// |z| significance bound for the direct-failure test.
const DIRECT_FAILURE_Z: f64 = 2.0;

/// Direction of a detected sustained shift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftDirection {
    Up,
    Down,
}

/// Result of feeding one observation to a component monitor.
#[derive(Debug, Clone, Copy)]
pub struct DriftUpdate {
    /// Whether the component is failing its tests after this observation.
    pub quarantined: bool,
    /// Shift direction when the CUSUM tripped, `None` otherwise.
    pub direction: Option<ShiftDirection>,
    /// Standardized deviate of this observation.
    pub z: f64,
}

/// Outcome of a quarantine reconciliation pass.
#[derive(Debug, Default)]
pub struct QuarantineOutcome {
    pub quarantined_now: Vec<QuarantineRecord>,
    pub restored_now: Vec<String>,
}

/// Running mean/deviation via Welford accumulation.
#[derive(Debug, Clone, Default)]
struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    fn std_dev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        (self.m2 / (self.count - 1) as f64).sqrt()
    }

    /// Standardized deviate of `x` against the accumulated distribution.
    /// Zero when the deviation is degenerate (mirrors the z-score guard
    /// used elsewhere in the pipeline).
    fn z(&self, x: f64) -> f64 {
        let std = self.std_dev();
        if std == 0.0 || !std.is_finite() {
            return 0.0;
        }
        let z = (x - self.mean) / std;
        if z.is_finite() {
            z
        } else {
            0.0
        }
    }
}

/// The reason a monitor is currently failing, with its evidence.
#[derive(Debug, Clone, Copy)]
struct FailEvidence {
    reason: QuarantineReason,
    z: f64,
    win_rate: f64,
}

/// Per-component detector state.
#[derive(Debug, Default)]
struct ComponentMonitor {
    stats: RunningStats,
    s_plus: f64,
    s_minus: f64,
    window: VecDeque<(DateTime<Utc>, f64)>,
    failing: Option<FailEvidence>,
}

impl ComponentMonitor {
    fn trim_window(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::days(WINDOW_DAYS);
        while let Some(&(ts, _)) = self.window.front() {
            if ts < cutoff {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn window_win_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let wins = self.window.iter().filter(|(_, r)| *r > 0.0).count();
        wins as f64 / self.window.len() as f64
    }

    /// Binomial z of the window win rate against a fair 50% baseline.
    fn win_rate_z(&self) -> f64 {
        let n = self.window.len();
        if n == 0 {
            return 0.0;
        }
        let se = (0.25 / n as f64).sqrt();
        (self.window_win_rate() - 0.5) / se
    }
}

/// CUSUM-style drift monitor and quarantine manager for signal components.
pub struct DriftQuarantineEngine {
    params: CusumParams,
    cooldown: Duration,
    quarantine_multiplier: f64,
    monitors: BTreeMap<String, ComponentMonitor>,
    quarantine: BTreeMap<String, QuarantineRecord>,
}

impl DriftQuarantineEngine {
    pub fn new(params: CusumParams, cooldown_hours: i64, quarantine_multiplier: f64) -> Self {
        Self {
            params,
            cooldown: Duration::hours(cooldown_hours),
            quarantine_multiplier,
            monitors: BTreeMap::new(),
            quarantine: BTreeMap::new(),
        }
    }

    /// Resume with the quarantine list persisted in the runtime state.
    pub fn with_quarantine(mut self, existing: BTreeMap<String, QuarantineRecord>) -> Self {
        self.quarantine = existing;
        self
    }

    /// Adopt hot-reloaded detector parameters. Does not reset accumulated
    /// sums: the new threshold applies from the next observation.
    pub fn set_params(&mut self, params: CusumParams) {
        self.params = params;
    }

    /// Currently quarantined components.
    pub fn quarantine(&self) -> &BTreeMap<String, QuarantineRecord> {
        &self.quarantine
    }

    /// Feed one outcome observation for a component.
    ///
    /// Updates the running statistics, the trailing window, and both
    /// cumulative sums; returns whether the component is failing and in
    /// which direction. Below the minimum window size this only
    /// accumulates evidence and reports a clean result.
    pub fn update(
        &mut self,
        component: &str,
        observation: f64,
        now: DateTime<Utc>,
    ) -> DriftUpdate {
        let monitor = self.monitors.entry(component.to_string()).or_default();

        let z = monitor.stats.z(observation);
        monitor.stats.push(observation);
        monitor.window.push_back((now, observation));
        monitor.trim_window(now);

        monitor.s_plus = (monitor.s_plus + z - self.params.k).max(0.0);
        monitor.s_minus = (monitor.s_minus - z - self.params.k).max(0.0);

        if monitor.window.len() < MIN_WINDOW_SAMPLES {
            monitor.failing = None;
            return DriftUpdate {
                quarantined: false,
                direction: None,
                z,
            };
        }

        let win_rate = monitor.window_win_rate();
        let wr_z = monitor.win_rate_z();

        let (quarantined, direction, evidence) = if monitor.s_plus > self.params.h {
            (
                true,
                Some(ShiftDirection::Up),
                Some(FailEvidence {
                    reason: QuarantineReason::CusumShiftUp,
                    z,
                    win_rate,
                }),
            )
        } else if monitor.s_minus > self.params.h {
            (
                true,
                Some(ShiftDirection::Down),
                Some(FailEvidence {
                    reason: QuarantineReason::CusumShiftDown,
                    z,
                    win_rate,
                }),
            )
        } else if win_rate < DIRECT_FAILURE_WIN_RATE && wr_z.abs() > DIRECT_FAILURE_Z {
            (
                true,
                None,
                Some(FailEvidence {
                    reason: QuarantineReason::DirectFailure,
                    z: wr_z,
                    win_rate,
                }),
            )
        } else {
            (false, None, None)
        };

        monitor.failing = evidence;
        DriftUpdate {
            quarantined,
            direction,
            z,
        }
    }

    /// Reconcile the quarantine list against current monitor state.
    ///
    /// Newly failing components are quarantined; components whose
    /// cool-down has elapsed *and* whose statistics pass are restored.
    /// Components without sufficient window evidence are left untouched
    /// in both directions.
    pub fn reconcile(&mut self, now: DateTime<Utc>) -> QuarantineOutcome {
        let mut outcome = QuarantineOutcome::default();

        for (name, monitor) in &mut self.monitors {
            let has_evidence = monitor.window.len() >= MIN_WINDOW_SAMPLES;

            match (self.quarantine.contains_key(name), &monitor.failing) {
                (false, Some(evidence)) if has_evidence => {
                    let record = QuarantineRecord {
                        component_name: name.clone(),
                        quarantined_at: now,
                        reason: evidence.reason,
                        z_score: evidence.z,
                        win_rate: evidence.win_rate,
                    };
                    warn!(
                        component = %name,
                        reason = %evidence.reason,
                        z = evidence.z,
                        win_rate = evidence.win_rate,
                        "Component quarantined"
                    );
                    self.quarantine.insert(name.clone(), record.clone());
                    outcome.quarantined_now.push(record);
                    // Restart the detector: post-quarantine evidence is
                    // judged fresh, not against the tripped distribution.
                    *monitor = ComponentMonitor::default();
                }
                (true, failing) if has_evidence => {
                    let record = &self.quarantine[name];
                    let cooled_down = now >= record.quarantined_at + self.cooldown;
                    if cooled_down && failing.is_none() {
                        info!(component = %name, "Component restored from quarantine");
                        self.quarantine.remove(name);
                        outcome.restored_now.push(name.clone());
                    }
                }
                _ => {}
            }
        }

        outcome
    }

    /// Weight multipliers for the signal-weighting subsystem: quarantined
    /// components are dampened, all other known components pass through.
    pub fn multipliers(&self) -> BTreeMap<String, f64> {
        let mut map = BTreeMap::new();
        for name in self.monitors.keys() {
            map.insert(name.clone(), 1.0);
        }
        for name in self.quarantine.keys() {
            map.insert(name.clone(), self.quarantine_multiplier);
        }
        map
    }
}
