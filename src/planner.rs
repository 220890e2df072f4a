//! Staged-restart planner.
//!
//! A Moore machine over `Frozen → StageA → StageB → StageC → Full`. Output
//! depends only on the current stage and this cycle's inputs; the single
//! piece of history is the count of consecutive clean passes at `StageC`
//! required before full re-admission.
//!
//! Any gate failure targets `Frozen` in one step, from any stage. There is
//! no gradual de-escalation: the failure path stays simple and auditable.

use crate::allocation::{non_losers, winners, winners_and_break_even};
use crate::types::{AllocationDecision, GateVerdict, Stage};
use std::collections::BTreeSet;
use tracing::info;

/// Consecutive clean passes required at `StageC` before advancing to `Full`.
const CLEAN_PASSES_FOR_FULL: u32 = 2;

/// The planner's prescription for the next cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPlan {
    pub stage: Stage,
    pub throttle: f64,
    pub allowed_symbols: BTreeSet<String>,
    /// Updated clean-pass counter to persist.
    pub clean_passes: u32,
}

/// Computes the next stage, throttle, and allow-list.
pub struct StagedRestartPlanner;

impl StagedRestartPlanner {
    /// Plan the next stage.
    ///
    /// Returns `None` while the manual override is active: the planner
    /// performs no state changes at all for the override's duration.
    pub fn plan(
        &self,
        current: Stage,
        clean_passes: u32,
        verdict: &GateVerdict,
        decisions: &[AllocationDecision],
        override_active: bool,
    ) -> Option<RestartPlan> {
        if override_active {
            info!("Manual override active, planner suppressed");
            return None;
        }

        if !verdict.all_ok() {
            // Hard reset from any stage. One step, no intermediate stages.
            return Some(RestartPlan {
                stage: Stage::Frozen,
                throttle: Stage::Frozen.throttle(),
                allowed_symbols: BTreeSet::new(),
                clean_passes: 0,
            });
        }

        let (stage, clean_passes) = match current {
            Stage::StageC => {
                let passes = clean_passes + 1;
                if passes >= CLEAN_PASSES_FOR_FULL {
                    (Stage::Full, passes)
                } else {
                    (Stage::StageC, passes)
                }
            }
            Stage::Full => (Stage::Full, clean_passes),
            // Arrival at StageC starts the clean-pass count fresh: the
            // qualifying passes must happen while already at StageC.
            Stage::StageB => (Stage::StageC, 0),
            other => (other.next(), 0),
        };

        let allowed_symbols: BTreeSet<String> = match stage {
            Stage::Frozen => BTreeSet::new(),
            Stage::StageA | Stage::StageB => winners(decisions).into_iter().collect(),
            Stage::StageC => winners_and_break_even(decisions).into_iter().collect(),
            Stage::Full => non_losers(decisions).into_iter().collect(),
        };

        info!(
            from = %current,
            to = %stage,
            allowed = allowed_symbols.len(),
            clean_passes,
            "Restart plan computed"
        );

        Some(RestartPlan {
            stage,
            throttle: stage.throttle(),
            allowed_symbols,
            clean_passes,
        })
    }
}
