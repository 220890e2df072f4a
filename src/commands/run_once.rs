//! Run-once command handler.
//!
//! Executes a single recovery cycle and exits with a code fit for cron or
//! systemd timers: zero when the cycle completed with nothing outstanding,
//! one otherwise.

use crate::config::ControllerConfig;
use crate::driver::{ControlLoopDriver, DriverError};
use chrono::Utc;
use std::path::PathBuf;
use tracing::{error, info};

/// Run exactly one control cycle.
///
/// Returns the process exit code: 0 for a clean cycle, 1 when causes remain
/// outstanding, a reversal fired, or the cycle itself failed.
///
/// # Errors
/// Returns `DriverError` only for fatal startup problems (bad config,
/// corrupt state document). In-cycle failures map to exit code 1.
pub fn run_once(
    config: ControllerConfig,
    config_path: Option<PathBuf>,
) -> Result<i32, DriverError> {
    let mut driver = ControlLoopDriver::new(config, config_path)?;

    match driver.run_cycle(Utc::now()) {
        Ok(report) => {
            info!(
                stage = %report.stage,
                throttle = report.throttle,
                outstanding = report.failed_causes,
                incidents = report.incidents,
                reverted = report.reverted,
                "Cycle complete"
            );
            Ok(if report.clean() { 0 } else { 1 })
        }
        Err(e) => {
            error!(error = %e, "Cycle failed");
            Ok(1)
        }
    }
}
