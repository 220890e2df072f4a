//! Daemon command handler.
//!
//! Runs the control loop continuously until a shutdown signal arrives.

use crate::config::ControllerConfig;
use crate::driver::{ControlLoopDriver, DriverError};
use std::path::PathBuf;

/// Run the control loop as a long-lived daemon.
///
/// `interval_override` replaces the configured cycle interval when given
/// (mostly useful for shortened soak tests).
///
/// # Errors
/// Returns `DriverError` for fatal startup problems; once the loop is
/// running, in-cycle failures are contained and logged.
pub async fn run_daemon(
    config: ControllerConfig,
    config_path: Option<PathBuf>,
    interval_override: Option<u64>,
) -> Result<(), DriverError> {
    let cycle_interval = interval_override.unwrap_or(config.cycle_interval_secs);
    let mut driver = ControlLoopDriver::new(config, config_path)?;
    driver.run_daemon(cycle_interval).await;
    Ok(())
}
