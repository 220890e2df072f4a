//! CLI command handlers.
//!
//! This module contains the implementation for each CLI subcommand,
//! delegating to the control-loop driver and the state store.

mod daemon;
mod run_once;
mod status;

pub use daemon::run_daemon;
pub use run_once::run_once;
pub use status::run_status;
