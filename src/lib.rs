//! Autonomous recovery and staged-restart controller for a trading
//! pipeline.
//!
//! The controller diagnoses protective halts, clears recoverable faults,
//! and re-admits capital in stages gated on realized profitability and
//! risk posture. Signal components whose outcome distribution drifts are
//! quarantined independently of the capital stages.

pub mod allocation;
pub mod commands;
pub mod config;
pub mod diagnose;
pub mod drift;
pub mod driver;
pub mod evidence;
pub mod gates;
pub mod planner;
pub mod reconcile;
pub mod revert;
pub mod state;
pub mod types;
