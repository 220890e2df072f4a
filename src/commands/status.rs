//! Status command handler.
//!
//! Prints the persisted runtime state and recent incidents without running
//! a cycle or taking any writes.

use crate::config::ControllerConfig;
use crate::evidence::EvidenceReader;
use crate::state::{RuntimeStateStore, StateError};
use std::path::PathBuf;

/// Incidents shown in the status report.
const INCIDENT_TAIL: usize = 10;

/// Print the current runtime state and recent incidents.
///
/// # Errors
/// Returns `StateError` when the state document is missing or corrupt; a
/// controller that has never run has no status to report.
pub fn run_status(config: &ControllerConfig) -> Result<(), StateError> {
    let data_dir = PathBuf::from(&config.data_dir);
    let store = RuntimeStateStore::new(data_dir.join("runtime_state.json"));
    let state = store.load()?;

    println!("stage:            {}", state.mode);
    println!("throttle:         {:.2}", state.throttle);
    println!("protective mode:  {}", state.protective_mode);
    println!("state version:    {}", state.version);
    match state.last_recovery_timestamp {
        Some(ts) => println!("last recovery:    {}", ts.to_rfc3339()),
        None => println!("last recovery:    never"),
    }
    if let Some(until) = state.override_disable_until {
        println!("manual override:  active until {}", until.to_rfc3339());
    }
    println!("clean passes:     {}", state.clean_passes);
    println!("stale metrics:    {}", state.stale_metrics_flag);
    println!("fee mismatch acc: {}", state.fee_mismatch_accumulated);

    if state.allowed_symbols.is_empty() {
        println!("allowed symbols:  (none)");
    } else {
        let symbols: Vec<&str> = state.allowed_symbols.iter().map(String::as_str).collect();
        println!("allowed symbols:  {}", symbols.join(", "));
    }

    if state.quarantine.is_empty() {
        println!("quarantine:       (empty)");
    } else {
        println!("quarantine:");
        for (name, record) in &state.quarantine {
            println!(
                "  {name}: {} since {} (win rate {:.2}, z {:.2})",
                record.reason,
                record.quarantined_at.to_rfc3339(),
                record.win_rate,
                record.z_score,
            );
        }
    }

    let reader = EvidenceReader::new(&data_dir);
    let incidents = reader.incidents(INCIDENT_TAIL);
    if incidents.is_empty() {
        println!("incidents:        (none)");
    } else {
        println!("incidents (last {}):", incidents.len());
        for incident in incidents {
            println!(
                "  [{}] {}: {}",
                incident.timestamp.to_rfc3339(),
                incident.kind,
                incident.details,
            );
        }
    }

    Ok(())
}
