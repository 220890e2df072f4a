//! Runtime state persistence with atomic file writes.
//!
//! The `RuntimeState` document is the single source of truth for the
//! controller's operational mode, throttle, allow-list, and health flags.
//! Only the control-loop driver writes it; external consumers read it with
//! optimistic staleness tolerance.
//!
//! # Safety
//! - Uses atomic file writes (write to temp, fsync, rename) so a partial
//!   document is never observable
//! - A corrupt document on disk is a fatal startup error, never silently
//!   replaced with defaults

use crate::config::CapitalLimits;
use crate::types::{QuarantineRecord, Stage};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Errors raised by the state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("IO error on state document '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("state document '{path}' is corrupt: {source}")]
    Corrupt {
        path: String,
        source: serde_json::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The controller's durable operational state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeState {
    /// Monotonic document version, bumped on every persisted write.
    pub version: u64,
    /// Current capital-admission stage.
    pub mode: Stage,
    /// Position-sizing throttle derived from `mode`.
    pub throttle: f64,
    /// Symbols currently admitted for trading.
    pub allowed_symbols: BTreeSet<String>,
    /// Whether the surrounding system is in protective (kill-switch) mode.
    pub protective_mode: bool,
    /// When the last recovery cycle completed.
    pub last_recovery_timestamp: Option<DateTime<Utc>>,
    /// Capital limits the gate evaluator enforces.
    pub capital_limits: CapitalLimits,
    /// Currently quarantined signal components.
    pub quarantine: BTreeMap<String, QuarantineRecord>,
    /// Stale-metrics health flag, set by the diagnoser and cleared by the
    /// reconciler once evidence freshens.
    pub stale_metrics_flag: bool,
    /// Accumulated fee discrepancy in currency units.
    pub fee_mismatch_accumulated: Decimal,
    /// Manual override: while `now < override_disable_until`, the planner
    /// and reconciler run read-only and apply no writes.
    pub override_disable_until: Option<DateTime<Utc>>,
    /// Consecutive clean gate passes observed while at `StageC`. The only
    /// history the planner carries beyond the current stage.
    pub clean_passes: u32,
}

impl RuntimeState {
    /// Fresh first-boot state: frozen, nothing admitted.
    pub fn initial(capital_limits: CapitalLimits) -> Self {
        Self {
            version: 0,
            mode: Stage::Frozen,
            throttle: Stage::Frozen.throttle(),
            allowed_symbols: BTreeSet::new(),
            protective_mode: true,
            last_recovery_timestamp: None,
            capital_limits,
            quarantine: BTreeMap::new(),
            stale_metrics_flag: false,
            fee_mismatch_accumulated: Decimal::ZERO,
            override_disable_until: None,
            clean_passes: 0,
        }
    }

    /// Whether the manual override window is active at `now`.
    pub fn override_active(&self, now: DateTime<Utc>) -> bool {
        self.override_disable_until
            .map(|until| now < until)
            .unwrap_or(false)
    }
}

/// Durable store for the `RuntimeState` document.
///
/// The store itself is dumb: it loads, saves atomically, and bumps the
/// version counter. All decisions about *what* to write belong to the
/// control-loop driver.
pub struct RuntimeStateStore {
    path: PathBuf,
}

impl RuntimeStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state document, creating the initial frozen state if no
    /// document exists yet.
    ///
    /// # Errors
    /// A document that exists but fails to parse is a fatal error: the
    /// controller must refuse to operate on undefined state.
    pub fn load_or_init(&self, capital_limits: CapitalLimits) -> Result<RuntimeState, StateError> {
        match fs::read_to_string(&self.path) {
            Ok(data) => {
                serde_json::from_str(&data).map_err(|source| StateError::Corrupt {
                    path: self.path.display().to_string(),
                    source,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No state document found, initializing frozen state");
                let mut state = RuntimeState::initial(capital_limits);
                self.save(&mut state)?;
                Ok(state)
            }
            Err(source) => Err(StateError::Io {
                path: self.path.display().to_string(),
                source,
            }),
        }
    }

    /// Load an existing state document. Errors if none exists.
    pub fn load(&self) -> Result<RuntimeState, StateError> {
        let data = fs::read_to_string(&self.path).map_err(|source| StateError::Io {
            path: self.path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| StateError::Corrupt {
            path: self.path.display().to_string(),
            source,
        })
    }

    /// Persist the state atomically, bumping its version.
    ///
    /// Write-to-temp, fsync, rename: POSIX guarantees the rename is atomic
    /// on the same filesystem, so readers observe either the old or the new
    /// document, never a partial one.
    pub fn save(&self, state: &mut RuntimeState) -> Result<(), StateError> {
        state.version += 1;
        let json = serde_json::to_string_pretty(state)?;
        let temp_path = self.path.with_extension("json.tmp");

        let io_err = |source| StateError::Io {
            path: self.path.display().to_string(),
            source,
        };

        let mut file = fs::File::create(&temp_path).map_err(io_err)?;
        file.write_all(json.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&temp_path, &self.path).map_err(io_err)?;

        Ok(())
    }
}
