//! Controller configuration.
//!
//! All thresholds that were previously scattered across the pipeline live
//! in one `ControllerConfig` struct with named, documented fields. The
//! struct is loaded once at startup from a JSON file; threshold values
//! (and only threshold values) can be hot-reloaded while the daemon runs.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::info;

/// Errors raised while loading or reloading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Capital limits enforced by the risk gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapitalLimits {
    /// Maximum portfolio exposure (trade-count concentration proxy, 0-1).
    #[serde(default = "default_max_exposure")]
    pub max_exposure: f64,
    /// Maximum observed per-trade leverage.
    #[serde(default = "default_max_leverage")]
    pub max_leverage: f64,
    /// Maximum 24h drawdown as a fraction of equity.
    #[serde(default = "default_max_drawdown_24h")]
    pub max_drawdown_24h: f64,
}

impl Default for CapitalLimits {
    fn default() -> Self {
        Self {
            max_exposure: default_max_exposure(),
            max_leverage: default_max_leverage(),
            max_drawdown_24h: default_max_drawdown_24h(),
        }
    }
}

/// Per-feed staleness limits for the stale-metrics check. Executed trades
/// arrive in bursts and tolerate a longer gap than the signal stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedAgeLimits {
    /// Maximum age in seconds of the newest executed trade.
    #[serde(default = "default_executed_trades_age_secs")]
    pub executed_trades_secs: i64,
    /// Maximum age in seconds of the newest signal outcome.
    #[serde(default = "default_strategy_signals_age_secs")]
    pub strategy_signals_secs: i64,
}

impl Default for FeedAgeLimits {
    fn default() -> Self {
        Self {
            executed_trades_secs: default_executed_trades_age_secs(),
            strategy_signals_secs: default_strategy_signals_age_secs(),
        }
    }
}

/// CUSUM drift-detector parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CusumParams {
    /// Reference value k: per-step drift allowance in standardized units.
    #[serde(default = "default_cusum_k")]
    pub k: f64,
    /// Decision threshold h: cumulative sum level that trips quarantine.
    #[serde(default = "default_cusum_h")]
    pub h: f64,
}

impl Default for CusumParams {
    fn default() -> Self {
        Self {
            k: default_cusum_k(),
            h: default_cusum_h(),
        }
    }
}

/// Full controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Capital limits for the risk gate.
    #[serde(default)]
    pub capital_limits: CapitalLimits,

    /// Minimum expectancy for the profit gate to pass.
    #[serde(default = "default_min_expectancy")]
    pub min_expectancy: f64,

    /// CUSUM parameters for the drift engine.
    #[serde(default)]
    pub cusum: CusumParams,

    /// Quarantine cool-down in hours before restoration is considered.
    #[serde(default = "default_quarantine_cooldown_hours")]
    pub quarantine_cooldown_hours: i64,

    /// Weight multiplier applied to quarantined components.
    #[serde(default = "default_quarantine_multiplier")]
    pub quarantine_multiplier: f64,

    /// Per-feed ages beyond which `stale_metrics` fires.
    #[serde(default)]
    pub feed_age_limits: FeedAgeLimits,

    /// Accumulated fee discrepancy (currency units) raising `fee_mismatch`.
    #[serde(default = "default_fee_mismatch_limit")]
    pub fee_mismatch_limit: f64,

    /// Per-symbol average fee above which fill quality is an outlier.
    #[serde(default = "default_fill_fee_limit")]
    pub fill_fee_limit: f64,

    /// Per-symbol average slippage above which fill quality is an outlier.
    #[serde(default = "default_fill_slippage_limit")]
    pub fill_slippage_limit: f64,

    /// Consecutive cycle errors tolerated before the fail-safe freeze.
    #[serde(default = "default_max_consecutive_cycle_errors")]
    pub max_consecutive_cycle_errors: u32,

    /// Seconds between health checks in daemon mode.
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,

    /// Seconds between full control cycles in daemon mode.
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,

    /// Directory holding the state document and all JSONL streams.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            capital_limits: CapitalLimits::default(),
            min_expectancy: default_min_expectancy(),
            cusum: CusumParams::default(),
            quarantine_cooldown_hours: default_quarantine_cooldown_hours(),
            quarantine_multiplier: default_quarantine_multiplier(),
            feed_age_limits: FeedAgeLimits::default(),
            fee_mismatch_limit: default_fee_mismatch_limit(),
            fill_fee_limit: default_fill_fee_limit(),
            fill_slippage_limit: default_fill_slippage_limit(),
            max_consecutive_cycle_errors: default_max_consecutive_cycle_errors(),
            health_interval_secs: default_health_interval_secs(),
            cycle_interval_secs: default_cycle_interval_secs(),
            data_dir: default_data_dir(),
        }
    }
}

impl ControllerConfig {
    /// Tighter limits for cautious re-admission after a serious halt.
    pub fn conservative() -> Self {
        Self {
            capital_limits: CapitalLimits {
                max_exposure: 0.50,
                max_leverage: 3.0,
                max_drawdown_24h: 0.03,
            },
            min_expectancy: 0.60,
            ..Self::default()
        }
    }

    /// Load configuration from a JSON file.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file is missing, unreadable, fails to
    /// parse, or fails validation. Startup must not proceed on error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Re-read the file and adopt its threshold values only.
    ///
    /// State-machine topology, intervals, and file locations are fixed at
    /// startup; this updates gate limits, drift parameters, cool-downs, and
    /// cause thresholds in place.
    pub fn reload_thresholds(&mut self, path: &Path) -> Result<(), ConfigError> {
        let fresh = Self::load(path)?;
        self.capital_limits = fresh.capital_limits;
        self.min_expectancy = fresh.min_expectancy;
        self.cusum = fresh.cusum;
        self.quarantine_cooldown_hours = fresh.quarantine_cooldown_hours;
        self.quarantine_multiplier = fresh.quarantine_multiplier;
        self.feed_age_limits = fresh.feed_age_limits;
        self.fee_mismatch_limit = fresh.fee_mismatch_limit;
        self.fill_fee_limit = fresh.fill_fee_limit;
        self.fill_slippage_limit = fresh.fill_slippage_limit;
        info!("Configuration thresholds reloaded");
        Ok(())
    }

    /// Validate cross-field constraints.
    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.capital_limits.max_exposure) {
            return Err(ConfigError::Invalid(format!(
                "max_exposure must be in [0, 1], got {}",
                self.capital_limits.max_exposure
            )));
        }
        if self.capital_limits.max_leverage <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "max_leverage must be positive, got {}",
                self.capital_limits.max_leverage
            )));
        }
        if self.capital_limits.max_drawdown_24h <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "max_drawdown_24h must be positive, got {}",
                self.capital_limits.max_drawdown_24h
            )));
        }
        if self.cusum.h <= 0.0 || self.cusum.k < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "cusum parameters must satisfy h > 0, k >= 0 (h={}, k={})",
                self.cusum.h, self.cusum.k
            )));
        }
        if self.quarantine_cooldown_hours <= 0 {
            return Err(ConfigError::Invalid(
                "quarantine_cooldown_hours must be positive".to_string(),
            ));
        }
        if self.feed_age_limits.executed_trades_secs <= 0
            || self.feed_age_limits.strategy_signals_secs <= 0
        {
            return Err(ConfigError::Invalid(
                "feed_age_limits must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_max_exposure() -> f64 {
    0.75
}

fn default_max_leverage() -> f64 {
    5.0
}

fn default_max_drawdown_24h() -> f64 {
    0.05
}

fn default_min_expectancy() -> f64 {
    0.55
}

fn default_cusum_k() -> f64 {
    0.5
}

fn default_cusum_h() -> f64 {
    5.0
}

fn default_quarantine_cooldown_hours() -> i64 {
    48
}

fn default_quarantine_multiplier() -> f64 {
    0.1
}

fn default_executed_trades_age_secs() -> i64 {
    600
}

fn default_strategy_signals_age_secs() -> i64 {
    300
}

fn default_fee_mismatch_limit() -> f64 {
    10.0
}

fn default_fill_fee_limit() -> f64 {
    1.0
}

fn default_fill_slippage_limit() -> f64 {
    0.0010
}

fn default_max_consecutive_cycle_errors() -> u32 {
    3
}

fn default_health_interval_secs() -> u64 {
    30
}

fn default_cycle_interval_secs() -> u64 {
    60
}

fn default_data_dir() -> String {
    "warden_data".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ControllerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.capital_limits.max_exposure, 0.75);
        assert_eq!(config.cusum.k, 0.5);
        assert_eq!(config.cusum.h, 5.0);
        assert_eq!(config.quarantine_cooldown_hours, 48);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: ControllerConfig =
            serde_json::from_str(r#"{"min_expectancy": 0.60}"#).unwrap();
        assert_eq!(config.min_expectancy, 0.60);
        assert_eq!(config.capital_limits.max_drawdown_24h, 0.05);
    }

    #[test]
    fn feed_age_limits_default_per_feed() {
        let config = ControllerConfig::default();
        assert_eq!(config.feed_age_limits.executed_trades_secs, 600);
        assert_eq!(config.feed_age_limits.strategy_signals_secs, 300);

        let parsed: ControllerConfig =
            serde_json::from_str(r#"{"feed_age_limits": {"strategy_signals_secs": 120}}"#)
                .unwrap();
        assert_eq!(parsed.feed_age_limits.strategy_signals_secs, 120);
        assert_eq!(parsed.feed_age_limits.executed_trades_secs, 600);
    }

    #[test]
    fn invalid_exposure_rejected() {
        let mut config = ControllerConfig::default();
        config.capital_limits.max_exposure = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn reload_updates_thresholds_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"min_expectancy": 0.70, "cycle_interval_secs": 5}"#,
        )
        .unwrap();

        let mut config = ControllerConfig::default();
        let original_interval = config.cycle_interval_secs;
        config.reload_thresholds(&path).unwrap();

        assert_eq!(config.min_expectancy, 0.70);
        // Interval is topology, not a threshold: unchanged by reload.
        assert_eq!(config.cycle_interval_secs, original_interval);
    }
}
