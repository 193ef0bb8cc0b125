//! Application configuration.
//!
//! Loaded from a TOML file with CLI overrides; every knob has an
//! evidence-based default so an empty file is a valid configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub cadence: CadenceConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default, rename = "loop")]
    pub run_loop: LoopConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Parse a TOML configuration file. A missing file is not an error;
    /// malformed contents are fatal.
    pub fn load(path: &str) -> Result<Self> {
        if !std::path::Path::new(path).exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {path}: {e}")))?;
        toml::from_str(&content).map_err(|e| Error::config(format!("cannot parse {path}: {e}")))
    }
}

/// Node management API connection.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    /// Base URL of the lnd-manage style management API.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Per-request timeout in seconds. A timeout counts as that channel's
    /// attempt failing for the cycle.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:18081".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl NodeConfig {
    /// Request timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Policy engine parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Path to the policy rule file.
    #[serde(default = "default_rule_file")]
    pub rule_file: String,
    /// Global outbound fee ceiling in ppm. The floor is always 1 ppm so a
    /// channel is never literally free to drain.
    #[serde(default = "default_max_fee_ppm")]
    pub max_fee_ppm: u32,
    /// Balance ratio above which a channel is considered outbound-heavy.
    #[serde(default = "default_high_balance")]
    pub high_balance_threshold: f64,
    /// Balance ratio below which a channel is considered depleted.
    #[serde(default = "default_low_balance")]
    pub low_balance_threshold: f64,
    /// Lookback window in hours used by the flow-based strategy when
    /// comparing recent against earlier flow.
    #[serde(default = "default_flow_lookback_hours")]
    pub flow_lookback_hours: u32,
    /// Retention for the per-channel performance history consumed by the
    /// revenue_max strategy, in days.
    #[serde(default = "default_history_retention_days")]
    pub history_retention_days: u32,
}

fn default_rule_file() -> String {
    "rules.toml".to_string()
}

fn default_max_fee_ppm() -> u32 {
    5000
}

fn default_high_balance() -> f64 {
    0.8
}

fn default_low_balance() -> f64 {
    0.2
}

fn default_flow_lookback_hours() -> u32 {
    24
}

fn default_history_retention_days() -> u32 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rule_file: default_rule_file(),
            max_fee_ppm: default_max_fee_ppm(),
            high_balance_threshold: default_high_balance(),
            low_balance_threshold: default_low_balance(),
            flow_lookback_hours: default_flow_lookback_hours(),
            history_retention_days: default_history_retention_days(),
        }
    }
}

/// When and how often fee changes may be applied to a channel.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CadenceConfig {
    /// Maximum number of changes per channel per UTC day.
    #[serde(default = "default_max_daily_changes")]
    pub max_daily_changes: u32,
    /// UTC hours during which changes are applied.
    #[serde(default = "default_update_hours")]
    pub update_hours: Vec<u32>,
    /// Minimum gap between two changes on the same channel, in hours.
    #[serde(default = "default_min_change_gap_hours")]
    pub min_change_gap_hours: u32,
    /// Maximum relative outbound fee increase per change (0.5 = +50%).
    #[serde(default = "default_max_increase_pct")]
    pub max_increase_pct: f64,
    /// Maximum relative outbound fee decrease per change (0.3 = -30%).
    #[serde(default = "default_max_decrease_pct")]
    pub max_decrease_pct: f64,
}

fn default_max_daily_changes() -> u32 {
    2
}

fn default_update_hours() -> Vec<u32> {
    vec![9, 21]
}

fn default_min_change_gap_hours() -> u32 {
    4
}

fn default_max_increase_pct() -> f64 {
    0.5
}

fn default_max_decrease_pct() -> f64 {
    0.3
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            max_daily_changes: default_max_daily_changes(),
            update_hours: default_update_hours(),
            min_change_gap_hours: default_min_change_gap_hours(),
            max_increase_pct: default_max_increase_pct(),
            max_decrease_pct: default_max_decrease_pct(),
        }
    }
}

/// Durations and intensities of the parameter-set sequence.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_baseline_hours")]
    pub baseline_hours: u32,
    #[serde(default = "default_conservative_hours")]
    pub conservative_hours: u32,
    #[serde(default = "default_aggressive_hours")]
    pub aggressive_hours: u32,
    #[serde(default = "default_advanced_hours")]
    pub advanced_hours: u32,
    #[serde(default = "default_stabilization_hours")]
    pub stabilization_hours: u32,
    /// Strategy intensity multiplier during the conservative set.
    #[serde(default = "default_conservative_intensity")]
    pub conservative_intensity: f64,
    /// Strategy intensity multiplier during the aggressive set.
    #[serde(default = "default_aggressive_intensity")]
    pub aggressive_intensity: f64,
    /// Strategy intensity multiplier during the advanced set.
    #[serde(default = "default_advanced_intensity")]
    pub advanced_intensity: f64,
}

fn default_baseline_hours() -> u32 {
    24
}

fn default_conservative_hours() -> u32 {
    48
}

fn default_aggressive_hours() -> u32 {
    48
}

fn default_advanced_hours() -> u32 {
    48
}

fn default_stabilization_hours() -> u32 {
    24
}

fn default_conservative_intensity() -> f64 {
    0.2
}

fn default_aggressive_intensity() -> f64 {
    0.5
}

fn default_advanced_intensity() -> f64 {
    0.7
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            baseline_hours: default_baseline_hours(),
            conservative_hours: default_conservative_hours(),
            aggressive_hours: default_aggressive_hours(),
            advanced_hours: default_advanced_hours(),
            stabilization_hours: default_stabilization_hours(),
            conservative_intensity: default_conservative_intensity(),
            aggressive_intensity: default_aggressive_intensity(),
            advanced_intensity: default_advanced_intensity(),
        }
    }
}

/// Rollback thresholds for the safety monitor.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SafetyConfig {
    /// Revenue decline fraction that triggers a rollback when a rule does
    /// not carry its own threshold.
    #[serde(default = "default_revenue_threshold")]
    pub revenue_decline_threshold: f64,
    /// Flow decline fraction that triggers a rollback.
    #[serde(default = "default_flow_threshold")]
    pub flow_decline_threshold: f64,
    /// Minimum observation period after a change before it is judged, in
    /// hours.
    #[serde(default = "default_min_observation_hours")]
    pub min_observation_hours: u32,
}

fn default_revenue_threshold() -> f64 {
    0.3
}

fn default_flow_threshold() -> f64 {
    0.6
}

fn default_min_observation_hours() -> u32 {
    2
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            revenue_decline_threshold: default_revenue_threshold(),
            flow_decline_threshold: default_flow_threshold(),
            min_observation_hours: default_min_observation_hours(),
        }
    }
}

/// Control loop pacing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoopConfig {
    /// Interval between cycles, in minutes.
    #[serde(default = "default_cycle_interval_minutes")]
    pub cycle_interval_minutes: u64,
    /// Concurrent snapshot fetches within a cycle.
    #[serde(default = "default_snapshot_concurrency")]
    pub snapshot_concurrency: usize,
}

fn default_cycle_interval_minutes() -> u64 {
    30
}

fn default_snapshot_concurrency() -> usize {
    10
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            cycle_interval_minutes: default_cycle_interval_minutes(),
            snapshot_concurrency: default_snapshot_concurrency(),
        }
    }
}

impl LoopConfig {
    /// Cycle interval as a [`Duration`].
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_minutes * 60)
    }
}

/// Where the time-series store keeps its files.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Directory for append-only data-point and fee-change logs.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_data_dir() -> String {
    "experiment_data".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: pretty, json, compact
    #[serde(default)]
    pub format: LogFormat,
    /// Optional log file path (logs to both file and stdout)
    #[serde(default)]
    pub log_file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            log_file: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.engine.max_fee_ppm, 5000);
        assert_eq!(config.cadence.max_daily_changes, 2);
        assert_eq!(config.cadence.update_hours, vec![9, 21]);
        assert_eq!(config.cadence.min_change_gap_hours, 4);
        assert_eq!(config.safety.revenue_decline_threshold, 0.3);
        assert_eq!(config.safety.flow_decline_threshold, 0.6);
        assert_eq!(config.run_loop.cycle_interval_minutes, 30);
        assert_eq!(config.run_loop.snapshot_concurrency, 10);
    }

    #[test]
    fn test_empty_toml_is_valid() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.node.base_url, "http://localhost:18081");
        assert_eq!(config.schedule.baseline_hours, 24);
    }

    #[test]
    fn test_partial_override() {
        let config: AppConfig = toml::from_str(
            r#"
            [engine]
            max_fee_ppm = 3000

            [cadence]
            update_hours = [6, 18]
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.max_fee_ppm, 3000);
        assert_eq!(config.cadence.update_hours, vec![6, 18]);
        // untouched sections keep defaults
        assert_eq!(config.safety.min_observation_hours, 2);
    }

    #[test]
    fn test_malformed_toml_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[engine\nmax_fee_ppm = ").unwrap();
        let err = AppConfig::load(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
