//! Engine configuration.
//!
//! Loaded from TOML or constructed in code; every field has a default
//! so partial files and `BeaconConfig::default()` both work.

use serde::Deserialize;
use std::path::PathBuf;

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BeaconConfig {
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub geofence: GeofenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Movement and presence classification thresholds.
#[derive(Debug, Clone, Deserialize)]
pub struct Thresholds {
    /// Movement inactivity (ms) before ACTIVE/MOVING degrades to IDLE.
    #[serde(default = "default_idle_after_ms")]
    pub idle_after_ms: i64,
    /// Update silence (ms) before an agent is UNREACHABLE; also the
    /// span after which a fresh sample counts as "back online".
    #[serde(default = "default_unreachable_after_ms")]
    pub unreachable_after_ms: i64,
    /// Update silence (ms) before an agent is OFFLINE.
    #[serde(default = "default_offline_after_ms")]
    pub offline_after_ms: i64,
    /// Speed (km/h) at or above which a sample classifies as MOVING.
    #[serde(default = "default_min_speed_kmh")]
    pub min_speed_kmh: f64,
    /// Displacement (m) across >= 1 s flagged as anomalous. Advisory.
    #[serde(default = "default_max_jump_distance_m")]
    pub max_jump_distance_m: f64,
}

fn default_idle_after_ms() -> i64 {
    300_000
}

fn default_unreachable_after_ms() -> i64 {
    30_000
}

fn default_offline_after_ms() -> i64 {
    600_000
}

fn default_min_speed_kmh() -> f64 {
    1.5
}

fn default_max_jump_distance_m() -> f64 {
    300.0
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            idle_after_ms: default_idle_after_ms(),
            unreachable_after_ms: default_unreachable_after_ms(),
            offline_after_ms: default_offline_after_ms(),
            min_speed_kmh: default_min_speed_kmh(),
            max_jump_distance_m: default_max_jump_distance_m(),
        }
    }
}

/// Background sweeper configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_watchdog_enabled")]
    pub enabled: bool,
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
}

fn default_watchdog_enabled() -> bool {
    true
}

fn default_check_interval_ms() -> u64 {
    5_000
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: default_watchdog_enabled(),
            check_interval_ms: default_check_interval_ms(),
        }
    }
}

/// Geofence evaluation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GeofenceConfig {
    /// Whether membership is evaluated during `track`.
    #[serde(default = "default_geofence_enabled")]
    pub enabled: bool,
}

fn default_geofence_enabled() -> bool {
    true
}

impl Default for GeofenceConfig {
    fn default() -> Self {
        Self {
            enabled: default_geofence_enabled(),
        }
    }
}

/// Logging sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Minimum severity: debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Structured JSON lines instead of plain text.
    #[serde(default)]
    pub json: bool,
    /// Write to stdout.
    #[serde(default = "default_log_console")]
    pub console: bool,
    /// Also append to this file; its directory is created on demand.
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_console() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            console: default_log_console(),
            file_path: None,
        }
    }
}

/// Load configuration from a TOML file.
pub fn load_config(path: &str) -> Result<BeaconConfig, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: BeaconConfig = toml::from_str(&contents)?;
    Ok(config)
}
