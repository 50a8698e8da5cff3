//! Centralized runtime constants and the user-facing `MeterConfig`.
//!
//! Fixed tunables are constants so they can be found in one place. Everything
//! a user may change lives in [`MeterConfig`], read from `config.json` in the
//! data directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::alerts::AlertThresholds;

/// Directory name appended to the platform local-data directory.
pub const APP_DIR_NAME: &str = "NetMeter";

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "NETMETER_DATA_DIR";

/// File name of the configuration file inside the data directory.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Default daily allowance (2 GiB).
pub const DEFAULT_DAILY_LIMIT_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Smallest accepted daily limit (1 MiB).
pub const MIN_DAILY_LIMIT_BYTES: u64 = 1024 * 1024;

/// Warning threshold as a percentage of the daily limit, when not set explicitly.
pub const WARNING_PERCENT: u64 = 80;

/// Critical threshold as a percentage of the daily limit, when not set explicitly.
pub const CRITICAL_PERCENT: u64 = 95;

/// Number of recent samples averaged for the live speed display.
pub const RATE_WINDOW_SAMPLES: usize = 5;

/// A wall-clock gap longer than this many sampling intervals is treated as a sleep.
pub const SLEEP_GAP_FACTOR: f64 = 5.0;

/// Lower bound on the sleep-detection gap regardless of the sampling interval (seconds).
pub const SLEEP_GAP_MIN_SECS: f64 = 30.0;

/// How long a resolved network identity is reused before the OS is asked again (seconds).
pub const IDENTITY_REFRESH_SECS: u64 = 5;

/// Poll interval of the clock-jump watcher that infers sleeps (seconds).
pub const CLOCK_WATCH_INTERVAL_SECS: u64 = 5;

/// Consecutive failed saves before persistence is reported as degraded.
pub const PERSISTENCE_DEGRADED_AFTER: u32 = 3;

/// Capacity of the alert broadcast channel.
pub const ALERT_CHANNEL_SIZE: usize = 32;

/// Capacity of the command and persistence request channels.
pub const COMMAND_CHANNEL_SIZE: usize = 16;

/// Which counters count toward the daily alert total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitMode {
    /// Received + sent.
    #[default]
    Total,
    /// Received only.
    Download,
}

impl LimitMode {
    pub fn total_of(self, received: u64, sent: u64) -> u64 {
        match self {
            LimitMode::Total => received.saturating_add(sent),
            LimitMode::Download => received,
        }
    }
}

/// Which interface counters are read. `"total"` sums every interface.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InterfaceSelection {
    #[default]
    Total,
    Named(String),
}

impl From<String> for InterfaceSelection {
    fn from(value: String) -> Self {
        if value.is_empty() || value.eq_ignore_ascii_case("total") {
            InterfaceSelection::Total
        } else {
            InterfaceSelection::Named(value)
        }
    }
}

impl From<InterfaceSelection> for String {
    fn from(value: InterfaceSelection) -> Self {
        match value {
            InterfaceSelection::Total => "total".to_string(),
            InterfaceSelection::Named(name) => name,
        }
    }
}

/// Every recognized configuration option, with defaults for missing fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    pub sampling_interval_secs: f64,
    pub daily_limit_bytes: u64,
    /// Explicit warning threshold; `None` means `WARNING_PERCENT` of the limit.
    pub warning_bytes: Option<u64>,
    /// Explicit critical threshold; `None` means `CRITICAL_PERCENT` of the limit.
    pub critical_bytes: Option<u64>,
    pub retention_days: u32,
    pub backup_interval_hours: u64,
    pub save_interval_secs: u64,
    pub backup_slots: usize,
    pub counter_timeout_ms: u64,
    pub limit_mode: LimitMode,
    pub interface: InterfaceSelection,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            sampling_interval_secs: 1.0,
            daily_limit_bytes: DEFAULT_DAILY_LIMIT_BYTES,
            warning_bytes: None,
            critical_bytes: None,
            retention_days: 30,
            backup_interval_hours: 24,
            save_interval_secs: 300,
            backup_slots: 30,
            counter_timeout_ms: 2000,
            limit_mode: LimitMode::Total,
            interface: InterfaceSelection::Total,
        }
    }
}

impl MeterConfig {
    /// Read `path`, falling back to defaults when the file is missing or unreadable.
    ///
    /// The result is always sanitized.
    pub fn load_or_default(path: &Path) -> Self {
        let config = match Self::load(path) {
            Ok(Some(config)) => config,
            Ok(None) => {
                tracing::info!("No config at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config {}: {e:#}. Using defaults.", path.display());
                Self::default()
            }
        };
        config.sanitized()
    }

    fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = serde_json::from_str(&raw).context("parsing config JSON")?;
        Ok(Some(config))
    }

    /// Clamp every option into its valid range, logging each correction.
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();

        if !self.sampling_interval_secs.is_finite() {
            self.sampling_interval_secs = defaults.sampling_interval_secs;
        }
        self.sampling_interval_secs =
            clamp_logged("sampling_interval_secs", self.sampling_interval_secs, 0.5, 60.0);
        self.retention_days = clamp_logged("retention_days", self.retention_days, 1, 366);
        self.backup_interval_hours =
            clamp_logged("backup_interval_hours", self.backup_interval_hours, 1, 720);
        self.save_interval_secs =
            clamp_logged("save_interval_secs", self.save_interval_secs, 10, 3600);
        self.backup_slots = clamp_logged("backup_slots", self.backup_slots, 1, 365);
        self.counter_timeout_ms =
            clamp_logged("counter_timeout_ms", self.counter_timeout_ms, 100, 30_000);

        self.daily_limit_bytes = clamp_logged(
            "daily_limit_bytes",
            self.daily_limit_bytes,
            MIN_DAILY_LIMIT_BYTES,
            u64::MAX,
        );

        if let Err(e) = self.thresholds().validate() {
            tracing::warn!("{e}. Using {WARNING_PERCENT}%/{CRITICAL_PERCENT}% of the daily limit.");
            self.warning_bytes = None;
            self.critical_bytes = None;
        }
        self
    }

    /// Effective thresholds: explicit values, else percentages of the daily limit.
    pub fn thresholds(&self) -> AlertThresholds {
        let limit = self.daily_limit_bytes;
        AlertThresholds {
            warning_bytes: self.warning_bytes.unwrap_or(limit / 100 * WARNING_PERCENT),
            critical_bytes: self.critical_bytes.unwrap_or(limit / 100 * CRITICAL_PERCENT),
            limit_bytes: limit,
        }
    }

    pub fn sampling_interval(&self) -> Duration {
        Duration::from_secs_f64(self.sampling_interval_secs)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_secs(self.backup_interval_hours * 3600)
    }

    pub fn counter_timeout(&self) -> Duration {
        Duration::from_millis(self.counter_timeout_ms)
    }

    /// Gap after which a tick is treated as a resume from sleep.
    pub fn sleep_gap(&self) -> Duration {
        Duration::from_secs_f64(
            (self.sampling_interval_secs * SLEEP_GAP_FACTOR).max(SLEEP_GAP_MIN_SECS),
        )
    }
}

fn clamp_logged<T: PartialOrd + Copy + std::fmt::Display>(
    name: &str,
    value: T,
    min: T,
    max: T,
) -> T {
    let clamped = if value < min {
        min
    } else if value > max {
        max
    } else {
        value
    };
    if clamped != value {
        tracing::warn!("Config {name}={value} out of range [{min}, {max}], using {clamped}");
    }
    clamped
}

/// Resolve the data directory: `$NETMETER_DATA_DIR`, else `<local data dir>/NetMeter`.
pub fn resolve_data_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    let base = dirs::data_local_dir().context("no local data directory on this platform")?;
    Ok(base.join(APP_DIR_NAME))
}
