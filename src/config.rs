use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::clock::{DRIFT_THRESHOLD_NS, REFRESH_INTERVAL_NS};
use crate::sink::STDOUT_PATH;

const PAGE_SIZE: usize = 4096;

/// Top-level configuration for the parrotty tracer.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// BPF ring buffer size in bytes. Default: 1MB.
    #[serde(default = "default_ring_buffer_size")]
    pub ring_buffer_size: usize,

    /// How often per-direction event counts are logged. Default: 60s.
    #[serde(default = "default_stats_interval", with = "humantime_serde")]
    pub stats_interval: Duration,

    /// Where and how events are written.
    #[serde(default)]
    pub output: OutputConfig,

    /// Monotonic to wall-clock conversion tuning.
    #[serde(default)]
    pub calibration: CalibrationConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Event output configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// File to append events to, or "-" for stdout. Default: "-".
    #[serde(default = "default_output_path")]
    pub path: String,

    /// Rendering format. Default: text.
    #[serde(default)]
    pub format: OutputFormat,

    /// Flush after every event. Default: true.
    #[serde(default = "default_true")]
    pub flush_each_event: bool,
}

/// Event rendering format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Header line plus byte-literal payload line.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Clock calibration configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CalibrationConfig {
    /// Recalibrate when the estimate diverges by more than this. Default: 1ms.
    #[serde(default = "default_drift_threshold", with = "humantime_serde")]
    pub drift_threshold: Duration,

    /// Recalibrate when the anchor is older than this. Default: 60s.
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,
}

impl CalibrationConfig {
    pub fn drift_threshold_ns(&self) -> u64 {
        duration_ns(self.drift_threshold)
    }

    pub fn refresh_interval_ns(&self) -> u64 {
        duration_ns(self.refresh_interval)
    }
}

/// Health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Serde default functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ring_buffer_size() -> usize {
    256 * PAGE_SIZE
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_output_path() -> String {
    STDOUT_PATH.to_string()
}

fn default_drift_threshold() -> Duration {
    Duration::from_nanos(DRIFT_THRESHOLD_NS)
}

fn default_refresh_interval() -> Duration {
    Duration::from_nanos(REFRESH_INTERVAL_NS)
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn duration_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            ring_buffer_size: default_ring_buffer_size(),
            stats_interval: default_stats_interval(),
            output: OutputConfig::default(),
            calibration: CalibrationConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: default_output_path(),
            format: OutputFormat::default(),
            flush_each_event: true,
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            drift_threshold: default_drift_threshold(),
            refresh_interval: default_refresh_interval(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.ring_buffer_size == 0 {
            bail!("ring_buffer_size must be positive");
        }

        if !self.ring_buffer_size.is_power_of_two() || self.ring_buffer_size % PAGE_SIZE != 0 {
            bail!(
                "ring_buffer_size must be a power of two and a multiple of {PAGE_SIZE}, got {}",
                self.ring_buffer_size
            );
        }

        if u32::try_from(self.ring_buffer_size).is_err() {
            bail!("ring_buffer_size must fit in 32 bits");
        }

        if self.stats_interval.is_zero() {
            bail!("stats_interval must be positive");
        }

        if self.output.path.is_empty() {
            bail!("output.path is required");
        }

        if self.calibration.drift_threshold.is_zero() {
            bail!("calibration.drift_threshold must be positive");
        }

        if self.calibration.refresh_interval.is_zero() {
            bail!("calibration.refresh_interval must be positive");
        }

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when enabled");
        }

        Ok(())
    }
}
