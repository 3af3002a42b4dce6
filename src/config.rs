//! Configuration management for asmon
//!
//! Settings are read from `~/.config/asmon/config.toml`; every field has a default so a
//! missing file or a partial file is fine. The CLI layers its flags on top.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// asmon configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// External sampler invocation
    #[serde(default)]
    pub sampler: SamplerConfig,
    /// Restart policy
    #[serde(default)]
    pub restart: RestartConfig,
    /// Rolling windows and degraded thresholds
    #[serde(default)]
    pub aggregation: AggregationConfig,
    /// Display options
    #[serde(default)]
    pub display: DisplayConfig,
    /// Hardware profile selection
    #[serde(default)]
    pub hardware: HardwareConfig,
}

/// Sampler process configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Sampler executable
    #[serde(default = "default_program")]
    pub program: String,
    /// Sampler sets to enable (e.g. "cpu_power")
    #[serde(default = "default_samplers")]
    pub samplers: Vec<String>,
    /// Sampling interval in milliseconds, 0 disables periodic sampling
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Samples after which the sampler exits and is restarted, 0 = unbounded
    #[serde(default)]
    pub max_sample_count: u64,
    /// Grace period between terminate and kill on stop
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// Refuse to start unless running as root
    #[serde(default = "default_true")]
    pub require_root: bool,
}

/// Restart policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartConfig {
    /// First backoff delay after an unexpected exit
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    /// Backoff ceiling
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Failure restarts within the window that count as flapping
    #[serde(default = "default_flap_threshold")]
    pub flap_threshold: usize,
    /// Flap detection window in seconds
    #[serde(default = "default_flap_window_secs")]
    pub flap_window_secs: u64,
}

/// Aggregation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Power averaging window in seconds
    #[serde(default = "default_power_window_secs")]
    pub power_window_secs: u64,
    /// Dwell time before the throttle indicator changes
    #[serde(default = "default_throttle_dwell_ms")]
    pub throttle_dwell_ms: u64,
    /// Consecutive unparsable records that mark the view degraded
    #[serde(default = "default_unparsable_threshold")]
    pub unparsable_threshold: u32,
}

/// Display configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// Presentation refresh period in milliseconds
    #[serde(default = "default_refresh_ms")]
    pub refresh_ms: u64,
    /// Color theme index (0-8)
    #[serde(default = "default_color")]
    pub color: u8,
    /// Extract and show per-core metrics
    #[serde(default)]
    pub show_cores: bool,
    /// Output format: "text" or "json"
    #[serde(default = "default_format")]
    pub format: String,
}

/// Hardware profile configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Chip brand string to use instead of asking the OS
    #[serde(default)]
    pub chip_override: Option<String>,
}

// Default value functions
fn default_program() -> String {
    "powermetrics".to_string()
}

fn default_samplers() -> Vec<String> {
    vec![
        "cpu_power".to_string(),
        "gpu_power".to_string(),
        "thermal".to_string(),
    ]
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_stop_timeout_ms() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

fn default_backoff_initial_ms() -> u64 {
    250
}

fn default_backoff_max_ms() -> u64 {
    5000
}

fn default_flap_threshold() -> usize {
    5
}

fn default_flap_window_secs() -> u64 {
    60
}

fn default_power_window_secs() -> u64 {
    30
}

fn default_throttle_dwell_ms() -> u64 {
    3000
}

fn default_unparsable_threshold() -> u32 {
    5
}

fn default_refresh_ms() -> u64 {
    1000
}

fn default_color() -> u8 {
    2
}

fn default_format() -> String {
    "text".to_string()
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            samplers: default_samplers(),
            interval_ms: default_interval_ms(),
            max_sample_count: 0,
            stop_timeout_ms: default_stop_timeout_ms(),
            require_root: true,
        }
    }
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            flap_threshold: default_flap_threshold(),
            flap_window_secs: default_flap_window_secs(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            power_window_secs: default_power_window_secs(),
            throttle_dwell_ms: default_throttle_dwell_ms(),
            unparsable_threshold: default_unparsable_threshold(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            refresh_ms: default_refresh_ms(),
            color: default_color(),
            show_cores: false,
            format: default_format(),
        }
    }
}

impl SamplerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl RestartConfig {
    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn flap_window(&self) -> Duration {
        Duration::from_secs(self.flap_window_secs)
    }
}

impl AggregationConfig {
    pub fn power_window(&self) -> Duration {
        Duration::from_secs(self.power_window_secs)
    }

    pub fn throttle_dwell(&self) -> Duration {
        Duration::from_millis(self.throttle_dwell_ms)
    }
}

impl DisplayConfig {
    pub fn refresh(&self) -> Duration {
        Duration::from_millis(self.refresh_ms)
    }
}

impl Config {
    /// Get the default configuration directory
    ///
    /// Returns `~/.config/asmon`, or `.config/asmon` relative to the working directory when
    /// `HOME` is unset.
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = std::env::var("HOME")
            .map(|home| PathBuf::from(home).join(".config"))
            .unwrap_or_else(|_| PathBuf::from(".config"));

        Ok(config_dir.join("asmon"))
    }

    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_file = Self::default_path()?.join("config.toml");

        if !config_file.exists() {
            return Ok(Self::default());
        }

        Self::load_from(&config_file)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<()> {
        let config_dir = Self::default_path()?;
        std::fs::create_dir_all(&config_dir)?;
        self.save_to(&config_dir.join("config.toml"))
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.sampler.program.trim().is_empty() {
            return Err(Error::Config("sampler.program is empty".into()));
        }
        if self.sampler.samplers.is_empty() {
            return Err(Error::Config("sampler.samplers is empty".into()));
        }
        if self.aggregation.power_window_secs == 0 {
            return Err(Error::Config(
                "aggregation.power_window_secs must be at least 1".into(),
            ));
        }
        if self.aggregation.throttle_dwell_ms == 0 {
            return Err(Error::Config(
                "aggregation.throttle_dwell_ms must be at least 1".into(),
            ));
        }
        if self.restart.backoff_initial_ms > self.restart.backoff_max_ms {
            return Err(Error::Config(
                "restart.backoff_initial_ms exceeds restart.backoff_max_ms".into(),
            ));
        }
        if self.restart.flap_threshold == 0 {
            return Err(Error::Config("restart.flap_threshold must be at least 1".into()));
        }
        if self.display.color > 8 {
            return Err(Error::Config(format!(
                "display.color must be 0-8, got {}",
                self.display.color
            )));
        }
        if self.display.refresh_ms == 0 {
            return Err(Error::Config("display.refresh_ms must be at least 1".into()));
        }
        match self.display.format.as_str() {
            "text" | "json" => Ok(()),
            other => Err(Error::Config(format!("unknown display.format '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sampler.program, "powermetrics");
        assert_eq!(config.sampler.interval_ms, 1000);
        assert_eq!(config.sampler.max_sample_count, 0);
        assert!(config.sampler.require_root);
        assert_eq!(config.aggregation.power_window(), Duration::from_secs(30));
        assert_eq!(config.display.color, 2);
        assert!(!config.display.show_cores);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [sampler]
            interval_ms = 500
            max_sample_count = 100

            [display]
            show_cores = true
            "#,
        )
        .unwrap();

        assert_eq!(config.sampler.interval_ms, 500);
        assert_eq!(config.sampler.max_sample_count, 100);
        assert_eq!(config.sampler.samplers.len(), 3);
        assert!(config.display.show_cores);
        assert_eq!(config.restart, RestartConfig::default());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.display.color = 9;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.aggregation.power_window_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.display.format = "yaml".into();
        assert!(config.validate().is_err());

        // zero dwell would let every pressure sample flip the throttle indicator
        let mut config = Config::default();
        config.aggregation.throttle_dwell_ms = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.restart.backoff_initial_ms = 10_000;
        assert!(config.validate().unwrap_err().is_fatal());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.hardware.chip_override = Some("Apple M2 Pro".into());
        config.sampler.max_sample_count = 42;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sampler\ninterval_ms = ").unwrap();

        assert!(matches!(Config::load_from(&path), Err(Error::Config(_))));
    }
}
