//! Relay configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. `config/daq_relay.toml` (base configuration)
//! 2. Environment variables prefixed with `DAQ_RELAY_`, nested keys separated by
//!    a double underscore (`DAQ_RELAY_ACQUISITION__SAMPLE_RATE=2000`)
//!
//! The calibration list can live inline under `[[channels]]` or in a legacy
//! `channel_config.json` file (`{"Channels": [{"Channel", "Slope", "Intercept"}]}`)
//! named by `channels_file`.
//!
//! # Example
//! ```no_run
//! use daq_relay::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), daq_relay::error::DaqError>(())
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::calibration::{CalibrationTable, ChannelCalibration};
use crate::engine::EngineSettings;
use crate::error::{AppResult, DaqError};
use crate::hardware::VoltageRange;
use crate::telemetry::{PublisherSettings, DEFAULT_DATA_CHANNEL, DEFAULT_KEY_PREFIX};

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/daq_relay.toml";

/// Top-level relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Device session settings
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Inline calibration entries
    #[serde(default)]
    pub channels: Vec<ChannelCalibration>,
    /// Legacy JSON calibration file, used when `channels` is empty
    #[serde(default)]
    pub channels_file: Option<PathBuf>,
    /// Telemetry sink settings
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Status monitor settings
    #[serde(default)]
    pub status: StatusConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Acquisition device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Device name
    #[serde(default = "default_device")]
    pub device: String,
    /// Physical channels per session
    #[serde(default = "default_channel_count")]
    pub channel_count: usize,
    /// Lower input bound in volts
    #[serde(default)]
    pub min_voltage: f64,
    /// Upper input bound in volts
    #[serde(default = "default_max_voltage")]
    pub max_voltage: f64,
    /// Per-channel sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Samples per channel per read
    #[serde(default = "default_samples_per_channel")]
    pub samples_per_channel: usize,
}

/// Telemetry sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Sink backend (memory or redis)
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Channel receiving full batches
    #[serde(default = "default_data_channel")]
    pub data_channel: String,
    /// Prefix of latest-value keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Expiry of latest values in seconds (0 = never)
    #[serde(default)]
    pub latest_ttl_secs: u64,
    /// Batches buffered between engine and publisher
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Upper bound for each sink call in milliseconds
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_ms: u64,
}

/// Status monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    /// Poll interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize)]
struct LegacyChannelFile {
    #[serde(rename = "Channels", alias = "channels")]
    channels: Vec<ChannelCalibration>,
}

// Default value functions
fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_device() -> String {
    "Dev1".to_string()
}

fn default_channel_count() -> usize {
    16
}

fn default_max_voltage() -> f64 {
    10.0
}

fn default_sample_rate() -> u32 {
    1000
}

fn default_samples_per_channel() -> usize {
    100
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_data_channel() -> String {
    DEFAULT_DATA_CHANNEL.to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_queue_capacity() -> usize {
    64
}

fn default_publish_timeout() -> u64 {
    2000
}

fn default_poll_interval() -> u64 {
    1000
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "DAQ Relay".to_string(),
            log_level: "info".to_string(),
            log_format: default_log_format(),
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            channel_count: default_channel_count(),
            min_voltage: 0.0,
            max_voltage: default_max_voltage(),
            sample_rate: default_sample_rate(),
            samples_per_channel: default_samples_per_channel(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: default_redis_url(),
            data_channel: default_data_channel(),
            key_prefix: default_key_prefix(),
            latest_ttl_secs: 0,
            queue_capacity: default_queue_capacity(),
            publish_timeout_ms: default_publish_timeout(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            acquisition: AcquisitionConfig::default(),
            channels: Vec::new(),
            channels_file: None,
            telemetry: TelemetryConfig::default(),
            status: StatusConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `config/daq_relay.toml` and environment variables
    ///
    /// Environment variables can override configuration with prefix `DAQ_RELAY_`
    /// Example: `DAQ_RELAY_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        debug!(path = %path.as_ref().display(), "Loaded configuration");
        Ok(config)
    }

    /// Layered providers: TOML file, then environment.
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("DAQ_RELAY_").split("__"))
    }

    /// Validate configuration after loading
    ///
    /// Reads `channels_file` when no inline channels are configured.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        let acq = &self.acquisition;
        if acq.channel_count == 0 {
            return Err(DaqError::Configuration(
                "acquisition.channel_count must be at least 1".to_string(),
            ));
        }
        if acq.min_voltage >= acq.max_voltage {
            return Err(DaqError::Configuration(format!(
                "Invalid voltage range {}..{}: min must be below max",
                acq.min_voltage, acq.max_voltage
            )));
        }
        if acq.sample_rate == 0 || acq.samples_per_channel == 0 {
            return Err(DaqError::Configuration(
                "acquisition.sample_rate and samples_per_channel must be positive".to_string(),
            ));
        }

        let valid_backends = ["memory", "redis"];
        if !valid_backends.contains(&self.telemetry.backend.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid telemetry backend '{}'. Must be one of: {}",
                self.telemetry.backend,
                valid_backends.join(", ")
            )));
        }
        if self.telemetry.queue_capacity == 0 {
            return Err(DaqError::Configuration(
                "telemetry.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.status.poll_interval_ms == 0 {
            return Err(DaqError::Configuration(
                "status.poll_interval_ms must be at least 1".to_string(),
            ));
        }

        // Covers inline entries and the legacy file alike.
        if let Some(entry) = self
            .calibration()?
            .iter()
            .find(|c| c.channel_index >= acq.channel_count)
        {
            return Err(DaqError::Configuration(format!(
                "Calibration for channel {} but the device is configured with {} channels",
                entry.channel_index, acq.channel_count
            )));
        }

        Ok(())
    }

    /// Calibration table: inline entries, else the legacy JSON file, else empty.
    pub fn calibration(&self) -> AppResult<CalibrationTable> {
        if !self.channels.is_empty() {
            return Ok(CalibrationTable::new(self.channels.iter().copied()));
        }
        match &self.channels_file {
            Some(path) => load_legacy_channels(path),
            None => Ok(CalibrationTable::default()),
        }
    }

    /// Engine settings derived from `acquisition` and `telemetry`.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            device: self.acquisition.device.clone(),
            channel_count: self.acquisition.channel_count,
            voltage_range: VoltageRange::new(
                self.acquisition.min_voltage,
                self.acquisition.max_voltage,
            ),
            batch_queue_capacity: self.telemetry.queue_capacity,
        }
    }

    /// Publisher settings derived from `telemetry`.
    pub fn publisher_settings(&self) -> PublisherSettings {
        PublisherSettings {
            data_channel: self.telemetry.data_channel.clone(),
            key_prefix: self.telemetry.key_prefix.clone(),
            latest_ttl: (self.telemetry.latest_ttl_secs > 0)
                .then(|| Duration::from_secs(self.telemetry.latest_ttl_secs)),
            call_timeout: Duration::from_millis(self.telemetry.publish_timeout_ms),
        }
    }

    /// Status poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.status.poll_interval_ms)
    }
}

/// Load a legacy `channel_config.json` calibration file.
pub fn load_legacy_channels<P: AsRef<Path>>(path: P) -> AppResult<CalibrationTable> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(DaqError::Configuration(format!(
            "Calibration file {} does not exist",
            path.display()
        )));
    }
    let file: LegacyChannelFile = Figment::from(Json::file(path)).extract()?;
    debug!(path = %path.display(), entries = file.channels.len(), "Loaded legacy calibration file");
    Ok(CalibrationTable::new(file.channels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_minimal_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "relay.toml",
            r#"
            [application]
            name = "Test"
            log_level = "debug"
            "#,
        );

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.application.name, "Test");
        assert_eq!(config.acquisition.channel_count, 16);
        assert_eq!(config.telemetry.data_channel, "Daq.data.updated");
        assert_eq!(config.telemetry.key_prefix, "Daq:data:");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_inline_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "relay.toml",
            r#"
            [application]
            name = "Test"
            log_level = "info"

            [[channels]]
            channel_index = 2
            slope = 2.0
            intercept = 0.5
            "#,
        );

        let config = AppConfig::load_from(&path).unwrap();
        let table = config.calibration().unwrap();
        assert_eq!(table.get(2), Some(&ChannelCalibration::new(2, 2.0, 0.5)));
    }

    #[test]
    fn test_legacy_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let json = write_file(
            &dir,
            "channel_config.json",
            r#"{"Channels": [{"Channel": 0, "Slope": 2.0, "Intercept": 0.5},
                             {"Channel": 1, "Slope": 1.0, "Intercept": 0.0}]}"#,
        );

        let table = load_legacy_channels(&json).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(0).map(|c| c.slope), Some(2.0));
    }

    #[test]
    fn test_missing_legacy_file() {
        assert!(load_legacy_channels("/nonexistent/channel_config.json").is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = AppConfig::default();
        config.application.log_level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_channel_beyond_device_is_rejected() {
        let mut config = AppConfig::default();
        config.acquisition.channel_count = 4;
        config.channels = vec![ChannelCalibration::new(4, 1.0, 0.0)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_legacy_channel_beyond_device_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let json = write_file(
            &dir,
            "channel_config.json",
            r#"{"Channels": [{"Channel": 20, "Slope": 1.0, "Intercept": 0.0}]}"#,
        );

        let mut config = AppConfig::default();
        config.channels_file = Some(json);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("channel 20"));

        config.acquisition.channel_count = 32;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_inverted_voltage_range_is_rejected() {
        let mut config = AppConfig::default();
        config.acquisition.min_voltage = 5.0;
        config.acquisition.max_voltage = -5.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_publisher_settings_ttl() {
        let mut config = AppConfig::default();
        assert_eq!(config.publisher_settings().latest_ttl, None);
        config.telemetry.latest_ttl_secs = 30;
        assert_eq!(
            config.publisher_settings().latest_ttl,
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "relay.toml",
                r#"
                [application]
                name = "Test"
                log_level = "info"
                "#,
            )?;
            jail.set_env("DAQ_RELAY_ACQUISITION__SAMPLE_RATE", "2500");
            let config: AppConfig = AppConfig::figment(Path::new("relay.toml")).extract()?;
            assert_eq!(config.acquisition.sample_rate, 2500);
            Ok(())
        });
    }
}
