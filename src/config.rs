//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::Deserialize;
use serde::de::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{RecorderError, Result};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub ble: BleConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Sensor unit link configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BleConfig {
    #[serde(default = "default_device_name")]
    pub device_name: String,

    #[serde(default = "default_service_uuid")]
    pub service_uuid: Uuid,

    #[serde(default = "default_characteristic_uuid")]
    pub characteristic_uuid: Uuid,

    #[serde(default = "default_mtu")]
    pub mtu: u16,

    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,

    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    #[serde(default = "default_frame_buffer")]
    pub frame_buffer: usize,
}

/// Upload queue configuration
#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_bucket_dir")]
    pub bucket_dir: PathBuf,

    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,

    #[serde(default = "default_progress_step_percent")]
    pub progress_step_percent: u8,
}

/// Local trip storage configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_trips_dir")]
    pub trips_dir: PathBuf,

    #[serde(default = "default_export_gpx")]
    pub export_gpx: bool,
}

/// Status polling configuration
#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

// Default value functions
fn default_device_name() -> String { "ESP32-SENSOR-FUSION".to_string() }
fn default_service_uuid() -> Uuid { Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b) }
fn default_characteristic_uuid() -> Uuid { Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26a8) }
fn default_mtu() -> u16 { 100 }
fn default_scan_timeout_ms() -> u64 { 60_000 }
fn default_reconnect_delay_ms() -> u64 { 3_000 }
fn default_frame_buffer() -> usize { 64 }

fn default_bucket_dir() -> PathBuf { PathBuf::from("./bucket") }
fn default_state_dir() -> PathBuf { PathBuf::from("./state") }
fn default_max_attempts() -> u32 { 3 }
fn default_base_retry_delay_ms() -> u64 { 4_000 }
fn default_progress_step_percent() -> u8 { 10 }

fn default_trips_dir() -> PathBuf { PathBuf::from("./trips") }
fn default_export_gpx() -> bool { true }

fn default_poll_interval_ms() -> u64 { 1_000 }

fn default_log_level() -> String { "info".to_string() }

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            service_uuid: default_service_uuid(),
            characteristic_uuid: default_characteristic_uuid(),
            mtu: default_mtu(),
            scan_timeout_ms: default_scan_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            frame_buffer: default_frame_buffer(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            bucket_dir: default_bucket_dir(),
            state_dir: default_state_dir(),
            max_attempts: default_max_attempts(),
            base_retry_delay_ms: default_base_retry_delay_ms(),
            progress_step_percent: default_progress_step_percent(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            trips_dir: default_trips_dir(),
            export_gpx: default_export_gpx(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ble: BleConfig::default(),
            upload: UploadConfig::default(),
            storage: StorageConfig::default(),
            monitor: MonitorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl BleConfig {
    /// Scan window before giving up on discovery
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    /// Fixed delay before each reconnect attempt
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl UploadConfig {
    /// Base of the exponential retry backoff
    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }

    /// Persisted transfer record file
    pub fn records_path(&self) -> PathBuf {
        self.state_dir.join("transfers.json")
    }

    /// Local engine transfer table
    pub fn engine_table_path(&self) -> PathBuf {
        self.state_dir.join("engine.json")
    }
}

impl MonitorConfig {
    /// Status polling period
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Build a configuration error from a message
fn invalid(msg: impl std::fmt::Display) -> RecorderError {
    RecorderError::Config(toml::de::Error::custom(msg))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use fleet_recorder::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        if self.ble.device_name.trim().is_empty() {
            return Err(invalid("ble device_name cannot be empty"));
        }

        if self.ble.service_uuid.is_nil() || self.ble.characteristic_uuid.is_nil() {
            return Err(invalid("ble service and characteristic UUIDs cannot be nil"));
        }

        // 23 is the BLE default ATT MTU, 517 the maximum
        if self.ble.mtu < 23 || self.ble.mtu > 517 {
            return Err(invalid("mtu must be between 23 and 517"));
        }

        if self.ble.scan_timeout_ms == 0 || self.ble.scan_timeout_ms > 600_000 {
            return Err(invalid("scan_timeout_ms must be between 1 and 600000"));
        }

        if self.ble.reconnect_delay_ms == 0 || self.ble.reconnect_delay_ms > 60_000 {
            return Err(invalid("reconnect_delay_ms must be between 1 and 60000"));
        }

        if self.ble.frame_buffer == 0 {
            return Err(invalid("frame_buffer must be greater than 0"));
        }

        if self.upload.max_attempts == 0 || self.upload.max_attempts > 10 {
            return Err(invalid("max_attempts must be between 1 and 10"));
        }

        if self.upload.base_retry_delay_ms == 0 || self.upload.base_retry_delay_ms > 600_000 {
            return Err(invalid("base_retry_delay_ms must be between 1 and 600000"));
        }

        if self.upload.progress_step_percent == 0 || self.upload.progress_step_percent > 100 {
            return Err(invalid("progress_step_percent must be between 1 and 100"));
        }

        for (name, dir) in [
            ("bucket_dir", &self.upload.bucket_dir),
            ("state_dir", &self.upload.state_dir),
            ("trips_dir", &self.storage.trips_dir),
        ] {
            if dir.as_os_str().is_empty() {
                return Err(invalid(format!("{} cannot be empty", name)));
            }
        }

        if self.monitor.poll_interval_ms == 0 || self.monitor.poll_interval_ms > 60_000 {
            return Err(invalid("poll_interval_ms must be between 1 and 60000"));
        }

        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(invalid("log level must be one of: trace, debug, info, warn, error"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_from_file() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let toml_content = r#"
[ble]
device_name = "ESP32-TEST"
service_uuid = "4fafc201-1fb5-459e-8fcc-c5c9c331914b"

[upload]
max_attempts = 5

[storage]

[logging]
level = "debug"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.ble.device_name, "ESP32-TEST");
        assert_eq!(config.ble.service_uuid, default_service_uuid());
        assert_eq!(config.upload.max_attempts, 5);
        assert_eq!(config.upload.base_retry_delay_ms, 4_000);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.monitor.poll_interval_ms, 1_000);
    }

    #[test]
    fn test_load_empty_file_uses_defaults() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"").unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.ble.device_name, "ESP32-SENSOR-FUSION");
        assert_eq!(config.ble.reconnect_delay(), Duration::from_secs(3));
    }

    #[test]
    fn test_invalid_uuid_fails_to_parse() {
        let result: std::result::Result<Config, _> = toml::from_str(
            r#"
[ble]
service_uuid = "not-a-uuid"
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load("/nonexistent/fleet-recorder.toml");
        assert!(matches!(result, Err(RecorderError::Io(_))));
    }

    #[test]
    fn test_empty_device_name() {
        let mut config = Config::default();
        config.ble.device_name = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_nil_characteristic_uuid() {
        let mut config = Config::default();
        config.ble.characteristic_uuid = Uuid::nil();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mtu_bounds() {
        let mut config = Config::default();
        config.ble.mtu = 22;
        assert!(config.validate().is_err());

        config.ble.mtu = 518;
        assert!(config.validate().is_err());

        for mtu in [23, 100, 517] {
            config.ble.mtu = mtu;
            assert!(config.validate().is_ok(), "MTU {} should be valid", mtu);
        }
    }

    #[test]
    fn test_scan_timeout_zero() {
        let mut config = Config::default();
        config.ble.scan_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reconnect_delay_too_high() {
        let mut config = Config::default();
        config.ble.reconnect_delay_ms = 60_001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_frame_buffer_zero() {
        let mut config = Config::default();
        config.ble.frame_buffer = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_attempts_bounds() {
        let mut config = Config::default();
        config.upload.max_attempts = 0;
        assert!(config.validate().is_err());

        config.upload.max_attempts = 11;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_progress_step_zero() {
        let mut config = Config::default();
        config.upload.progress_step_percent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_trips_dir() {
        let mut config = Config::default();
        config.storage.trips_dir = PathBuf::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_poll_interval_zero() {
        let mut config = Config::default();
        config.monitor.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_state_paths() {
        let config = Config::default();
        assert_eq!(config.upload.records_path(), PathBuf::from("./state/transfers.json"));
        assert_eq!(config.upload.engine_table_path(), PathBuf::from("./state/engine.json"));
    }

    #[test]
    fn test_default_functions() {
        assert_eq!(default_device_name(), "ESP32-SENSOR-FUSION");
        assert_eq!(
            default_service_uuid().to_string(),
            "4fafc201-1fb5-459e-8fcc-c5c9c331914b"
        );
        assert_eq!(
            default_characteristic_uuid().to_string(),
            "beb5483e-36e1-4688-b7f5-ea07361b26a8"
        );
        assert_eq!(default_mtu(), 100);
        assert_eq!(default_scan_timeout_ms(), 60_000);
        assert_eq!(default_reconnect_delay_ms(), 3_000);
        assert_eq!(default_frame_buffer(), 64);
        assert_eq!(default_max_attempts(), 3);
        assert_eq!(default_base_retry_delay_ms(), 4_000);
        assert_eq!(default_progress_step_percent(), 10);
        assert_eq!(default_trips_dir(), PathBuf::from("./trips"));
        assert!(default_export_gpx());
        assert_eq!(default_poll_interval_ms(), 1_000);
        assert_eq!(default_log_level(), "info");
    }

    #[test]
    fn test_bundled_config_matches_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/default.toml");
        let config = Config::load(path).unwrap();
        let defaults = Config::default();

        assert_eq!(config.ble.device_name, defaults.ble.device_name);
        assert_eq!(config.ble.service_uuid, defaults.ble.service_uuid);
        assert_eq!(config.ble.characteristic_uuid, defaults.ble.characteristic_uuid);
        assert_eq!(config.ble.mtu, defaults.ble.mtu);
        assert_eq!(config.upload.max_attempts, defaults.upload.max_attempts);
        assert_eq!(config.upload.base_retry_delay(), defaults.upload.base_retry_delay());
        assert_eq!(config.storage.trips_dir, defaults.storage.trips_dir);
        assert_eq!(config.monitor.poll_interval(), defaults.monitor.poll_interval());
        assert!(config.logging.log_dir.is_none());
    }
}
