//! Configuration system using Figment
//!
//! Strongly-typed, immutable settings for the sampling daemon. Configuration is
//! layered, later layers overriding earlier ones:
//! 1. Built-in defaults ([`Settings::default`])
//! 2. A TOML file (`config.toml` unless `--config` says otherwise)
//! 3. Environment variables prefixed with `NSIM_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! NSIM_APPLICATION__LOG_LEVEL=debug
//! NSIM_APPLICATION__SAMPLE_INTERVAL=5s
//! NSIM_DEVICES__DRY_MFC__PORT=/dev/ttyUSB0
//! ```
//!
//! # Example
//!
//! ```toml
//! [application]
//! log_dir = "data"
//! log_prefix = "nsim_log"
//! sample_interval = "1s"
//!
//! [devices.dry_mfc]
//! port = "/dev/ttyS3"
//! address = 1
//!
//! [devices.wet_mfc]
//! port = "/dev/ttyS4"
//! address = 2
//!
//! [devices.hygrometer]
//! port = "/dev/ttyS5"
//! baud_rate = 19200
//! ```
//!
//! A device section that is absent means the instrument is not configured; its
//! channels are always absent from the readings.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default station address of the dry-air flow controller.
pub const DEFAULT_DRY_MFC_ADDRESS: u8 = 1;
/// Default station address of the wet-air flow controller.
pub const DEFAULT_WET_MFC_ADDRESS: u8 = 2;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Figment could not load or extract the settings
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// Settings loaded but failed validation
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::LoadError(Box::new(err))
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Plot buffer settings
    #[serde(default)]
    pub plot: PlotConfig,
    /// Configured instruments
    #[serde(default)]
    pub devices: DeviceConfigs,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit diagnostics as JSON lines instead of human-readable text
    #[serde(default)]
    pub json_logs: bool,
    /// Directory for CSV data logs
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// File name prefix for CSV data logs
    #[serde(default = "default_log_prefix")]
    pub log_prefix: String,
    /// Time between acquisition cycles
    #[serde(default = "default_sample_interval", with = "humantime_serde")]
    pub sample_interval: Duration,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            log_dir: default_log_dir(),
            log_prefix: default_log_prefix(),
            sample_interval: default_sample_interval(),
        }
    }
}

/// Plot buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotConfig {
    /// Maximum number of readings kept for display
    #[serde(default = "default_max_points")]
    pub max_points: usize,
    /// Refresh cadence of the plot timer
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,
}

impl Default for PlotConfig {
    fn default() -> Self {
        Self {
            max_points: default_max_points(),
            refresh_interval: default_refresh_interval(),
        }
    }
}

/// The set of instruments this installation talks to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfigs {
    /// Dry-air mass flow controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_mfc: Option<FlowControllerConfig>,
    /// Wet-air mass flow controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wet_mfc: Option<FlowControllerConfig>,
    /// Chilled-mirror hygrometer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hygrometer: Option<HygrometerConfig>,
    /// Cell temperature probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_probe: Option<TemperatureProbeConfig>,
}

/// Parity modes for serial communication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
}

/// Line settings shared by every serial instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Path to the serial device (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Data bits (5-8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Parity setting
    #[serde(default)]
    pub parity: Parity,
    /// Stop bits (1 or 2)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Read timeout for a single transaction
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl SerialSettings {
    /// Settings for `port` with 9600 8N1 and a one second timeout.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: Parity::None,
            stop_bits: default_stop_bits(),
            timeout: default_read_timeout(),
        }
    }

    /// Set the read timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// True when both settings describe the same line configuration and read
    /// timeout (ignoring the port name).
    pub fn same_line_settings(&self, other: &SerialSettings) -> bool {
        self.timeout == other.timeout
            && self.baud_rate == other.baud_rate
            && self.data_bits == other.data_bits
            && self.parity == other.parity
            && self.stop_bits == other.stop_bits
    }

    fn validate(&self, device: &str) -> Result<(), ConfigError> {
        if self.port.trim().is_empty() {
            return Err(invalid(format!("{device}: port must not be empty")));
        }
        if self.baud_rate == 0 {
            return Err(invalid(format!("{device}: baud_rate must be non-zero")));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(invalid(format!(
                "{device}: data_bits must be 5-8, got {}",
                self.data_bits
            )));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(invalid(format!(
                "{device}: stop_bits must be 1 or 2, got {}",
                self.stop_bits
            )));
        }
        if self.timeout.is_zero() {
            return Err(invalid(format!("{device}: timeout must be non-zero")));
        }
        Ok(())
    }
}

/// Mass flow controller (Modbus RTU over RS-485)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "FlowControllerSection")]
pub struct FlowControllerConfig {
    /// Serial line settings
    #[serde(flatten)]
    pub serial: SerialSettings,
    /// Station address on the bus; dry defaults to 1, wet to 2
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<u8>,
    /// Reverse register order of float pairs
    #[serde(default)]
    pub word_swap: bool,
    /// Bus settle delay after opening the port
    #[serde(default = "default_mfc_settle", with = "humantime_serde")]
    pub settle: Duration,
}

impl FlowControllerConfig {
    /// Config for `port` with defaults for everything else.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            serial: SerialSettings::new(port).with_timeout(default_mfc_timeout()),
            address: None,
            word_swap: false,
            settle: default_mfc_settle(),
        }
    }
}

/// `[devices.*_mfc]` as written in the file. The controllers answer quickly, so
/// their read timeout defaults shorter than other serial devices.
#[derive(Deserialize)]
struct FlowControllerSection {
    #[serde(flatten)]
    serial: SerialSettings,
    #[serde(default, with = "humantime_serde::option")]
    timeout: Option<Duration>,
    #[serde(default)]
    address: Option<u8>,
    #[serde(default)]
    word_swap: bool,
    #[serde(default = "default_mfc_settle", with = "humantime_serde")]
    settle: Duration,
}

impl From<FlowControllerSection> for FlowControllerConfig {
    fn from(section: FlowControllerSection) -> Self {
        Self {
            serial: section
                .serial
                .with_timeout(section.timeout.unwrap_or_else(default_mfc_timeout)),
            address: section.address,
            word_swap: section.word_swap,
            settle: section.settle,
        }
    }
}

/// Chilled-mirror hygrometer (ASCII over RS-232)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HygrometerConfig {
    /// Serial line settings
    #[serde(flatten)]
    pub serial: SerialSettings,
    /// How long a poll waits for a matching line
    #[serde(default = "default_poll_window", with = "humantime_serde")]
    pub poll_window: Duration,
    /// Settle delay after opening the port
    #[serde(default = "default_ascii_settle", with = "humantime_serde")]
    pub settle: Duration,
}

impl HygrometerConfig {
    /// Config for `port` with defaults for everything else.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            serial: SerialSettings::new(port),
            poll_window: default_poll_window(),
            settle: default_ascii_settle(),
        }
    }
}

/// Cell temperature probe (ASCII over RS-232)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemperatureProbeConfig {
    /// Serial line settings
    #[serde(flatten)]
    pub serial: SerialSettings,
    /// Command that requests one reading
    #[serde(default = "default_probe_command")]
    pub poll_command: String,
    /// How long a poll waits for a matching line
    #[serde(default = "default_poll_window", with = "humantime_serde")]
    pub poll_window: Duration,
    /// Settle delay after opening the port
    #[serde(default = "default_ascii_settle", with = "humantime_serde")]
    pub settle: Duration,
}

impl TemperatureProbeConfig {
    /// Config for `port` with defaults for everything else.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            serial: SerialSettings::new(port),
            poll_command: default_probe_command(),
            poll_window: default_poll_window(),
            settle: default_ascii_settle(),
        }
    }
}

impl DeviceConfigs {
    /// Station address of the dry-air controller.
    pub fn dry_address(&self) -> Option<u8> {
        self.dry_mfc
            .as_ref()
            .map(|c| c.address.unwrap_or(DEFAULT_DRY_MFC_ADDRESS))
    }

    /// Station address of the wet-air controller.
    pub fn wet_address(&self) -> Option<u8> {
        self.wet_mfc
            .as_ref()
            .map(|c| c.address.unwrap_or(DEFAULT_WET_MFC_ADDRESS))
    }

    /// True when no instrument is configured at all.
    pub fn is_empty(&self) -> bool {
        self.dry_mfc.is_none()
            && self.wet_mfc.is_none()
            && self.hygrometer.is_none()
            && self.temperature_probe.is_none()
    }
}

impl Settings {
    /// Load settings from `path` (if it exists) layered over defaults and under
    /// `NSIM_` environment overrides, then validate.
    ///
    /// A missing file is not an error; callers decide whether to warn about it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if path.exists() {
            figment = figment.merge(Toml::file(path));
        }
        let settings: Settings = figment.merge(Env::prefixed("NSIM_").split("__")).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML document layered over defaults, then validate.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::string(toml))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Render the effective settings as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| invalid(e.to_string()))
    }

    /// Semantic checks that parsing alone cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application.sample_interval.is_zero() {
            return Err(invalid("application.sample_interval must be non-zero"));
        }
        if self.plot.max_points == 0 {
            return Err(invalid("plot.max_points must be at least 1"));
        }
        if self.plot.refresh_interval.is_zero() {
            return Err(invalid("plot.refresh_interval must be non-zero"));
        }

        let mfcs = [
            ("dry_mfc", self.devices.dry_mfc.as_ref(), self.devices.dry_address()),
            ("wet_mfc", self.devices.wet_mfc.as_ref(), self.devices.wet_address()),
        ];
        for (name, cfg, address) in mfcs {
            let (Some(cfg), Some(address)) = (cfg, address) else {
                continue;
            };
            cfg.serial.validate(name)?;
            if !(1..=247).contains(&address) {
                return Err(invalid(format!(
                    "{name}: address must be 1-247, got {address}"
                )));
            }
        }

        if let (Some(dry), Some(wet)) = (&self.devices.dry_mfc, &self.devices.wet_mfc) {
            if dry.serial.port == wet.serial.port {
                if self.devices.dry_address() == self.devices.wet_address() {
                    return Err(invalid(format!(
                        "dry_mfc and wet_mfc share {} with the same address",
                        dry.serial.port
                    )));
                }
                if !dry.serial.same_line_settings(&wet.serial) {
                    return Err(invalid(format!(
                        "dry_mfc and wet_mfc share {} with different line settings or timeouts",
                        dry.serial.port
                    )));
                }
            }
        }

        if let Some(hygrometer) = &self.devices.hygrometer {
            hygrometer.serial.validate("hygrometer")?;
            if hygrometer.poll_window.is_zero() {
                return Err(invalid("hygrometer: poll_window must be non-zero"));
            }
        }

        if let Some(probe) = &self.devices.temperature_probe {
            probe.serial.validate("temperature_probe")?;
            if probe.poll_window.is_zero() {
                return Err(invalid("temperature_probe: poll_window must be non-zero"));
            }
            if probe.poll_command.trim().is_empty() {
                return Err(invalid("temperature_probe: poll_command must not be empty"));
            }
        }

        // Only the Modbus controllers can share a bus
        let mut line_ports = Vec::new();
        if let Some(h) = &self.devices.hygrometer {
            line_ports.push(("hygrometer", h.serial.port.as_str()));
        }
        if let Some(p) = &self.devices.temperature_probe {
            line_ports.push(("temperature_probe", p.serial.port.as_str()));
        }
        let all_ports: Vec<&str> = [
            self.devices.dry_mfc.as_ref().map(|c| c.serial.port.as_str()),
            self.devices.wet_mfc.as_ref().map(|c| c.serial.port.as_str()),
            self.devices.hygrometer.as_ref().map(|c| c.serial.port.as_str()),
            self.devices
                .temperature_probe
                .as_ref()
                .map(|c| c.serial.port.as_str()),
        ]
        .into_iter()
        .flatten()
        .collect();
        for (name, port) in line_ports {
            if all_ports.iter().filter(|p| **p == port).count() > 1 {
                return Err(invalid(format!("{name}: port {port} is used by another device")));
            }
        }

        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(msg.into())
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_log_prefix() -> String {
    "nsim_log".to_string()
}

fn default_sample_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_points() -> usize {
    500
}

fn default_refresh_interval() -> Duration {
    Duration::from_millis(1000)
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_mfc_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_mfc_settle() -> Duration {
    Duration::from_millis(500)
}

fn default_ascii_settle() -> Duration {
    Duration::from_secs(1)
}

fn default_poll_window() -> Duration {
    Duration::from_secs(1)
}

fn default_probe_command() -> String {
    "T".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [application]
        log_prefix = "cell_a"
        sample_interval = "5s"

        [devices.dry_mfc]
        port = "/dev/ttyS3"

        [devices.wet_mfc]
        port = "/dev/ttyS4"
        timeout = "250ms"

        [devices.hygrometer]
        port = "/dev/ttyS5"
        baud_rate = 19200
    "#;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert!(settings.devices.is_empty());
        assert_eq!(settings.application.log_prefix, "nsim_log");
        assert_eq!(settings.plot.max_points, 500);
    }

    #[test]
    fn test_parse_sample_config() {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        assert_eq!(settings.application.sample_interval, Duration::from_secs(5));
        assert_eq!(settings.application.log_dir, PathBuf::from("data"));
        assert_eq!(settings.devices.dry_address(), Some(1));
        assert_eq!(settings.devices.wet_address(), Some(2));

        let wet = settings.devices.wet_mfc.as_ref().unwrap();
        assert_eq!(wet.serial.timeout, Duration::from_millis(250));
        assert_eq!(wet.serial.parity, Parity::None);

        let hygrometer = settings.devices.hygrometer.as_ref().unwrap();
        assert_eq!(hygrometer.serial.baud_rate, 19200);
        assert_eq!(hygrometer.poll_window, Duration::from_secs(1));
        assert!(settings.devices.temperature_probe.is_none());
    }

    #[test]
    fn test_rejects_address_out_of_range() {
        let err = Settings::from_toml_str(
            r#"
            [devices.dry_mfc]
            port = "/dev/ttyS3"
            address = 0
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("address must be 1-247"));
    }

    #[test]
    fn test_rejects_shared_bus_with_same_address() {
        let err = Settings::from_toml_str(
            r#"
            [devices.dry_mfc]
            port = "/dev/ttyUSB0"
            address = 3

            [devices.wet_mfc]
            port = "/dev/ttyUSB0"
            address = 3
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("same address"));
    }

    #[test]
    fn test_shared_bus_with_distinct_addresses_is_valid() {
        let settings = Settings::from_toml_str(
            r#"
            [devices.dry_mfc]
            port = "/dev/ttyUSB0"

            [devices.wet_mfc]
            port = "/dev/ttyUSB0"
            "#,
        )
        .unwrap();
        assert_ne!(settings.devices.dry_address(), settings.devices.wet_address());
    }

    #[test]
    fn test_mfc_timeout_defaults_to_half_a_second() {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        let dry = settings.devices.dry_mfc.as_ref().unwrap();
        assert_eq!(dry.serial.timeout, Duration::from_millis(500));
        assert_eq!(dry.serial.timeout, FlowControllerConfig::new("/dev/ttyS3").serial.timeout);
        let hygrometer = settings.devices.hygrometer.as_ref().unwrap();
        assert_eq!(hygrometer.serial.timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_rejects_shared_bus_with_different_timeouts() {
        let err = Settings::from_toml_str(
            r#"
            [devices.dry_mfc]
            port = "/dev/ttyUSB0"

            [devices.wet_mfc]
            port = "/dev/ttyUSB0"
            timeout = "2s"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("different line settings or timeouts"));
    }

    #[test]
    fn test_rejects_hygrometer_on_modbus_port() {
        let err = Settings::from_toml_str(
            r#"
            [devices.dry_mfc]
            port = "/dev/ttyUSB0"

            [devices.hygrometer]
            port = "/dev/ttyUSB0"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("used by another device"));
    }

    #[test]
    fn test_rejects_zero_interval() {
        let err = Settings::from_toml_str(
            r#"
            [application]
            sample_interval = "0s"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_toml_round_trip() {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        let rendered = settings.to_toml().unwrap();
        let reparsed = Settings::from_toml_str(&rendered).unwrap();
        assert_eq!(
            reparsed.devices.hygrometer.unwrap().serial,
            settings.devices.hygrometer.unwrap().serial
        );
        assert_eq!(
            reparsed.devices.wet_mfc.unwrap().serial.timeout,
            Duration::from_millis(250)
        );
    }
}
