//! Application configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. A TOML file (default `config/visa_vulture.toml`, optional)
//! 2. Environment variables prefixed with `VISA_VULTURE_` (nested keys use `__`)
//!
//! Every field has a default, so an absent file yields a usable configuration.
//!
//! # Example
//! ```no_run
//! use visa_vulture::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! config.validate()?;
//! println!("Simulation mode: {}", config.simulation_mode);
//! # Ok::<(), visa_vulture::error::VultureError>(())
//! ```

use crate::error::{VultureError, VultureResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/visa_vulture.toml";

/// Top-level application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Use the in-process simulated instruments instead of real resources
    pub simulation_mode: bool,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
    /// Optional file receiving log output instead of stdout
    pub log_file: Option<PathBuf>,
    /// Poll interval of the run loop's interruptible sleep
    pub poll_interval_ms: u64,
    /// Instrument connection settings
    pub connection: ConnectionSettings,
    /// Resource strings offered by a resource scan
    pub resources: Vec<String>,
    /// Soft limits producing warnings when a plan is loaded
    pub validation_limits: SoftLimits,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            simulation_mode: false,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            log_file: None,
            poll_interval_ms: 100,
            connection: ConnectionSettings::default(),
            resources: Vec::new(),
            validation_limits: SoftLimits::default(),
        }
    }
}

/// Per-resource communication settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Read/write timeout in milliseconds
    pub timeout_ms: u64,
    /// Terminator expected at the end of responses
    pub read_termination: String,
    /// Terminator appended to every command
    pub write_termination: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            read_termination: "\n".to_string(),
            write_termination: "\n".to_string(),
        }
    }
}

impl ConnectionSettings {
    /// Timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Warning thresholds. Values outside them still load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SoftLimits {
    /// Signal generator thresholds
    pub signal_generator: SignalGeneratorSoftLimits,
    /// Power supply thresholds
    pub power_supply: PowerSupplySoftLimits,
    /// Thresholds shared by every plan type
    pub common: CommonSoftLimits,
}

/// Signal generator warning thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalGeneratorSoftLimits {
    /// Below typical noise floor
    pub power_min_dbm: f64,
    /// Above typical equipment limits
    pub power_max_dbm: f64,
    /// Unusually low frequency
    pub frequency_min_hz: f64,
    /// Above typical equipment range
    pub frequency_max_hz: f64,
}

impl Default for SignalGeneratorSoftLimits {
    fn default() -> Self {
        Self {
            power_min_dbm: -100.0,
            power_max_dbm: 30.0,
            frequency_min_hz: 1.0,
            frequency_max_hz: 50e9,
        }
    }
}

/// Power supply warning thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerSupplySoftLimits {
    /// Above typical lab supply
    pub voltage_max_v: f64,
    /// Above typical lab supply
    pub current_max_a: f64,
}

impl Default for PowerSupplySoftLimits {
    fn default() -> Self {
        Self {
            voltage_max_v: 100.0,
            current_max_a: 50.0,
        }
    }
}

/// Warning thresholds for every plan type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommonSoftLimits {
    /// 24 hours; longer steps are unusual
    pub duration_max_s: f64,
}

impl Default for CommonSoftLimits {
    fn default() -> Self {
        Self {
            duration_max_s: 86_400.0,
        }
    }
}

impl AppConfig {
    /// Load from the default file location and the environment.
    pub fn load() -> VultureResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment.
    ///
    /// Environment variables override the file, e.g.
    /// `VISA_VULTURE_LOG_LEVEL=debug` or `VISA_VULTURE_CONNECTION__TIMEOUT_MS=2000`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> VultureResult<Self> {
        let config = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("VISA_VULTURE_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parse configuration from TOML text (no environment overrides).
    pub fn from_toml_str(toml: &str) -> VultureResult<Self> {
        let config = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::string(toml))
            .extract()?;
        Ok(config)
    }

    /// Check semantic constraints, reporting every violation at once.
    pub fn validate(&self) -> VultureResult<()> {
        let mut errors = Vec::new();

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            errors.push(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.log_format.to_lowercase().as_str()) {
            errors.push(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.poll_interval_ms < 10 {
            errors.push(format!(
                "poll_interval_ms must be >= 10, got {}",
                self.poll_interval_ms
            ));
        }

        if self.connection.timeout_ms == 0 {
            errors.push("connection.timeout_ms must be > 0".to_string());
        }

        let sg = &self.validation_limits.signal_generator;
        if sg.power_min_dbm >= sg.power_max_dbm {
            errors.push(format!(
                "validation_limits.signal_generator.power_min_dbm ({}) must be below power_max_dbm ({})",
                sg.power_min_dbm, sg.power_max_dbm
            ));
        }
        if sg.frequency_min_hz >= sg.frequency_max_hz {
            errors.push(format!(
                "validation_limits.signal_generator.frequency_min_hz ({}) must be below frequency_max_hz ({})",
                sg.frequency_min_hz, sg.frequency_max_hz
            ));
        }

        let ps = &self.validation_limits.power_supply;
        if ps.voltage_max_v <= 0.0 {
            errors.push("validation_limits.power_supply.voltage_max_v must be > 0".to_string());
        }
        if ps.current_max_a <= 0.0 {
            errors.push("validation_limits.power_supply.current_max_a must be > 0".to_string());
        }
        if self.validation_limits.common.duration_max_s <= 0.0 {
            errors.push("validation_limits.common.duration_max_s must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(VultureError::Configuration(errors.join("; ")))
        }
    }

    /// Poll interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
