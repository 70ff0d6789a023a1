//! Configuration System using Figment
//!
//! Strongly-typed configuration for the cathode heating subsystem.
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, `config/cathode.toml` by default)
//! 2. Environment variables (prefixed with `CATHODE_`, nested keys separated by `__`)
//!
//! # Example
//! ```no_run
//! use cathode_heating::config::CathodeConfig;
//!
//! let config = CathodeConfig::load()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), figment::Error>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::cathode::MAX_CHANNELS;

/// Number of temperature samples retained per channel.
pub const MAX_POINTS: usize = 20;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CathodeConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Serial settings shared by every heater power supply
    #[serde(default)]
    pub power_supply: PowerSupplyConfig,
    /// One entry per physical cathode
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    /// Overtemperature polling
    #[serde(default)]
    pub safety: SafetyConfig,
    /// Voltage ramping
    #[serde(default)]
    pub ramp: RampConfig,
    /// Fitted cathode curves
    #[serde(default)]
    pub models: ModelsConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log line format
    #[serde(default)]
    pub log_format: LogFormat,
    /// Colour log output (ignored for JSON)
    #[serde(default = "default_log_ansi")]
    pub log_ansi: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Cathode Heating".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
            log_ansi: default_log_ansi(),
        }
    }
}

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Single-line human-readable output
    #[default]
    Compact,
    /// Multi-line output for interactive sessions
    Pretty,
    /// One JSON object per event
    Json,
}

fn default_log_ansi() -> bool {
    true
}

/// Serial line settings for the 9014 supplies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerSupplyConfig {
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Per-command response timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Answer every command with a synthetic placeholder instead of opening the port
    #[serde(default)]
    pub mock: bool,
}

impl Default for PowerSupplyConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            timeout_ms: default_timeout_ms(),
            mock: false,
        }
    }
}

impl PowerSupplyConfig {
    /// Response timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Per-cathode configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Display label (A, B, C)
    pub label: String,
    /// Serial port of this cathode's heater supply
    pub port: String,
    /// Overtemperature threshold in °C
    #[serde(default = "default_overtemp_limit")]
    pub overtemp_limit_c: f64,
    /// Overvoltage protection limit in V
    #[serde(default = "default_overvoltage_limit")]
    pub overvoltage_limit_v: f64,
    /// Overcurrent protection limit in A
    #[serde(default = "default_overcurrent_limit")]
    pub overcurrent_limit_a: f64,
}

impl ChannelConfig {
    /// Channel with default limits on the given port.
    pub fn new(label: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            port: port.into(),
            overtemp_limit_c: default_overtemp_limit(),
            overvoltage_limit_v: default_overvoltage_limit(),
            overcurrent_limit_a: default_overcurrent_limit(),
        }
    }
}

/// Safety poll configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Poll period in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Temperature samples kept per channel
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Switch the heater output off when a channel trips overtemperature
    #[serde(default)]
    pub auto_shutdown_on_overtemp: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            history_capacity: default_history_capacity(),
            auto_shutdown_on_overtemp: false,
        }
    }
}

impl SafetyConfig {
    /// Poll period as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Voltage ramp configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RampConfig {
    /// Fixed voltage step in V
    #[serde(default = "default_step_v")]
    pub step_v: f64,
    /// Default ramp rate in V/s
    #[serde(default = "default_rate")]
    pub default_rate_v_per_s: f64,
    /// Read the present output voltage with GETD before ramping instead of
    /// trusting the last commanded setpoint
    #[serde(default)]
    pub read_back_start: bool,
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            step_v: default_step_v(),
            default_rate_v_per_s: default_rate(),
            read_back_start: false,
        }
    }
}

/// A fitted curve as ordered sample tables
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CurveConfig {
    /// Independent samples
    pub x: Vec<f64>,
    /// Dependent samples, in physical units
    pub y: Vec<f64>,
    /// Interpolate the dependent axis in log10 space
    #[serde(default)]
    pub log_transform: bool,
}

/// Cathode curve tables
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelsConfig {
    /// Heater current (A) to heater voltage (V)
    #[serde(default)]
    pub heater_voltage: CurveConfig,
    /// Heater current (A) to emission current (A), log-transformed
    #[serde(default)]
    pub emission_current: CurveConfig,
    /// Heater current (A) to true temperature (K)
    #[serde(default)]
    pub true_temperature: CurveConfig,
}

// Default value functions
fn default_baud_rate() -> u32 {
    9600
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_overtemp_limit() -> f64 {
    200.0
}

fn default_overvoltage_limit() -> f64 {
    50.0
}

fn default_overcurrent_limit() -> f64 {
    10.0
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_history_capacity() -> usize {
    MAX_POINTS
}

fn default_step_v() -> f64 {
    0.1
}

fn default_rate() -> f64 {
    0.01
}

impl CathodeConfig {
    /// Load configuration from `config/cathode.toml` and environment variables
    ///
    /// Environment variables override file values with prefix `CATHODE_`.
    /// Example: `CATHODE_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from("config/cathode.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(CathodeConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CATHODE_").split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.channels.len() > MAX_CHANNELS {
            return Err(format!(
                "At most {} cathode channels are supported, got {}",
                MAX_CHANNELS,
                self.channels.len()
            ));
        }

        let mut labels = std::collections::HashSet::new();
        for channel in &self.channels {
            if !labels.insert(&channel.label) {
                return Err(format!("Duplicate channel label: {}", channel.label));
            }
        }

        if self.power_supply.timeout_ms == 0 {
            return Err("power_supply.timeout_ms must be positive".to_string());
        }
        if self.safety.poll_interval_ms == 0 {
            return Err("safety.poll_interval_ms must be positive".to_string());
        }
        if self.safety.history_capacity == 0 {
            return Err("safety.history_capacity must be positive".to_string());
        }
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(self.ramp.step_v) || !positive(self.ramp.default_rate_v_per_s) {
            return Err("ramp.step_v and ramp.default_rate_v_per_s must be positive".to_string());
        }

        for (name, curve) in [
            ("heater_voltage", &self.models.heater_voltage),
            ("emission_current", &self.models.emission_current),
            ("true_temperature", &self.models.true_temperature),
        ] {
            if curve.x.len() != curve.y.len() {
                return Err(format!(
                    "models.{name}: x has {} samples but y has {}",
                    curve.x.len(),
                    curve.y.len()
                ));
            }
        }

        Ok(())
    }
}
