//! Tracing Infrastructure
//!
//! Structured, async-aware logging for the cathode heating subsystem, built on the
//! `tracing` and `tracing-subscriber` crates. The control loop never decides how a
//! message is presented; it only emits events with `cathode`, `port` and `command` fields.
//! Level, line format and colour come from `[application]` in the configuration
//! (`log_level`, `log_format`, `log_ansi`); `RUST_LOG` overrides the level.
//!
//! # Example
//! ```no_run
//! use cathode_heating::{config::CathodeConfig, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CathodeConfig::load()?;
//! logging::init_from_config(&config)?;
//! info!(cathode = "A", "Heater output ON");
//! # Ok(())
//! # }
//! ```

use crate::config::{CathodeConfig, LogFormat};
use tracing::{debug, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// Subscriber settings resolved from the application configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Line format
    pub format: LogFormat,
    /// ANSI colours for the text formats
    pub ansi: bool,
}

impl LoggingConfig {
    /// Resolve the `[application]` logging settings.
    pub fn from_config(config: &CathodeConfig) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format,
            ansi: config.application.log_ansi,
        })
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(self.level)))
    }

    fn fmt_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        match self.format {
            LogFormat::Compact => fmt::layer().compact().with_ansi(self.ansi).boxed(),
            LogFormat::Pretty => fmt::layer().pretty().with_ansi(self.ansi).boxed(),
            LogFormat::Json => fmt::layer().json().with_ansi(false).boxed(),
        }
    }
}

/// Initialize tracing from the application configuration
pub fn init_from_config(config: &CathodeConfig) -> Result<(), String> {
    init(LoggingConfig::from_config(config)?)
}

/// Install the global subscriber.
///
/// A second call is a no-op that returns `Ok(())`: the first subscriber stays in place.
pub fn init(config: LoggingConfig) -> Result<(), String> {
    if tracing::dispatcher::has_been_set() {
        debug!("Global subscriber already installed; keeping it");
        return Ok(());
    }

    let layer = config.fmt_layer().with_filter(config.env_filter());
    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| format!("Failed to initialize tracing: {}", e))
}

/// Parse log level string into tracing Level
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    level.parse::<Level>().map_err(|_| {
        format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )
    })
}

fn level_to_filter_string(level: Level) -> String {
    level.as_str().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("trace"), Ok(Level::TRACE));
        assert_eq!(parse_log_level("warn"), Ok(Level::WARN));
        assert_eq!(parse_log_level("Debug"), Ok(Level::DEBUG));
        assert!(parse_log_level("verbose").is_err());
        assert_eq!(level_to_filter_string(Level::INFO), "info");
    }

    #[test]
    fn test_logging_config_from_application_config() {
        let mut config = CathodeConfig::default();
        config.application.log_level = "debug".to_string();
        config.application.log_format = LogFormat::Pretty;
        config.application.log_ansi = false;

        let logging = LoggingConfig::from_config(&config).unwrap();
        assert_eq!(
            logging,
            LoggingConfig {
                level: Level::DEBUG,
                format: LogFormat::Pretty,
                ansi: false,
            }
        );
    }

    #[test]
    fn test_every_format_builds_a_layer() {
        for format in [LogFormat::Compact, LogFormat::Pretty, LogFormat::Json] {
            let config = LoggingConfig {
                level: Level::INFO,
                format,
                ansi: false,
            };
            let _layer = config.fmt_layer();
        }
    }

    #[test]
    fn test_second_init_keeps_first_subscriber() {
        let mut config = CathodeConfig::default();
        config.application.log_format = LogFormat::Json;
        assert!(init_from_config(&config).is_ok());
        assert!(init_from_config(&config).is_ok());
        assert!(tracing::dispatcher::has_been_set());
    }
}
