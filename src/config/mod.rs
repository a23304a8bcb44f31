//! Configuration management for pathsteer.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::multipath::SelectorConfig;
use crate::probe::{ProbeConfig, MIN_PAYLOAD_SIZE};
use crate::routing::RouterConfig;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Probe configuration.
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Path selection configuration.
    #[serde(default)]
    pub selection: SelectorConfig,

    /// Router configuration.
    #[serde(default)]
    pub router: RouterConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))?;

        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.selection.window_size == 0 {
            return Err(Error::InvalidConfig("selection.window_size must be at least 1".into()));
        }

        if !(self.selection.reroute_ratio >= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "selection.reroute_ratio must be >= 1.0, got {}",
                self.selection.reroute_ratio
            )));
        }

        if self.selection.route_delete_loss_threshold > 100 {
            return Err(Error::InvalidConfig(format!(
                "selection.route_delete_loss_threshold is a percentage, got {}",
                self.selection.route_delete_loss_threshold
            )));
        }

        if self.probe.payload_size < MIN_PAYLOAD_SIZE {
            return Err(Error::InvalidConfig(format!(
                "probe.payload_size must be at least {MIN_PAYLOAD_SIZE} bytes"
            )));
        }

        if self.probe.timeout.is_zero() || self.probe.timeout >= self.probe.interval {
            return Err(Error::InvalidConfig(
                "probe.timeout must be non-zero and shorter than probe.interval".into(),
            ));
        }

        if self.router.apply_interval.is_zero() {
            return Err(Error::InvalidConfig("router.apply_interval must be non-zero".into()));
        }

        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text or json).
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable colored output.
    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_color(),
        }
    }
}

/// Initialize logging for an embedding binary.
///
/// Installs the global subscriber, so it succeeds once per process.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    } else {
        subscriber
            .with(fmt::layer().with_ansi(config.color))
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    }

    Ok(())
}
