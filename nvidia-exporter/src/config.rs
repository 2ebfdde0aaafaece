//! Configuration for the NVIDIA exporter.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding the polling interval.
pub const ENV_POLLING_INTERVAL: &str = "POLLING_INTERVAL_SECONDS";

/// Environment variable overriding the listen port.
pub const ENV_EXPORTER_PORT: &str = "EXPORTER_PORT";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Prometheus exporter settings.
    #[serde(default)]
    pub prometheus: PrometheusConfig,

    /// Sampling loop settings.
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Prometheus HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// Address to listen on (default: "0.0.0.0:9102").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for metrics endpoint (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,

    /// Metric name prefix (default: "nvidia").
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_listen() -> String {
    "0.0.0.0:9102".to_string()
}

fn default_path() -> String {
    "/metrics".to_string()
}

fn default_prefix() -> String {
    "nvidia".to_string()
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
            prefix: default_prefix(),
        }
    }
}

/// Sampling loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Seconds to sleep between cycles (default: 5).
    #[serde(default = "default_polling_interval")]
    pub polling_interval_secs: u64,

    /// Seconds a single cycle may run before it is reported as overrunning
    /// (default: 30).
    #[serde(default = "default_cycle_timeout")]
    pub cycle_timeout_secs: u64,
}

fn default_polling_interval() -> u64 {
    5
}

fn default_cycle_timeout() -> u64 {
    30
}

impl SamplingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            polling_interval_secs: default_polling_interval(),
            cycle_timeout_secs: default_cycle_timeout(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl ExporterConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ExporterConfig = json5::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ExporterConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `POLLING_INTERVAL_SECONDS` and `EXPORTER_PORT` from the process
    /// environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply environment overrides using `lookup` to resolve variables.
    ///
    /// `EXPORTER_PORT` replaces only the port of the listen address.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_POLLING_INTERVAL) {
            let secs = raw.trim().parse::<u64>().map_err(|_| {
                ConfigError::Validation(format!(
                    "{} must be a positive integer, got {:?}",
                    ENV_POLLING_INTERVAL, raw
                ))
            })?;
            self.sampling.polling_interval_secs = secs;
        }

        if let Some(raw) = lookup(ENV_EXPORTER_PORT) {
            let port = raw.trim().parse::<u16>().map_err(|_| {
                ConfigError::Validation(format!(
                    "{} must be a TCP port, got {:?}",
                    ENV_EXPORTER_PORT, raw
                ))
            })?;
            let mut addr = self.listen_addr()?;
            addr.set_port(port);
            self.prometheus.listen = addr.to_string();
        }

        self.validate()
    }

    /// Parsed listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.prometheus.listen.parse().map_err(|_| {
            ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.prometheus.listen
            ))
        })
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sampling.polling_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "polling_interval_secs must be > 0".to_string(),
            ));
        }

        if self.sampling.cycle_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "cycle_timeout_secs must be > 0".to_string(),
            ));
        }

        self.listen_addr()?;

        // Validate path starts with /
        if !self.prometheus.path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }

        if !is_valid_prefix(&self.prometheus.prefix) {
            return Err(ConfigError::Validation(format!(
                "Invalid metric prefix: {:?}",
                self.prometheus.prefix
            )));
        }

        Ok(())
    }
}

/// Prometheus metric names must match `[a-zA-Z_:][a-zA-Z0-9_:]*`. An empty
/// prefix disables prefixing.
fn is_valid_prefix(prefix: &str) -> bool {
    let mut chars = prefix.chars();
    match chars.next() {
        None => true,
        Some(first) if first.is_ascii_alphabetic() || first == '_' || first == ':' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
        }
        Some(_) => false,
    }
}
