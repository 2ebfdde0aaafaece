//! Tracing subscriber setup.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::ExporterError;

/// Build the filter: `RUST_LOG` when set, otherwise the configured level for
/// this crate with dependencies held at `warn`.
fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,nvidia_exporter={}", level)))
}

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
pub fn init_tracing(config: &LoggingConfig) -> Result<(), ExporterError> {
    let filter = build_filter(&config.level);

    match config.format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .try_init(),
    }
    .map_err(|e| ExporterError::Tracing(e.to_string()))
}
