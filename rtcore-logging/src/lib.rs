//! Structured logging setup for the real-time core

use thiserror::Error;
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

/// Output format of the installed subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per event (production)
    Json,
    /// Human-readable lines (development)
    #[default]
    Console,
}

/// Logging setup options
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Name attached to the first event
    pub service_name: String,
    /// Filter used when `RUST_LOG` is unset
    pub default_level: String,
    pub format: LogFormat,
}

impl LoggingConfig {
    pub fn new(service_name: &str, default_level: &str, format: LogFormat) -> Self {
        LoggingConfig {
            service_name: service_name.to_string(),
            default_level: default_level.to_string(),
            format,
        }
    }
}

/// Logging initialization errors
#[derive(Error, Debug)]
pub enum LoggingError {
    /// A global subscriber is already installed
    #[error("Failed to install subscriber: {0}")]
    Init(#[from] TryInitError),
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install a global subscriber, failing if one is already set
pub fn try_init(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = env_filter(&config.default_level);

    match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_current_span(false)
                    .with_span_list(false),
            )
            .try_init()?,
        LogFormat::Console => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()?,
    }

    tracing::info!(
        service = %config.service_name,
        format = ?config.format,
        "Logging initialized"
    );
    Ok(())
}

/// Initialize JSON logging for a core service
///
/// A second call is ignored with a warning instead of panicking.
pub fn init_logging(service_name: &str, default_level: &str) {
    let config = LoggingConfig::new(service_name, default_level, LogFormat::Json);
    if let Err(err) = try_init(&config) {
        tracing::warn!(service = service_name, error = %err, "Logging already initialized");
    }
}

/// Initialize console logging (for development and tests)
pub fn init_console_logging(service_name: &str, default_level: &str) {
    let config = LoggingConfig::new(service_name, default_level, LogFormat::Console);
    if let Err(err) = try_init(&config) {
        tracing::warn!(service = service_name, error = %err, "Logging already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_an_error() {
        let config = LoggingConfig::new("rtcore-test", "debug", LogFormat::Console);
        // The first install may race other tests in this binary; only the
        // repeated call is guaranteed to fail.
        let _ = try_init(&config);
        assert!(try_init(&config).is_err());
    }

    #[test]
    fn test_init_helpers_do_not_panic_when_repeated() {
        init_console_logging("rtcore-test", "info");
        init_logging("rtcore-test", "info");
    }
}
