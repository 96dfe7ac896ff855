//! Logging initialisation.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::{LogFormat, LogSettings};

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log filter '{directive}': {reason}")]
    InvalidFilter { directive: String, reason: String },

    #[error("Failed to install log subscriber: {0}")]
    Install(String),
}

/// Builds the filter from `RUST_LOG`, falling back to the configured level.
pub fn build_filter(settings: &LogSettings) -> Result<EnvFilter, TelemetryError> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .map_err(|e| TelemetryError::InvalidFilter {
            directive: settings.level.clone(),
            reason: e.to_string(),
        })
}

/// Installs the global subscriber and bridges `log` records into it.
///
/// Fails when a global subscriber or logger is already installed.
pub fn init_logging(settings: &LogSettings) -> Result<(), TelemetryError> {
    let filter = build_filter(settings)?;

    let fmt_layer = match settings.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .boxed(),
    };

    tracing_log::LogTracer::init().map_err(|e| TelemetryError::Install(e.to_string()))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TelemetryError::Install(e.to_string()))
}
