//! Logging configuration and subscriber bootstrap for the Buxton binaries.
//!
//! Defines the [`LogFormat`] enumeration used by the daemon and CLI along
//! with a once-only installer for the global `tracing` subscriber.

use std::io::{self, IsTerminal};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;
use tracing::Subscriber;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::{EnvFilter, fmt};

static LOGGING_GUARD: OnceCell<()> = OnceCell::new();

/// Supported logging output formats.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    /// Structured JSON suitable for ingestion by logging stacks.
    Json,
    /// Human-readable single line output.
    #[default]
    Compact,
}

/// Errors encountered while configuring logging.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// Failed to parse the configured log filter expression.
    #[error("invalid log filter: {0}")]
    Filter(String),
    /// Failed to install the tracing subscriber.
    #[error("failed to install logging subscriber: {0}")]
    Subscriber(#[from] SetGlobalDefaultError),
}

/// Installs the global tracing subscriber when invoked for the first time.
///
/// Repeated calls are idempotent; only the first invocation touches global
/// state.
///
/// # Errors
///
/// Returns [`LoggingError`] when the filter expression does not parse or
/// the subscriber cannot be installed.
pub fn init_logging(filter: &str, format: LogFormat) -> Result<(), LoggingError> {
    LOGGING_GUARD
        .get_or_try_init(|| install_subscriber(filter, format))
        .map(|_| ())
}

fn install_subscriber(filter: &str, format: LogFormat) -> Result<(), LoggingError> {
    let filter =
        EnvFilter::try_new(filter).map_err(|error| LoggingError::Filter(error.to_string()))?;

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal());

    let subscriber: Box<dyn Subscriber + Send + Sync> = match format {
        LogFormat::Json => Box::new(builder.json().flatten_event(true).finish()),
        LogFormat::Compact => Box::new(builder.compact().finish()),
    };

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
