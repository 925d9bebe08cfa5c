//! Structured logging setup
//!
//! JSON or human-readable output on STDOUT, optionally mirrored to an
//! append-only file. `RUST_LOG` takes precedence over the configured level.

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::sync::Arc;
use tracing::Subscriber;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

type BoxedSubscriber = Box<dyn Subscriber + Send + Sync>;

/// Initialize logging based on configuration.
///
/// # Arguments
///
/// * `config` - Logging configuration
///
/// # Errors
///
/// Returns error if the level is not a valid filter, the log file cannot be
/// opened, or a global subscriber is already installed.
///
/// # Examples
///
/// ```no_run
/// use kafka_events::config::LoggingConfig;
/// use kafka_events::logging::init_logging;
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     json_format: true,
///     file_path: None,
/// };
///
/// init_logging(&config).unwrap();
/// ```
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    build_subscriber(config)?
        .try_init()
        .context("Failed to install log subscriber")
}

/// Builds the subscriber without installing it.
fn build_subscriber(config: &LoggingConfig) -> Result<BoxedSubscriber> {
    let env_filter = build_filter(&config.level)?;

    let file = match &config.file_path {
        Some(path) => Some(Arc::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?,
        )),
        None => None,
    };

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.json_format {
        let stdout_layer = fmt::layer().json().with_current_span(true);
        let file_layer = file.map(|f| fmt::layer().json().with_current_span(true).with_writer(f));
        Ok(Box::new(registry.with(stdout_layer).with(file_layer)))
    } else {
        let stdout_layer = fmt::layer().with_target(true).with_level(true);
        let file_layer = file.map(|f| {
            fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(f)
        });
        Ok(Box::new(registry.with(stdout_layer).with(file_layer)))
    }
}

fn build_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level: {}", level))
}
