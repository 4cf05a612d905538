//! Tracing subscriber assembly from [`LoggingConfig`].

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Installs the global tracing subscriber per config: level filter,
/// plain or JSON lines, console and/or file sinks.
///
/// Calling it twice is harmless; the second install is skipped.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("beacon={}", config.level)));

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.console {
        if config.json {
            layers.push(tracing_subscriber::fmt::layer().json().boxed());
        } else {
            layers.push(tracing_subscriber::fmt::layer().boxed());
        }
    }

    if let Some(path) = &config.file_path {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        let writer = Arc::new(file);

        if config.json {
            layers.push(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(writer)
                    .boxed(),
            );
        } else {
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer)
                    .boxed(),
            );
        }
    }

    // A second init (tests, embedders with their own subscriber) is
    // not an error.
    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init();

    Ok(())
}
