//! Logging setup using tracing.

use crate::config::LoggingConfig;
use crate::{Error, Result};
use std::fs::OpenOptions;
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn filter(level: &str, verbose: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let directive = if verbose {
        "evostate=debug".to_string()
    } else {
        format!("evostate={}", level)
    };
    EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("evostate=info"))
}

/// Install a stderr subscriber. `RUST_LOG` overrides the configured level.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    if let Some(file) = &config.file {
        return init_file_logging(file, config);
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter(&config.level, config.verbose))
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| Error::Configuration {
            reason: format!("failed to install logger: {}", e),
        })
}

/// Install a subscriber appending to `log_file`
pub fn init_file_logging(log_file: &Path, config: &LoggingConfig) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)?;

    tracing_subscriber::fmt()
        .with_env_filter(filter(&config.level, config.verbose))
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .try_init()
        .map_err(|e| Error::Configuration {
            reason: format!("failed to install logger: {}", e),
        })
}
