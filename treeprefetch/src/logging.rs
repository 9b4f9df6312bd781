//! Tracing subscriber setup.
//!
//! The library only emits `tracing` events; binaries call [`init_logging`]
//! once at startup to print them and, optionally, write them to a daily
//! rolling log file.

use std::path::PathBuf;

use time::format_description::well_known::Rfc3339;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::error::PrefetchError;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Prefix of rolling log file names.
pub const DEFAULT_LOG_FILE_PREFIX: &str = "treeprefetch.log";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Level for this crate's events, e.g. `info` or `debug`.
    pub level: String,
    /// Directory for rolling log files; console only when `None`.
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            directory: None,
            file_prefix: DEFAULT_LOG_FILE_PREFIX.to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    /// Filter directives applied when `RUST_LOG` is unset.
    pub fn default_directives(&self) -> String {
        format!("treeprefetch={}", self.level)
    }
}

/// Installs the global subscriber.
///
/// Returns the file appender's guard when a log directory is configured;
/// buffered lines are flushed when the guard is dropped, so keep it alive
/// for the lifetime of the process.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>, PrefetchError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.default_directives()))
        .map_err(|e| PrefetchError::Config(format!("invalid log level: {}", e)))?;

    let console = tracing_subscriber::fmt::layer()
        .with_timer(LocalTime::new(Rfc3339))
        .with_target(true);

    let (file_layer, guard) = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                PrefetchError::Config(format!("cannot create log directory {}: {}", dir.display(), e))
            })?;
            let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_timer(LocalTime::new(Rfc3339))
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| PrefetchError::Config(format!("logging already initialised: {}", e)))?;

    Ok(guard)
}
