//! Tracing subscriber setup.
//!
//! Logs go to stderr and, when a directory is given, to a daily-rotated file
//! written on a background thread. `RUST_LOG` overrides the configured level.
//!
//! Keep the returned [`LoggingGuard`] alive for the life of the process;
//! dropping it flushes and stops the file writer.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{EnvFilter, ParseError};
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::prelude::*;

/// Base name of the rotated log files.
pub const LOG_FILE_PREFIX: &str = "bustrack.log";

/// Errors installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log filter '{filter}': {source}")]
    Filter {
        filter: String,
        #[source]
        source: ParseError,
    },

    #[error("Failed to create log directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("A global tracing subscriber is already installed")]
    AlreadyInitialized,
}

/// Keeps the background file writer running.
#[derive(Debug)]
pub struct LoggingGuard {
    _file_writer: Option<WorkerGuard>,
    log_directory: Option<PathBuf>,
}

impl LoggingGuard {
    /// Directory receiving log files, if file logging is on.
    pub fn log_directory(&self) -> Option<&Path> {
        self.log_directory.as_deref()
    }
}

/// Build the level filter: `RUST_LOG` if set, otherwise `default_level`.
pub fn build_filter(default_level: &str) -> Result<EnvFilter, LoggingError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(default_level).map_err(|source| LoggingError::Filter {
            filter: default_level.to_string(),
            source,
        }),
    }
}

/// Install the global subscriber.
pub fn init(level: &str, directory: Option<&Path>) -> Result<LoggingGuard, LoggingError> {
    let filter = build_filter(level)?;

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_timer(LocalTime::rfc_3339())
        .with_target(false);

    let (file_layer, file_writer) = match directory {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|source| LoggingError::Directory {
                path: dir.to_path_buf(),
                source,
            })?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(LocalTime::rfc_3339());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)?;

    Ok(LoggingGuard {
        _file_writer: file_writer,
        log_directory: directory.map(Path::to_path_buf),
    })
}
