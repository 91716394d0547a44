//! CLI error type.

use std::io;
use std::path::PathBuf;

use bustrack::config::ConfigError;
use bustrack::logging::LoggingError;
use bustrack::route_search::HistoryError;
use bustrack::session::SessionError;
use bustrack::store::StoreError;
use bustrack::trip::TripError;
use thiserror::Error;

/// Errors surfaced by CLI commands. Every variant exits with status 1.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Config(String),

    #[error(transparent)]
    ConfigFile(#[from] ConfigError),

    #[error(transparent)]
    Logging(#[from] LoggingError),

    #[error("Failed to start async runtime: {0}")]
    Runtime(#[source] io::Error),

    #[error("Failed to read {path}: {source}")]
    ReadInput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    ParseInput {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write {path}: {source}")]
    WriteOutput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Replay failed: {0}")]
    Replay(String),

    #[error(transparent)]
    Trip(#[from] TripError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    History(#[from] HistoryError),
}
