//! Shared command setup: configuration, logging and the async runtime.

use std::path::{Path, PathBuf};

use bustrack::config::{config_file_path, ConfigFile};
use bustrack::logging::{self, LoggingGuard};
use tracing::info;

use crate::error::CliError;

/// Loaded configuration plus the resources a long-running command needs.
pub struct CliRunner {
    config: ConfigFile,
    config_path: PathBuf,
    _logging: LoggingGuard,
}

impl CliRunner {
    /// Load configuration from `config_path` (or the default location) and
    /// install logging.
    pub fn new(config_path: Option<&Path>) -> Result<Self, CliError> {
        let config_path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(config_file_path);
        let config = ConfigFile::load_from(&config_path)?;
        let logging = logging::init(&config.logging.level, Some(&config.logging.directory))?;

        Ok(Self {
            config,
            config_path,
            _logging: logging,
        })
    }

    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    pub fn log_startup(&self, command: &str) {
        info!(
            version = bustrack::VERSION,
            command,
            config = %self.config_path.display(),
            "bustrack starting"
        );
    }

    /// Single-threaded runtime; every command drives one session or view.
    pub fn runtime(&self) -> Result<tokio::runtime::Runtime, CliError> {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(CliError::Runtime)
    }
}
