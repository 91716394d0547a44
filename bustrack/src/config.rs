//! INI configuration file.
//!
//! Settings live in `<config_dir>/bustrack/config.ini`:
//!
//! ```ini
//! [tracking]
//! min_interval_ms = 5000
//! high_accuracy = true
//! timeout_ms = 30000
//! max_fix_age_ms = 5000
//! max_accuracy_m = 999.99
//! seed_on_start = false
//!
//! [logging]
//! level = info
//! directory = ~/.local/share/bustrack/logs
//!
//! [search]
//! history_file = ~/.local/share/bustrack/search_history.json
//! history_limit = 5
//! ```
//!
//! A missing file yields defaults. Keys not listed in [`ConfigKey`] and
//! values that do not parse are rejected.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::Ini;
use thiserror::Error;
use tracing::debug;

use crate::model::DEFAULT_MAX_ACCURACY_M;
use crate::route_search::DEFAULT_HISTORY_LIMIT;
use crate::sampler::{SamplerOptions, DEFAULT_MAX_FIX_AGE, DEFAULT_TIMEOUT};
use crate::session::SessionConfig;
use crate::throttle::DEFAULT_MIN_INTERVAL;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] ini::Error),

    #[error("Failed to write config file: {0}")]
    Write(#[from] io::Error),

    #[error("Unknown configuration key '{0}'")]
    UnknownKey(String),

    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// Directory holding `config.ini`.
pub fn config_directory() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bustrack")
}

/// Path of the configuration file.
pub fn config_file_path() -> PathBuf {
    config_directory().join("config.ini")
}

/// Directory for logs and search history.
pub fn data_directory() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bustrack")
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ if path == "~" => dirs::home_dir().unwrap_or_else(|| PathBuf::from(path)),
        _ => PathBuf::from(path),
    }
}

/// `[tracking]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingSettings {
    pub min_interval_ms: u64,
    pub high_accuracy: bool,
    pub timeout_ms: u64,
    pub max_fix_age_ms: u64,
    pub max_accuracy_m: f64,
    pub seed_on_start: bool,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            min_interval_ms: DEFAULT_MIN_INTERVAL.as_millis() as u64,
            high_accuracy: true,
            timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            max_fix_age_ms: DEFAULT_MAX_FIX_AGE.as_millis() as u64,
            max_accuracy_m: DEFAULT_MAX_ACCURACY_M,
            seed_on_start: false,
        }
    }
}

impl TrackingSettings {
    pub fn sampler_options(&self) -> SamplerOptions {
        SamplerOptions {
            high_accuracy: self.high_accuracy,
            timeout: Duration::from_millis(self.timeout_ms),
            max_fix_age: Duration::from_millis(self.max_fix_age_ms),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            min_interval: Duration::from_millis(self.min_interval_ms),
            max_accuracy_m: self.max_accuracy_m,
            seed_on_start: self.seed_on_start,
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
    pub directory: PathBuf,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: data_directory().join("logs"),
        }
    }
}

/// `[search]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchSettings {
    pub history_file: PathBuf,
    pub history_limit: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            history_file: data_directory().join("search_history.json"),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Whole configuration file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConfigFile {
    pub tracking: TrackingSettings,
    pub logging: LoggingSettings,
    pub search: SearchSettings,
}

impl ConfigFile {
    /// Load from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&config_file_path())
    }

    /// Load from `path`. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let ini = Ini::load_from_file(path)?;
        Self::from_ini(&ini)
    }

    /// Parse from INI text.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(contents)
            .map_err(|e| ConfigError::Read(ini::Error::Parse(e)))?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (section, properties) in ini.iter() {
            let Some(section) = section else {
                if let Some((key, _)) = properties.iter().next() {
                    return Err(ConfigError::UnknownKey(key.to_string()));
                }
                continue;
            };
            for (key, value) in properties.iter() {
                let name = format!("{}.{}", section, key);
                let config_key: ConfigKey = name.parse()?;
                config_key.set(&mut config, value)?;
            }
        }
        Ok(config)
    }

    /// Save to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&config_file_path())
    }

    /// Save to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.to_ini().write_to_file(path)?;
        debug!(path = %path.display(), "Config saved");
        Ok(())
    }

    fn to_ini(&self) -> Ini {
        let mut ini = Ini::new();
        for key in ConfigKey::all() {
            ini.with_section(Some(key.section()))
                .set(key.key_name(), key.get(self));
        }
        ini
    }
}

/// Settable configuration keys, in `section.key` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    TrackingMinIntervalMs,
    TrackingHighAccuracy,
    TrackingTimeoutMs,
    TrackingMaxFixAgeMs,
    TrackingMaxAccuracyM,
    TrackingSeedOnStart,
    LoggingLevel,
    LoggingDirectory,
    SearchHistoryFile,
    SearchHistoryLimit,
}

impl ConfigKey {
    pub fn all() -> &'static [ConfigKey] {
        &[
            ConfigKey::TrackingMinIntervalMs,
            ConfigKey::TrackingHighAccuracy,
            ConfigKey::TrackingTimeoutMs,
            ConfigKey::TrackingMaxFixAgeMs,
            ConfigKey::TrackingMaxAccuracyM,
            ConfigKey::TrackingSeedOnStart,
            ConfigKey::LoggingLevel,
            ConfigKey::LoggingDirectory,
            ConfigKey::SearchHistoryFile,
            ConfigKey::SearchHistoryLimit,
        ]
    }

    /// Full `section.key` name.
    pub fn name(&self) -> String {
        format!("{}.{}", self.section(), self.key_name())
    }

    pub fn section(&self) -> &'static str {
        match self {
            ConfigKey::TrackingMinIntervalMs
            | ConfigKey::TrackingHighAccuracy
            | ConfigKey::TrackingTimeoutMs
            | ConfigKey::TrackingMaxFixAgeMs
            | ConfigKey::TrackingMaxAccuracyM
            | ConfigKey::TrackingSeedOnStart => "tracking",
            ConfigKey::LoggingLevel | ConfigKey::LoggingDirectory => "logging",
            ConfigKey::SearchHistoryFile | ConfigKey::SearchHistoryLimit => "search",
        }
    }

    pub fn key_name(&self) -> &'static str {
        match self {
            ConfigKey::TrackingMinIntervalMs => "min_interval_ms",
            ConfigKey::TrackingHighAccuracy => "high_accuracy",
            ConfigKey::TrackingTimeoutMs => "timeout_ms",
            ConfigKey::TrackingMaxFixAgeMs => "max_fix_age_ms",
            ConfigKey::TrackingMaxAccuracyM => "max_accuracy_m",
            ConfigKey::TrackingSeedOnStart => "seed_on_start",
            ConfigKey::LoggingLevel => "level",
            ConfigKey::LoggingDirectory => "directory",
            ConfigKey::SearchHistoryFile => "history_file",
            ConfigKey::SearchHistoryLimit => "history_limit",
        }
    }

    /// Current value as it would be written to the file.
    pub fn get(&self, config: &ConfigFile) -> String {
        match self {
            ConfigKey::TrackingMinIntervalMs => config.tracking.min_interval_ms.to_string(),
            ConfigKey::TrackingHighAccuracy => config.tracking.high_accuracy.to_string(),
            ConfigKey::TrackingTimeoutMs => config.tracking.timeout_ms.to_string(),
            ConfigKey::TrackingMaxFixAgeMs => config.tracking.max_fix_age_ms.to_string(),
            ConfigKey::TrackingMaxAccuracyM => config.tracking.max_accuracy_m.to_string(),
            ConfigKey::TrackingSeedOnStart => config.tracking.seed_on_start.to_string(),
            ConfigKey::LoggingLevel => config.logging.level.clone(),
            ConfigKey::LoggingDirectory => config.logging.directory.display().to_string(),
            ConfigKey::SearchHistoryFile => config.search.history_file.display().to_string(),
            ConfigKey::SearchHistoryLimit => config.search.history_limit.to_string(),
        }
    }

    /// Parse `value` and store it.
    pub fn set(&self, config: &mut ConfigFile, value: &str) -> Result<(), ConfigError> {
        let value = value.trim();
        match self {
            ConfigKey::TrackingMinIntervalMs => {
                config.tracking.min_interval_ms = self.parse_number(value)?;
            }
            ConfigKey::TrackingHighAccuracy => {
                config.tracking.high_accuracy = self.parse_bool(value)?;
            }
            ConfigKey::TrackingTimeoutMs => {
                let timeout: u64 = self.parse_number(value)?;
                if timeout == 0 {
                    return Err(self.invalid(value, "must be greater than zero"));
                }
                config.tracking.timeout_ms = timeout;
            }
            ConfigKey::TrackingMaxFixAgeMs => {
                config.tracking.max_fix_age_ms = self.parse_number(value)?;
            }
            ConfigKey::TrackingMaxAccuracyM => {
                let meters: f64 = self.parse_number(value)?;
                if !meters.is_finite() || meters <= 0.0 {
                    return Err(self.invalid(value, "must be a positive number of meters"));
                }
                config.tracking.max_accuracy_m = meters;
            }
            ConfigKey::TrackingSeedOnStart => {
                config.tracking.seed_on_start = self.parse_bool(value)?;
            }
            ConfigKey::LoggingLevel => {
                value
                    .parse::<tracing::Level>()
                    .map_err(|_| self.invalid(value, "expected trace, debug, info, warn or error"))?;
                config.logging.level = value.to_lowercase();
            }
            ConfigKey::LoggingDirectory => {
                config.logging.directory = self.parse_path(value)?;
            }
            ConfigKey::SearchHistoryFile => {
                config.search.history_file = self.parse_path(value)?;
            }
            ConfigKey::SearchHistoryLimit => {
                config.search.history_limit = self.parse_number(value)?;
            }
        }
        Ok(())
    }

    fn invalid(&self, value: &str, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidValue {
            key: self.name(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    fn parse_number<T>(&self, value: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        value.parse().map_err(|e: T::Err| self.invalid(value, e.to_string()))
    }

    fn parse_bool(&self, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            _ => Err(self.invalid(value, "expected true or false")),
        }
    }

    fn parse_path(&self, value: &str) -> Result<PathBuf, ConfigError> {
        if value.is_empty() {
            return Err(self.invalid(value, "path must not be empty"));
        }
        Ok(expand_tilde(value))
    }
}

impl FromStr for ConfigKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        ConfigKey::all()
            .iter()
            .copied()
            .find(|key| key.name() == wanted)
            .ok_or_else(|| ConfigError::UnknownKey(s.to_string()))
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.section(), self.key_name())
    }
}
