//! Helpers shared across CLI commands.

use std::path::Path;

use bustrack::model::LocationRecord;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CliError;

/// Read and decode a JSON file.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, CliError> {
    let contents = std::fs::read_to_string(path).map_err(|source| CliError::ReadInput {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| CliError::ParseInput {
        path: path.to_path_buf(),
        source,
    })
}

/// Encode `value` as pretty JSON and write it to `path`.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), CliError> {
    let json = serde_json::to_string_pretty(value).map_err(|e| CliError::WriteOutput {
        path: path.to_path_buf(),
        source: e.into(),
    })?;
    std::fs::write(path, json).map_err(|source| CliError::WriteOutput {
        path: path.to_path_buf(),
        source,
    })
}

/// One line per record: local time, coordinates, accuracy, speed.
pub fn format_record(record: &LocationRecord) -> String {
    let local = record.recorded_at.with_timezone(&chrono::Local);
    let accuracy = record
        .accuracy
        .map(|a| format!("±{:.0}m", a))
        .unwrap_or_else(|| "±?".to_string());
    format!(
        "{}  {:>10.5} {:>11.5}  {:>6}  {:>5.1} km/h",
        local.format("%H:%M:%S"),
        record.latitude,
        record.longitude,
        accuracy,
        record.speed * 3.6,
    )
}
