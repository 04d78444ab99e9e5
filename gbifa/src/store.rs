//! Persisted JSON batches
//!
//! The download phase writes one file per calendar month plus a small
//! metadata record; the reporting phase reads them back. Files are written
//! whole in a single call — a batch on disk is either the old version or
//! the new version, never a partial mix.

use gbifa_common::{Result, YearMonth};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Run metadata persisted alongside the monthly batches
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Last-seen total activity count from the count probe
    pub total_count: u64,
}

pub const METADATA_FILE: &str = "saved_metadata.json";
pub const CITATIONS_FILE: &str = "citations.json";
const ACTIVITY_FILE_SUFFIX: &str = "-activity.json";

/// Path of the batch file for one month, e.g. `202403-activity.json`
pub fn month_file_path(data_dir: &Path, month: YearMonth) -> PathBuf {
    data_dir.join(format!("{}{}", month.compact(), ACTIVITY_FILE_SUFFIX))
}

/// Serialize `value` to `path`, creating parent directories as needed
pub fn write_json_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_vec(value)?;
    std::fs::write(path, body)?;
    Ok(())
}

/// Read and deserialize a JSON file
pub fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let body = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&body)?)
}

/// Write one month's record batch
///
/// With `replace` set, any previous batch for the month is superseded.
/// Without it, the new records are appended after the file's existing
/// records, so a month flushed more than once accumulates rather than
/// losing its earlier flush.
pub fn write_month_batch(
    data_dir: &Path,
    month: YearMonth,
    records: &[Value],
    replace: bool,
) -> Result<()> {
    let path = month_file_path(data_dir, month);

    let mut combined: Vec<Value> = if replace {
        Vec::new()
    } else {
        match read_json_file(&path) {
            Ok(existing) => existing,
            Err(_) => Vec::new(),
        }
    };
    combined.extend(records.iter().cloned());

    tracing::debug!(
        month = %month,
        records = records.len(),
        replace,
        "writing activity batch"
    );
    write_json_file(&path, &combined)
}

/// Load one month's persisted records; a missing batch is simply empty
pub fn load_month(data_dir: &Path, month: YearMonth) -> Vec<Value> {
    let path = month_file_path(data_dir, month);
    match read_json_file(&path) {
        Ok(records) => records,
        Err(error) => {
            tracing::warn!(
                path = %path.display(),
                %error,
                "no usable batch for month, treating as empty"
            );
            Vec::new()
        }
    }
}

/// Load every persisted activity batch, most recent month first
///
/// Unreadable or malformed files are logged and skipped; the resulting gap
/// shows up as missing records downstream, not as a failed run.
pub fn load_all_activity(data_dir: &Path) -> Vec<Value> {
    let entries = match std::fs::read_dir(data_dir) {
        Ok(entries) => entries,
        Err(error) => {
            tracing::warn!(
                data_dir = %data_dir.display(),
                %error,
                "cannot read data directory"
            );
            return Vec::new();
        }
    };

    let mut batch_names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.ends_with(ACTIVITY_FILE_SUFFIX))
        .collect();
    // Filenames sort chronologically; reverse for most-recent-first
    batch_names.sort();
    batch_names.reverse();

    let mut records = Vec::new();
    for name in batch_names {
        let path = data_dir.join(&name);
        match read_json_file::<Vec<Value>>(&path) {
            Ok(batch) => records.extend(batch),
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "skipping unreadable batch");
            }
        }
    }
    records
}

/// Persist run metadata
pub fn write_metadata(data_dir: &Path, metadata: &RunMetadata) -> Result<()> {
    write_json_file(&data_dir.join(METADATA_FILE), metadata)
}

/// Load run metadata from a previous run, if any
pub fn read_metadata(data_dir: &Path) -> Option<RunMetadata> {
    read_json_file(&data_dir.join(METADATA_FILE)).ok()
}
