// src/config/ingest.rs

//! Settings file discovery and parsing
//!
//! The host agent drops `<sequence>.settings` files into the config folder;
//! the file with the highest numeric prefix is the current request. Older
//! sequences are left in place (the host cleans them up).

use super::{RawSettings, Request};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A discovered `.settings` file, not yet parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsFile {
    pub sequence: u64,
    pub path: PathBuf,
}

/// Find the `.settings` file with the highest numeric sequence prefix.
///
/// Returns `Ok(None)` when the folder holds no settings files at all.
pub fn latest_settings(config_folder: &Path) -> Result<Option<SettingsFile>> {
    let entries = std::fs::read_dir(config_folder).map_err(|e| {
        Error::Environment(format!(
            "Cannot read config folder {}: {}",
            config_folder.display(),
            e
        ))
    })?;

    let mut newest: Option<SettingsFile> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(sequence) = sequence_of(&path) else {
            continue;
        };
        match &newest {
            Some(current) if current.sequence >= sequence => {}
            _ => newest = Some(SettingsFile { sequence, path }),
        }
    }

    if let Some(found) = &newest {
        debug!(
            "Selected settings sequence {} ({})",
            found.sequence,
            found.path.display()
        );
    }
    Ok(newest)
}

/// Numeric prefix of a `<n>.settings` path, if it has one.
pub fn sequence_of(path: &Path) -> Option<u64> {
    if path.extension()? != "settings" {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

/// Read one settings file into its raw wire form.
pub fn read_raw(file: &SettingsFile) -> Result<RawSettings> {
    let content = std::fs::read_to_string(&file.path).map_err(|e| {
        Error::Configuration(format!("Cannot read {}: {}", file.path.display(), e))
    })?;

    let raw: RawSettings = serde_json::from_str(&content).map_err(|e| {
        Error::Configuration(format!("Malformed settings {}: {}", file.path.display(), e))
    })?;

    if !raw.extra.is_empty() {
        warn!(
            "Settings sequence {} carries {} unrecognized field(s); they will be echoed in status",
            file.sequence,
            raw.extra.len()
        );
    }
    Ok(raw)
}

/// Read and validate one settings file into a `Request`.
pub fn read_request(file: &SettingsFile) -> Result<Request> {
    Request::from_raw(file.sequence, read_raw(file)?)
}
