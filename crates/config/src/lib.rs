//! Shared directories and JSON files for Mailvault
//!
//! Settings and per-mailbox tokens live in the config directory
//! (`~/.config/mailvault/`, or `$MAILVAULT_CONFIG_DIR`). The archive itself
//! defaults to the platform data directory.
//!
//! Call [`init`] at application startup to bootstrap the config directory.

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "mailvault";

/// Overrides the platform config directory when set and non-empty
pub const CONFIG_DIR_ENV: &str = "MAILVAULT_CONFIG_DIR";

/// Create the config directory if needed and return it
pub fn init() -> Result<PathBuf> {
    let dir = config_dir().context("No config directory for this platform")?;
    create_dir(&dir)?;
    Ok(dir)
}

/// `$MAILVAULT_CONFIG_DIR`, else `<platform config dir>/mailvault`
pub fn config_dir() -> Option<PathBuf> {
    match std::env::var_os(CONFIG_DIR_ENV) {
        Some(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
        _ => dirs::config_dir().map(|root| root.join(APP_DIR)),
    }
}

/// Default archive root (`~/.local/share/mailvault` on Linux)
pub fn data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|root| root.join(APP_DIR))
}

pub fn config_path(name: &str) -> Option<PathBuf> {
    config_dir().map(|dir| dir.join(name))
}

pub fn config_exists(name: &str) -> bool {
    config_path(name).is_some_and(|path| path.is_file())
}

/// Parse `name` from the config directory
pub fn load_json<T: DeserializeOwned>(name: &str) -> Result<T> {
    let path = config_path(name).context("No config directory for this platform")?;
    load_json_file(&path)
}

pub fn load_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read(path).with_context(|| format!("Reading {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("Parsing {}", path.display()))
}

/// Write `value` as pretty JSON, creating parent directories
///
/// The file is written next to its destination and renamed into place, so
/// readers never see a truncated file.
pub fn save_json_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        create_dir(parent)?;
    }

    let mut body = serde_json::to_vec_pretty(value)?;
    body.push(b'\n');

    let staging = path.with_extension("json.tmp");
    std::fs::write(&staging, &body)
        .with_context(|| format!("Writing {}", staging.display()))?;
    std::fs::rename(&staging, path).with_context(|| format!("Replacing {}", path.display()))
}

fn create_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("Creating {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        limit: u64,
    }

    #[test]
    fn test_data_dir_is_app_scoped() {
        if let Some(dir) = data_dir() {
            assert!(dir.ends_with("mailvault"));
        }
    }

    #[test]
    fn test_json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sample.json");
        let sample = Sample {
            name: "archive".to_string(),
            limit: 42,
        };

        save_json_file(&path, &sample).unwrap();
        let loaded: Sample = load_json_file(&path).unwrap();

        assert_eq!(loaded, sample);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_save_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");

        for limit in [1, 2] {
            let sample = Sample {
                name: "archive".to_string(),
                limit,
            };
            save_json_file(&path, &sample).unwrap();
        }

        let loaded: Sample = load_json_file(&path).unwrap();
        assert_eq!(loaded.limit, 2);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result: Result<Sample> = load_json_file(&dir.path().join("missing.json"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_malformed_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let result: Result<Sample> = load_json_file(&path);
        assert!(format!("{:#}", result.unwrap_err()).contains("Parsing"));
    }
}
