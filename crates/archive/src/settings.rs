//! Archive settings
//!
//! Loaded (in order of priority) from:
//! 1. `MAILVAULT_DATA_DIR` environment variable (data directory only)
//! 2. `settings.json` in the Mailvault config directory
//! 3. Built-in defaults

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Settings filename in the Mailvault config directory
const SETTINGS_FILE: &str = "settings.json";

/// Environment variable overriding the data directory
const DATA_DIR_ENV: &str = "MAILVAULT_DATA_DIR";

/// Attachments strictly smaller than this are stored inline with their record;
/// anything at or above it goes to the large-object blob namespace.
pub const DEFAULT_INLINE_THRESHOLD: u64 = 5 * 1024 * 1024;

/// Threads per browsing page
pub const PAGE_SIZE: i64 = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveSettings {
    /// Root for the database file and the blob directory
    pub data_dir: PathBuf,
    /// Inline/large-object placement cutoff in bytes
    pub inline_threshold_bytes: u64,
    /// Deadline for a single provider HTTP call
    pub provider_timeout_secs: u64,
    /// Deadline for a whole sync run; 0 disables it
    pub job_deadline_secs: u64,
    /// Threads requested per provider list call
    pub provider_page_size: usize,
    /// Seconds without a heartbeat after which an active run counts as
    /// interrupted
    pub run_lease_secs: u64,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            data_dir: config::data_dir().unwrap_or_else(|| PathBuf::from("mailvault-data")),
            inline_threshold_bytes: DEFAULT_INLINE_THRESHOLD,
            provider_timeout_secs: 30,
            job_deadline_secs: 6 * 60 * 60,
            provider_page_size: 100,
            run_lease_secs: 120,
        }
    }
}

impl ArchiveSettings {
    /// Load settings from the config directory, falling back to defaults
    pub fn load() -> Self {
        let mut settings = if config::config_exists(SETTINGS_FILE) {
            match config::load_json::<ArchiveSettings>(SETTINGS_FILE) {
                Ok(settings) => settings,
                Err(e) => {
                    log::warn!("[CONFIG] Ignoring unreadable settings file: {:#}", e);
                    Self::default()
                }
            }
        } else {
            Self::default()
        };

        if let Ok(dir) = std::env::var(DATA_DIR_ENV)
            && !dir.is_empty()
        {
            settings.data_dir = PathBuf::from(dir);
        }

        settings
    }

    /// Path of the SQLite archive database
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("archive.sqlite")
    }

    /// Root of the large-object blob namespace
    pub fn blob_path(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn job_deadline(&self) -> Option<Duration> {
        (self.job_deadline_secs > 0).then(|| Duration::from_secs(self.job_deadline_secs))
    }

    pub fn run_lease(&self) -> Duration {
        Duration::from_secs(self.run_lease_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = ArchiveSettings::default();
        assert_eq!(settings.inline_threshold_bytes, 5 * 1024 * 1024);
        assert_eq!(settings.provider_timeout(), Duration::from_secs(30));
        assert!(settings.job_deadline().is_some());
        assert_eq!(settings.run_lease(), Duration::from_secs(120));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "inline_threshold_bytes": 1024, "job_deadline_secs": 0 }"#;
        let settings: ArchiveSettings = serde_json::from_str(json).unwrap();

        assert_eq!(settings.inline_threshold_bytes, 1024);
        assert_eq!(settings.job_deadline(), None);
        assert_eq!(settings.provider_page_size, 100);
    }

    #[test]
    fn test_paths_under_data_dir() {
        let settings = ArchiveSettings {
            data_dir: PathBuf::from("/tmp/vault"),
            ..Default::default()
        };
        assert_eq!(settings.database_path(), PathBuf::from("/tmp/vault/archive.sqlite"));
        assert_eq!(settings.blob_path(), PathBuf::from("/tmp/vault/blobs"));
    }
}
