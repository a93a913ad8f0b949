use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TallyError};
use crate::ingest::DEFAULT_BATCH_SIZE;
use crate::publisher::DEFAULT_PAGE_SIZE;

pub const DB_FILE: &str = "tally.db";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub data_dir: String,
    /// Records buffered before a bulk insert.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Records per page when re-publishing stored transactions.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// How long `list` waits for each correlated response.
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_response_timeout_secs() -> u64 {
    5
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir().to_string_lossy().to_string(),
            batch_size: default_batch_size(),
            page_size: default_page_size(),
            response_timeout_secs: default_response_timeout_secs(),
        }
    }
}

impl Settings {
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(DB_FILE)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("tally")
}

fn settings_path() -> PathBuf {
    config_dir().join("settings.json")
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Documents")
        .join("tally")
}

pub fn load_settings() -> Settings {
    let path = settings_path();
    if path.exists() {
        let content = std::fs::read_to_string(&path).unwrap_or_default();
        match serde_json::from_str(&content) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable settings, using defaults");
                Settings::default()
            }
        }
    } else {
        Settings::default()
    }
}

pub fn save_settings(settings: &Settings) -> Result<()> {
    if settings.batch_size == 0 || settings.page_size == 0 {
        return Err(TallyError::Settings(
            "batch_size and page_size must be at least 1".to_string(),
        ));
    }
    let dir = config_dir();
    std::fs::create_dir_all(&dir)?;
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| TallyError::Settings(e.to_string()))?;
    std::fs::write(settings_path(), format!("{json}\n"))?;
    Ok(())
}

/// Expands a leading `~` and anchors relative paths at the working directory.
/// The path does not need to exist yet.
pub fn shellexpand_path(path: &str) -> String {
    let mut expanded = PathBuf::from(path);
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            expanded = PathBuf::from(path.replacen('~', &home.to_string_lossy(), 1));
        }
    }
    if expanded.is_relative() {
        if let Ok(cwd) = std::env::current_dir() {
            expanded = cwd.join(expanded);
        }
    }
    std::fs::canonicalize(&expanded)
        .unwrap_or(expanded)
        .to_string_lossy()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = Settings {
            data_dir: "/tmp/test".to_string(),
            batch_size: 50,
            page_size: 10,
            response_timeout_secs: 2,
        };
        let json = serde_json::to_string_pretty(&settings).unwrap();
        std::fs::write(&path, &json).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let loaded: Settings = serde_json::from_str(&content).unwrap();
        assert_eq!(loaded.data_dir, "/tmp/test");
        assert_eq!(loaded.batch_size, 50);
        assert_eq!(loaded.page_size, 10);
        assert_eq!(loaded.response_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.batch_size, 30);
        assert_eq!(s.page_size, 100);
        assert_eq!(s.response_timeout_secs, 5);
        assert!(!s.data_dir.is_empty());
        assert!(s.db_path().ends_with(DB_FILE));
    }

    #[test]
    fn test_load_merges_with_defaults() {
        let json = r#"{"data_dir": "/tmp/test", "page_size": 25}"#;
        let s: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(s.batch_size, 30);
        assert_eq!(s.page_size, 25);
        assert_eq!(s.response_timeout_secs, 5);
    }

    #[test]
    fn test_shellexpand_keeps_missing_absolute_path() {
        assert_eq!(shellexpand_path("/definitely/not/here"), "/definitely/not/here");
    }

    #[test]
    fn test_shellexpand_anchors_missing_relative_path() {
        let expanded = PathBuf::from(shellexpand_path("not-created-yet/books"));
        assert!(expanded.is_absolute());
        assert!(expanded.ends_with("not-created-yet/books"));
    }

    #[test]
    fn test_shellexpand_is_stable_once_expanded() {
        let dir = tempfile::tempdir().unwrap();
        let once = shellexpand_path(&dir.path().to_string_lossy());
        assert_eq!(shellexpand_path(&once), once);
    }
}
