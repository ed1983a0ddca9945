//! Configuration file parser for `feedsync.toml`.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are accepted, though we log a warning for each since they are
//! usually typos.
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration
// ============================================================================

/// Process configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file.
    pub database_path: String,

    /// Default tracing filter, overridden by `RUST_LOG`.
    pub log_level: String,

    /// Minutes between two scheduler passes.
    pub polling_frequency_minutes: u64,

    /// Maximum jobs taken per scheduler pass (0 = all due feeds).
    pub batch_size: usize,

    /// Feeds with this many consecutive parsing errors are no longer polled
    /// (0 = never give up).
    pub polling_error_limit: i64,

    /// Feeds refreshed concurrently.
    pub workers: usize,

    /// Minutes between two polls of the same feed.
    pub check_interval_minutes: u64,

    /// Rewrite stored entries whose content changed upstream.
    pub update_existing_entries: bool,

    /// Batch size from which new entries are bulk-loaded.
    pub bulk_insert_threshold: usize,

    /// Hashes remembered per user for cross-feed dedup (0 = unbounded).
    pub dedup_capacity_per_user: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "feedsync.db".to_string(),
            log_level: "info".to_string(),
            polling_frequency_minutes: 60,
            batch_size: 100,
            polling_error_limit: 3,
            workers: 16,
            check_interval_minutes: 60,
            update_existing_entries: true,
            bulk_insert_threshold: 3,
            dedup_capacity_per_user: 0,
        }
    }
}

const KNOWN_KEYS: [&str; 10] = [
    "database_path",
    "log_level",
    "polling_frequency_minutes",
    "batch_size",
    "polling_error_limit",
    "workers",
    "check_interval_minutes",
    "update_existing_entries",
    "bulk_insert_threshold",
    "dedup_capacity_per_user",
];

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            database = %config.database_path,
            workers = config.workers,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Time between scheduler passes, at least one minute.
    pub fn polling_frequency(&self) -> Duration {
        Duration::from_secs(self.polling_frequency_minutes.max(1) * 60)
    }

    /// Time between polls of one feed, at least one minute.
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_minutes.max(1) * 60)
    }

    /// Worker count, at least one.
    pub fn workers(&self) -> usize {
        self.workers.max(1)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write_config(name: &str, content: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("feedsync_config_test_{name}"));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("feedsync.toml");
        std::fs::write(&path, content).unwrap();
        path
    }

    fn cleanup(path: &Path) {
        if let Some(dir) = path.parent() {
            std::fs::remove_dir_all(dir).ok();
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.database_path, "feedsync.db");
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.polling_error_limit, 3);
        assert_eq!(config.bulk_insert_threshold, 3);
        assert_eq!(config.dedup_capacity_per_user, 0);
        assert!(config.update_existing_entries);
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/feedsync_test_nonexistent_config.toml");
        let config = Config::load(path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_whitespace_only_file_returns_default() {
        let path = write_config("whitespace", "   \n  \n  ");
        let config = Config::load(&path).unwrap();
        assert_eq!(config, Config::default());
        cleanup(&path);
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let path = write_config("partial", "workers = 4\n");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.log_level, "info");
        cleanup(&path);
    }

    #[test]
    fn test_full_config() {
        let content = r#"
database_path = "/var/lib/feedsync/feeds.db"
log_level = "debug"
polling_frequency_minutes = 5
batch_size = 250
polling_error_limit = 0
workers = 8
check_interval_minutes = 30
update_existing_entries = false
bulk_insert_threshold = 10
dedup_capacity_per_user = 50000
"#;
        let path = write_config("full", content);
        let config = Config::load(&path).unwrap();
        assert_eq!(
            config,
            Config {
                database_path: "/var/lib/feedsync/feeds.db".to_string(),
                log_level: "debug".to_string(),
                polling_frequency_minutes: 5,
                batch_size: 250,
                polling_error_limit: 0,
                workers: 8,
                check_interval_minutes: 30,
                update_existing_entries: false,
                bulk_insert_threshold: 10,
                dedup_capacity_per_user: 50000,
            }
        );
        cleanup(&path);
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let path = write_config("invalid", "this is not [valid toml");
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
        cleanup(&path);
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let path = write_config("unknown", "workers = 2\ntheme = \"dark\"\n");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.workers, 2);
        cleanup(&path);
    }

    #[test]
    fn test_wrong_type_returns_error() {
        let path = write_config("wrongtype", "batch_size = \"lots\"\n");
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
        cleanup(&path);
    }

    #[test]
    fn test_too_large_file_rejected() {
        let path = write_config("too_large", &"a".repeat(1_048_577));
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        assert!(err.to_string().contains("too large"));
        cleanup(&path);
    }

    #[test]
    fn test_durations_have_a_floor() {
        let config = Config {
            polling_frequency_minutes: 0,
            check_interval_minutes: 0,
            workers: 0,
            ..Config::default()
        };
        assert_eq!(config.polling_frequency(), Duration::from_secs(60));
        assert_eq!(config.check_interval(), Duration::from_secs(60));
        assert_eq!(config.workers(), 1);
    }
}
