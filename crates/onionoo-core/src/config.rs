//! Configuration management for Onionoo.
//!
//! This module provides configuration loading, saving, and defaults.
//! Configuration is stored in TOML format in a platform-appropriate location.

use crate::error::{OnionooError, Result};
use crate::indexer::IndexerSettings;
use crate::service::ServiceSettings;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Main configuration structure.
///
/// ## Example Configuration File (onionoo.toml)
///
/// ```toml
/// [general]
/// log_level = "info"
/// data_path = "/var/lib/onionoo/summary.json"
///
/// [indexer]
/// refresh_interval_secs = 60
/// wait_timeout_secs = 10
/// max_index_age_secs = 21600
/// max_record_age_days = 7
///
/// [cache]
/// min_max_age_secs = 300
/// max_max_age_secs = 2700
/// interval_secs = 300
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Index refresh and freshness
    pub indexer: IndexerConfig,

    /// Advertised cache lifetimes
    pub cache: CacheConfig,
}

/// General configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Summary document location (None = default location)
    pub data_path: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            log_level: "info".to_string(),
            data_path: None,
        }
    }
}

/// Indexer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Seconds between checks for a newer summary generation
    pub refresh_interval_secs: u64,

    /// Seconds a query waits for the first index
    pub wait_timeout_secs: u64,

    /// Queries fail once the index is older than this many seconds
    pub max_index_age_secs: u64,

    /// Records not seen for this many days are left out of the index
    pub max_record_age_days: u32,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        IndexerConfig {
            refresh_interval_secs: 60,
            wait_timeout_secs: 10,
            max_index_age_secs: 6 * 60 * 60,
            max_record_age_days: 7,
        }
    }
}

/// Cache lifetime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub min_max_age_secs: u64,
    pub max_max_age_secs: u64,
    pub interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            min_max_age_secs: 5 * 60,
            max_max_age_secs: 45 * 60,
            interval_secs: 5 * 60,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Returns default config if no config file exists.
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Config::default());
        }

        info!(path = %path.display(), "Loading configuration");
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents).map_err(|e| OnionooError::ConfigError {
            reason: format!("Failed to parse config: {}", e),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        info!(path = %path.display(), "Saving configuration");
        let contents = toml::to_string_pretty(self).map_err(|e| OnionooError::ConfigError {
            reason: format!("Failed to serialize config: {}", e),
        })?;

        fs::write(path, contents)?;
        Ok(())
    }

    /// Reject settings the indexer or service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.indexer.refresh_interval_secs == 0 {
            return Err(OnionooError::ConfigError {
                reason: "indexer.refresh_interval_secs must be positive".to_string(),
            });
        }
        if self.cache.interval_secs == 0 {
            return Err(OnionooError::ConfigError {
                reason: "cache.interval_secs must be positive".to_string(),
            });
        }
        if self.cache.min_max_age_secs > self.cache.max_max_age_secs {
            return Err(OnionooError::ConfigError {
                reason: "cache.min_max_age_secs exceeds cache.max_max_age_secs".to_string(),
            });
        }
        Ok(())
    }

    /// Get the default configuration file path.
    pub fn default_config_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "onionoo").ok_or_else(|| OnionooError::ConfigError {
            reason: "Could not determine config directory".to_string(),
        })?;

        Ok(dirs.config_dir().join("onionoo.toml"))
    }

    /// Get the default data directory path.
    pub fn default_data_dir() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "onionoo").ok_or_else(|| OnionooError::ConfigError {
            reason: "Could not determine data directory".to_string(),
        })?;

        Ok(dirs.data_dir().to_path_buf())
    }

    /// Get the summary document path (from config or default).
    pub fn data_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.general.data_path {
            Ok(path.clone())
        } else {
            Ok(Self::default_data_dir()?.join("summary.json"))
        }
    }

    pub fn indexer_settings(&self) -> IndexerSettings {
        IndexerSettings {
            refresh_interval: Duration::from_secs(self.indexer.refresh_interval_secs),
            max_record_age: chrono::Duration::days(i64::from(self.indexer.max_record_age_days)),
        }
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            wait_timeout: Duration::from_secs(self.indexer.wait_timeout_secs),
            max_index_age: Duration::from_secs(self.indexer.max_index_age_secs),
            cache_min_max_age: Duration::from_secs(self.cache.min_max_age_secs),
            cache_max_max_age: Duration::from_secs(self.cache.max_max_age_secs),
            cache_interval: Duration::from_secs(self.cache.interval_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.indexer.refresh_interval_secs, 60);
        assert_eq!(config.indexer.max_index_age_secs, 21600);
        assert_eq!(config.cache.max_max_age_secs, 2700);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let mut config = Config::default();
        config.general.data_path = Some(temp_dir.path().join("summary.json"));
        config.indexer.max_record_age_days = 3;

        config.save_to(&config_path).unwrap();
        let loaded = Config::load_from(&config_path).unwrap();

        assert_eq!(loaded.indexer.max_record_age_days, 3);
        assert_eq!(
            loaded.data_path().unwrap(),
            temp_dir.path().join("summary.json")
        );
    }

    #[test]
    fn test_load_nonexistent() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nonexistent.toml");

        let config = Config::load_from(&config_path).unwrap();
        assert_eq!(config.indexer.wait_timeout_secs, 10);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("partial.toml");
        fs::write(&config_path, "[cache]\nmax_max_age_secs = 600\n").unwrap();

        let config = Config::load_from(&config_path).unwrap();
        assert_eq!(config.cache.max_max_age_secs, 600);
        assert_eq!(config.cache.min_max_age_secs, 300);
        assert_eq!(config.indexer.refresh_interval_secs, 60);
    }

    #[test]
    fn test_invalid_files_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("bad.toml");

        fs::write(&config_path, "[indexer\n").unwrap();
        assert!(matches!(
            Config::load_from(&config_path),
            Err(OnionooError::ConfigError { .. })
        ));

        fs::write(&config_path, "[cache]\ninterval_secs = 0\n").unwrap();
        assert!(Config::load_from(&config_path).is_err());
    }

    #[test]
    fn test_settings_conversion() {
        let mut config = Config::default();
        config.indexer.max_record_age_days = 2;
        config.cache.interval_secs = 60;

        let indexer = config.indexer_settings();
        assert_eq!(indexer.refresh_interval, Duration::from_secs(60));
        assert_eq!(indexer.max_record_age, chrono::Duration::days(2));

        let service = config.service_settings();
        assert_eq!(service.max_index_age, Duration::from_secs(21600));
        assert_eq!(service.cache_interval, Duration::from_secs(60));
    }
}
