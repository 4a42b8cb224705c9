//! # Tally Configuration
//!
//! Configuration management for the sync engine and daemon.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TALLY_DB_PATH=/var/lib/tally/tally.db                              │
//! │     TALLY_KEY_PATH=/var/lib/tally/credentials.key                      │
//! │     TALLY_STALE_AFTER_SECS=600                                         │
//! │     TALLY_SYNC_INTERVAL_SECS=3600                                      │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tally/tally.toml (Linux)                                 │
//! │     ~/Library/Application Support/com.tally.tally/tally.toml (macOS)   │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     Database and key file in the platform data directory              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [storage]
//! database_path = "/var/lib/tally/tally.db"
//! key_path = "/var/lib/tally/credentials.key"
//!
//! [sync]
//! stale_after_secs = 600
//! progress_idle_secs = 600
//! chunk_size = 100
//! interval_secs = 3600
//! log_retention_days = 90
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Storage Settings
// =============================================================================

/// Where durable state lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// SQLite database file.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// 32-byte credential key file (created on first run, mode 0600).
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
}

fn data_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "tally", "tally")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_database_path() -> PathBuf {
    data_dir().join("tally.db")
}

fn default_key_path() -> PathBuf {
    data_dir().join("credentials.key")
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            database_path: default_database_path(),
            key_path: default_key_path(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Sync behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Age after which a `running` sync log is treated as abandoned (seconds).
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    /// Idle period before a progress entry is dropped (seconds).
    #[serde(default = "default_progress_idle")]
    pub progress_idle_secs: u64,

    /// Metrics written per transaction.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Interval between scheduled `sync_all_accounts` runs (seconds).
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Finished sync logs older than this are pruned. 0 keeps them forever.
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,
}

fn default_stale_after() -> u64 {
    600
}
fn default_progress_idle() -> u64 {
    600
}
fn default_chunk_size() -> usize {
    tally_db::DEFAULT_CHUNK_SIZE
}
fn default_interval() -> u64 {
    3600
}
fn default_log_retention_days() -> u32 {
    90
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            stale_after_secs: default_stale_after(),
            progress_idle_secs: default_progress_idle(),
            chunk_size: default_chunk_size(),
            interval_secs: default_interval(),
            log_retention_days: default_log_retention_days(),
        }
    }
}

impl SyncSettings {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn progress_idle(&self) -> Duration {
        Duration::from_secs(self.progress_idle_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Retention window, or `None` when logs are kept forever.
    pub fn log_retention(&self) -> Option<chrono::Duration> {
        (self.log_retention_days > 0)
            .then(|| chrono::Duration::days(i64::from(self.log_retention_days)))
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete Tally configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TallyConfig {
    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub sync: SyncSettings,
}

impl TallyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (tally.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        let positive = [
            ("stale_after_secs", self.sync.stale_after_secs),
            ("progress_idle_secs", self.sync.progress_idle_secs),
            ("interval_secs", self.sync.interval_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(SyncError::InvalidConfig(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.sync.chunk_size == 0 {
            return Err(SyncError::InvalidConfig(
                "chunk_size must be greater than 0".into(),
            ));
        }

        if self.storage.database_path.as_os_str().is_empty()
            || self.storage.key_path.as_os_str().is_empty()
        {
            return Err(SyncError::InvalidConfig(
                "storage paths must not be empty".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from any key lookup (the environment in production).
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("TALLY_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.storage.database_path = PathBuf::from(path);
        }

        if let Some(path) = lookup("TALLY_KEY_PATH") {
            debug!(path = %path, "Overriding key path from environment");
            self.storage.key_path = PathBuf::from(path);
        }

        if let Some(secs) = lookup("TALLY_STALE_AFTER_SECS") {
            match secs.parse::<u64>() {
                Ok(s) => self.sync.stale_after_secs = s,
                Err(_) => warn!(value = %secs, "Ignoring invalid TALLY_STALE_AFTER_SECS"),
            }
        }

        if let Some(secs) = lookup("TALLY_SYNC_INTERVAL_SECS") {
            match secs.parse::<u64>() {
                Ok(s) => self.sync.interval_secs = s,
                Err(_) => warn!(value = %secs, "Ignoring invalid TALLY_SYNC_INTERVAL_SECS"),
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "tally", "tally")
            .map(|dirs| dirs.config_dir().join("tally.toml"))
    }
}
