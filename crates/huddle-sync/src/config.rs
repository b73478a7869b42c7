//! # Sync Configuration
//!
//! Configuration management for the sync core.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     HUDDLE_SNAPSHOT_LIMIT=200                                          │
//! │     HUDDLE_TYPING_TTL_MS=5000                                          │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/huddle/sync.toml (Linux)                                 │
//! │     ~/Library/Application Support/com.huddle.huddle/sync.toml (macOS)  │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     100 messages, 3 s typing TTL, 1 s sweep tick                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [session]
//! snapshot_limit = 100
//! typing_ttl_ms = 3000
//! typing_tick_ms = 1000
//! event_buffer = 256
//!
//! [store]
//! database_path = "/var/lib/huddle/huddle.db"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use huddle_core::{MessageFilter, SNAPSHOT_LIMIT, TYPING_TICK_MS, TYPING_TTL_MS};

use crate::error::{SyncError, SyncResult};
use crate::presence::MAX_SWEEP_TICK;

// =============================================================================
// Session Settings
// =============================================================================

/// Per-session tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Messages fetched when a channel opens or resyncs.
    #[serde(default = "default_snapshot_limit")]
    pub snapshot_limit: u32,

    /// How long a typing assertion stays live without a refresh.
    #[serde(default = "default_typing_ttl")]
    pub typing_ttl_ms: u64,

    /// Presence sweeper period. Must not exceed the TTL.
    #[serde(default = "default_typing_tick")]
    pub typing_tick_ms: u64,

    /// Capacity of each subscription's delivery channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_snapshot_limit() -> u32 {
    SNAPSHOT_LIMIT
}
fn default_typing_ttl() -> u64 {
    TYPING_TTL_MS
}
fn default_typing_tick() -> u64 {
    TYPING_TICK_MS
}
fn default_event_buffer() -> usize {
    256
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            snapshot_limit: default_snapshot_limit(),
            typing_ttl_ms: default_typing_ttl(),
            typing_tick_ms: default_typing_tick(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl SessionSettings {
    /// Typing TTL as a Duration.
    pub fn typing_ttl(&self) -> Duration {
        Duration::from_millis(self.typing_ttl_ms)
    }

    /// Sweeper tick as a Duration.
    pub fn typing_tick(&self) -> Duration {
        Duration::from_millis(self.typing_tick_ms)
    }

    /// The filter every channel view uses.
    pub fn filter(&self) -> MessageFilter {
        MessageFilter::top_level()
    }
}

// =============================================================================
// Store Settings
// =============================================================================

/// Where the SQLite backend keeps its data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Database file. Falls back to the platform data directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

impl StoreSettings {
    /// Resolves the database path, if one can be determined.
    pub fn resolved_database_path(&self) -> Option<PathBuf> {
        self.database_path.clone().or_else(|| {
            directories::ProjectDirs::from("com", "huddle", "huddle")
                .map(|dirs| dirs.data_dir().join("huddle.db"))
        })
    }
}

// =============================================================================
// Sync Config
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub session: SessionSettings,

    #[serde(default)]
    pub store: StoreSettings,
}

impl SyncConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, then applies environment overrides.
    ///
    /// ## Arguments
    /// * `config_path` - Optional explicit path; uses the platform default if None
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
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

    /// Loads configuration, falling back to defaults on error.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load sync config, using defaults");
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

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        let session = &self.session;

        if session.snapshot_limit == 0 {
            return Err(SyncError::InvalidConfig(
                "snapshot_limit must be greater than zero".into(),
            ));
        }

        if session.typing_ttl_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "typing_ttl_ms must be greater than zero".into(),
            ));
        }

        let max_tick = session
            .typing_ttl_ms
            .min(MAX_SWEEP_TICK.as_millis() as u64);
        if session.typing_tick_ms == 0 || session.typing_tick_ms > max_tick {
            return Err(SyncError::InvalidConfig(format!(
                "typing_tick_ms must be between 1 and {max_tick}"
            )));
        }

        if session.event_buffer == 0 {
            return Err(SyncError::InvalidConfig(
                "event_buffer must be greater than zero".into(),
            ));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Applies `HUDDLE_*` overrides read through `lookup`.
    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(limit) = lookup("HUDDLE_SNAPSHOT_LIMIT") {
            match limit.parse::<u32>() {
                Ok(n) => {
                    debug!(snapshot_limit = n, "Overriding snapshot limit from environment");
                    self.session.snapshot_limit = n;
                }
                Err(_) => warn!(value = %limit, "Invalid HUDDLE_SNAPSHOT_LIMIT"),
            }
        }

        if let Some(ttl) = lookup("HUDDLE_TYPING_TTL_MS") {
            match ttl.parse::<u64>() {
                Ok(ms) => self.session.typing_ttl_ms = ms,
                Err(_) => warn!(value = %ttl, "Invalid HUDDLE_TYPING_TTL_MS"),
            }
        }

        if let Some(tick) = lookup("HUDDLE_TYPING_TICK_MS") {
            match tick.parse::<u64>() {
                Ok(ms) => self.session.typing_tick_ms = ms,
                Err(_) => warn!(value = %tick, "Invalid HUDDLE_TYPING_TICK_MS"),
            }
        }

        if let Some(buffer) = lookup("HUDDLE_EVENT_BUFFER") {
            match buffer.parse::<usize>() {
                Ok(n) => self.session.event_buffer = n,
                Err(_) => warn!(value = %buffer, "Invalid HUDDLE_EVENT_BUFFER"),
            }
        }

        if let Some(path) = lookup("HUDDLE_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.store.database_path = Some(PathBuf::from(path));
        }
    }

    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "huddle", "huddle")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }
}
