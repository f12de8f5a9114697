//! # Sync Configuration
//!
//! Configuration management for the sync client.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TIDE_TRANSPORT=http                                                │
//! │     TIDE_KEEPALIVE_TIMEOUT_SECS=30                                     │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tide/tide.toml (Linux)                                   │
//! │     ~/Library/Application Support/dev.tide.tide/tide.toml (macOS)      │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [stream]
//! transport = "websocket"     # websocket | http
//! keepalive_timeout_secs = 60
//! credit_batch = 10
//! credit_low_water = 5
//!
//! [stream.parameters]
//! region = "eu"
//!
//! [upload]
//! poll_interval_secs = 5
//!
//! [storage]
//! compact_threshold = 1000
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Transport Kind
// =============================================================================

/// Which stream transport to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// WebSocket with explicit credit frames.
    #[default]
    Websocket,
    /// HTTP POST streaming newline-delimited JSON.
    Http,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Websocket => write!(f, "websocket"),
            TransportKind::Http => write!(f, "http"),
        }
    }
}

impl std::str::FromStr for TransportKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "websocket" | "ws" => Ok(TransportKind::Websocket),
            "http" | "ndjson" => Ok(TransportKind::Http),
            other => Err(SyncError::InvalidConfig(format!(
                "Unknown transport: '{}'. Valid options: websocket, http",
                other
            ))),
        }
    }
}

// =============================================================================
// Stream Settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSettings {
    #[serde(default)]
    pub transport: TransportKind,

    #[serde(default = "default_stream_path")]
    pub stream_path: String,

    #[serde(default = "default_write_checkpoint_path")]
    pub write_checkpoint_path: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Reconnect when no line arrives for this long.
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_secs: u64,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Lines granted per credit frame.
    #[serde(default = "default_credit_batch")]
    pub credit_batch: usize,

    /// Buffered lines at or below which more credit is requested.
    #[serde(default = "default_credit_low_water")]
    pub credit_low_water: usize,

    /// Sync rule parameters sent with every request.
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,

    /// Hold a file lock beside the database while syncing, for storage shared
    /// between processes.
    #[serde(default)]
    pub shared_storage_lock: bool,
}

fn default_stream_path() -> String {
    "/sync/stream".into()
}
fn default_write_checkpoint_path() -> String {
    "/write-checkpoint2.json".into()
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_keepalive_timeout() -> u64 {
    60
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    60
}
fn default_credit_batch() -> usize {
    10
}
fn default_credit_low_water() -> usize {
    5
}

impl Default for StreamSettings {
    fn default() -> Self {
        StreamSettings {
            transport: TransportKind::default(),
            stream_path: default_stream_path(),
            write_checkpoint_path: default_write_checkpoint_path(),
            connect_timeout_secs: default_connect_timeout(),
            keepalive_timeout_secs: default_keepalive_timeout(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            credit_batch: default_credit_batch(),
            credit_low_water: default_credit_low_water(),
            parameters: BTreeMap::new(),
            shared_storage_lock: false,
        }
    }
}

impl StreamSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

// =============================================================================
// Upload Settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSettings {
    /// Upload check interval when no local commit wakes the loop.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_retry_initial_backoff")]
    pub retry_initial_backoff_ms: u64,

    #[serde(default = "default_retry_max_backoff")]
    pub retry_max_backoff_secs: u64,
}

fn default_poll_interval() -> u64 {
    5
}
fn default_retry_initial_backoff() -> u64 {
    1000
}
fn default_retry_max_backoff() -> u64 {
    60
}

impl Default for UploadSettings {
    fn default() -> Self {
        UploadSettings {
            poll_interval_secs: default_poll_interval(),
            retry_initial_backoff_ms: default_retry_initial_backoff(),
            retry_max_backoff_secs: default_retry_max_backoff(),
        }
    }
}

impl UploadSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn retry_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_initial_backoff_ms)
    }

    pub fn retry_max_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_max_backoff_secs)
    }
}

// =============================================================================
// Storage Settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Compact the op log after this many applied ops. 0 disables.
    #[serde(default = "default_compact_threshold")]
    pub compact_threshold: u64,
}

fn default_compact_threshold() -> u64 {
    1000
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            compact_threshold: default_compact_threshold(),
        }
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub stream: StreamSettings,

    #[serde(default)]
    pub upload: UploadSettings,

    #[serde(default)]
    pub storage: StorageSettings,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (tide.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)
                    .map_err(|e| SyncError::ConfigLoadFailed(e.to_string()))?;
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
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

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

    pub fn validate(&self) -> SyncResult<()> {
        let stream = &self.stream;

        if !stream.stream_path.starts_with('/') || !stream.write_checkpoint_path.starts_with('/') {
            return Err(SyncError::InvalidConfig(
                "stream_path and write_checkpoint_path must start with '/'".into(),
            ));
        }

        if stream.credit_batch == 0 {
            return Err(SyncError::InvalidConfig(
                "credit_batch must be greater than 0".into(),
            ));
        }

        if stream.credit_low_water >= stream.credit_batch {
            return Err(SyncError::InvalidConfig(format!(
                "credit_low_water ({}) must be below credit_batch ({})",
                stream.credit_low_water, stream.credit_batch
            )));
        }

        if stream.keepalive_timeout_secs == 0 || stream.connect_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "timeouts must be greater than 0".into(),
            ));
        }

        if stream.initial_backoff() > stream.max_backoff() {
            return Err(SyncError::InvalidConfig(
                "initial_backoff_ms exceeds max_backoff_secs".into(),
            ));
        }

        if self.upload.poll_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "poll_interval_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(kind) = std::env::var("TIDE_TRANSPORT") {
            match kind.parse() {
                Ok(parsed) => {
                    debug!(transport = %kind, "Overriding transport from environment");
                    self.stream.transport = parsed;
                }
                Err(_) => warn!(transport = %kind, "Unknown transport in environment"),
            }
        }

        if let Ok(secs) = std::env::var("TIDE_KEEPALIVE_TIMEOUT_SECS") {
            if let Ok(s) = secs.parse::<u64>() {
                self.stream.keepalive_timeout_secs = s;
            }
        }

        if let Ok(batch) = std::env::var("TIDE_CREDIT_BATCH") {
            if let Ok(n) = batch.parse::<usize>() {
                self.stream.credit_batch = n;
            }
        }

        if let Ok(low) = std::env::var("TIDE_CREDIT_LOW_WATER") {
            if let Ok(n) = low.parse::<usize>() {
                self.stream.credit_low_water = n;
            }
        }

        if let Ok(secs) = std::env::var("TIDE_UPLOAD_POLL_SECS") {
            if let Ok(s) = secs.parse::<u64>() {
                self.upload.poll_interval_secs = s;
            }
        }

        if let Ok(flag) = std::env::var("TIDE_SHARED_STORAGE_LOCK") {
            self.stream.shared_storage_lock = matches!(flag.to_lowercase().as_str(), "1" | "true" | "yes");
        }
    }

    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "tide", "tide")
            .map(|dirs| dirs.config_dir().join("tide.toml"))
    }
}
