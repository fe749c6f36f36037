//! Configuration for the sync engine.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $ATTUNE_CONFIG (explicit override)
//!   2. <plugin_dir>/attune.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub storage: StorageConfig,
    pub transfer: TransferConfig,
    pub apply: ApplyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root under which all engine state lives.
    pub plugin_dir: PathBuf,
    /// Age after which cached file blobs may be swept. 0 = never.
    pub file_cache_max_age_hours: u64,
    /// Age after which components may be swept. 0 = never.
    /// Recipes are never swept regardless of this setting.
    pub component_max_age_hours: u64,
}

impl StorageConfig {
    pub fn file_cache_dir(&self) -> PathBuf {
        self.plugin_dir.join("FileCache")
    }

    pub fn component_dir(&self) -> PathBuf {
        self.plugin_dir.join("ComponentStorage")
    }

    pub fn component_cache_dir(&self) -> PathBuf {
        self.plugin_dir.join("ComponentCache")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunk size for control messages.
    pub control_chunk_size: usize,
    /// Chunk size for binary (coordinated) file chunks.
    pub file_chunk_size: usize,
    /// Chunk size for the streaming-JSON file chunk fallback.
    pub json_chunk_size: usize,
    /// Payloads up to this total go inline in one response.
    pub direct_limit_bytes: u64,
    /// Payloads up to this total stream progressively; beyond it the
    /// differential path is preferred when a previous manifest exists.
    pub progressive_limit_bytes: u64,
    /// Per-chunk send attempts before the file fails.
    pub max_send_attempts: u32,
    /// First retry backoff; doubles per attempt.
    pub send_backoff_ms: u64,
    /// Pacing: sleep `pause_ms` every `pause_every_chunks` chunks.
    pub pause_every_chunks: u32,
    pub pause_ms: u64,
    /// Yield to the executor every this many chunks.
    pub yield_every_chunks: u32,
    /// Default `send_request` timeout.
    pub request_timeout_secs: u64,
    /// Sessions idle longer than this are dropped and their buffers freed.
    pub idle_session_secs: u64,
    /// Bounded wait for a channel to open.
    pub channel_open_timeout_secs: u64,
    /// Poll interval while waiting for a channel to open.
    pub channel_poll_ms: u64,
    /// Fixed per-channel memory budget used in channel negotiation.
    pub per_channel_budget_mb: u64,
}

impl TransferConfig {
    pub fn send_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.send_backoff_ms << attempt)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn idle_session_max(&self) -> Duration {
        Duration::from_secs(self.idle_session_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyConfig {
    /// Bounded wait for the target to become ready before applying.
    pub ready_timeout_secs: u64,
    /// Transactions kept for rollback. Oldest entries are discarded.
    pub max_transactions: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            transfer: TransferConfig::default(),
            apply: ApplyConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from("."),
            file_cache_max_age_hours: 0,
            component_max_age_hours: 0,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            control_chunk_size: 1024,
            file_chunk_size: 16 * 1024,
            json_chunk_size: 32 * 1024,
            direct_limit_bytes: 1024 * 1024,
            progressive_limit_bytes: 50 * 1024 * 1024,
            max_send_attempts: 3,
            send_backoff_ms: 100,
            pause_every_chunks: 5,
            pause_ms: 10,
            yield_every_chunks: 10,
            request_timeout_secs: 30,
            idle_session_secs: 600,
            channel_open_timeout_secs: 15,
            channel_poll_ms: 200,
            per_channel_budget_mb: 64,
        }
    }
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            ready_timeout_secs: 5,
            max_transactions: 10,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SyncConfig {
    /// Load config rooted at `plugin_dir`: env vars → file → defaults.
    pub fn load(plugin_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let plugin_dir = plugin_dir.into();
        let path = std::env::var("ATTUNE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| plugin_dir.join("attune.toml"));

        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            SyncConfig::default()
        };
        if config.storage.plugin_dir == PathBuf::from(".") {
            config.storage.plugin_dir = plugin_dir;
        }
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply ATTUNE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ATTUNE_STORAGE__PLUGIN_DIR") {
            self.storage.plugin_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ATTUNE_TRANSFER__FILE_CHUNK_SIZE") {
            if let Ok(n) = v.parse() {
                self.transfer.file_chunk_size = n;
            }
        }
        if let Ok(v) = std::env::var("ATTUNE_TRANSFER__IDLE_SESSION_SECS") {
            if let Ok(n) = v.parse() {
                self.transfer.idle_session_secs = n;
            }
        }
        if let Ok(v) = std::env::var("ATTUNE_APPLY__READY_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.apply.ready_timeout_secs = n;
            }
        }
    }
}
