//! Client configuration.
//!
//! Loaded from a TOML file; every field has a default so an empty file (or
//! no file at all) is a valid configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nostr_sync_core::ReconnectPolicy;

/// Tunables for loaders, publishing and relay connections.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientConfig {
    /// Events requested per backfill block (default: 30).
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// How many retained events deep a relay's read-ahead must reach past the
    /// cursor before another block is requested (default: 2).
    #[serde(default = "default_load_next_block_buffer")]
    pub load_next_block_buffer: usize,

    /// Milliseconds to wait for publish acknowledgements (default: 5000).
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,

    /// Seconds allowed for a single connection attempt (default: 10).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Failed reconnects tolerated before a relay gives up (default: 5).
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Relays used when a command names none.
    #[serde(default)]
    pub default_relays: Vec<String>,
}

fn default_block_size() -> usize {
    30
}

fn default_load_next_block_buffer() -> usize {
    2
}

fn default_publish_timeout_ms() -> u64 {
    5000
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            load_next_block_buffer: default_load_next_block_buffer(),
            publish_timeout_ms: default_publish_timeout_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            default_relays: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Publish acknowledgement deadline.
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    /// Per-attempt connection deadline.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Reconnect limits for relay connections.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_reconnect_attempts,
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}
