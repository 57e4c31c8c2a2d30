//! Configuration management for sync-cli.

use anyhow::{Context, Result};
use std::path::Path;

use nostr_sync_client::{normalize_relays, ClientConfig};

/// Load the client configuration, falling back to defaults without a file.
pub fn load(path: Option<&Path>) -> Result<ClientConfig> {
    match path {
        Some(path) => ClientConfig::from_file(path).context("Failed to load configuration"),
        None => Ok(ClientConfig::default()),
    }
}

/// Relays named on the command line, or the configured defaults.
pub fn resolve_relays(requested: &[String], config: &ClientConfig) -> Result<Vec<String>> {
    let relays = if requested.is_empty() {
        &config.default_relays
    } else {
        requested
    };
    if relays.is_empty() {
        anyhow::bail!("No relays given. Pass --relay or set default_relays in the config file.");
    }
    normalize_relays(relays).context("Invalid relay url")
}
