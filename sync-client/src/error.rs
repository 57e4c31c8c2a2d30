//! Client error types.

use nostr_sync_types::SyncError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by the client API.
///
/// Network failures are not among them: a relay that cannot be reached only
/// ever shows up as "no result" to requests and loaders.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Relay URL could not be parsed or is not `ws://` / `wss://`.
    #[error("invalid relay url {url}: {reason}")]
    InvalidUrl {
        /// The rejected input.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Filter or query map failed validation.
    #[error("invalid query: {0}")]
    InvalidQuery(#[from] SyncError),

    /// A one-shot request was started twice.
    #[error("request already started")]
    AlreadyStarted,

    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
