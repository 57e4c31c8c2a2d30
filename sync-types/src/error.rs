//! Error types for nostr-sync.

use thiserror::Error;

/// Errors produced while decoding or validating protocol data.
#[derive(Debug, Error)]
pub enum SyncError {
    /// JSON encoding or decoding failed
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Envelope had the wrong shape for its command
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Envelope command was not recognised
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// Coordinate string could not be parsed
    #[error("invalid coordinate: {0}")]
    InvalidCoordinate(String),

    /// Filter failed validation
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SyncError::UnknownMessageType("AUTH".into());
        assert_eq!(err.to_string(), "unknown message type: AUTH");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SyncError>();
    }
}
