//! Transport abstraction for relay connections.
//!
//! A [`Transport`] carries JSON text frames to and from one relay. The
//! relay task owns one transport and drives it; a [`Connector`] builds the
//! transport for a URL so the pool can be pointed at real sockets or at
//! scripted mocks.
//!
//! # Design
//!
//! The transport trait is async and connection-oriented:
//! - `connect()` establishes a connection
//! - `send()` transmits one text frame
//! - `recv()` waits for the next text frame
//! - `close()` gracefully terminates
//!
//! `recv()` must be cancel-safe: the relay task races it against outbound
//! traffic and drops whichever future loses.

mod mock;
mod websocket;

pub use mock::{MockConnector, MockTransport, Responder};
pub use websocket::{WebSocketConnector, WebSocketTransport};

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Connection timeout.
    #[error("connection timeout")]
    Timeout,
}

/// A text-frame connection to one relay.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the relay at `url`.
    async fn connect(&self, url: &str) -> Result<(), TransportError>;

    /// Send one text frame.
    async fn send(&self, text: &str) -> Result<(), TransportError>;

    /// Receive the next text frame.
    ///
    /// Waits until a frame arrives or the connection closes.
    async fn recv(&self) -> Result<String, TransportError>;

    /// Check if currently connected.
    fn is_connected(&self) -> bool;

    /// Close the connection gracefully.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Builds the transport a relay connection will use.
pub trait Connector: Send + Sync {
    /// A fresh transport for `url` (already normalized).
    fn transport(&self, url: &str) -> Arc<dyn Transport>;
}
