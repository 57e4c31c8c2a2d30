//! # nostr-sync-client
//!
//! Relay connections and the sync workflows built on them.
//!
//! This is the library applications use to read from and write to a set of
//! relays. It drives the pure logic in `nostr-sync-core` with tokio tasks
//! and websockets.
//!
//! ## Features
//!
//! - **Relay Pool**: one lazily connected, self-reconnecting [`Relay`] per URL
//! - **Requests**: one-shot [`Request`] that completes at end-of-stored-events
//! - **Live Queries**: [`MultiSubscription`] keeps one subscription per relay
//! - **Timelines**: [`TimelineLoader`] merges live events with per-relay
//!   backward pagination ([`BlockLoader`]) into one sorted store
//! - **Publishing**: [`PublishAction`] fans out an event and gathers one
//!   acknowledgement per relay, with a timeout
//! - **Transport Abstraction**: pluggable transport layer (websocket, mock)
//!
//! ## Example
//!
//! ```ignore
//! use nostr_sync_client::{ClientConfig, RelayPool, SyncContext, TimelineLoader};
//! use nostr_sync_types::{Filter, QueryMap};
//!
//! let config = ClientConfig::default();
//! let pool = RelayPool::websocket(&config);
//! let context = SyncContext::new();
//!
//! let timeline = TimelineLoader::new(pool.clone(), context.clone(), "home", &config);
//! let mut map = QueryMap::new();
//! map.insert("wss://relay.example".into(), vec![Filter::new().kinds([1])]);
//! timeline.set_query_map(map)?;
//! timeline.open()?;
//! timeline.load_next_block();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod deferred;
pub mod error;
pub mod loader;
pub mod pool;
pub mod publish;
pub mod relay;
pub mod request;
pub mod services;
pub mod subscription;
pub mod transport;

pub use config::{ClientConfig, ConfigError};
pub use deferred::Deferred;
pub use error::{ClientError, Result};
pub use loader::{BlockLoader, TimelineLoader};
pub use pool::{normalize_query_map, normalize_relays, normalize_url, RelayPool};
pub use publish::{PublishAction, DEFAULT_PUBLISH_TIMEOUT};
pub use relay::{MessageHandler, Relay, RelayOptions};
pub use request::Request;
pub use services::{
    apply_deletion, deletion_targets, DeletionService, LatestReplaceableCache, MemoryPublishLog,
    SeenEvents, SyncContext,
};
pub use subscription::MultiSubscription;
pub use transport::{
    Connector, MockConnector, MockTransport, Responder, Transport, TransportError,
    WebSocketConnector, WebSocketTransport,
};
