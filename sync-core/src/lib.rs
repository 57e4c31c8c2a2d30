//! # nostr-sync-core
//!
//! Pure logic for the relay sync engine (no I/O, instant tests).
//!
//! This crate holds the in-memory state and algorithms: the reactive
//! [`Subject`], the deduplicating [`EventStore`], the per-relay connection
//! state machine, backward pagination and publish acknowledgement tracking.
//! None of it touches a socket or a timer.
//!
//! ## Design Philosophy
//!
//! State machines here take input and produce output without side effects:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O is performed by `nostr-sync-client`, which interprets the
//! actions produced here.
//!
//! Shared structures ([`Subject`], [`EventStore`]) guard their state with a
//! mutex and never call an observer while holding it.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ack;
pub mod connection;
pub mod pagination;
pub mod query;
pub mod store;
pub mod subject;

pub use ack::{AckOutcome, AckTracker, CommandResult, OK_RESULT, TIMEOUT_MESSAGE};
pub use connection::{
    calculate_backoff, Action, ConnectionEvent, ReconnectPolicy, RelayEvent, RelayState,
};
pub use pagination::{needs_block, next_block_filters, BlockState};
pub use query::{diff_query_maps, QueryMapDiff};
pub use store::{EventFilter, EventStore};
pub use subject::{PersistentSubject, Subject, Subscription};
