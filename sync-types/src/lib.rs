//! # sync-types
//!
//! Data types shared by every nostr-sync crate:
//! - [`Event`], [`Tag`], [`Coordinate`] - the event model and replaceable slots
//! - [`Filter`], [`QueryMap`] - read-path query shapes
//! - [`ClientMessage`], [`RelayMessage`] - JSON array envelopes on the wire
//! - [`SubscriptionId`] - subscription correlation
//! - [`SyncError`] - error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod event;
mod filter;
mod ids;
mod messages;

pub use error::SyncError;
pub use event::{
    is_parameterized_replaceable, is_replaceable, kind, Coordinate, Event, Tag,
};
pub use filter::{map_query_map, validate_query_map, Filter, QueryMap};
pub use ids::SubscriptionId;
pub use messages::{ClientMessage, RelayMessage};
