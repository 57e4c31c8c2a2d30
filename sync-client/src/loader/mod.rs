//! Backward-paginating loaders.
//!
//! A [`BlockLoader`] pages one relay back in time; a [`TimelineLoader`]
//! runs one block loader per relay in its query map, merges their stores,
//! and adds a live subscription for new events.

mod block;
mod timeline;

pub use block::BlockLoader;
pub use timeline::TimelineLoader;
