//! Backward pagination for one relay.
//!
//! A block loader walks back in time one block at a time. Each block asks for
//! at most `block_size` events older than the oldest event it already holds.
//! A block that yields nothing new means the relay has no older matching
//! events, and the loader is done for good.

use nostr_sync_types::{Event, Filter};

/// Per-relay pagination state: `Idle -> Loading -> (Idle | Complete)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockState {
    /// Ready for another block.
    #[default]
    Idle,
    /// A block request is in flight.
    Loading,
    /// The last block produced no new events. Terminal.
    Complete,
}

impl BlockState {
    /// Move to `Loading`. Returns false (and changes nothing) unless idle.
    pub fn start(&mut self) -> bool {
        if *self != BlockState::Idle {
            return false;
        }
        *self = BlockState::Loading;
        true
    }

    /// Finish the in-flight block. Zero new events completes the loader.
    /// Ignored unless loading.
    pub fn finish(&mut self, new_events: usize) {
        if *self != BlockState::Loading {
            return;
        }
        *self = if new_events == 0 {
            BlockState::Complete
        } else {
            BlockState::Idle
        };
    }

    /// Abandon the in-flight block without judging completeness.
    pub fn abort(&mut self) {
        if *self == BlockState::Loading {
            *self = BlockState::Idle;
        }
    }

    /// Whether a block is in flight.
    pub fn is_loading(&self) -> bool {
        *self == BlockState::Loading
    }

    /// Whether the relay is exhausted.
    pub fn is_complete(&self) -> bool {
        *self == BlockState::Complete
    }
}

/// Filters for the next block: `limit` set to the block size and, once
/// something is held, `until` set to just before the oldest held event.
///
/// A filter whose window closes (nothing older than the oldest event, or
/// `until` falling before its `since`) is left out. An empty result after
/// the first block means the relay has nothing further to give.
pub fn next_block_filters(base: &[Filter], oldest: Option<&Event>, block_size: usize) -> Vec<Filter> {
    base.iter()
        .cloned()
        .filter_map(|filter| {
            let filter = filter.limit(block_size);
            let event = match oldest {
                Some(event) => event,
                None => return Some(filter),
            };
            let until = event.created_at.checked_sub(1)?;
            if filter.since.map_or(false, |since| since > until) {
                return None;
            }
            Some(filter.until(until))
        })
        .collect()
}

/// Whether a relay's read-ahead buffer is used up relative to the cursor.
///
/// `boundary` is the `created_at` of the relay's buffer-th oldest retained
/// event. Nothing retained that deep, or a boundary still at or after the
/// cursor, means another block is needed.
pub fn needs_block(boundary: Option<u64>, cursor: u64) -> bool {
    boundary.map_or(true, |created_at| created_at >= cursor)
}
