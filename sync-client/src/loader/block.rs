//! Per-relay block loader.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

use nostr_sync_core::{next_block_filters, BlockState, EventFilter, EventStore, Subject, Subscription};
use nostr_sync_types::{Event, Filter};

use crate::error::Result;
use crate::pool::{normalize_url, RelayPool};
use crate::request::Request;
use crate::services::{self, SyncContext};

struct InFlight {
    request: Request,
    _events: Subscription,
}

struct LoaderState {
    block: BlockState,
    active: bool,
    in_flight: Option<InFlight>,
}

struct BlockInner {
    relay: String,
    filters: Vec<Filter>,
    block_size: usize,
    pool: RelayPool,
    context: SyncContext,
    store: EventStore,
    state: Mutex<LoaderState>,
    on_block_finish: Subject<()>,
    deletions: Mutex<Option<Subscription>>,
}

impl BlockInner {
    fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Returns true when the event was new to this loader's store.
    fn handle_event(&self, event: &Event) -> bool {
        if !self.is_active() {
            return false;
        }
        let deletions = &self.context.deletions;
        if event.is_deletion() {
            deletions.handle_event(event);
        }
        if deletions.is_deleted(event) {
            return false;
        }
        if event.is_replaceable() {
            self.context.replaceables.handle_event(event);
        }
        self.context.seen.handle_event(event);
        self.context.seen.record_relay(&event.id, &self.relay);
        self.store.add_event(event.clone())
    }

    fn apply_deletion(&self, deletion: &Event) {
        services::apply_deletion(&self.store, deletion);
    }

    fn finish_block(&self, new_events: usize) {
        let (complete, finished) = {
            let mut state = self.state.lock();
            if !state.active || !state.block.is_loading() {
                return;
            }
            state.block.finish(new_events);
            (state.block.is_complete(), state.in_flight.take())
        };
        drop(finished);

        debug!(relay = %self.relay, "got {} events", new_events);
        if complete {
            debug!(relay = %self.relay, "complete");
        }
        self.on_block_finish.next(());
    }
}

/// Pages one relay backward in time, one block per request.
///
/// `Idle -> Loading -> (Idle | Complete)`. A block that adds nothing new to
/// the store completes the loader for good. The loader also listens to the
/// shared tombstone stream and removes deleted events from its store.
#[derive(Clone)]
pub struct BlockLoader {
    inner: Arc<BlockInner>,
}

impl BlockLoader {
    /// Loader for `relay` with base `filters`. Filters are validated here so
    /// a bad query fails before any request is issued.
    pub fn new(
        pool: RelayPool,
        context: SyncContext,
        relay: &str,
        filters: Vec<Filter>,
        block_size: usize,
    ) -> Result<Self> {
        let relay = normalize_url(relay)?;
        for filter in &filters {
            filter.validate()?;
        }

        let inner = Arc::new(BlockInner {
            store: EventStore::new(relay.clone()),
            relay,
            filters,
            block_size: block_size.max(1),
            pool,
            context,
            state: Mutex::new(LoaderState {
                block: BlockState::Idle,
                active: true,
                in_flight: None,
            }),
            on_block_finish: Subject::stream(),
            deletions: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let deletions = inner.context.deletions.stream().subscribe(move |deletion: &Event| {
            if let Some(inner) = weak.upgrade() {
                inner.apply_deletion(deletion);
            }
        });
        *inner.deletions.lock() = Some(deletions);

        Ok(Self { inner })
    }

    /// Relay URL.
    pub fn relay(&self) -> &str {
        &self.inner.relay
    }

    /// Base filters (without pagination bounds).
    pub fn filters(&self) -> &[Filter] {
        &self.inner.filters
    }

    /// Events loaded so far.
    pub fn store(&self) -> &EventStore {
        &self.inner.store
    }

    /// Emits after every block, including the final empty one.
    pub fn on_block_finish(&self) -> &Subject<()> {
        &self.inner.on_block_finish
    }

    /// Pagination state.
    pub fn state(&self) -> BlockState {
        self.inner.state.lock().block
    }

    /// Whether a block is in flight.
    pub fn is_loading(&self) -> bool {
        self.state().is_loading()
    }

    /// Whether the relay has no older matching events.
    pub fn is_complete(&self) -> bool {
        self.state().is_complete()
    }

    /// Request the next block. Returns false when no request was issued:
    /// the loader is loading, complete, or cleaned up, or its filters leave
    /// no older window to ask for. That last case completes the loader and
    /// emits `on_block_finish` right away.
    pub fn load_next_block(&self) -> Result<bool> {
        let oldest = self.inner.store.get_last_event(0, None);
        let filters = next_block_filters(&self.inner.filters, oldest.as_ref(), self.inner.block_size);

        let mut state = self.inner.state.lock();
        if !state.active || !state.block.start() {
            return Ok(false);
        }
        if oldest.is_some() && filters.is_empty() {
            state.block.finish(0);
            drop(state);
            debug!(relay = %self.inner.relay, "complete, window exhausted");
            self.inner.on_block_finish.next(());
            return Ok(false);
        }

        let request = match Request::new(&self.inner.pool, [&self.inner.relay]) {
            Ok(request) => request,
            Err(e) => {
                state.block.abort();
                return Err(e);
            }
        };
        let new_events = Arc::new(AtomicUsize::new(0));
        let weak: Weak<BlockInner> = Arc::downgrade(&self.inner);
        let events = request.on_event().subscribe({
            let weak = weak.clone();
            let new_events = Arc::clone(&new_events);
            move |event: &Event| {
                if let Some(inner) = weak.upgrade() {
                    if inner.handle_event(event) {
                        new_events.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        });
        if let Err(e) = request.start(filters) {
            state.block.abort();
            return Err(e);
        }

        let done = request.on_complete();
        state.in_flight = Some(InFlight {
            request,
            _events: events,
        });
        drop(state);

        debug!(relay = %self.inner.relay, "loading next block");
        tokio::spawn(async move {
            done.wait().await;
            if let Some(inner) = weak.upgrade() {
                inner.finish_block(new_events.load(Ordering::SeqCst));
            }
        });
        Ok(true)
    }

    /// Stop loading: cancel the in-flight block, stop following the
    /// tombstone stream, and detach the store. Results still in flight are
    /// dropped.
    pub fn cleanup(&self) {
        let in_flight = {
            let mut state = self.inner.state.lock();
            state.active = false;
            state.block.abort();
            state.in_flight.take()
        };
        if let Some(in_flight) = in_flight {
            in_flight.request.cancel();
        }
        self.inner.deletions.lock().take();
        self.inner.store.cleanup();
    }

    /// The `nth` newest loaded event passing `filter`.
    pub fn get_first_event(&self, nth: usize, filter: Option<&EventFilter>) -> Option<Event> {
        self.inner.store.get_first_event(nth, filter)
    }

    /// The `nth` oldest loaded event passing `filter`.
    pub fn get_last_event(&self, nth: usize, filter: Option<&EventFilter>) -> Option<Event> {
        self.inner.store.get_last_event(nth, filter)
    }
}

impl std::fmt::Debug for BlockLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockLoader")
            .field("relay", &self.inner.relay)
            .field("state", &self.state())
            .field("events", &self.inner.store.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::transport::{MockConnector, MockTransport};
    use nostr_sync_types::{kind, ClientMessage, Tag};
    use std::time::Duration;

    const RELAY: &str = "wss://relay.test";

    fn note(created_at: u64) -> Event {
        Event::unsigned("aa", kind::TEXT_NOTE, created_at, vec![], created_at.to_string())
    }

    fn setup(events: Vec<Event>) -> (RelayPool, MockTransport, SyncContext) {
        let connector = MockConnector::new();
        let transport = connector.transport_for(RELAY);
        transport.respond_with_events(events);
        let pool = RelayPool::new(Arc::new(connector), &ClientConfig::default());
        (pool, transport, SyncContext::new())
    }

    async fn next_block(loader: &BlockLoader) {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = loader.on_block_finish().subscribe(move |_| {
            let _ = tx.send(());
        });
        assert!(loader.load_next_block().unwrap());
        assert!(loader.is_loading());
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("block did not finish");
    }

    fn block_requests(transport: &MockTransport) -> Vec<Vec<Filter>> {
        transport
            .sent_client_messages()
            .into_iter()
            .filter_map(|m| match m {
                ClientMessage::Req { filters, .. } => Some(filters),
                _ => None,
            })
            .collect()
    }

    // ===========================================
    // Pagination
    // ===========================================

    #[tokio::test]
    async fn pages_back_until_an_empty_block() {
        let (pool, transport, context) = setup((1..=4).map(note).collect());
        let loader = BlockLoader::new(pool, context, RELAY, vec![Filter::new().kinds([1])], 2).unwrap();

        next_block(&loader).await;
        assert_eq!(loader.state(), BlockState::Idle);
        assert_eq!(loader.store().len(), 2);

        next_block(&loader).await;
        assert_eq!(loader.state(), BlockState::Idle);
        assert_eq!(loader.get_last_event(0, None).unwrap().created_at, 1);

        next_block(&loader).await;
        assert!(loader.is_complete());
        assert!(!loader.load_next_block().unwrap());

        let requests = block_requests(&transport);
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0][0].until, None);
        assert_eq!(requests[1][0].until, Some(2));
        assert_eq!(requests[2][0].until, Some(0));
        assert!(requests.iter().all(|f| f[0].limit == Some(2)));
    }

    #[tokio::test]
    async fn completes_without_request_once_since_is_reached() {
        let (pool, transport, context) = setup(vec![note(100), note(150)]);
        let filters = vec![Filter::new().kinds([1]).since(100)];
        let loader = BlockLoader::new(pool, context, RELAY, filters, 10).unwrap();
        let (finished, _sub) = {
            let count = Arc::new(AtomicUsize::new(0));
            let c = Arc::clone(&count);
            let sub = loader.on_block_finish().subscribe(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            });
            (count, sub)
        };

        next_block(&loader).await;
        assert_eq!(loader.store().len(), 2);
        assert_eq!(loader.state(), BlockState::Idle);

        assert!(!loader.load_next_block().unwrap());
        assert!(loader.is_complete());
        assert_eq!(finished.load(Ordering::SeqCst), 2);
        assert_eq!(block_requests(&transport).len(), 1);
    }

    #[tokio::test]
    async fn second_load_while_loading_is_refused() {
        let connector = MockConnector::new();
        // no responder: the block never finishes
        let pool = RelayPool::new(Arc::new(connector), &ClientConfig::default());
        let loader = BlockLoader::new(pool, SyncContext::new(), RELAY, vec![Filter::new()], 2).unwrap();

        assert!(loader.load_next_block().unwrap());
        assert!(!loader.load_next_block().unwrap());
        assert!(loader.is_loading());

        loader.cleanup();
        assert_eq!(loader.state(), BlockState::Idle);
        assert!(!loader.load_next_block().unwrap());
    }

    // ===========================================
    // Deletions
    // ===========================================

    #[tokio::test]
    async fn tombstones_remove_and_block_events() {
        let doomed = note(3);
        let (pool, _transport, context) = setup(vec![note(1), note(2), doomed.clone()]);
        let loader = BlockLoader::new(pool, context.clone(), RELAY, vec![Filter::new()], 10).unwrap();

        next_block(&loader).await;
        assert!(loader.store().has_event(&doomed.id));

        let deletion = Event::unsigned(
            "aa",
            kind::DELETION,
            5,
            vec![Tag::new(["e", doomed.id.as_str()])],
            "",
        );
        context.deletions.handle_event(&deletion);
        assert!(!loader.store().has_event(&doomed.id));

        // a later copy from a relay stays out
        assert!(!loader.inner.handle_event(&doomed));
        assert!(!loader.store().has_event(&doomed.id));
    }

    #[tokio::test]
    async fn coordinate_deletion_spares_newer_version_in_either_order() {
        let article = Event::unsigned("aa", 30023, 20, vec![Tag::new(["d", "post"])], "v2");
        let deletion = Event::unsigned("aa", kind::DELETION, 10, vec![Tag::new(["a", "30023:aa:post"])], "");

        // version first, then the older deletion
        let (pool, _transport, context) = setup(Vec::new());
        let loader = BlockLoader::new(pool, context, RELAY, vec![Filter::new()], 10).unwrap();
        assert!(loader.inner.handle_event(&article));
        loader.inner.handle_event(&deletion);
        assert!(loader.store().has_event(&article.id));

        // deletion first, then the newer version
        let (pool, _transport, context) = setup(Vec::new());
        let loader = BlockLoader::new(pool, context, RELAY, vec![Filter::new()], 10).unwrap();
        loader.inner.handle_event(&deletion);
        assert!(loader.inner.handle_event(&article));
        assert!(loader.store().has_event(&article.id));
    }

    #[tokio::test]
    async fn loaded_events_reach_shared_services() {
        let profile = Event::unsigned("aa", kind::METADATA, 7, vec![], "{}");
        let (pool, _transport, context) = setup(vec![profile.clone(), note(1)]);
        let loader = BlockLoader::new(pool, context.clone(), RELAY, vec![Filter::new()], 10).unwrap();

        next_block(&loader).await;
        assert_eq!(loader.store().len(), 2);
        assert!(context.seen.contains(&profile.id));
        assert_eq!(context.seen.relays_for(&profile.id), vec![RELAY]);
        let coordinate = profile.coordinate().unwrap();
        assert_eq!(context.replaceables.get(&coordinate).unwrap().id, profile.id);
    }

    #[tokio::test]
    async fn invalid_filters_fail_construction() {
        let (pool, _transport, context) = setup(Vec::new());
        assert!(BlockLoader::new(pool, context, RELAY, vec![Filter::new().limit(0)], 10).is_err());
    }
}
