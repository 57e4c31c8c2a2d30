//! Aggregate timeline over many relays.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use nostr_sync_core::{
    diff_query_maps, needs_block, EventFilter, EventStore, PersistentSubject, Subscription,
};
use nostr_sync_types::{map_query_map, validate_query_map, Event, QueryMap};

use super::BlockLoader;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::pool::{normalize_query_map, RelayPool};
use crate::services::{self, SyncContext};
use crate::subscription::MultiSubscription;

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

struct LoaderEntry {
    loader: BlockLoader,
    _on_finish: Subscription,
}

struct TimelineState {
    cursor: u64,
    query_map: QueryMap,
    loaders: BTreeMap<String, LoaderEntry>,
    event_filter: Option<EventFilter>,
}

struct TimelineInner {
    name: String,
    pool: RelayPool,
    context: SyncContext,
    block_size: usize,
    load_next_block_buffer: usize,
    store: EventStore,
    subscription: MultiSubscription,
    timeline: PersistentSubject<Vec<Event>>,
    /// Set when block results changed the store since the last recompute.
    stale: AtomicBool,
    loading: PersistentSubject<bool>,
    complete: PersistentSubject<bool>,
    state: Mutex<TimelineState>,
    listeners: Mutex<Vec<Subscription>>,
}

fn observe<T, F>(weak: &Weak<TimelineInner>, f: F) -> impl Fn(&T) + Send + Sync + 'static
where
    F: Fn(&TimelineInner, &T) + Send + Sync + 'static,
{
    let weak = weak.clone();
    move |value: &T| {
        if let Some(inner) = weak.upgrade() {
            f(&inner, value);
        }
    }
}

impl TimelineInner {
    fn update_timeline(&self) {
        self.stale.store(false, Ordering::SeqCst);
        let filter = self.state.lock().event_filter.clone();
        let events = self.store.get_sorted_events();
        let events = match filter {
            Some(filter) => events.into_iter().filter(|e| filter(e, &self.store)).collect(),
            None => events,
        };
        self.timeline.next(events);
    }

    /// Inserts that arrive with an in-flight block are folded into a single
    /// recompute when that block finishes.
    fn handle_store_event(&self, event: &Event) {
        let from_block = self
            .loaders()
            .iter()
            .any(|loader| loader.is_loading() && loader.store().has_event(&event.id));
        if from_block {
            self.stale.store(true, Ordering::SeqCst);
        } else {
            self.update_timeline();
        }
    }

    fn flush_timeline(&self) {
        if self.stale.load(Ordering::SeqCst) {
            self.update_timeline();
        }
    }

    /// Live events from the multi-relay subscription.
    fn handle_event(&self, event: &Event) {
        let deletions = &self.context.deletions;
        if event.is_deletion() {
            deletions.handle_event(event);
        }
        if deletions.is_deleted(event) {
            return;
        }
        if event.is_replaceable() {
            self.context.replaceables.handle_event(event);
        }
        self.context.seen.handle_event(event);
        self.store.add_event(event.clone());
    }

    fn handle_delete(&self, deletion: &Event) {
        services::apply_deletion(&self.store, deletion);
    }

    fn loaders(&self) -> Vec<BlockLoader> {
        self.state
            .lock()
            .loaders
            .values()
            .map(|entry| entry.loader.clone())
            .collect()
    }

    fn update_loading(&self) {
        let loading = self.loaders().iter().any(BlockLoader::is_loading);
        if self.loading.value() != loading {
            self.loading.next(loading);
        }
    }

    fn update_complete(&self) {
        let complete = self.loaders().iter().all(BlockLoader::is_complete);
        if self.complete.value() != complete {
            self.complete.next(complete);
        }
    }

    fn load_where(&self, wants_block: impl Fn(&BlockLoader) -> bool) {
        let mut triggered = false;
        for loader in self.loaders() {
            if loader.is_loading() || loader.is_complete() || !wants_block(&loader) {
                continue;
            }
            match loader.load_next_block() {
                Ok(started) => triggered |= started,
                Err(e) => warn!(name = %self.name, relay = %loader.relay(), error = %e, "block load failed"),
            }
        }
        if triggered {
            self.update_loading();
        }
    }

    fn trigger_block_loads(&self) {
        let (cursor, filter) = {
            let state = self.state.lock();
            (state.cursor, state.event_filter.clone())
        };
        let buffer = self.load_next_block_buffer;
        self.load_where(|loader| {
            let boundary = loader
                .get_last_event(buffer, filter.as_ref())
                .map(|event| event.created_at);
            needs_block(boundary, cursor)
        });
    }

    fn discard_loaders(&self) {
        let entries: Vec<LoaderEntry> = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.loaders).into_values().collect()
        };
        for entry in entries {
            entry.loader.cleanup();
            self.store.disconnect(entry.loader.store());
        }
        self.flush_timeline();
    }
}

/// A merged, sorted, filtered view of many relays, paged backward on
/// demand.
///
/// Every relay in the query map gets its own [`BlockLoader`]; their stores
/// are connected into one aggregate store that also receives live events
/// from a [`MultiSubscription`]. The `timeline`, `loading` and `complete`
/// subjects recompute whenever the aggregate store or a loader changes;
/// the results of one block are applied in a single recompute.
#[derive(Clone)]
pub struct TimelineLoader {
    inner: Arc<TimelineInner>,
}

impl TimelineLoader {
    /// An empty timeline. Block size and read-ahead come from `config`.
    pub fn new(pool: RelayPool, context: SyncContext, name: impl Into<String>, config: &ClientConfig) -> Self {
        let name = name.into();
        let inner = Arc::new(TimelineInner {
            store: EventStore::new(name.clone()),
            subscription: MultiSubscription::new(pool.clone(), name.clone()),
            name,
            pool,
            context,
            block_size: config.block_size.max(1),
            load_next_block_buffer: config.load_next_block_buffer,
            timeline: PersistentSubject::new(Vec::new()),
            stale: AtomicBool::new(false),
            loading: PersistentSubject::new(false),
            complete: PersistentSubject::new(false),
            state: Mutex::new(TimelineState {
                cursor: now(),
                query_map: QueryMap::new(),
                loaders: BTreeMap::new(),
                event_filter: None,
            }),
            listeners: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        let listeners = vec![
            inner.store.on_event().subscribe(observe(&weak, |t, e: &Event| t.handle_store_event(e))),
            inner.store.on_delete().subscribe(observe(&weak, |t, _: &String| t.update_timeline())),
            inner.store.on_clear().subscribe(observe(&weak, |t, _: &()| t.update_timeline())),
            inner.subscription.on_event().subscribe(observe(&weak, |t, e: &Event| t.handle_event(e))),
            inner.context.deletions.stream().subscribe(observe(&weak, |t, e: &Event| t.handle_delete(e))),
        ];
        *inner.listeners.lock() = listeners;

        Self { inner }
    }

    /// Timeline name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Sorted, filtered events, newest first.
    pub fn timeline(&self) -> &PersistentSubject<Vec<Event>> {
        &self.inner.timeline
    }

    /// True while any relay is loading a block.
    pub fn loading(&self) -> &PersistentSubject<bool> {
        &self.inner.loading
    }

    /// True once every relay is exhausted.
    pub fn complete(&self) -> &PersistentSubject<bool> {
        &self.inner.complete
    }

    /// Aggregate store.
    pub fn store(&self) -> &EventStore {
        &self.inner.store
    }

    /// Current cursor (unix seconds).
    pub fn cursor(&self) -> u64 {
        self.inner.state.lock().cursor
    }

    /// Current (normalized) query map.
    pub fn query_map(&self) -> QueryMap {
        self.inner.state.lock().query_map.clone()
    }

    /// Block loader for `relay`, if it is in the query map.
    pub fn loader(&self, relay: &str) -> Option<BlockLoader> {
        let url = crate::pool::normalize_url(relay).ok()?;
        self.inner
            .state
            .lock()
            .loaders
            .get(&url)
            .map(|entry| entry.loader.clone())
    }

    /// Number of block loaders.
    pub fn loader_count(&self) -> usize {
        self.inner.state.lock().loaders.len()
    }

    /// The live subscription.
    pub fn subscription(&self) -> &MultiSubscription {
        &self.inner.subscription
    }

    /// Point the timeline at a new relay→filters map.
    ///
    /// The map is validated before anything changes. A structurally equal
    /// map is a no-op. Loaders for removed or changed relays are discarded,
    /// loaders for changed or new relays are created, the live subscription
    /// follows with a smaller limit, and block loads are triggered.
    pub fn set_query_map(&self, query_map: QueryMap) -> Result<()> {
        validate_query_map(&query_map)?;
        let query_map = normalize_query_map(query_map)?;
        let inner = &self.inner;

        let (removed, added) = {
            let mut state = inner.state.lock();
            if state.query_map == query_map {
                return Ok(());
            }
            let diff = diff_query_maps(&state.query_map, &query_map);

            let mut created = Vec::new();
            for url in diff.to_open() {
                let filters = query_map.get(url).cloned().unwrap_or_default();
                let loader = BlockLoader::new(
                    inner.pool.clone(),
                    inner.context.clone(),
                    url,
                    filters,
                    inner.block_size,
                )?;
                created.push(loader);
            }

            info!(
                name = %inner.name,
                relays = query_map.len(),
                added = diff.added.len(),
                changed = diff.changed.len(),
                removed = diff.removed.len(),
                "set query map"
            );

            let removed: Vec<LoaderEntry> = diff
                .to_close()
                .filter_map(|url| state.loaders.remove(url))
                .collect();
            let weak = Arc::downgrade(inner);
            for loader in &created {
                let on_finish = loader.on_block_finish().subscribe(observe(&weak, |t, _: &()| {
                    t.flush_timeline();
                    t.update_loading();
                    t.update_complete();
                }));
                state.loaders.insert(
                    loader.relay().to_string(),
                    LoaderEntry {
                        loader: loader.clone(),
                        _on_finish: on_finish,
                    },
                );
            }
            state.query_map = query_map.clone();
            (removed, created)
        };

        for entry in removed {
            entry.loader.cleanup();
            inner.store.disconnect(entry.loader.store());
        }
        inner.flush_timeline();
        for loader in &added {
            inner.store.connect(loader.store());
        }

        let live_limit = (inner.block_size / 2).max(1);
        inner
            .subscription
            .set_query_map(map_query_map(&query_map, |filter| filter.limit(live_limit)))?;

        self.trigger_block_loads();
        inner.update_loading();
        inner.update_complete();
        Ok(())
    }

    /// Replace the client-side predicate and recompute the timeline.
    pub fn set_event_filter(&self, filter: Option<EventFilter>) {
        self.inner.state.lock().event_filter = filter;
        self.inner.update_timeline();
    }

    /// Move the cursor and load blocks for relays whose read-ahead no
    /// longer reaches it.
    pub fn set_cursor(&self, cursor: u64) {
        self.inner.state.lock().cursor = cursor;
        self.trigger_block_loads();
    }

    /// Start a block on every idle relay whose `load_next_block_buffer`-th
    /// oldest event is at or after the cursor (or that holds fewer events).
    pub fn trigger_block_loads(&self) {
        self.inner.trigger_block_loads();
    }

    /// Start a block on every idle relay, regardless of the cursor.
    pub fn load_next_block(&self) {
        self.inner.load_where(|_| true);
    }

    /// Start the live subscription.
    pub fn open(&self) -> Result<()> {
        self.inner.subscription.open()
    }

    /// Stop the live subscription.
    pub fn close(&self) {
        self.inner.subscription.close();
    }

    /// Drop every event from the aggregate view and let the live
    /// subscription deliver them again.
    pub fn forget_events(&self) {
        self.inner.store.clear();
        self.inner.timeline.next(Vec::new());
        self.inner.subscription.forget_events();
    }

    /// Start over: cursor back to now, loaders and query map dropped,
    /// events forgotten. The next `set_query_map` rebuilds everything.
    pub fn reset(&self) -> Result<()> {
        debug!(name = %self.inner.name, "reset");
        {
            let mut state = self.inner.state.lock();
            state.cursor = now();
            state.query_map.clear();
        }
        self.inner.discard_loaders();
        self.inner.subscription.set_query_map(QueryMap::new())?;
        self.forget_events();
        self.inner.update_loading();
        self.inner.update_complete();
        Ok(())
    }

    /// Tear down: close the live subscription, discard loaders, detach the
    /// aggregate store and stop following the tombstone stream.
    pub fn cleanup(&self) {
        self.close();
        self.inner.discard_loaders();
        self.inner.store.cleanup();
        self.inner.listeners.lock().clear();
    }
}

impl std::fmt::Debug for TimelineLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineLoader")
            .field("name", &self.inner.name)
            .field("cursor", &self.cursor())
            .field("loaders", &self.loader_count())
            .field("events", &self.inner.store.len())
            .finish()
    }
}
