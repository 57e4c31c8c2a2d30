//! Deduplicating event store.
//!
//! An [`EventStore`] indexes events by id and keeps, for every replaceable
//! coordinate, only the newest event by `(created_at, id)`. Stores compose:
//! a parent `connect`s to child stores and mirrors every insert and delete
//! they observe, so a timeline's aggregate store is the deduplicated union of
//! its per-relay stores.
//!
//! The store keeps no memory of deletions. Re-adding an event after
//! `delete_event` makes it visible again; callers that need tombstones to
//! stick consult a shared delete log before inserting.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use nostr_sync_types::{Coordinate, Event};

use crate::subject::{Subject, Subscription};

/// Client-side predicate applied over a store's sorted output.
pub type EventFilter = Arc<dyn Fn(&Event, &EventStore) -> bool + Send + Sync>;

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

/// Where an entry came from. An entry stays visible while at least one
/// source still backs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Source {
    Direct,
    Child(u64),
}

struct ConnectedChild {
    store: EventStore,
    _subscriptions: Vec<Subscription>,
}

#[derive(Default)]
struct State {
    events: HashMap<String, Event>,
    replaceable: HashMap<Coordinate, String>,
    sources: HashMap<String, HashSet<Source>>,
    children: HashMap<u64, ConnectedChild>,
}

impl State {
    /// Returns true when visible content changed.
    fn insert(&mut self, event: Event, source: Source) -> bool {
        if self.events.contains_key(&event.id) {
            self.sources.entry(event.id).or_default().insert(source);
            return false;
        }

        if let Some(coordinate) = event.coordinate() {
            if let Some(current_id) = self.replaceable.get(&coordinate).cloned() {
                let current_wins = self
                    .events
                    .get(&current_id)
                    .map_or(false, |current| current.sort_key() >= event.sort_key());
                if current_wins {
                    return false;
                }
                self.events.remove(&current_id);
                self.sources.remove(&current_id);
            }
            self.replaceable.insert(coordinate, event.id.clone());
        }

        self.sources
            .entry(event.id.clone())
            .or_default()
            .insert(source);
        self.events.insert(event.id.clone(), event);
        true
    }

    fn remove_id(&mut self, id: &str) -> Option<Event> {
        let event = self.events.remove(id)?;
        self.sources.remove(id);
        if let Some(coordinate) = event.coordinate() {
            if self.replaceable.get(&coordinate).map(String::as_str) == Some(id) {
                self.replaceable.remove(&coordinate);
            }
        }
        Some(event)
    }

    fn remove_key(&mut self, key: &str) -> Option<Event> {
        if self.events.contains_key(key) {
            return self.remove_id(key);
        }
        let coordinate: Coordinate = key.parse().ok()?;
        let id = self.replaceable.get(&coordinate)?.clone();
        self.remove_id(&id)
    }

    /// Remove the canonical event for `coordinate` if it is no newer than
    /// `until`.
    fn remove_replaceable_until(&mut self, coordinate: &Coordinate, until: u64) -> Option<Event> {
        let id = self.replaceable.get(coordinate)?.clone();
        let covered = self.events.get(&id).map_or(false, |e| e.created_at <= until);
        if !covered {
            return None;
        }
        self.remove_id(&id)
    }

    /// Drop `source` from every entry; remove entries nothing backs anymore.
    fn release_source(&mut self, source: Source) -> Vec<Event> {
        let orphaned: Vec<String> = self
            .sources
            .iter_mut()
            .filter_map(|(id, backers)| {
                backers.remove(&source);
                backers.is_empty().then(|| id.clone())
            })
            .collect();
        orphaned
            .iter()
            .filter_map(|id| self.remove_id(id))
            .collect()
    }
}

struct Inner {
    id: u64,
    name: String,
    state: Mutex<State>,
    on_event: Subject<Event>,
    on_delete: Subject<String>,
    on_clear: Subject<()>,
}

/// Shared handle to an event store. Cloning shares the same store.
#[derive(Clone)]
pub struct EventStore {
    inner: Arc<Inner>,
}

impl EventStore {
    /// Create an empty store. The name only appears in logs and debug output.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                state: Mutex::new(State::default()),
                on_event: Subject::stream(),
                on_delete: Subject::stream(),
                on_clear: Subject::stream(),
            }),
        }
    }

    fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// Process-unique id of this store.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Store name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Emits every event that changed visible content (new id or newer
    /// replacement).
    pub fn on_event(&self) -> &Subject<Event> {
        &self.inner.on_event
    }

    /// Emits the id of every removed event.
    pub fn on_delete(&self) -> &Subject<String> {
        &self.inner.on_delete
    }

    /// Emits after `clear`.
    pub fn on_clear(&self) -> &Subject<()> {
        &self.inner.on_clear
    }

    /// Add an event. Returns true when the store's visible content changed.
    pub fn add_event(&self, event: Event) -> bool {
        self.insert(event, Source::Direct)
    }

    fn insert(&self, event: Event, source: Source) -> bool {
        let changed = self.inner.state.lock().insert(event.clone(), source);
        if changed {
            self.inner.on_event.next(event);
        }
        changed
    }

    /// Remove an entry by event id or by coordinate string
    /// (`kind:pubkey[:identifier]`). Returns the removed event.
    pub fn delete_event(&self, key: &str) -> Option<Event> {
        let removed = self.inner.state.lock().remove_key(key);
        if let Some(event) = &removed {
            self.inner.on_delete.next(event.id.clone());
        }
        removed
    }

    /// Remove the canonical event for a coordinate string, but only if it
    /// was created at or before `until`. Versions newer than a deletion
    /// request survive it.
    pub fn delete_replaceable_until(&self, coordinate: &str, until: u64) -> Option<Event> {
        let coordinate: Coordinate = coordinate.parse().ok()?;
        let removed = self
            .inner
            .state
            .lock()
            .remove_replaceable_until(&coordinate, until);
        if let Some(event) = &removed {
            self.inner.on_delete.next(event.id.clone());
        }
        removed
    }

    /// Remove every entry. Connected children stay connected.
    pub fn clear(&self) {
        {
            let mut state = self.inner.state.lock();
            state.events.clear();
            state.replaceable.clear();
            state.sources.clear();
        }
        self.inner.on_clear.next(());
    }

    /// Mirror `child` into this store: its current entries are added now and
    /// every later insert, delete and clear it observes is applied here too.
    pub fn connect(&self, child: &EventStore) {
        let child_id = child.id();
        if child_id == self.id() || self.inner.state.lock().children.contains_key(&child_id) {
            return;
        }

        let source = Source::Child(child_id);
        let weak = Arc::downgrade(&self.inner);
        let subscriptions = vec![
            child.on_event().subscribe(with_parent(&weak, move |parent, event: &Event| {
                parent.insert(event.clone(), source);
            })),
            child.on_delete().subscribe(with_parent(&weak, |parent, id: &String| {
                if let Some(removed) = parent.delete_event(id) {
                    parent.restore_replaceables(&[removed]);
                }
            })),
            child.on_clear().subscribe(with_parent(&weak, move |parent, _: &()| {
                let removed = parent.release(source);
                parent.restore_replaceables(&removed);
            })),
        ];

        self.inner.state.lock().children.insert(
            child_id,
            ConnectedChild {
                store: child.clone(),
                _subscriptions: subscriptions,
            },
        );

        for event in child.all_events() {
            self.insert(event, source);
        }
    }

    /// Stop mirroring `child` and remove entries only it was backing.
    pub fn disconnect(&self, child: &EventStore) {
        let detached = self.inner.state.lock().children.remove(&child.id());
        let Some(detached) = detached else {
            return;
        };
        drop(detached);

        let removed = self.release(Source::Child(child.id()));
        self.restore_replaceables(&removed);
    }

    /// A removed replaceable entry may have superseded an older version
    /// that a connected child still holds.
    fn restore_replaceables(&self, removed: &[Event]) {
        let coordinates: Vec<Coordinate> = removed.iter().filter_map(Event::coordinate).collect();
        if coordinates.is_empty() {
            return;
        }
        let remaining: Vec<(u64, EventStore)> = self
            .inner
            .state
            .lock()
            .children
            .iter()
            .map(|(id, c)| (*id, c.store.clone()))
            .collect();
        for (id, store) in remaining {
            for coordinate in &coordinates {
                if let Some(event) = store.get_replaceable(coordinate) {
                    self.insert(event, Source::Child(id));
                }
            }
        }
    }

    fn release(&self, source: Source) -> Vec<Event> {
        let removed = self.inner.state.lock().release_source(source);
        for event in &removed {
            self.inner.on_delete.next(event.id.clone());
        }
        removed
    }

    /// Detach from every connected child. Entries are kept.
    pub fn cleanup(&self) {
        let children: Vec<ConnectedChild> = self
            .inner
            .state
            .lock()
            .children
            .drain()
            .map(|(_, c)| c)
            .collect();
        drop(children);
    }

    /// Number of connected children.
    pub fn child_count(&self) -> usize {
        self.inner.state.lock().children.len()
    }

    /// Number of visible events.
    pub fn len(&self) -> usize {
        self.inner.state.lock().events.len()
    }

    /// Whether the store holds no events.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an event with this id is visible.
    pub fn has_event(&self, id: &str) -> bool {
        self.inner.state.lock().events.contains_key(id)
    }

    /// Look up an event by id.
    pub fn get_event(&self, id: &str) -> Option<Event> {
        self.inner.state.lock().events.get(id).cloned()
    }

    /// The canonical event for a coordinate.
    pub fn get_replaceable(&self, coordinate: &Coordinate) -> Option<Event> {
        let state = self.inner.state.lock();
        let id = state.replaceable.get(coordinate)?;
        state.events.get(id).cloned()
    }

    fn all_events(&self) -> Vec<Event> {
        self.inner.state.lock().events.values().cloned().collect()
    }

    /// Every visible event, newest first by `(created_at, id)`.
    pub fn get_sorted_events(&self) -> Vec<Event> {
        let mut events = self.all_events();
        events.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
        events
    }

    /// The `nth` newest event passing `filter`.
    pub fn get_first_event(&self, nth: usize, filter: Option<&EventFilter>) -> Option<Event> {
        self.get_sorted_events()
            .into_iter()
            .filter(|e| filter.map_or(true, |f| f(e, self)))
            .nth(nth)
    }

    /// The `nth` oldest event passing `filter`.
    pub fn get_last_event(&self, nth: usize, filter: Option<&EventFilter>) -> Option<Event> {
        self.get_sorted_events()
            .into_iter()
            .rev()
            .filter(|e| filter.map_or(true, |f| f(e, self)))
            .nth(nth)
    }
}

fn with_parent<T, F>(weak: &Weak<Inner>, apply: F) -> impl Fn(&T) + Send + Sync + 'static
where
    F: Fn(&EventStore, &T) + Send + Sync + 'static,
{
    let weak = weak.clone();
    move |value: &T| {
        if let Some(inner) = weak.upgrade() {
            apply(&EventStore::from_inner(inner), value);
        }
    }
}

impl fmt::Debug for EventStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("EventStore")
            .field("name", &self.inner.name)
            .field("events", &state.events.len())
            .field("children", &state.children.len())
            .finish()
    }
}
