//! Application-wide collaborators shared by loaders and publish actions.
//!
//! Nothing here is a global: a [`SyncContext`] is built once and handed to
//! every component that needs it, so tests can use a fresh one each.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use nostr_sync_core::{EventStore, Subject};
use nostr_sync_types::{Coordinate, Event};

use crate::publish::PublishAction;

fn normalize_coordinate(raw: &str) -> String {
    raw.parse::<Coordinate>()
        .map(|c| c.to_string())
        .unwrap_or_else(|_| raw.to_string())
}

/// Keys a deletion event asks to remove: referenced ids (`e` tags) and
/// coordinates (`a` tags, normalized).
pub fn deletion_targets(deletion: &Event) -> (Vec<String>, Vec<String>) {
    let ids = deletion.tag_values("e").map(str::to_string).collect();
    let coordinates = deletion.tag_values("a").map(normalize_coordinate).collect();
    (ids, coordinates)
}

/// Remove what a deletion event targets from `store`. Referenced ids go
/// unconditionally; a coordinate only loses versions created at or before
/// the deletion.
pub fn apply_deletion(store: &EventStore, deletion: &Event) {
    let (ids, coordinates) = deletion_targets(deletion);
    for id in &ids {
        store.delete_event(id);
    }
    for coordinate in &coordinates {
        store.delete_replaceable_until(coordinate, deletion.created_at);
    }
}

#[derive(Default)]
struct Tombstones {
    applied: HashSet<String>,
    ids: HashSet<String>,
    /// Coordinate -> newest deletion timestamp.
    coordinates: HashMap<String, u64>,
}

/// Delete log plus the process-wide tombstone stream.
///
/// Once a deletion has been observed it always wins: any later copy of a
/// deleted id, or any version of a deleted coordinate at or before the
/// deletion time, reports `is_deleted`.
#[derive(Clone)]
pub struct DeletionService {
    tombstones: Arc<Mutex<Tombstones>>,
    stream: Subject<Event>,
}

impl DeletionService {
    /// Empty delete log.
    pub fn new() -> Self {
        Self {
            tombstones: Arc::new(Mutex::new(Tombstones::default())),
            stream: Subject::stream(),
        }
    }

    /// Record a deletion event and broadcast it. Returns false for
    /// non-deletions and deletions already seen.
    pub fn handle_event(&self, event: &Event) -> bool {
        if !event.is_deletion() {
            return false;
        }
        let (ids, coordinates) = deletion_targets(event);
        {
            let mut tombstones = self.tombstones.lock();
            if !tombstones.applied.insert(event.id.clone()) {
                return false;
            }
            tombstones.ids.extend(ids);
            for coordinate in coordinates {
                let at = tombstones.coordinates.entry(coordinate).or_insert(0);
                *at = (*at).max(event.created_at);
            }
        }
        debug!(id = %event.id, "applied deletion");
        self.stream.next(event.clone());
        true
    }

    /// Whether a recorded deletion covers `event`.
    pub fn is_deleted(&self, event: &Event) -> bool {
        let tombstones = self.tombstones.lock();
        if tombstones.ids.contains(&event.id) {
            return true;
        }
        event
            .coordinate()
            .and_then(|c| tombstones.coordinates.get(&c.to_string()).copied())
            .map_or(false, |deleted_at| event.created_at <= deleted_at)
    }

    /// Deletion events as they are recorded.
    pub fn stream(&self) -> &Subject<Event> {
        &self.stream
    }

    /// Number of deletion events recorded.
    pub fn len(&self) -> usize {
        self.tombstones.lock().applied.len()
    }

    /// Whether no deletion has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DeletionService {
    fn default() -> Self {
        Self::new()
    }
}

/// Newest known version of every replaceable event.
#[derive(Clone, Default)]
pub struct LatestReplaceableCache {
    events: Arc<Mutex<HashMap<Coordinate, Event>>>,
}

impl LatestReplaceableCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer an event. Returns true if it became the cached version.
    pub fn handle_event(&self, event: &Event) -> bool {
        let Some(coordinate) = event.coordinate() else {
            return false;
        };
        let mut events = self.events.lock();
        match events.get(&coordinate) {
            Some(current) if current.sort_key() >= event.sort_key() => false,
            _ => {
                events.insert(coordinate, event.clone());
                true
            }
        }
    }

    /// Cached version for `coordinate`.
    pub fn get(&self, coordinate: &Coordinate) -> Option<Event> {
        self.events.lock().get(coordinate).cloned()
    }

    /// Number of coordinates cached.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Which event ids the application has seen, and where.
#[derive(Clone, Default)]
pub struct SeenEvents {
    seen: Arc<Mutex<HashMap<String, BTreeSet<String>>>>,
}

impl SeenEvents {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an event as seen. Returns true the first time.
    pub fn handle_event(&self, event: &Event) -> bool {
        let mut seen = self.seen.lock();
        if seen.contains_key(&event.id) {
            return false;
        }
        seen.insert(event.id.clone(), BTreeSet::new());
        true
    }

    /// Record that `relay` holds event `id`.
    pub fn record_relay(&self, id: &str, relay: &str) {
        self.seen
            .lock()
            .entry(id.to_string())
            .or_default()
            .insert(relay.to_string());
    }

    /// Whether `id` has been seen anywhere.
    pub fn contains(&self, id: &str) -> bool {
        self.seen.lock().contains_key(id)
    }

    /// Relays known to hold `id`, sorted.
    pub fn relays_for(&self, id: &str) -> Vec<String> {
        self.seen
            .lock()
            .get(id)
            .map(|relays| relays.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Every publish action started in this context, oldest first.
#[derive(Clone, Default)]
pub struct MemoryPublishLog {
    entries: Arc<Mutex<Vec<PublishAction>>>,
}

impl MemoryPublishLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an action.
    pub fn add(&self, action: PublishAction) {
        self.entries.lock().push(action);
    }

    /// Snapshot of the log.
    pub fn entries(&self) -> Vec<PublishAction> {
        self.entries.lock().clone()
    }

    /// Number of logged actions.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing was published.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The shared collaborators, bundled.
#[derive(Clone, Default)]
pub struct SyncContext {
    /// Delete log and tombstone stream.
    pub deletions: DeletionService,
    /// Latest replaceable events.
    pub replaceables: LatestReplaceableCache,
    /// Event existence.
    pub seen: SeenEvents,
    /// Publish history.
    pub publish_log: MemoryPublishLog,
}

impl SyncContext {
    /// Fresh, empty services.
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_sync_types::{kind, Tag};

    fn note(created_at: u64) -> Event {
        Event::unsigned("aa", kind::TEXT_NOTE, created_at, vec![], created_at.to_string())
    }

    fn article(created_at: u64, d: &str) -> Event {
        Event::unsigned("aa", 30023, created_at, vec![Tag::new(["d", d])], created_at.to_string())
    }

    fn deletion(created_at: u64, tags: Vec<Tag>) -> Event {
        Event::unsigned("aa", kind::DELETION, created_at, tags, "")
    }

    // ===========================================
    // DeletionService
    // ===========================================

    #[test]
    fn deleted_ids_stay_deleted() {
        let service = DeletionService::new();
        let target = note(5);
        assert!(!service.is_deleted(&target));

        assert!(service.handle_event(&deletion(10, vec![Tag::new(["e", target.id.as_str()])])));
        assert!(service.is_deleted(&target));
        assert!(!service.is_deleted(&note(6)));
    }

    #[test]
    fn applied_coordinate_deletion_keeps_newer_version() {
        let store = EventStore::new("test");
        let newer = article(20, "post");
        store.add_event(newer.clone());

        apply_deletion(&store, &deletion(10, vec![Tag::new(["a", "30023:aa:post"])]));
        assert!(store.has_event(&newer.id));

        apply_deletion(&store, &deletion(25, vec![Tag::new(["a", "30023:aa:post"])]));
        assert!(!store.has_event(&newer.id));
    }

    #[test]
    fn applied_id_deletion_ignores_timestamps() {
        let store = EventStore::new("test");
        let target = note(50);
        store.add_event(target.clone());

        apply_deletion(&store, &deletion(10, vec![Tag::new(["e", target.id.as_str()])]));
        assert!(store.is_empty());
    }

    #[test]
    fn coordinate_deletion_covers_older_versions_only() {
        let service = DeletionService::new();
        service.handle_event(&deletion(10, vec![Tag::new(["a", "30023:aa:post"])]));

        assert!(service.is_deleted(&article(9, "post")));
        assert!(service.is_deleted(&article(10, "post")));
        assert!(!service.is_deleted(&article(11, "post")));
        assert!(!service.is_deleted(&article(9, "other")));
    }

    #[test]
    fn deletions_are_broadcast_once() {
        let service = DeletionService::new();
        let count = Arc::new(Mutex::new(0));
        let _sub = {
            let count = Arc::clone(&count);
            service.stream().subscribe(move |_| *count.lock() += 1)
        };
        let del = deletion(10, vec![Tag::new(["e", "ff"])]);

        assert!(service.handle_event(&del));
        assert!(!service.handle_event(&del));
        assert!(!service.handle_event(&note(1)));
        assert_eq!(*count.lock(), 1);
        assert_eq!(service.len(), 1);
    }

    // ===========================================
    // Caches
    // ===========================================

    #[test]
    fn replaceable_cache_keeps_newest() {
        let cache = LatestReplaceableCache::new();
        let newer = article(20, "post");
        assert!(cache.handle_event(&newer));
        assert!(!cache.handle_event(&article(10, "post")));
        assert!(!cache.handle_event(&note(30)));

        let coordinate = newer.coordinate().unwrap();
        assert_eq!(cache.get(&coordinate).unwrap().id, newer.id);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn seen_events_tracks_relays() {
        let seen = SeenEvents::new();
        let event = note(1);
        assert!(seen.handle_event(&event));
        assert!(!seen.handle_event(&event));
        seen.record_relay(&event.id, "wss://b.test");
        seen.record_relay(&event.id, "wss://a.test");
        assert!(seen.contains(&event.id));
        assert_eq!(seen.relays_for(&event.id), vec!["wss://a.test", "wss://b.test"]);
        assert!(seen.relays_for("missing").is_empty());
    }
}
