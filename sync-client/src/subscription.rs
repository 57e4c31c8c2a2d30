//! Persistent multi-relay subscription.
//!
//! Keeps one live subscription per relay in a query map and funnels every
//! matching event into a single `on_event` stream. Updating the query map
//! only touches the relays whose filters actually changed.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

use nostr_sync_core::{diff_query_maps, QueryMapDiff, Subject};
use nostr_sync_types::{validate_query_map, Event, QueryMap, RelayMessage, SubscriptionId};

use crate::error::Result;
use crate::pool::{normalize_query_map, RelayPool};
use crate::relay::{MessageHandler, Relay};

struct ActiveRelay {
    relay: Arc<Relay>,
    id: SubscriptionId,
}

#[derive(Default)]
struct MultiState {
    query_map: QueryMap,
    open: bool,
    active: BTreeMap<String, ActiveRelay>,
    seen: HashSet<String>,
}

struct MultiInner {
    name: String,
    pool: RelayPool,
    state: Mutex<MultiState>,
    on_event: Subject<Event>,
}

impl MultiInner {
    fn handle(&self, relay: &str, message: &RelayMessage) {
        match message {
            RelayMessage::Event { event, .. } => {
                {
                    let mut state = self.state.lock();
                    if !state.open {
                        return;
                    }
                    let matches = state
                        .query_map
                        .get(relay)
                        .map_or(false, |filters| filters.iter().any(|f| f.matches(event)));
                    if !matches {
                        trace!(relay, id = %event.id, "dropping event outside filters");
                        return;
                    }
                    if !state.seen.insert(event.id.clone()) {
                        return;
                    }
                }
                self.on_event.next(event.clone());
            }
            RelayMessage::Closed { message, .. } => {
                debug!(name = %self.name, relay, reason = %message, "live subscription closed");
                self.state.lock().active.remove(relay);
            }
            _ => {}
        }
    }

    fn open_relay(self: &Arc<Self>, state: &mut MultiState, url: &str) -> Result<()> {
        let Some(filters) = state.query_map.get(url).cloned() else {
            return Ok(());
        };
        let relay = self.pool.request_relay(url)?;
        let id = match state.active.remove(url) {
            Some(previous) => {
                previous.relay.unsubscribe(&previous.id);
                previous.id
            }
            None => SubscriptionId::with_label(&self.name),
        };
        relay.subscribe(id.clone(), filters, handler(Arc::downgrade(self), url.to_string()));
        state.active.insert(url.to_string(), ActiveRelay { relay, id });
        Ok(())
    }

    fn close_relay(state: &mut MultiState, url: &str) {
        if let Some(active) = state.active.remove(url) {
            active.relay.unsubscribe(&active.id);
        }
    }

    fn close_all(state: &mut MultiState) {
        for (_, active) in std::mem::take(&mut state.active) {
            active.relay.unsubscribe(&active.id);
        }
    }
}

impl Drop for MultiInner {
    fn drop(&mut self) {
        Self::close_all(self.state.get_mut());
    }
}

fn handler(inner: Weak<MultiInner>, relay: String) -> MessageHandler {
    Arc::new(move |message: &RelayMessage| {
        if let Some(inner) = inner.upgrade() {
            inner.handle(&relay, message);
        }
    })
}

/// A named, long-lived subscription over many relays.
///
/// Starts closed; call [`open`](Self::open) to begin streaming. Clones
/// share the subscription, and dropping the last clone closes it.
#[derive(Clone)]
pub struct MultiSubscription {
    inner: Arc<MultiInner>,
}

impl MultiSubscription {
    /// Create a closed subscription with an empty query map.
    pub fn new(pool: RelayPool, name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(MultiInner {
                name: name.into(),
                pool,
                state: Mutex::new(MultiState::default()),
                on_event: Subject::stream(),
            }),
        }
    }

    /// Name used in subscription ids and logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Matching events from every relay, each id at most once until
    /// [`forget_events`](Self::forget_events).
    pub fn on_event(&self) -> &Subject<Event> {
        &self.inner.on_event
    }

    /// The current (normalized) query map.
    pub fn query_map(&self) -> QueryMap {
        self.inner.state.lock().query_map.clone()
    }

    /// Whether the subscription is streaming.
    pub fn is_open(&self) -> bool {
        self.inner.state.lock().open
    }

    /// Number of relays with a live subscription.
    pub fn active_relay_count(&self) -> usize {
        self.inner.state.lock().active.len()
    }

    /// Replace the query map. The whole map is validated before anything
    /// changes; when open, only relays whose filters differ are touched.
    pub fn set_query_map(&self, query_map: QueryMap) -> Result<QueryMapDiff> {
        validate_query_map(&query_map)?;
        let query_map = normalize_query_map(query_map)?;

        let mut state = self.inner.state.lock();
        let diff = diff_query_maps(&state.query_map, &query_map);
        if diff.is_noop() {
            return Ok(diff);
        }
        debug!(
            name = %self.inner.name,
            added = diff.added.len(),
            changed = diff.changed.len(),
            removed = diff.removed.len(),
            "updating live query map"
        );
        state.query_map = query_map;
        if state.open {
            for url in &diff.removed {
                MultiInner::close_relay(&mut state, url);
            }
            for url in diff.to_open() {
                self.inner.open_relay(&mut state, url)?;
            }
        }
        Ok(diff)
    }

    /// Start streaming from every relay in the query map.
    pub fn open(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.open {
            return Ok(());
        }
        state.open = true;
        let urls: Vec<String> = state.query_map.keys().cloned().collect();
        for url in &urls {
            self.inner.open_relay(&mut state, url)?;
        }
        debug!(name = %self.inner.name, relays = urls.len(), "opened live subscription");
        Ok(())
    }

    /// Stop streaming and close every relay subscription.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if !state.open {
            return;
        }
        state.open = false;
        MultiInner::close_all(&mut state);
        debug!(name = %self.inner.name, "closed live subscription");
    }

    /// Forget which ids were already emitted so they can surface again.
    pub fn forget_events(&self) {
        self.inner.state.lock().seen.clear();
    }
}

impl std::fmt::Debug for MultiSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MultiSubscription")
            .field("name", &self.inner.name)
            .field("open", &state.open)
            .field("relays", &state.query_map.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::transport::{MockConnector, MockTransport};
    use nostr_sync_types::{kind, ClientMessage, Filter};
    use tokio::sync::mpsc;

    fn note(pubkey: &str, created_at: u64) -> Event {
        Event::unsigned(pubkey, kind::TEXT_NOTE, created_at, vec![], created_at.to_string())
    }

    fn setup() -> (RelayPool, MockConnector) {
        let connector = MockConnector::new();
        let pool = RelayPool::new(Arc::new(connector.clone()), &ClientConfig::default());
        (pool, connector)
    }

    fn map(entries: &[(&str, Filter)]) -> QueryMap {
        entries
            .iter()
            .map(|(url, filter)| (url.to_string(), vec![filter.clone()]))
            .collect()
    }

    fn reqs(transport: &MockTransport) -> usize {
        transport
            .sent_client_messages()
            .iter()
            .filter(|m| matches!(m, ClientMessage::Req { .. }))
            .count()
    }

    fn closes(transport: &MockTransport) -> usize {
        transport
            .sent_client_messages()
            .iter()
            .filter(|m| matches!(m, ClientMessage::Close(_)))
            .count()
    }

    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    // ===========================================
    // Streaming
    // ===========================================

    #[tokio::test]
    async fn merges_events_from_all_relays_once() {
        let (pool, connector) = setup();
        let shared = note("aa", 3);
        connector
            .transport_for("wss://a.test")
            .respond_with_events(vec![shared.clone(), note("aa", 1)]);
        connector
            .transport_for("wss://b.test")
            .respond_with_events(vec![shared.clone(), note("aa", 2)]);

        let sub = MultiSubscription::new(pool, "home");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _s = sub.on_event().subscribe(move |e: &Event| {
            let _ = tx.send(e.created_at);
        });
        sub.set_query_map(map(&[
            ("wss://a.test", Filter::new()),
            ("wss://b.test", Filter::new()),
        ]))
        .unwrap();
        sub.open().unwrap();

        let mut stamps = Vec::new();
        for _ in 0..3 {
            stamps.push(rx.recv().await.unwrap());
        }
        settle().await;
        assert!(rx.try_recv().is_err());
        stamps.sort();
        assert_eq!(stamps, vec![1, 2, 3]);
        assert_eq!(sub.active_relay_count(), 2);
    }

    #[tokio::test]
    async fn closed_subscription_sends_nothing() {
        let (pool, connector) = setup();
        let sub = MultiSubscription::new(pool, "home");
        sub.set_query_map(map(&[("wss://a.test", Filter::new())])).unwrap();
        settle().await;
        assert_eq!(reqs(&connector.transport_for("wss://a.test")), 0);
        assert!(!sub.is_open());
    }

    // ===========================================
    // Query map diffing
    // ===========================================

    #[tokio::test]
    async fn equal_query_map_is_a_noop() {
        let (pool, connector) = setup();
        connector.transport_for("wss://a.test").respond_with_events(Vec::new());
        let sub = MultiSubscription::new(pool, "home");
        sub.set_query_map(map(&[("wss://a.test", Filter::new().kinds([1]))])).unwrap();
        sub.open().unwrap();
        settle().await;

        let diff = sub
            .set_query_map(map(&[("wss://a.test/", Filter::new().kinds([1]))]))
            .unwrap();
        settle().await;

        assert!(diff.is_noop());
        assert_eq!(reqs(&connector.transport_for("wss://a.test")), 1);
    }

    #[tokio::test]
    async fn only_changed_relays_are_reissued() {
        let (pool, connector) = setup();
        for url in ["wss://a.test", "wss://b.test", "wss://c.test"] {
            connector.transport_for(url).respond_with_events(Vec::new());
        }
        let sub = MultiSubscription::new(pool, "home");
        sub.set_query_map(map(&[
            ("wss://a.test", Filter::new().kinds([1])),
            ("wss://b.test", Filter::new().kinds([1])),
        ]))
        .unwrap();
        sub.open().unwrap();
        settle().await;

        sub.set_query_map(map(&[
            ("wss://a.test", Filter::new().kinds([1])),
            ("wss://b.test", Filter::new().kinds([6])),
            ("wss://c.test", Filter::new().kinds([1])),
        ]))
        .unwrap();
        settle().await;

        let a = connector.transport_for("wss://a.test");
        let b = connector.transport_for("wss://b.test");
        let c = connector.transport_for("wss://c.test");
        assert_eq!((reqs(&a), closes(&a)), (1, 0));
        assert_eq!((reqs(&b), closes(&b)), (2, 1));
        assert_eq!((reqs(&c), closes(&c)), (1, 0));

        sub.set_query_map(map(&[("wss://c.test", Filter::new().kinds([1]))]))
            .unwrap();
        settle().await;
        assert_eq!(closes(&a), 1);
        assert_eq!(closes(&b), 2);
        assert_eq!(sub.active_relay_count(), 1);
    }

    #[tokio::test]
    async fn invalid_map_leaves_state_untouched() {
        let (pool, _) = setup();
        let sub = MultiSubscription::new(pool, "home");
        let good = map(&[("wss://a.test", Filter::new())]);
        sub.set_query_map(good).unwrap();

        let bad = map(&[
            ("wss://b.test", Filter::new()),
            ("wss://c.test", Filter::new().limit(0)),
        ]);
        assert!(sub.set_query_map(bad).is_err());
        assert!(sub.set_query_map(map(&[("ftp://x.test", Filter::new())])).is_err());
        assert_eq!(sub.query_map().keys().collect::<Vec<_>>(), vec!["wss://a.test"]);
    }

    #[tokio::test]
    async fn forget_events_allows_replay() {
        let (pool, connector) = setup();
        let a = connector.transport_for("wss://a.test");
        a.respond_with_events(vec![note("aa", 1)]);
        let sub = MultiSubscription::new(pool, "home");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _s = sub.on_event().subscribe(move |e: &Event| {
            let _ = tx.send(e.id.clone());
        });
        sub.set_query_map(map(&[("wss://a.test", Filter::new())])).unwrap();
        sub.open().unwrap();
        let first = rx.recv().await.unwrap();

        let id = sub.inner.state.lock().active["wss://a.test"].id.clone();
        let replay = RelayMessage::Event {
            subscription_id: id,
            event: note("aa", 1),
        };
        a.push_message(&replay);
        settle().await;
        assert!(rx.try_recv().is_err());

        sub.forget_events();
        a.push_message(&replay);
        assert_eq!(rx.recv().await.unwrap(), first);
    }
}
