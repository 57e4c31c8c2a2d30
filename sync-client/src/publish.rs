//! Fan-out publishing with per-relay acknowledgement.
//!
//! A [`PublishAction`] sends one event to a set of relays and collects one
//! [`CommandResult`] per relay. It completes when every relay has answered
//! or when the timeout fires, in which case every relay still pending gets a
//! synthetic `"Timeout"` failure. Completion happens exactly once.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use nostr_sync_core::{AckOutcome, AckTracker, CommandResult, PersistentSubject, Subject, Subscription};
use nostr_sync_types::Event;

use crate::deferred::Deferred;
use crate::error::Result;
use crate::pool::{normalize_relays, RelayPool};
use crate::relay::Relay;
use crate::services::{SeenEvents, SyncContext};

/// Deadline used when the caller does not pick one.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_millis(5000);

/// A relay still owing an answer. Holding the relay keeps the pool from
/// pruning it while the `OK` is outstanding.
struct PendingRelay {
    _relay: Arc<Relay>,
    _listener: Subscription,
}

struct PublishState {
    tracker: AckTracker,
    pending: HashMap<String, PendingRelay>,
    timer: Option<JoinHandle<()>>,
}

struct PublishInner {
    id: String,
    label: String,
    event: Event,
    relays: Vec<String>,
    seen: SeenEvents,
    state: Mutex<PublishState>,
    results: PersistentSubject<Vec<CommandResult>>,
    on_result: Subject<CommandResult>,
    on_complete: Deferred<Vec<CommandResult>>,
}

impl PublishInner {
    fn handle_result(&self, result: &CommandResult) {
        let (answered, results, finished) = {
            let mut state = self.state.lock();
            let outcome = state.tracker.ack(result.clone());
            if outcome == AckOutcome::Ignored {
                return;
            }
            let answered = state.pending.remove(&result.relay);
            let finished = (outcome == AckOutcome::Complete).then(|| state.timer.take());
            (answered, state.tracker.results().to_vec(), finished)
        };
        drop(answered);

        if result.status {
            self.seen.record_relay(&self.event.id, &result.relay);
        }
        self.results.next(results.clone());
        self.on_result.next(result.clone());

        if let Some(timer) = finished {
            if let Some(timer) = timer {
                timer.abort();
            }
            debug!(action = %self.id, label = %self.label, "publish complete");
            self.on_complete.resolve(results);
        }
    }

    fn handle_timeout(&self) {
        let (expired, abandoned, results) = {
            let mut state = self.state.lock();
            state.timer = None;
            let expired = state.tracker.expire();
            if expired.is_empty() {
                return;
            }
            let abandoned = std::mem::take(&mut state.pending);
            (expired, abandoned, state.tracker.results().to_vec())
        };
        drop(abandoned);

        warn!(
            action = %self.id,
            label = %self.label,
            relays = ?expired.iter().map(|r| r.relay.as_str()).collect::<Vec<_>>(),
            "publish timed out"
        );
        self.results.next(results.clone());
        for result in expired {
            self.on_result.next(result);
        }
        self.on_complete.resolve(results);
    }
}

/// One event sent to many relays.
///
/// Clones share the action. No explicit teardown is needed: each relay and
/// its listener are released as that relay answers or the timeout fires.
#[derive(Clone)]
pub struct PublishAction {
    inner: Arc<PublishInner>,
}

impl PublishAction {
    /// Send `event` to `relays` and start the `timeout` clock.
    ///
    /// The event is also recorded in the context: publish log, seen events,
    /// the replaceable cache for replaceable kinds and the delete log for
    /// deletions. Must be called inside a tokio runtime.
    pub fn new<I, S>(
        pool: &RelayPool,
        context: &SyncContext,
        label: impl Into<String>,
        relays: I,
        event: Event,
        timeout: Duration,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let relays = normalize_relays(relays)?;
        let connections = relays
            .iter()
            .map(|url| pool.request_relay(url))
            .collect::<Result<Vec<_>>>()?;

        let inner = Arc::new(PublishInner {
            id: uuid::Uuid::new_v4().simple().to_string(),
            label: label.into(),
            state: Mutex::new(PublishState {
                tracker: AckTracker::new(event.id.clone(), relays.iter().cloned()),
                pending: HashMap::new(),
                timer: None,
            }),
            event,
            relays,
            seen: context.seen.clone(),
            results: PersistentSubject::new(Vec::new()),
            on_result: Subject::stream(),
            on_complete: Deferred::new(),
        });

        for relay in &connections {
            let weak = Arc::downgrade(&inner);
            let listener = relay.on_command_result().subscribe(move |result: &CommandResult| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_result(result);
                }
            });
            inner.state.lock().pending.insert(
                relay.url().to_string(),
                PendingRelay {
                    _relay: Arc::clone(relay),
                    _listener: listener,
                },
            );
        }
        for relay in &connections {
            relay.publish(inner.event.clone());
        }
        debug!(action = %inner.id, label = %inner.label, relays = connections.len(), "publishing");

        if connections.is_empty() {
            inner.on_complete.resolve(Vec::new());
        } else {
            let timer = tokio::spawn({
                let inner = Arc::clone(&inner);
                async move {
                    tokio::time::sleep(timeout).await;
                    inner.handle_timeout();
                }
            });
            let mut state = inner.state.lock();
            if state.tracker.is_complete() {
                timer.abort();
            } else {
                state.timer = Some(timer);
            }
        }

        let action = Self { inner };
        let event = &action.inner.event;
        context.publish_log.add(action.clone());
        if event.is_replaceable() {
            context.replaceables.handle_event(event);
        }
        if event.is_deletion() {
            context.deletions.handle_event(event);
        }
        context.seen.handle_event(event);
        Ok(action)
    }

    /// Stable id of this action.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Caller-supplied label.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// The published event.
    pub fn event(&self) -> &Event {
        &self.inner.event
    }

    /// Normalized target relays.
    pub fn relays(&self) -> &[String] {
        &self.inner.relays
    }

    /// Every result so far, in arrival order.
    pub fn results(&self) -> &PersistentSubject<Vec<CommandResult>> {
        &self.inner.results
    }

    /// Each result as it arrives.
    pub fn on_result(&self) -> &Subject<CommandResult> {
        &self.inner.on_result
    }

    /// Resolves with one result per relay.
    pub fn on_complete(&self) -> Deferred<Vec<CommandResult>> {
        self.inner.on_complete.clone()
    }

    /// Whether every relay has an answer.
    pub fn is_complete(&self) -> bool {
        self.inner.on_complete.is_resolved()
    }

    /// Relays that have not answered yet.
    pub fn pending_relays(&self) -> Vec<String> {
        self.inner.state.lock().tracker.pending_relays()
    }
}

impl std::fmt::Debug for PublishAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishAction")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("event", &self.inner.event.id)
            .field("relays", &self.inner.relays)
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::transport::MockConnector;
    use nostr_sync_types::{kind, ClientMessage, RelayMessage, Tag};

    const RELAYS: [&str; 3] = ["wss://a.test", "wss://b.test", "wss://c.test"];

    fn note() -> Event {
        Event::unsigned("aa", kind::TEXT_NOTE, 100, vec![], "hello")
    }

    fn setup() -> (RelayPool, MockConnector, SyncContext) {
        let connector = MockConnector::new();
        let pool = RelayPool::new(Arc::new(connector.clone()), &ClientConfig::default());
        (pool, connector, SyncContext::new())
    }

    fn publish(pool: &RelayPool, context: &SyncContext, relays: &[&str], event: Event) -> PublishAction {
        PublishAction::new(pool, context, "test", relays.iter().copied(), event, DEFAULT_PUBLISH_TIMEOUT).unwrap()
    }

    // ===========================================
    // Completion
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn completes_when_every_relay_answers() {
        let (pool, connector, context) = setup();
        for url in RELAYS {
            connector.transport_for(url).respond_with_events(Vec::new());
        }
        let started = tokio::time::Instant::now();
        let action = publish(&pool, &context, &RELAYS, note());

        let results = action.on_complete().wait().await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.status));
        let mut relays: Vec<&str> = results.iter().map(|r| r.relay.as_str()).collect();
        relays.sort();
        assert_eq!(relays, RELAYS);
        assert!(started.elapsed() < DEFAULT_PUBLISH_TIMEOUT);
        assert!(action.pending_relays().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_relays_time_out() {
        let (pool, connector, context) = setup();
        connector.transport_for("wss://a.test").respond_with_events(Vec::new());
        // b and c accept the connection but never answer
        let started = tokio::time::Instant::now();
        let action = publish(&pool, &context, &RELAYS, note());

        let results = action.on_complete().wait().await;
        assert!(started.elapsed() >= DEFAULT_PUBLISH_TIMEOUT);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].relay, "wss://a.test");
        assert!(results[0].status);
        let timeouts: Vec<&CommandResult> = results.iter().filter(|r| r.is_timeout()).collect();
        assert_eq!(timeouts.len(), 2);
        assert_eq!(timeouts[0].relay, "wss://b.test");
        assert_eq!(timeouts[1].relay, "wss://c.test");
        assert_eq!(action.results().value(), results);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_relay_times_out() {
        let (pool, connector, context) = setup();
        connector.transport_for("wss://a.test").fail_connects(100, "refused");
        let action = publish(&pool, &context, &["wss://a.test"], note());

        let results = action.on_complete().wait().await;
        assert_eq!(results, vec![CommandResult::timeout("wss://a.test", action.event().id.clone())]);
    }

    #[tokio::test]
    async fn no_relays_completes_immediately() {
        let (pool, _, context) = setup();
        let action = publish(&pool, &context, &[], note());
        assert!(action.is_complete());
        assert!(action.on_complete().wait().await.is_empty());
    }

    // ===========================================
    // Result handling
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn counts_one_result_per_relay_for_this_event() {
        let (pool, connector, context) = setup();
        let event = note();
        let id = event.id.clone();
        connector.transport_for("wss://a.test").set_responder(move |m| match m {
            ClientMessage::Event(_) => vec![
                RelayMessage::Ok {
                    event_id: "someone-else".into(),
                    status: true,
                    message: String::new(),
                },
                RelayMessage::Ok {
                    event_id: id.clone(),
                    status: false,
                    message: "blocked: spam".into(),
                },
                RelayMessage::Ok {
                    event_id: id.clone(),
                    status: true,
                    message: "duplicate".into(),
                },
            ],
            _ => Vec::new(),
        });
        let action = publish(&pool, &context, &["wss://a.test"], event);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _s = action.on_result().subscribe(move |r: &CommandResult| {
            let _ = tx.send(r.clone());
        });

        let results = action.on_complete().wait().await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].status);
        assert_eq!(results[0].message, "blocked: spam");
        assert_eq!(rx.recv().await.unwrap().message, "blocked: spam");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn equivalent_urls_collapse() {
        let (pool, connector, context) = setup();
        connector.transport_for("wss://a.test").respond_with_events(Vec::new());
        let action = publish(&pool, &context, &["wss://a.test/", "WSS://A.TEST"], note());
        assert_eq!(action.relays(), ["wss://a.test"]);
        assert_eq!(action.on_complete().wait().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_relay_survives_pool_pruning() {
        let (pool, connector, context) = setup();
        let transport = connector.transport_for("wss://a.test");
        let action = publish(&pool, &context, &["wss://a.test"], note());

        assert_eq!(pool.prune_idle(), 0);
        transport.push_message(&RelayMessage::Ok {
            event_id: action.event().id.clone(),
            status: true,
            message: String::new(),
        });

        let results = action.on_complete().wait().await;
        assert_eq!(results.len(), 1);
        assert!(results[0].status);
        assert!(!results[0].is_timeout());

        // answered relays are let go
        assert_eq!(pool.prune_idle(), 1);
    }

    // ===========================================
    // Side effects
    // ===========================================

    #[tokio::test]
    async fn records_into_shared_services() {
        let (pool, connector, context) = setup();
        connector.transport_for("wss://a.test").respond_with_events(Vec::new());
        let profile = Event::unsigned("aa", kind::METADATA, 5, vec![], "{}");
        let action = publish(&pool, &context, &["wss://a.test"], profile.clone());

        assert_eq!(context.publish_log.len(), 1);
        assert_eq!(context.publish_log.entries()[0].id(), action.id());
        assert!(context.seen.contains(&profile.id));
        assert_eq!(
            context.replaceables.get(&profile.coordinate().unwrap()).unwrap().id,
            profile.id
        );

        action.on_complete().wait().await;
        assert_eq!(context.seen.relays_for(&profile.id), vec!["wss://a.test"]);
    }

    #[tokio::test]
    async fn publishing_a_deletion_records_the_tombstone() {
        let (pool, _, context) = setup();
        let target = note();
        let deletion = Event::unsigned("aa", kind::DELETION, 200, vec![Tag::new(["e", target.id.as_str()])], "");
        let _action = publish(&pool, &context, &[], deletion);
        assert!(context.deletions.is_deleted(&target));
    }
}
