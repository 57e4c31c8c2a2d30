//! One-shot read request.
//!
//! Opens the same subscription on a set of relays, forwards matching events
//! as they arrive, and completes once every relay has reported the end of
//! its stored events (or closed the subscription). There is no timeout at
//! this layer.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

use nostr_sync_core::Subject;
use nostr_sync_types::{Event, Filter, RelayMessage, SubscriptionId};

use crate::deferred::Deferred;
use crate::error::{ClientError, Result};
use crate::pool::{normalize_relays, RelayPool};
use crate::relay::{MessageHandler, Relay};

#[derive(Default)]
struct RequestState {
    started: bool,
    filters: Vec<Filter>,
    finished: HashSet<String>,
    /// `(relay, event id)` pairs already forwarded.
    forwarded: HashSet<(String, String)>,
}

struct RequestInner {
    id: SubscriptionId,
    relays: Vec<Arc<Relay>>,
    state: Mutex<RequestState>,
    on_event: Subject<Event>,
    complete: Deferred<()>,
}

impl RequestInner {
    fn handle(&self, relay: &str, message: &RelayMessage) {
        match message {
            RelayMessage::Event { event, .. } => {
                {
                    let mut state = self.state.lock();
                    if self.complete.is_resolved() {
                        return;
                    }
                    if !state.filters.iter().any(|f| f.matches(event)) {
                        trace!(relay, id = %event.id, "dropping event outside filters");
                        return;
                    }
                    if !state.forwarded.insert((relay.to_string(), event.id.clone())) {
                        return;
                    }
                }
                self.on_event.next(event.clone());
            }
            RelayMessage::Eose(_) => {
                self.unsubscribe(relay);
                self.finish_relay(relay);
            }
            RelayMessage::Closed { .. } => self.finish_relay(relay),
            _ => {}
        }
    }

    fn finish_relay(&self, relay: &str) {
        let all_done = {
            let mut state = self.state.lock();
            state.finished.insert(relay.to_string());
            state.finished.len() >= self.relays.len()
        };
        if all_done && self.complete.resolve(()) {
            debug!(subscription = %self.id, "request complete");
        }
    }

    fn unsubscribe(&self, url: &str) {
        if let Some(relay) = self.relays.iter().find(|r| r.url() == url) {
            relay.unsubscribe(&self.id);
        }
    }

    fn cancel(&self) {
        for relay in &self.relays {
            relay.unsubscribe(&self.id);
        }
        self.complete.resolve(());
    }
}

impl Drop for RequestInner {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// A one-shot request to a fixed set of relays.
///
/// Clones share the request. When the last clone is dropped the request is
/// cancelled: its subscriptions are closed and `on_complete` resolves.
#[derive(Clone)]
pub struct Request {
    inner: Arc<RequestInner>,
}

impl Request {
    /// Prepare a request against `relays`. Nothing is sent until `start`.
    pub fn new<I, S>(pool: &RelayPool, relays: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let relays = normalize_relays(relays)?
            .iter()
            .map(|url| pool.request_relay(url))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            inner: Arc::new(RequestInner {
                id: SubscriptionId::generate(),
                relays,
                state: Mutex::new(RequestState::default()),
                on_event: Subject::stream(),
                complete: Deferred::new(),
            }),
        })
    }

    /// Subscription id used on every relay.
    pub fn id(&self) -> &SubscriptionId {
        &self.inner.id
    }

    /// Relays this request targets.
    pub fn relay_urls(&self) -> Vec<String> {
        self.inner.relays.iter().map(|r| r.url().to_string()).collect()
    }

    /// Matching events, each forwarded once per relay.
    ///
    /// The same event from two relays is forwarded twice; deduplication is
    /// the event store's job.
    pub fn on_event(&self) -> &Subject<Event> {
        &self.inner.on_event
    }

    /// Resolves when every relay has finished or the request is cancelled.
    pub fn on_complete(&self) -> Deferred<()> {
        self.inner.complete.clone()
    }

    /// Whether the request has completed.
    pub fn is_complete(&self) -> bool {
        self.inner.complete.is_resolved()
    }

    /// Send the request. Fails if any filter is invalid or the request was
    /// already started.
    pub fn start(&self, filters: Vec<Filter>) -> Result<()> {
        for filter in &filters {
            filter.validate()?;
        }
        {
            let mut state = self.inner.state.lock();
            if state.started {
                return Err(ClientError::AlreadyStarted);
            }
            state.started = true;
            state.filters = filters.clone();
        }

        if self.inner.relays.is_empty() {
            self.inner.complete.resolve(());
            return Ok(());
        }

        debug!(subscription = %self.inner.id, relays = self.inner.relays.len(), "starting request");
        for relay in &self.inner.relays {
            relay.subscribe(
                self.inner.id.clone(),
                filters.clone(),
                handler(Arc::downgrade(&self.inner), relay.url().to_string()),
            );
        }
        Ok(())
    }

    /// Abandon the request. Open subscriptions are closed and `on_complete`
    /// resolves; events still in flight are dropped.
    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

fn handler(inner: Weak<RequestInner>, relay: String) -> MessageHandler {
    Arc::new(move |message: &RelayMessage| {
        if let Some(inner) = inner.upgrade() {
            inner.handle(&relay, message);
        }
    })
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.inner.id)
            .field("relays", &self.relay_urls())
            .field("complete", &self.is_complete())
            .finish()
    }
}
