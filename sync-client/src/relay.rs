//! One relay connection.
//!
//! A [`Relay`] is a cheap handle over a background task that owns the
//! transport. Callers queue outbound messages without waiting; the task
//! connects lazily when there is something worth sending, routes inbound
//! frames to subscription handlers by subscription id, and publishes `OK`
//! results on [`Relay::on_command_result`].
//!
//! Connection lifecycle is decided by the pure [`RelayState`] machine from
//! `nostr-sync-core`; this module only performs the actions it asks for.
//! Network failures never surface as errors: after the reconnect budget is
//! spent, every open subscription receives a synthetic `CLOSED` and queued
//! traffic is dropped.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use nostr_sync_core::{
    Action, CommandResult, ConnectionEvent, ReconnectPolicy, RelayEvent, RelayState, Subject,
};
use nostr_sync_types::{ClientMessage, Event, Filter, RelayMessage, SubscriptionId};

use crate::config::ClientConfig;
use crate::transport::{Transport, TransportError};

/// Receives `EVENT`, `EOSE` and `CLOSED` frames for one subscription.
///
/// Runs on the relay task; it must not block.
pub type MessageHandler = Arc<dyn Fn(&RelayMessage) + Send + Sync>;

/// Connection tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOptions {
    /// Deadline for a single connection attempt.
    pub connect_timeout: Duration,
    /// Reconnect limits.
    pub reconnect: ReconnectPolicy,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for RelayOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            reconnect: config.reconnect_policy(),
        }
    }
}

struct ActiveSubscription {
    filters: Vec<Filter>,
    handler: MessageHandler,
    /// Connection session the `REQ` was last written in.
    sent_in: Option<u64>,
}

struct RelayShared {
    url: String,
    options: RelayOptions,
    subscriptions: Mutex<HashMap<SubscriptionId, ActiveSubscription>>,
    state: Mutex<RelayState>,
    on_command_result: Subject<CommandResult>,
    on_notice: Subject<String>,
    on_connection: Subject<ConnectionEvent>,
}

impl RelayShared {
    fn route(&self, text: &str) {
        let message = match RelayMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(relay = %self.url, error = %e, "dropping malformed frame");
                return;
            }
        };

        match &message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                if !event.has_valid_id() {
                    debug!(relay = %self.url, id = %event.id, "dropping event with mismatched id");
                    return;
                }
                self.dispatch(subscription_id, &message, false);
            }
            RelayMessage::Eose(subscription_id) => self.dispatch(subscription_id, &message, false),
            RelayMessage::Closed {
                subscription_id,
                message: reason,
            } => {
                debug!(relay = %self.url, subscription = %subscription_id, reason = %reason, "subscription closed by relay");
                self.dispatch(subscription_id, &message, true);
            }
            RelayMessage::Ok {
                event_id,
                status,
                message: reason,
            } => self.on_command_result.next(CommandResult::ok(
                self.url.clone(),
                event_id.clone(),
                *status,
                reason.clone(),
            )),
            RelayMessage::Notice(notice) => {
                info!(relay = %self.url, notice = %notice, "relay notice");
                self.on_notice.next(notice.clone());
            }
        }
    }

    fn dispatch(&self, id: &SubscriptionId, message: &RelayMessage, remove: bool) {
        let handler = {
            let mut subscriptions = self.subscriptions.lock();
            if remove {
                subscriptions.remove(id).map(|s| s.handler)
            } else {
                subscriptions.get(id).map(|s| Arc::clone(&s.handler))
            }
        };
        match handler {
            Some(handler) => handler(message),
            None => trace!(relay = %self.url, subscription = %id, "frame for unknown subscription"),
        }
    }

    /// Filters to write for `id` in `session`, or None if the subscription is
    /// gone or was already written in this session.
    fn claim(&self, id: &SubscriptionId, session: u64) -> Option<Vec<Filter>> {
        let mut subscriptions = self.subscriptions.lock();
        let sub = subscriptions.get_mut(id)?;
        if sub.sent_in == Some(session) {
            return None;
        }
        sub.sent_in = Some(session);
        Some(sub.filters.clone())
    }

    fn claim_all(&self, session: u64) -> Vec<(SubscriptionId, Vec<Filter>)> {
        let mut subscriptions = self.subscriptions.lock();
        subscriptions
            .iter_mut()
            .map(|(id, sub)| {
                sub.sent_in = Some(session);
                (id.clone(), sub.filters.clone())
            })
            .collect()
    }

    fn mark_closed(&self, id: &SubscriptionId) {
        if let Some(sub) = self.subscriptions.lock().get_mut(id) {
            sub.sent_in = None;
        }
    }

    /// Close every open subscription locally after the relay gave up.
    fn abandon(&self, error: &str) {
        let closed: Vec<(SubscriptionId, MessageHandler)> = self
            .subscriptions
            .lock()
            .drain()
            .map(|(id, sub)| (id, sub.handler))
            .collect();
        for (id, handler) in closed {
            handler(&RelayMessage::Closed {
                subscription_id: id,
                message: format!("error: {}", error),
            });
        }
    }
}

/// Handle to one relay connection.
///
/// Must be created inside a tokio runtime. Dropping the handle stops the
/// background task and closes the socket.
pub struct Relay {
    shared: Arc<RelayShared>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    task: JoinHandle<()>,
}

impl Relay {
    /// Start the background task for `url` over `transport`. Nothing is
    /// dialed until the first message is queued.
    pub fn spawn(url: impl Into<String>, transport: Arc<dyn Transport>, options: RelayOptions) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(RelayShared {
            url: url.into(),
            options,
            subscriptions: Mutex::new(HashMap::new()),
            state: Mutex::new(RelayState::new()),
            on_command_result: Subject::stream(),
            on_notice: Subject::stream(),
            on_connection: Subject::stream(),
        });
        let task = tokio::spawn(
            RelayTask {
                shared: Arc::clone(&shared),
                transport,
                outbound: outbound_rx,
                machine: RelayState::new(),
                session: 0,
            }
            .run(),
        );
        Self {
            shared,
            outbound,
            task,
        }
    }

    /// Normalized relay URL.
    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Current connection state.
    pub fn status(&self) -> RelayState {
        *self.shared.state.lock()
    }

    /// Open (or replace) subscription `id`. Frames for it go to `handler`
    /// until `unsubscribe`, a relay `CLOSED`, or the relay giving up.
    pub fn subscribe(&self, id: SubscriptionId, filters: Vec<Filter>, handler: MessageHandler) {
        self.shared.subscriptions.lock().insert(
            id.clone(),
            ActiveSubscription {
                filters: filters.clone(),
                handler,
                sent_in: None,
            },
        );
        self.queue(ClientMessage::Req {
            subscription_id: id,
            filters,
        });
    }

    /// Close subscription `id`. Returns false if it was not open.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let removed = self.shared.subscriptions.lock().remove(id).is_some();
        if removed {
            self.queue(ClientMessage::Close(id.clone()));
        }
        removed
    }

    /// Send an event. The answer arrives on `on_command_result`.
    pub fn publish(&self, event: Event) {
        self.queue(ClientMessage::Event(event));
    }

    fn queue(&self, message: ClientMessage) {
        if self.outbound.send(message).is_err() {
            debug!(relay = %self.shared.url, "relay task stopped; dropping message");
        }
    }

    /// Number of open subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.shared.subscriptions.lock().len()
    }

    /// Whether subscription `id` is open.
    pub fn has_subscription(&self, id: &SubscriptionId) -> bool {
        self.shared.subscriptions.lock().contains_key(id)
    }

    /// `OK` answers to published events.
    pub fn on_command_result(&self) -> &Subject<CommandResult> {
        &self.shared.on_command_result
    }

    /// `NOTICE` messages.
    pub fn on_notice(&self) -> &Subject<String> {
        &self.shared.on_notice
    }

    /// Connection lifecycle notifications.
    pub fn on_connection(&self) -> &Subject<ConnectionEvent> {
        &self.shared.on_connection
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("url", &self.shared.url)
            .field("status", &self.status())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

enum Wake {
    Outbound(Option<ClientMessage>),
    Inbound(Result<String, TransportError>),
}

struct RelayTask {
    shared: Arc<RelayShared>,
    transport: Arc<dyn Transport>,
    outbound: mpsc::UnboundedReceiver<ClientMessage>,
    machine: RelayState,
    session: u64,
}

impl RelayTask {
    async fn run(mut self) {
        loop {
            if !self.machine.is_connected() {
                let Some(first) = self.outbound.recv().await else {
                    break;
                };
                if !self.wants_connection(&first) {
                    continue;
                }
                if let Err(error) = self.drive(RelayEvent::ConnectRequested).await {
                    self.give_up(&error);
                    continue;
                }
                self.deliver(first).await;
                continue;
            }

            let wake = tokio::select! {
                message = self.outbound.recv() => Wake::Outbound(message),
                frame = self.transport.recv() => Wake::Inbound(frame),
            };
            match wake {
                Wake::Outbound(Some(message)) => self.deliver(message).await,
                Wake::Outbound(None) => break,
                Wake::Inbound(Ok(text)) => self.shared.route(&text),
                Wake::Inbound(Err(e)) => self.connection_lost(e.to_string()).await,
            }
        }

        if self.machine.is_connected() {
            let _ = self.transport.close().await;
        }
        debug!(relay = %self.shared.url, "relay task finished");
    }

    /// Messages that are pointless without an open subscription do not
    /// justify dialing.
    fn wants_connection(&self, message: &ClientMessage) -> bool {
        match message {
            ClientMessage::Event(_) => true,
            ClientMessage::Req {
                subscription_id, ..
            } => self.shared.subscriptions.lock().contains_key(subscription_id),
            ClientMessage::Close(_) => false,
        }
    }

    async fn deliver(&mut self, message: ClientMessage) {
        let message = match message {
            ClientMessage::Req {
                subscription_id, ..
            } => match self.shared.claim(&subscription_id, self.session) {
                Some(filters) => ClientMessage::Req {
                    subscription_id,
                    filters,
                },
                None => return,
            },
            ClientMessage::Close(id) => {
                self.shared.mark_closed(&id);
                ClientMessage::Close(id)
            }
            event => event,
        };
        if let Err(e) = self.write(&message).await {
            self.connection_lost(e.to_string()).await;
        }
    }

    async fn write(&self, message: &ClientMessage) -> Result<(), TransportError> {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(relay = %self.shared.url, error = %e, "failed to encode message");
                return Ok(());
            }
        };
        trace!(relay = %self.shared.url, frame = %text, "send");
        self.transport.send(&text).await
    }

    async fn connection_lost(&mut self, reason: String) {
        if let Err(error) = self.drive(RelayEvent::Disconnected { reason }).await {
            self.give_up(&error);
        }
    }

    fn give_up(&mut self, error: &str) {
        self.shared.abandon(error);
        let mut dropped = 0usize;
        while self.outbound.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(relay = %self.shared.url, dropped, "dropped queued messages");
        }
    }

    fn step(&mut self, event: RelayEvent) -> Vec<Action> {
        let (next, actions) = self.machine.on_event(event, &self.shared.options.reconnect);
        self.machine = next;
        *self.shared.state.lock() = next;
        actions
    }

    /// Feed `event` to the state machine and carry out the resulting actions
    /// until it settles. Err means the machine gave up.
    async fn drive(&mut self, event: RelayEvent) -> Result<(), String> {
        let mut pending: VecDeque<Action> = self.step(event).into();
        while let Some(action) = pending.pop_front() {
            match action {
                Action::Connect => {
                    let attempt = tokio::time::timeout(
                        self.shared.options.connect_timeout,
                        self.transport.connect(&self.shared.url),
                    )
                    .await;
                    let outcome = match attempt {
                        Ok(Ok(())) => RelayEvent::ConnectSucceeded,
                        Ok(Err(e)) => RelayEvent::ConnectFailed {
                            error: e.to_string(),
                        },
                        Err(_) => RelayEvent::ConnectFailed {
                            error: TransportError::Timeout.to_string(),
                        },
                    };
                    pending.extend(self.step(outcome));
                }
                Action::StartReconnectTimer { delay } => {
                    debug!(relay = %self.shared.url, ?delay, "waiting to reconnect");
                    tokio::time::sleep(delay).await;
                    pending.extend(self.step(RelayEvent::ReconnectTimer));
                }
                Action::Resubscribe => {
                    self.session += 1;
                    if let Err(e) = self.resubscribe().await {
                        pending.extend(self.step(RelayEvent::Disconnected {
                            reason: e.to_string(),
                        }));
                    }
                }
                Action::GiveUp { attempts, error } => {
                    warn!(relay = %self.shared.url, attempts, error = %error, "giving up on relay");
                    return Err(error);
                }
                Action::EmitEvent(event) => {
                    match &event {
                        ConnectionEvent::Connected => info!(relay = %self.shared.url, "connected"),
                        ConnectionEvent::Disconnected { reason } => {
                            info!(relay = %self.shared.url, reason = %reason, "disconnected")
                        }
                        ConnectionEvent::ConnectionFailed { error }
                        | ConnectionEvent::ReconnectFailed { error, .. } => {
                            debug!(relay = %self.shared.url, error = %error, "connect failed")
                        }
                    }
                    self.shared.on_connection.next(event);
                }
                Action::Disconnect | Action::CancelReconnect => {
                    let _ = self.transport.close().await;
                }
            }
        }
        Ok(())
    }

    async fn resubscribe(&mut self) -> Result<(), TransportError> {
        let subscriptions = self.shared.claim_all(self.session);
        if !subscriptions.is_empty() {
            debug!(relay = %self.shared.url, count = subscriptions.len(), "sending subscriptions");
        }
        for (subscription_id, filters) in subscriptions {
            self.write(&ClientMessage::Req {
                subscription_id,
                filters,
            })
            .await?;
        }
        Ok(())
    }
}
