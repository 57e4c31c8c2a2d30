//! Mock transport for testing.
//!
//! Allows scripting relay replies and capturing sent frames for
//! verification. A [`Responder`] turns each frame the client sends into the
//! frames a relay would answer with, which is enough to stand in for a small
//! in-memory relay.

use super::{Connector, Transport, TransportError};
use async_trait::async_trait;
use nostr_sync_types::{ClientMessage, Event, RelayMessage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Computes a relay's replies to one client frame.
pub type Responder = Arc<dyn Fn(&ClientMessage) -> Vec<RelayMessage> + Send + Sync>;

type Inbound = Result<String, TransportError>;

/// Mock transport for testing.
///
/// Clones share state, so a test can keep a handle while the relay task
/// owns another.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<MockTransportInner>,
}

struct MockTransportInner {
    state: Mutex<MockState>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
}

#[derive(Default)]
struct MockState {
    connected: bool,
    connected_address: Option<String>,
    connect_count: u32,
    sent_messages: Vec<String>,
    failing_connects: u32,
    connect_error: String,
    fail_next_send: Option<String>,
    responder: Option<Responder>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(MockTransportInner {
                state: Mutex::new(MockState::default()),
                inbound_tx,
                inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            }),
        }
    }

    /// Queue a raw frame for a later `recv()`.
    pub fn queue_response(&self, text: impl Into<String>) {
        let _ = self.inner.inbound_tx.send(Ok(text.into()));
    }

    /// Queue a relay message for a later `recv()`.
    pub fn push_message(&self, message: &RelayMessage) {
        if let Ok(text) = message.to_json() {
            self.queue_response(text);
        }
    }

    /// Answer every sent frame with `responder`.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&ClientMessage) -> Vec<RelayMessage> + Send + Sync + 'static,
    {
        self.inner.state.lock().responder = Some(Arc::new(responder));
    }

    /// Behave like a relay holding `events`: answer each `REQ` with the
    /// newest matching events (honoring every filter's `limit`) followed by
    /// `EOSE`, and accept every published event with `OK true`.
    pub fn respond_with_events(&self, events: Vec<Event>) {
        self.set_responder(move |message| match message {
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut matched: Vec<Event> = Vec::new();
                for filter in filters {
                    let mut hits: Vec<&Event> = events.iter().filter(|e| filter.matches(e)).collect();
                    hits.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
                    if let Some(limit) = filter.limit {
                        hits.truncate(limit);
                    }
                    for event in hits {
                        if !matched.iter().any(|m| m.id == event.id) {
                            matched.push(event.clone());
                        }
                    }
                }
                matched
                    .into_iter()
                    .map(|event| RelayMessage::Event {
                        subscription_id: subscription_id.clone(),
                        event,
                    })
                    .chain(std::iter::once(RelayMessage::Eose(subscription_id.clone())))
                    .collect()
            }
            ClientMessage::Event(event) => vec![RelayMessage::Ok {
                event_id: event.id.clone(),
                status: true,
                message: String::new(),
            }],
            ClientMessage::Close(_) => Vec::new(),
        });
    }

    /// Get all frames that were sent.
    pub fn sent_messages(&self) -> Vec<String> {
        self.inner.state.lock().sent_messages.clone()
    }

    /// Sent frames decoded as client messages.
    pub fn sent_client_messages(&self) -> Vec<ClientMessage> {
        self.sent_messages()
            .iter()
            .filter_map(|text| ClientMessage::from_json(text).ok())
            .collect()
    }

    /// Get the last frame that was sent.
    pub fn last_sent(&self) -> Option<String> {
        self.inner.state.lock().sent_messages.last().cloned()
    }

    /// Get the address that was connected to.
    pub fn connected_address(&self) -> Option<String> {
        self.inner.state.lock().connected_address.clone()
    }

    /// Number of successful `connect()` calls.
    pub fn connect_count(&self) -> u32 {
        self.inner.state.lock().connect_count
    }

    /// Cause the next connect() to fail with the given error.
    pub fn fail_next_connect(&self, error: &str) {
        self.fail_connects(1, error);
    }

    /// Cause the next `count` connects to fail with the given error.
    pub fn fail_connects(&self, count: u32, error: &str) {
        let mut state = self.inner.state.lock();
        state.failing_connects = count;
        state.connect_error = error.to_string();
    }

    /// Cause the next send() to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        self.inner.state.lock().fail_next_send = Some(error.to_string());
    }

    /// Simulate the relay dropping the connection.
    pub fn drop_connection(&self) {
        self.inner.state.lock().connected = false;
        let _ = self.inner.inbound_tx.send(Err(TransportError::ConnectionClosed));
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, address: &str) -> Result<(), TransportError> {
        let mut state = self.inner.state.lock();

        // Check for forced failure
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(TransportError::ConnectionFailed(state.connect_error.clone()));
        }

        state.connected = true;
        state.connect_count += 1;
        state.connected_address = Some(address.to_string());
        Ok(())
    }

    async fn send(&self, text: &str) -> Result<(), TransportError> {
        let responder = {
            let mut state = self.inner.state.lock();

            if !state.connected {
                return Err(TransportError::NotConnected);
            }

            // Check for forced failure
            if let Some(error) = state.fail_next_send.take() {
                return Err(TransportError::SendFailed(error));
            }

            state.sent_messages.push(text.to_string());
            state.responder.clone()
        };

        if let (Some(responder), Ok(message)) = (responder, ClientMessage::from_json(text)) {
            for reply in responder(&message) {
                self.push_message(&reply);
            }
        }
        Ok(())
    }

    async fn recv(&self) -> Result<String, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let mut inbound = self.inner.inbound_rx.lock().await;
        match inbound.recv().await {
            Some(Ok(text)) => Ok(text),
            Some(Err(error)) => Err(error),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    fn is_connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.state.lock().connected = false;
        Ok(())
    }
}

/// Hands out one shared [`MockTransport`] per relay URL.
#[derive(Clone, Default)]
pub struct MockConnector {
    transports: Arc<Mutex<HashMap<String, MockTransport>>>,
}

impl MockConnector {
    /// Create a connector with no transports yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// The transport used for `url`, created on first use.
    pub fn transport_for(&self, url: &str) -> MockTransport {
        self.transports
            .lock()
            .entry(url.to_string())
            .or_default()
            .clone()
    }
}

impl Connector for MockConnector {
    fn transport(&self, url: &str) -> Arc<dyn Transport> {
        Arc::new(self.transport_for(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_sync_types::{kind, Filter, SubscriptionId};

    fn note(created_at: u64) -> Event {
        Event::unsigned("aa", kind::TEXT_NOTE, created_at, vec![], created_at.to_string())
    }

    // ===========================================
    // MockTransport Basic Tests
    // ===========================================

    #[tokio::test]
    async fn mock_transport_connects() {
        let transport = MockTransport::new();
        assert!(!transport.is_connected());

        transport.connect("wss://relay.test").await.unwrap();

        assert!(transport.is_connected());
        assert_eq!(
            transport.connected_address(),
            Some("wss://relay.test".to_string())
        );
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn mock_transport_sends_messages() {
        let transport = MockTransport::new();
        transport.connect("wss://relay.test").await.unwrap();

        transport.send("frame 1").await.unwrap();
        transport.send("frame 2").await.unwrap();

        assert_eq!(transport.sent_messages(), vec!["frame 1", "frame 2"]);
        assert_eq!(transport.last_sent().as_deref(), Some("frame 2"));
    }

    #[tokio::test]
    async fn mock_transport_receives_queued_frames() {
        let transport = MockTransport::new();
        transport.connect("wss://relay.test").await.unwrap();

        transport.queue_response("one");
        transport.queue_response("two");

        assert_eq!(transport.recv().await.unwrap(), "one");
        assert_eq!(transport.recv().await.unwrap(), "two");
    }

    #[tokio::test]
    async fn mock_transport_closes() {
        let transport = MockTransport::new();
        transport.connect("wss://relay.test").await.unwrap();

        transport.close().await.unwrap();
        assert!(!transport.is_connected());
    }

    // ===========================================
    // Error Condition Tests
    // ===========================================

    #[tokio::test]
    async fn send_without_connect_fails() {
        let transport = MockTransport::new();
        let result = transport.send("data").await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn recv_without_connect_fails() {
        let transport = MockTransport::new();
        let result = transport.recv().await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn forced_connect_failures() {
        let transport = MockTransport::new();
        transport.fail_connects(2, "unreachable");

        assert!(matches!(
            transport.connect("wss://relay.test").await,
            Err(TransportError::ConnectionFailed(_))
        ));
        assert!(transport.connect("wss://relay.test").await.is_err());
        assert!(transport.connect("wss://relay.test").await.is_ok());
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn forced_send_failure() {
        let transport = MockTransport::new();
        transport.connect("wss://relay.test").await.unwrap();
        transport.fail_next_send("buffer full");

        let result = transport.send("data").await;
        assert!(matches!(result, Err(TransportError::SendFailed(_))));

        // Next send should work
        transport.send("data").await.unwrap();
    }

    #[tokio::test]
    async fn dropped_connection_surfaces_on_recv() {
        let transport = MockTransport::new();
        transport.connect("wss://relay.test").await.unwrap();
        transport.drop_connection();

        assert!(!transport.is_connected());
        transport.connect("wss://relay.test").await.unwrap();
        assert!(matches!(
            transport.recv().await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    // ===========================================
    // Scripted Relay Tests
    // ===========================================

    #[tokio::test]
    async fn responder_serves_newest_matching_events_then_eose() {
        let transport = MockTransport::new();
        transport.respond_with_events(vec![note(1), note(2), note(3)]);
        transport.connect("wss://relay.test").await.unwrap();

        let req = ClientMessage::Req {
            subscription_id: SubscriptionId::from("s"),
            filters: vec![Filter::new().kinds([kind::TEXT_NOTE]).limit(2)],
        };
        transport.send(&req.to_json().unwrap()).await.unwrap();

        let mut stamps = Vec::new();
        loop {
            match RelayMessage::from_json(&transport.recv().await.unwrap()).unwrap() {
                RelayMessage::Event { event, .. } => stamps.push(event.created_at),
                RelayMessage::Eose(id) => {
                    assert_eq!(id.as_str(), "s");
                    break;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(stamps, vec![3, 2]);
    }

    #[tokio::test]
    async fn responder_accepts_published_events() {
        let transport = MockTransport::new();
        transport.respond_with_events(Vec::new());
        transport.connect("wss://relay.test").await.unwrap();

        let event = note(1);
        transport
            .send(&ClientMessage::Event(event.clone()).to_json().unwrap())
            .await
            .unwrap();

        let reply = RelayMessage::from_json(&transport.recv().await.unwrap()).unwrap();
        assert!(matches!(reply, RelayMessage::Ok { status: true, ref event_id, .. } if *event_id == event.id));
    }

    // ===========================================
    // Clone and Connector Tests
    // ===========================================

    #[tokio::test]
    async fn mock_transport_clone_shares_state() {
        let transport1 = MockTransport::new();
        let transport2 = transport1.clone();

        transport1.connect("wss://relay.test").await.unwrap();
        assert!(transport2.is_connected());

        transport1.send("from t1").await.unwrap();
        transport2.send("from t2").await.unwrap();
        assert_eq!(transport1.sent_messages().len(), 2);
    }

    #[tokio::test]
    async fn connector_reuses_transport_per_url() {
        let connector = MockConnector::new();
        let handle = connector.transport_for("wss://a.test");

        let transport = connector.transport("wss://a.test");
        transport.connect("wss://a.test").await.unwrap();

        assert!(handle.is_connected());
        assert!(!connector.transport_for("wss://b.test").is_connected());
    }
}
