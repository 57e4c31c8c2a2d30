//! Connection pool.
//!
//! Consumers ask the pool for a relay by URL; every caller asking for the
//! same (normalized) URL shares one [`Relay`] and therefore one socket.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use nostr_sync_types::QueryMap;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::relay::{Relay, RelayOptions};
use crate::transport::{Connector, WebSocketConnector};

/// Canonical form of a relay URL: lowercase scheme and host, default port
/// dropped, no trailing slash.
pub fn normalize_url(input: &str) -> Result<String> {
    let invalid = |reason: &str| ClientError::InvalidUrl {
        url: input.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(input.trim()).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(invalid("scheme must be ws or wss"));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host"));
    }

    let mut normalized = url.to_string();
    if url.query().is_none() && url.fragment().is_none() {
        while normalized.ends_with('/') {
            normalized.pop();
        }
    }
    Ok(normalized)
}

/// Normalize relay URLs, dropping duplicates but keeping first-seen order.
pub fn normalize_relays<I, S>(urls: I) -> Result<Vec<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for url in urls {
        let url = normalize_url(url.as_ref())?;
        if !out.contains(&url) {
            out.push(url);
        }
    }
    Ok(out)
}

/// Normalize the keys of a query map. Entries that collapse onto the same
/// relay have their filters concatenated.
pub fn normalize_query_map(map: QueryMap) -> Result<QueryMap> {
    let mut out = QueryMap::new();
    for (url, filters) in map {
        out.entry(normalize_url(&url)?).or_default().extend(filters);
    }
    Ok(out)
}

struct PoolInner {
    relays: Mutex<BTreeMap<String, Arc<Relay>>>,
    connector: Arc<dyn Connector>,
    options: RelayOptions,
}

/// Shared map from relay URL to connection.
///
/// Cloning is cheap; clones share the same connections.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<PoolInner>,
}

impl RelayPool {
    /// Pool whose relays get their transports from `connector`.
    pub fn new(connector: Arc<dyn Connector>, config: &ClientConfig) -> Self {
        Self::with_options(connector, RelayOptions::from(config))
    }

    /// Pool with explicit connection options.
    pub fn with_options(connector: Arc<dyn Connector>, options: RelayOptions) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                relays: Mutex::new(BTreeMap::new()),
                connector,
                options,
            }),
        }
    }

    /// Pool over real WebSocket connections.
    pub fn websocket(config: &ClientConfig) -> Self {
        Self::new(Arc::new(WebSocketConnector), config)
    }

    /// The relay for `url`, created on first request.
    ///
    /// The returned relay is usable right away even though nothing has been
    /// dialed: it connects when the first message is queued. Must be called
    /// inside a tokio runtime.
    pub fn request_relay(&self, url: &str) -> Result<Arc<Relay>> {
        let url = normalize_url(url)?;
        let mut relays = self.inner.relays.lock();
        if let Some(relay) = relays.get(&url) {
            return Ok(Arc::clone(relay));
        }
        debug!(relay = %url, "adding relay to pool");
        let transport = self.inner.connector.transport(&url);
        let relay = Arc::new(Relay::spawn(url.clone(), transport, self.inner.options));
        relays.insert(url, Arc::clone(&relay));
        Ok(relay)
    }

    /// The relay for `url` if the pool already has one.
    pub fn relay(&self, url: &str) -> Option<Arc<Relay>> {
        let url = normalize_url(url).ok()?;
        self.inner.relays.lock().get(&url).cloned()
    }

    /// Every pooled relay, ordered by URL.
    pub fn relays(&self) -> Vec<Arc<Relay>> {
        self.inner.relays.lock().values().cloned().collect()
    }

    /// Number of pooled relays.
    pub fn len(&self) -> usize {
        self.inner.relays.lock().len()
    }

    /// Whether the pool holds no relays.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop relays that nobody outside the pool references and that carry
    /// no open subscription. Returns how many were closed.
    pub fn prune_idle(&self) -> usize {
        let removed: Vec<Arc<Relay>> = {
            let mut relays = self.inner.relays.lock();
            let idle: Vec<String> = relays
                .iter()
                .filter(|(_, relay)| Arc::strong_count(relay) == 1 && relay.subscription_count() == 0)
                .map(|(url, _)| url.clone())
                .collect();
            idle.iter().filter_map(|url| relays.remove(url)).collect()
        };
        for relay in &removed {
            debug!(relay = %relay.url(), "pruned idle relay");
        }
        removed.len()
    }
}

impl std::fmt::Debug for RelayPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let relays = self.inner.relays.lock();
        f.debug_struct("RelayPool")
            .field("relays", &relays.keys().collect::<Vec<_>>())
            .finish()
    }
}
