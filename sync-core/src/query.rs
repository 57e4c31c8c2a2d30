//! Query map reconciliation.

use nostr_sync_types::QueryMap;

/// How a new query map differs from the active one, per relay URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryMapDiff {
    /// Relays no longer queried. Close their subscriptions.
    pub removed: Vec<String>,
    /// Relays whose filters changed. Close and reopen.
    pub changed: Vec<String>,
    /// Relays newly queried. Open fresh.
    pub added: Vec<String>,
    /// Relays with structurally equal filters. Leave alone.
    pub unchanged: Vec<String>,
}

impl QueryMapDiff {
    /// Whether applying the new map would touch any subscription.
    pub fn is_noop(&self) -> bool {
        self.removed.is_empty() && self.changed.is_empty() && self.added.is_empty()
    }

    /// Relays that need a new subscription: changed then added.
    pub fn to_open(&self) -> impl Iterator<Item = &String> {
        self.changed.iter().chain(self.added.iter())
    }

    /// Relays whose current subscription must go: removed then changed.
    pub fn to_close(&self) -> impl Iterator<Item = &String> {
        self.removed.iter().chain(self.changed.iter())
    }
}

/// Compare two query maps. Filter lists compare by value, in order.
pub fn diff_query_maps(old: &QueryMap, new: &QueryMap) -> QueryMapDiff {
    let mut diff = QueryMapDiff::default();
    for relay in old.keys() {
        if !new.contains_key(relay) {
            diff.removed.push(relay.clone());
        }
    }
    for (relay, filters) in new {
        match old.get(relay) {
            None => diff.added.push(relay.clone()),
            Some(current) if current == filters => diff.unchanged.push(relay.clone()),
            Some(_) => diff.changed.push(relay.clone()),
        }
    }
    diff
}
