//! Read-path query filters.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Event, SyncError};

/// A query filter as sent in a `REQ`.
///
/// Equality is structural, so two filters built independently with the same
/// fields compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Match any of these event ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    /// Match any of these authors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    /// Match any of these kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,
    /// Match events carrying an `e` tag with one of these values.
    #[serde(rename = "#e", default, skip_serializing_if = "Option::is_none")]
    pub event_refs: Option<Vec<String>>,
    /// Match events carrying an `a` tag with one of these values.
    #[serde(rename = "#a", default, skip_serializing_if = "Option::is_none")]
    pub coordinate_refs: Option<Vec<String>>,
    /// Match events carrying a `p` tag with one of these values.
    #[serde(rename = "#p", default, skip_serializing_if = "Option::is_none")]
    pub pubkey_refs: Option<Vec<String>>,
    /// Match events carrying a `t` tag with one of these values.
    #[serde(rename = "#t", default, skip_serializing_if = "Option::is_none")]
    pub hashtags: Option<Vec<String>>,
    /// Lower time bound (inclusive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    /// Upper time bound (inclusive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    /// Maximum number of stored events the relay should return.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    /// An empty filter (matches everything).
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to the given kinds.
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u32>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Restrict to the given authors.
    pub fn authors<S: Into<String>>(mut self, authors: impl IntoIterator<Item = S>) -> Self {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    /// Restrict to the given event ids.
    pub fn ids<S: Into<String>>(mut self, ids: impl IntoIterator<Item = S>) -> Self {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Restrict to events referencing these event ids.
    pub fn event_refs<S: Into<String>>(mut self, ids: impl IntoIterator<Item = S>) -> Self {
        self.event_refs = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Restrict to events referencing these coordinates.
    pub fn coordinate_refs<S: Into<String>>(mut self, coords: impl IntoIterator<Item = S>) -> Self {
        self.coordinate_refs = Some(coords.into_iter().map(Into::into).collect());
        self
    }

    /// Restrict to events mentioning these pubkeys.
    pub fn pubkey_refs<S: Into<String>>(mut self, keys: impl IntoIterator<Item = S>) -> Self {
        self.pubkey_refs = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    /// Restrict to events with these hashtags.
    pub fn hashtags<S: Into<String>>(mut self, tags: impl IntoIterator<Item = S>) -> Self {
        self.hashtags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    /// Set or override the lower time bound.
    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    /// Set or override the upper time bound.
    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    /// Set or override the result limit.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether an event satisfies every constraint of this filter.
    ///
    /// `limit` is a relay-side hint and is not checked here.
    pub fn matches(&self, event: &Event) -> bool {
        fn any_of<T: PartialEq>(set: &Option<Vec<T>>, value: &T) -> bool {
            set.as_ref().map_or(true, |s| s.contains(value))
        }
        fn tag_matches(set: &Option<Vec<String>>, event: &Event, name: &str) -> bool {
            match set {
                None => true,
                Some(values) => event
                    .tag_values(name)
                    .any(|v| values.iter().any(|want| want == v)),
            }
        }

        any_of(&self.ids, &event.id)
            && any_of(&self.authors, &event.pubkey)
            && any_of(&self.kinds, &event.kind)
            && tag_matches(&self.event_refs, event, "e")
            && tag_matches(&self.coordinate_refs, event, "a")
            && tag_matches(&self.pubkey_refs, event, "p")
            && tag_matches(&self.hashtags, event, "t")
            && self.since.map_or(true, |s| event.created_at >= s)
            && self.until.map_or(true, |u| event.created_at <= u)
    }

    /// Reject filters that no relay could answer sensibly.
    pub fn validate(&self) -> Result<(), SyncError> {
        if let (Some(since), Some(until)) = (self.since, self.until) {
            if since > until {
                return Err(SyncError::InvalidFilter(format!(
                    "since ({}) is after until ({})",
                    since, until
                )));
            }
        }
        if self.limit == Some(0) {
            return Err(SyncError::InvalidFilter("limit must be positive".into()));
        }
        let lists = [
            ("ids", self.ids.as_ref().map(Vec::len)),
            ("authors", self.authors.as_ref().map(Vec::len)),
            ("kinds", self.kinds.as_ref().map(Vec::len)),
            ("#e", self.event_refs.as_ref().map(Vec::len)),
            ("#a", self.coordinate_refs.as_ref().map(Vec::len)),
            ("#p", self.pubkey_refs.as_ref().map(Vec::len)),
            ("#t", self.hashtags.as_ref().map(Vec::len)),
        ];
        for (name, len) in lists {
            if len == Some(0) {
                return Err(SyncError::InvalidFilter(format!("{} must not be empty", name)));
            }
        }
        Ok(())
    }
}

/// Relay URL to the filters requested from that relay.
pub type QueryMap = BTreeMap<String, Vec<Filter>>;

/// Apply `f` to every filter in the map, keeping the relay keys.
pub fn map_query_map(map: &QueryMap, f: impl Fn(Filter) -> Filter) -> QueryMap {
    map.iter()
        .map(|(relay, filters)| (relay.clone(), filters.iter().cloned().map(&f).collect()))
        .collect()
}

/// Validate every filter in the map. Relays with no filters are rejected.
pub fn validate_query_map(map: &QueryMap) -> Result<(), SyncError> {
    for (relay, filters) in map {
        if filters.is_empty() {
            return Err(SyncError::InvalidFilter(format!("no filters for {}", relay)));
        }
        for filter in filters {
            filter.validate()?;
        }
    }
    Ok(())
}
