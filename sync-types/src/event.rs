//! Event model and replaceable coordinates.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::SyncError;

/// Well-known event kinds the sync engine reasons about.
pub mod kind {
    /// Profile metadata (replaceable).
    pub const METADATA: u32 = 0;
    /// Short text note.
    pub const TEXT_NOTE: u32 = 1;
    /// Contact list (replaceable).
    pub const CONTACTS: u32 = 3;
    /// Deletion request (tombstone).
    pub const DELETION: u32 = 5;
    /// Repost of another event.
    pub const REPOST: u32 = 6;
    /// Zap receipt.
    pub const ZAP: u32 = 9735;
}

/// Whether events of this kind replace older events at the same coordinate.
pub fn is_replaceable(kind: u32) -> bool {
    kind == kind::METADATA
        || kind == kind::CONTACTS
        || (10_000..20_000).contains(&kind)
        || is_parameterized_replaceable(kind)
}

/// Whether the coordinate of this kind includes the `d` tag identifier.
pub fn is_parameterized_replaceable(kind: u32) -> bool {
    (30_000..40_000).contains(&kind)
}

/// A tag: a short array of strings where the first element names the tag.
///
/// `["e", "<event id>"]`, `["a", "30023:<pubkey>:slug"]`, `["d", "slug"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Build a tag from its parts.
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// Tag name (first element).
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Tag value (second element).
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// An immutable, content-addressed event.
///
/// Two events with the same `id` are the same event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Hex SHA-256 of the canonical serialization.
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Unix timestamp in seconds.
    pub created_at: u64,
    /// Kind number.
    pub kind: u32,
    /// Ordered tags.
    pub tags: Vec<Tag>,
    /// Content body.
    pub content: String,
    /// Signature over `id`. Not verified by this crate.
    pub sig: String,
}

impl Event {
    /// Build an event and fill in its content-derived id. The signature is
    /// left empty.
    pub fn unsigned(
        pubkey: impl Into<String>,
        kind: u32,
        created_at: u64,
        tags: Vec<Tag>,
        content: impl Into<String>,
    ) -> Self {
        let mut event = Self {
            id: String::new(),
            pubkey: pubkey.into(),
            created_at,
            kind,
            tags,
            content: content.into(),
            sig: String::new(),
        };
        event.id = event.compute_id();
        event
    }

    /// Compute the id from `[0, pubkey, created_at, kind, tags, content]`.
    pub fn compute_id(&self) -> String {
        let canonical = serde_json::Value::Array(vec![
            serde_json::Value::from(0),
            serde_json::Value::from(self.pubkey.as_str()),
            serde_json::Value::from(self.created_at),
            serde_json::Value::from(self.kind),
            serde_json::Value::Array(
                self.tags
                    .iter()
                    .map(|t| {
                        serde_json::Value::Array(
                            t.0.iter().map(|s| serde_json::Value::from(s.as_str())).collect(),
                        )
                    })
                    .collect(),
            ),
            serde_json::Value::from(self.content.as_str()),
        ]);
        let digest = Sha256::digest(canonical.to_string().as_bytes());
        hex::encode(digest)
    }

    /// Check that `id` matches the content.
    pub fn has_valid_id(&self) -> bool {
        self.id == self.compute_id()
    }

    /// Values of every tag with the given name, in order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.name() == Some(name))
            .filter_map(Tag::value)
    }

    /// Value of the first tag with the given name.
    pub fn first_tag_value<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.tag_values(name).next()
    }

    /// Whether this kind is replaceable.
    pub fn is_replaceable(&self) -> bool {
        is_replaceable(self.kind)
    }

    /// Whether this event is a deletion request.
    pub fn is_deletion(&self) -> bool {
        self.kind == kind::DELETION
    }

    /// Replaceable slot this event occupies, if its kind is replaceable.
    pub fn coordinate(&self) -> Option<Coordinate> {
        if !self.is_replaceable() {
            return None;
        }
        let identifier = is_parameterized_replaceable(self.kind)
            .then(|| self.first_tag_value("d").unwrap_or_default().to_string());
        Some(Coordinate {
            kind: self.kind,
            pubkey: self.pubkey.clone(),
            identifier,
        })
    }

    /// Ordering key: newer wins, ties go to the larger id.
    pub fn sort_key(&self) -> (u64, &str) {
        (self.created_at, self.id.as_str())
    }
}

/// The `(kind, pubkey, identifier)` slot of a replaceable event.
///
/// Written on the wire as `kind:pubkey` or `kind:pubkey:identifier`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Coordinate {
    /// Event kind.
    pub kind: u32,
    /// Author public key.
    pub pubkey: String,
    /// `d` tag value, only for parameterized replaceable kinds.
    pub identifier: Option<String>,
}

impl Coordinate {
    /// Build a coordinate, dropping the identifier for kinds that do not use one.
    pub fn new(kind: u32, pubkey: impl Into<String>, identifier: Option<String>) -> Self {
        let identifier = if is_parameterized_replaceable(kind) {
            Some(identifier.unwrap_or_default())
        } else {
            None
        };
        Self {
            kind,
            pubkey: pubkey.into(),
            identifier,
        }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identifier {
            Some(d) => write!(f, "{}:{}:{}", self.kind, self.pubkey, d),
            None => write!(f, "{}:{}", self.kind, self.pubkey),
        }
    }
}

impl FromStr for Coordinate {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let kind = parts
            .next()
            .and_then(|k| k.parse::<u32>().ok())
            .ok_or_else(|| SyncError::InvalidCoordinate(s.to_string()))?;
        let pubkey = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| SyncError::InvalidCoordinate(s.to_string()))?;
        if !is_replaceable(kind) {
            return Err(SyncError::InvalidCoordinate(s.to_string()));
        }
        let identifier = parts.next().map(str::to_string);
        Ok(Coordinate::new(kind, pubkey, identifier))
    }
}
