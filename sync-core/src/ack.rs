//! Publish acknowledgement tracking.
//!
//! An [`AckTracker`] is created per published event with the set of relays
//! it was sent to. Relays move from pending to answered as their `OK`
//! results arrive; whatever is still pending when the publish deadline
//! passes is answered with a synthetic timeout result. Each relay is
//! answered exactly once.

use std::collections::BTreeSet;

/// Message carried by results synthesized at the publish deadline.
pub const TIMEOUT_MESSAGE: &str = "Timeout";

/// Result kind of an `OK` answer to a published event.
pub const OK_RESULT: &str = "OK";

/// A relay's answer to a published event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Result kind, [`OK_RESULT`] for publish answers.
    pub kind: String,
    /// Normalized relay URL.
    pub relay: String,
    /// Id of the event this answers.
    pub event_id: String,
    /// Whether the relay accepted the event.
    pub status: bool,
    /// Relay-provided reason, or `"Timeout"`.
    pub message: String,
}

impl CommandResult {
    /// An `OK` answer from `relay`.
    pub fn ok(
        relay: impl Into<String>,
        event_id: impl Into<String>,
        status: bool,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind: OK_RESULT.to_string(),
            relay: relay.into(),
            event_id: event_id.into(),
            status,
            message: message.into(),
        }
    }

    /// The result recorded for a relay that never answered. It has the
    /// same kind as the answer it stands in for.
    pub fn timeout(relay: impl Into<String>, event_id: impl Into<String>) -> Self {
        Self::ok(relay, event_id, false, TIMEOUT_MESSAGE)
    }

    /// Whether this result was synthesized at the deadline.
    pub fn is_timeout(&self) -> bool {
        !self.status && self.message == TIMEOUT_MESSAGE
    }
}

/// What `ack` did with a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Wrong event, unknown relay or a repeat answer.
    Ignored,
    /// Recorded; other relays are still pending.
    Recorded,
    /// Recorded; this was the last pending relay.
    Complete,
}

/// Pending/answered bookkeeping for one published event.
#[derive(Debug, Clone)]
pub struct AckTracker {
    event_id: String,
    pending: BTreeSet<String>,
    results: Vec<CommandResult>,
}

impl AckTracker {
    /// Track `event_id` across `relays`. Duplicate relays collapse.
    pub fn new<I, S>(event_id: impl Into<String>, relays: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            event_id: event_id.into(),
            pending: relays.into_iter().map(Into::into).collect(),
            results: Vec::new(),
        }
    }

    /// Record a relay's answer.
    pub fn ack(&mut self, result: CommandResult) -> AckOutcome {
        if result.event_id != self.event_id || !self.pending.remove(&result.relay) {
            return AckOutcome::Ignored;
        }
        self.results.push(result);
        if self.pending.is_empty() {
            AckOutcome::Complete
        } else {
            AckOutcome::Recorded
        }
    }

    /// Answer every pending relay with a timeout result and return those
    /// results in relay order. Afterwards nothing is pending.
    pub fn expire(&mut self) -> Vec<CommandResult> {
        let expired: Vec<CommandResult> = std::mem::take(&mut self.pending)
            .into_iter()
            .map(|relay| CommandResult::timeout(relay, self.event_id.clone()))
            .collect();
        self.results.extend(expired.iter().cloned());
        expired
    }

    /// Id of the tracked event.
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// Whether `relay` has not answered yet.
    pub fn is_pending(&self, relay: &str) -> bool {
        self.pending.contains(relay)
    }

    /// Relays that have not answered, in sorted order.
    pub fn pending_relays(&self) -> Vec<String> {
        self.pending.iter().cloned().collect()
    }

    /// Number of relays still pending.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Every answer so far, in arrival order.
    pub fn results(&self) -> &[CommandResult] {
        &self.results
    }

    /// Whether every relay has answered.
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }
}
