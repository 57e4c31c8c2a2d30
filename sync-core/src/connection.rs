//! Relay connection state machine.
//!
//! Pure, side-effect-free: the machine takes an event and returns the new
//! state plus a list of actions. The relay task in `nostr-sync-client`
//! performs the actual socket work and feeds results back in.

use std::time::Duration;

/// Per-relay connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// No socket and no pending attempt.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Socket open.
    Connected,
    /// Socket lost or attempt failed; waiting to retry.
    Reconnecting {
        /// Number of failed attempts so far.
        attempt: u32,
    },
}

/// Limits for automatic reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Failed attempts tolerated before giving up. Zero disables retries.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

impl RelayState {
    /// Starting state.
    pub fn new() -> Self {
        Self::Disconnected
    }

    /// Process an event and return the new state plus actions to execute.
    pub fn on_event(self, event: RelayEvent, policy: &ReconnectPolicy) -> (Self, Vec<Action>) {
        match (self, event) {
            (Self::Disconnected, RelayEvent::ConnectRequested) => {
                (Self::Connecting, vec![Action::Connect])
            }

            (Self::Connecting, RelayEvent::ConnectSucceeded)
            | (Self::Reconnecting { .. }, RelayEvent::ConnectSucceeded) => (
                Self::Connected,
                vec![
                    Action::Resubscribe,
                    Action::EmitEvent(ConnectionEvent::Connected),
                ],
            ),
            (Self::Connecting, RelayEvent::ConnectFailed { error }) => {
                let emit = Action::EmitEvent(ConnectionEvent::ConnectionFailed {
                    error: error.clone(),
                });
                retry_or_give_up(0, error, emit, policy)
            }
            (Self::Connecting, RelayEvent::DisconnectRequested) => {
                (Self::Disconnected, vec![Action::Disconnect])
            }

            (Self::Connected, RelayEvent::Disconnected { reason }) => {
                let emit = Action::EmitEvent(ConnectionEvent::Disconnected {
                    reason: reason.clone(),
                });
                retry_or_give_up(0, reason, emit, policy)
            }
            (Self::Connected, RelayEvent::DisconnectRequested) => (
                Self::Disconnected,
                vec![
                    Action::Disconnect,
                    Action::EmitEvent(ConnectionEvent::Disconnected {
                        reason: "requested".into(),
                    }),
                ],
            ),

            (Self::Reconnecting { attempt }, RelayEvent::ReconnectTimer) => {
                (Self::Reconnecting { attempt }, vec![Action::Connect])
            }
            (Self::Reconnecting { attempt }, RelayEvent::ConnectFailed { error }) => {
                let emit = Action::EmitEvent(ConnectionEvent::ReconnectFailed {
                    attempt,
                    error: error.clone(),
                });
                retry_or_give_up(attempt, error, emit, policy)
            }
            (Self::Reconnecting { .. }, RelayEvent::DisconnectRequested) => {
                (Self::Disconnected, vec![Action::CancelReconnect])
            }

            // Anything else leaves the state alone.
            (state, _) => (state, vec![]),
        }
    }

    /// Whether the socket is open.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Whether an attempt is in progress or scheduled.
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting { .. })
    }
}

fn retry_or_give_up(
    failed: u32,
    error: String,
    emit: Action,
    policy: &ReconnectPolicy,
) -> (RelayState, Vec<Action>) {
    if failed >= policy.max_attempts {
        return (
            RelayState::Disconnected,
            vec![
                emit,
                Action::GiveUp {
                    attempts: failed,
                    error,
                },
            ],
        );
    }
    let attempt = failed.saturating_add(1);
    (
        RelayState::Reconnecting { attempt },
        vec![
            emit,
            Action::StartReconnectTimer {
                delay: calculate_backoff(attempt),
            },
        ],
    )
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Something needs the socket.
    ConnectRequested,
    /// Socket opened.
    ConnectSucceeded,
    /// Socket failed to open.
    ConnectFailed {
        /// Transport error text.
        error: String,
    },
    /// Open socket closed or errored.
    Disconnected {
        /// Reason for the loss.
        reason: String,
    },
    /// Caller asked to close.
    DisconnectRequested,
    /// Backoff timer fired.
    ReconnectTimer,
}

/// Work the relay task performs on behalf of the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open the socket.
    Connect,
    /// Close the socket.
    Disconnect,
    /// Replay every open subscription on the fresh socket.
    Resubscribe,
    /// Wait, then feed `ReconnectTimer`.
    StartReconnectTimer {
        /// Delay before the next attempt.
        delay: Duration,
    },
    /// Drop the pending timer.
    CancelReconnect,
    /// Stop retrying; queued work fails with `error`.
    GiveUp {
        /// Failed reconnection attempts before giving up.
        attempts: u32,
        /// Last transport error.
        error: String,
    },
    /// Report to observers.
    EmitEvent(ConnectionEvent),
}

/// Connection notifications surfaced to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Socket open.
    Connected,
    /// First attempt failed.
    ConnectionFailed {
        /// Transport error text.
        error: String,
    },
    /// Open socket lost.
    Disconnected {
        /// Reason for the loss.
        reason: String,
    },
    /// A retry failed.
    ReconnectFailed {
        /// Which retry this was.
        attempt: u32,
        /// Transport error text.
        error: String,
    },
}

/// Reconnection delay: `min(30s, 2^attempt s)` plus 0-5000ms of jitter so a
/// relay restart does not see every client return at once.
pub fn calculate_backoff(attempt: u32) -> Duration {
    let base_secs = 2u64.pow(attempt.min(5)).min(30);
    Duration::from_secs(base_secs) + Duration::from_millis(random_jitter_ms())
}

fn random_jitter_ms() -> u64 {
    let mut bytes = [0u8; 8];
    // No entropy means no jitter, not a failed reconnect.
    match getrandom::getrandom(&mut bytes) {
        Ok(()) => u64::from_le_bytes(bytes) % 5001,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy::default()
    }

    #[test]
    fn starts_disconnected() {
        assert_eq!(RelayState::new(), RelayState::Disconnected);
    }

    #[test]
    fn connect_request_transitions_to_connecting() {
        let (state, actions) = RelayState::Disconnected.on_event(RelayEvent::ConnectRequested, &policy());

        assert_eq!(state, RelayState::Connecting);
        assert_eq!(actions, vec![Action::Connect]);
    }

    #[test]
    fn connect_success_resubscribes() {
        let (state, actions) = RelayState::Connecting.on_event(RelayEvent::ConnectSucceeded, &policy());

        assert!(state.is_connected());
        assert!(actions.contains(&Action::Resubscribe));
        assert!(actions.contains(&Action::EmitEvent(ConnectionEvent::Connected)));
    }

    #[test]
    fn connect_failure_triggers_reconnect() {
        let (state, actions) = RelayState::Connecting.on_event(
            RelayEvent::ConnectFailed {
                error: "refused".into(),
            },
            &policy(),
        );

        assert_eq!(state, RelayState::Reconnecting { attempt: 1 });
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::StartReconnectTimer { .. })));
    }

    #[test]
    fn reconnect_timer_keeps_attempt_count() {
        let (state, actions) =
            RelayState::Reconnecting { attempt: 2 }.on_event(RelayEvent::ReconnectTimer, &policy());

        assert_eq!(state, RelayState::Reconnecting { attempt: 2 });
        assert_eq!(actions, vec![Action::Connect]);
    }

    #[test]
    fn reconnect_failure_increments_attempt() {
        let (state, actions) = RelayState::Reconnecting { attempt: 2 }.on_event(
            RelayEvent::ConnectFailed {
                error: "timeout".into(),
            },
            &policy(),
        );

        assert_eq!(state, RelayState::Reconnecting { attempt: 3 });
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::EmitEvent(ConnectionEvent::ReconnectFailed { attempt: 2, .. })
        )));
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let policy = ReconnectPolicy { max_attempts: 2 };
        let (state, actions) = RelayState::Reconnecting { attempt: 2 }.on_event(
            RelayEvent::ConnectFailed {
                error: "timeout".into(),
            },
            &policy,
        );

        assert_eq!(state, RelayState::Disconnected);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::GiveUp { attempts: 2, error } if error == "timeout")));

        // A later request starts over.
        let (state, _) = state.on_event(RelayEvent::ConnectRequested, &policy);
        assert_eq!(state, RelayState::Connecting);
    }

    #[test]
    fn zero_attempts_gives_up_immediately() {
        let policy = ReconnectPolicy { max_attempts: 0 };
        let (state, actions) = RelayState::Connecting.on_event(
            RelayEvent::ConnectFailed {
                error: "refused".into(),
            },
            &policy,
        );

        assert_eq!(state, RelayState::Disconnected);
        assert!(actions.iter().any(|a| matches!(a, Action::GiveUp { .. })));
    }

    #[test]
    fn full_reconnection_flow() {
        let p = policy();
        let (state, _) = RelayState::Connected.on_event(
            RelayEvent::Disconnected {
                reason: "reset".into(),
            },
            &p,
        );
        assert_eq!(state, RelayState::Reconnecting { attempt: 1 });

        let (state, _) = state.on_event(RelayEvent::ReconnectTimer, &p);
        let (state, actions) = state.on_event(RelayEvent::ConnectSucceeded, &p);
        assert!(state.is_connected());
        assert!(actions.contains(&Action::Resubscribe));
    }

    #[test]
    fn disconnect_request_from_connected() {
        let (state, actions) = RelayState::Connected.on_event(RelayEvent::DisconnectRequested, &policy());

        assert_eq!(state, RelayState::Disconnected);
        assert!(actions.contains(&Action::Disconnect));
    }

    #[test]
    fn disconnect_request_from_reconnecting_cancels() {
        let (state, actions) =
            RelayState::Reconnecting { attempt: 2 }.on_event(RelayEvent::DisconnectRequested, &policy());

        assert_eq!(state, RelayState::Disconnected);
        assert_eq!(actions, vec![Action::CancelReconnect]);
    }

    #[test]
    fn unexpected_events_are_ignored() {
        let (state, actions) = RelayState::Disconnected.on_event(RelayEvent::ReconnectTimer, &policy());
        assert_eq!(state, RelayState::Disconnected);
        assert!(actions.is_empty());

        let (state, actions) = RelayState::Connected.on_event(RelayEvent::ConnectRequested, &policy());
        assert_eq!(state, RelayState::Connected);
        assert!(actions.is_empty());
    }

    #[test]
    fn state_helpers() {
        assert!(!RelayState::Disconnected.is_connected());
        assert!(RelayState::Connecting.is_connecting());
        assert!(RelayState::Reconnecting { attempt: 1 }.is_connecting());
        assert!(!RelayState::Connected.is_connecting());
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert!(calculate_backoff(1) >= Duration::from_secs(2));
        assert!(calculate_backoff(3) >= Duration::from_secs(8));
        assert!(calculate_backoff(10) <= Duration::from_secs(35));
    }

    #[test]
    fn backoff_jitter_creates_variance() {
        let delays: Vec<Duration> = (0..20).map(|_| calculate_backoff(3)).collect();
        let min = delays.iter().min().unwrap();
        let max = delays.iter().max().unwrap();
        assert!(
            max.as_millis() - min.as_millis() >= 100,
            "expected jitter variance, got min={:?} max={:?}",
            min,
            max
        );
    }
}
