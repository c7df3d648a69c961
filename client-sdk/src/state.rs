//! Client State Machine (C4): the four lifecycle states, the legal
//! transition table, and ordered delivery of transition events to
//! subscribers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{DriverError, Result};
use crate::options::LifecycleCallback;

/// The four states a [`crate::client::Client`] can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClientState::Disconnected => "DISCONNECTED",
            ClientState::Connecting => "CONNECTING",
            ClientState::Connected => "CONNECTED",
            ClientState::Disconnecting => "DISCONNECTING",
        };
        f.write_str(s)
    }
}

/// A record of one transition, delivered to every subscriber in
/// registration order.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TransitionEvent {
    pub from: ClientState,
    pub to: ClientState,
    /// Milliseconds since the state machine was created, so events remain
    /// orderable without depending on wall-clock time.
    pub elapsed_ms: u64,
    /// How long the machine spent in `from` before this transition.
    pub duration: Duration,
    /// Set when the transition was driven by a failure (e.g. a dead
    /// connection forcing `CONNECTED -> DISCONNECTED`).
    pub error: Option<String>,
    /// Extra context about why the transition happened, e.g.
    /// `{"reason": "health_check_failed"}` or `{"reason": "reconnected", "attempt": 3}`.
    pub metadata: Option<serde_json::Value>,
}

/// Returns `true` when `from -> to` is in the legal transition table.
fn is_legal(from: ClientState, to: ClientState) -> bool {
    use ClientState::*;
    matches!(
        (from, to),
        (Disconnected, Connecting)
            | (Connecting, Connected)
            | (Connecting, Disconnected)
            | (Connected, Disconnecting)
            | (Connected, Connecting)
            | (Disconnecting, Disconnected)
    )
}

struct Inner {
    current: ClientState,
    entered_current_at: Instant,
    last_event: Option<TransitionEvent>,
    in_transition: bool,
    subscribers: Vec<LifecycleCallback>,
}

/// Enforces totally-ordered, non-reentrant transitions (invariant I3) and
/// hands every accepted transition to subscribers in registration order.
/// The guarding mutex is never held across I/O — callers do their socket
/// work, then call [`StateMachine::transition`] with the outcome.
pub struct StateMachine {
    inner: Mutex<Inner>,
    created_at: Instant,
}

impl StateMachine {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            inner: Mutex::new(Inner {
                current: ClientState::Disconnected,
                entered_current_at: now,
                last_event: None,
                in_transition: false,
                subscribers: Vec::new(),
            }),
            created_at: now,
        }
    }

    pub async fn current(&self) -> ClientState {
        self.inner.lock().await.current
    }

    pub async fn last_transition(&self) -> Option<TransitionEvent> {
        self.inner.lock().await.last_event.clone()
    }

    /// Registers a callback invoked, in order, after every transition.
    pub async fn subscribe(&self, callback: LifecycleCallback) {
        self.inner.lock().await.subscribers.push(callback);
    }

    /// Attempts `to`, failing with `ILLEGAL_TRANSITION` if not permitted
    /// from the current state and `REENTRANT_TRANSITION` if a transition is
    /// already in flight on this state machine.
    pub async fn transition(
        &self,
        to: ClientState,
        error: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<TransitionEvent> {
        let (from, subscribers, time_in_from) = {
            let mut inner = self.inner.lock().await;
            if inner.in_transition {
                return Err(DriverError::ReentrantTransition);
            }
            if !is_legal(inner.current, to) {
                return Err(DriverError::IllegalTransition {
                    from: inner.current.to_string(),
                    to: to.to_string(),
                });
            }
            inner.in_transition = true;
            (inner.current, inner.subscribers.clone(), inner.entered_current_at.elapsed())
        };

        let event = TransitionEvent {
            from,
            to,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            duration: time_in_from,
            error,
            metadata,
        };

        for subscriber in &subscribers {
            subscriber(&event);
        }

        if event.error.is_some() {
            warn!(from = %from, to = %to, error = ?event.error, "state transition completed with error");
        } else {
            info!(from = %from, to = %to, "state transition");
        }

        let mut inner = self.inner.lock().await;
        inner.current = to;
        inner.entered_current_at = Instant::now();
        inner.in_transition = false;
        inner.last_event = Some(event.clone());
        Ok(event)
    }

    /// Fails every I/O-shaped operation with `NOT_CONNECTED` unless the
    /// machine is `CONNECTED` or `CONNECTING` (invariant I1).
    pub async fn require_io_allowed(&self) -> Result<()> {
        let current = self.inner.lock().await.current;
        match current {
            ClientState::Connected | ClientState::Connecting => Ok(()),
            _ => Err(DriverError::NotConnected {
                state: current.to_string(),
            }),
        }
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn noop_callback() -> LifecycleCallback {
    Arc::new(|_event: &TransitionEvent| {})
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn legal_path_connect_then_disconnect_succeeds() {
        let sm = StateMachine::new();
        sm.transition(ClientState::Connecting, None, None).await.unwrap();
        sm.transition(ClientState::Connected, None, None).await.unwrap();
        sm.transition(ClientState::Disconnecting, None, None).await.unwrap();
        sm.transition(ClientState::Disconnected, None, None).await.unwrap();
        assert_eq!(sm.current().await, ClientState::Disconnected);
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let sm = StateMachine::new();
        let err = sm.transition(ClientState::Connected, None, None).await.unwrap_err();
        assert!(matches!(err, DriverError::IllegalTransition { .. }));
        assert_eq!(sm.current().await, ClientState::Disconnected);
    }

    #[tokio::test]
    async fn require_io_allowed_rejects_when_disconnected() {
        let sm = StateMachine::new();
        assert!(sm.require_io_allowed().await.is_err());
        sm.transition(ClientState::Connecting, None, None).await.unwrap();
        assert!(sm.require_io_allowed().await.is_ok());
    }

    #[tokio::test]
    async fn subscribers_are_invoked_in_registration_order() {
        let sm = StateMachine::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = Arc::clone(&order);
        sm.subscribe(Arc::new(move |_| {
            o1.try_lock().unwrap().push(1);
        }))
        .await;
        let o2 = Arc::clone(&order);
        sm.subscribe(Arc::new(move |_| {
            o2.try_lock().unwrap().push(2);
        }))
        .await;

        sm.transition(ClientState::Connecting, None, None).await.unwrap();
        assert_eq!(*order.lock().await, vec![1, 2]);
    }

    #[tokio::test]
    async fn transition_records_an_error_message() {
        let sm = StateMachine::new();
        sm.transition(ClientState::Connecting, None, None).await.unwrap();
        let event = sm
            .transition(ClientState::Disconnected, Some("dial failed".to_string()), None)
            .await
            .unwrap();
        assert_eq!(event.error.as_deref(), Some("dial failed"));
    }

    #[tokio::test]
    async fn transition_carries_metadata_through_to_the_event() {
        let sm = StateMachine::new();
        let event = sm
            .transition(ClientState::Connecting, None, Some(serde_json::json!({"reason": "health_check_failed"})))
            .await
            .unwrap();
        assert_eq!(event.metadata, Some(serde_json::json!({"reason": "health_check_failed"})));
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let cb: LifecycleCallback = Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        cb(&TransitionEvent {
            from: ClientState::Disconnected,
            to: ClientState::Connecting,
            elapsed_ms: 0,
            duration: Duration::ZERO,
            error: None,
            metadata: None,
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
