use std::fmt;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::CallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Creating,
    Waiting,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Creating => "creating",
            ConnectionState::Waiting => "waiting",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }

    /// Whether `self -> to` is a legal step. Self-transitions are handled
    /// separately as no-ops.
    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Idle, Creating)
                | (Idle, Connecting)
                | (Creating, Waiting)
                | (Waiting, Connecting)
                | (Connecting, Connected)
                | (_, Idle)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owns the current [`ConnectionState`] and publishes every change to
/// watchers.
#[derive(Debug)]
pub struct StateMachine {
    tx: watch::Sender<ConnectionState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Idle);
        Self { tx }
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Moves to `to`. Returns `Ok(false)` when already there.
    pub fn transition(&self, to: ConnectionState) -> Result<bool, CallError> {
        let from = self.current();
        if from == to {
            return Ok(false);
        }
        if !from.can_transition_to(to) {
            warn!(%from, %to, "rejected state transition");
            return Err(CallError::InvalidTransition { from, to });
        }
        debug!(%from, %to, "state transition");
        self.tx.send_replace(to);
        Ok(true)
    }

    pub fn reset(&self) {
        let from = self.tx.send_replace(ConnectionState::Idle);
        if from != ConnectionState::Idle {
            debug!(%from, "state reset to idle");
        }
    }
}
