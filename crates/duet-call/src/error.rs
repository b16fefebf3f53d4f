use thiserror::Error;

use crate::state::ConnectionState;

/// Failures talking to the signaling relay.
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    #[error("relay rejected request: {0}")]
    Invalid(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("relay backend error ({status}): {message}")]
    Backend { status: u16, message: String },
    #[error("relay unreachable: {0}")]
    Transport(String),
}

/// Failures inside a peer connection backend.
#[derive(Debug, Clone, Error)]
pub enum PeerError {
    #[error("peer setup failed: {0}")]
    Setup(String),
    #[error("peer link is closed")]
    Closed,
}

#[derive(Debug, Clone, Error)]
pub enum MediaError {
    #[error("media unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error("{0}")]
    Validation(String),
    #[error("a call is already in progress ({0})")]
    Busy(ConnectionState),
    #[error("session not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("{0}")]
    Media(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("no answer after {attempts} attempts")]
    NegotiationTimeout { attempts: u32 },
    #[error("connection lost")]
    LinkFailure,
    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
    #[error("call session has shut down")]
    SessionClosed,
}

impl From<PeerError> for CallError {
    fn from(err: PeerError) -> Self {
        CallError::Negotiation(err.to_string())
    }
}

pub const MSG_NO_ROOM: &str = "Room ID not specified";
pub const MSG_CREATE_FAILED: &str = "Error creating call";
pub const MSG_JOIN_FAILED: &str = "Error joining call";
pub const MSG_CONNECTION_LOST: &str = "Connection lost";
pub const MSG_TIMEOUT: &str = "Timeout. Second user did not connect.";
pub const MSG_NO_MICROPHONE: &str = "Could not access microphone";
pub const MSG_AUDIO_ONLY: &str = "Camera unavailable. Audio only.";

impl CallError {
    /// Text shown to the user when this error ends a call attempt. Errors
    /// without their own wording fall back to the flow's generic message.
    pub fn user_message(&self, fallback: &str) -> String {
        match self {
            CallError::Validation(message) | CallError::Media(message) => message.clone(),
            CallError::NegotiationTimeout { .. } => MSG_TIMEOUT.to_string(),
            CallError::LinkFailure => MSG_CONNECTION_LOST.to_string(),
            _ => fallback.to_string(),
        }
    }
}
