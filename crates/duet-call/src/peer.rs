//! The seam between a call session and whatever actually moves media.
//!
//! A backend turns its asynchronous callbacks into [`PeerEvent`]s pushed
//! through an [`EventSink`]. The sink stamps each event with the epoch the
//! link was created in, so a session can drop anything that arrives after
//! it tore that link down.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use duet_proto::{CandidateInit, SessionDescription};
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::PeerError;
use crate::media::{MediaTrack, TrackKind};
use crate::session::SessionEvent;

/// Label of the auxiliary stream carrying control messages.
pub const CONTROL_CHANNEL_LABEL: &str = "mediaState";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Publishes the offer and polls for the answer. Creates the control
    /// stream.
    Initiator,
    /// Fetches the offer and publishes the answer. Receives the control
    /// stream.
    Joiner,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Joiner => f.write_str("joiner"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackInfo {
    pub track_id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

pub enum PeerEvent {
    LocalCandidate(CandidateInit),
    LinkState(LinkState),
    RemoteTrack(RemoteTrackInfo),
    ControlAvailable(Arc<dyn ControlStream>),
    ControlOpen,
    ControlMessage(String),
    ControlClosed,
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(&candidate.candidate).finish()
            }
            PeerEvent::LinkState(state) => f.debug_tuple("LinkState").field(state).finish(),
            PeerEvent::RemoteTrack(info) => f.debug_tuple("RemoteTrack").field(info).finish(),
            PeerEvent::ControlAvailable(stream) => f
                .debug_tuple("ControlAvailable")
                .field(&stream.label())
                .finish(),
            PeerEvent::ControlOpen => f.write_str("ControlOpen"),
            PeerEvent::ControlMessage(text) => f.debug_tuple("ControlMessage").field(text).finish(),
            PeerEvent::ControlClosed => f.write_str("ControlClosed"),
        }
    }
}

/// Delivers backend callbacks into the owning session's event queue.
#[derive(Clone)]
pub struct EventSink {
    epoch: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub fn new(epoch: u64, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Queues `event`. Returns false once the session is gone.
    pub fn emit(&self, event: PeerEvent) -> bool {
        trace!(epoch = self.epoch, ?event, "peer event");
        self.tx
            .send(SessionEvent::Peer {
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }
}

/// Ordered text channel over the direct link.
#[async_trait]
pub trait ControlStream: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> Result<(), PeerError>;

    async fn close(&self);
}

/// One peer connection.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), PeerError>;

    /// Creates the offer and installs it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Creates the answer and installs it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn apply_remote_description(&self, description: SessionDescription)
        -> Result<(), PeerError>;

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), PeerError>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    /// Builds a link for `role`. An initiator's link announces its control
    /// stream through `sink` before this returns.
    async fn create(&self, role: Role, sink: EventSink) -> Result<Arc<dyn PeerLink>, PeerError>;
}
