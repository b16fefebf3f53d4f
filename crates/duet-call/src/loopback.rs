//! In-process peer backend.
//!
//! Links created from the same [`LoopbackNetwork`] find each other through
//! a token embedded in the descriptions they exchange. When the initiator
//! applies an answer that carries the joiner's token, both links behave as
//! if the direct connection came up. The control stream then relays text
//! frames straight into the other side's event queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use duet_proto::{CandidateInit, SdpKind, SessionDescription};
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::PeerError;
use crate::media::MediaTrack;
use crate::peer::{
    ControlStream, EventSink, LinkState, PeerEvent, PeerFactory, PeerLink, RemoteTrackInfo, Role,
    CONTROL_CHANNEL_LABEL,
};

const TOKEN_ATTR: &str = "a=duet-loopback:";
const TRACK_ATTR: &str = "a=duet-track:";

#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    links: Arc<Mutex<HashMap<String, Arc<LinkShared>>>>,
    next_port: Arc<AtomicU16>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> LoopbackFactory {
        LoopbackFactory {
            network: self.clone(),
        }
    }

    /// Links created and not yet closed.
    pub fn open_links(&self) -> usize {
        self.links.lock().len()
    }

    /// Reports a transport failure on every open link.
    pub fn fail_links(&self) {
        for link in self.links.lock().values() {
            link.sink.emit(PeerEvent::LinkState(LinkState::Failed));
        }
    }

    fn lookup(&self, token: &str) -> Option<Arc<LinkShared>> {
        self.links.lock().get(token).cloned()
    }

    fn port(&self) -> u16 {
        40000 + self.next_port.fetch_add(1, Ordering::Relaxed) % 20000
    }
}

pub struct LoopbackFactory {
    network: LoopbackNetwork,
}

#[async_trait]
impl PeerFactory for LoopbackFactory {
    async fn create(&self, role: Role, sink: EventSink) -> Result<Arc<dyn PeerLink>, PeerError> {
        let shared = Arc::new(LinkShared {
            token: Uuid::new_v4().simple().to_string(),
            role,
            sink,
            tracks: Mutex::new(Vec::new()),
            remote_token: Mutex::new(None),
            remote_candidates: Mutex::new(Vec::new()),
            control: Mutex::new(None),
            peer: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        if role == Role::Initiator {
            let control = Arc::new(LoopbackControl::new());
            *shared.control.lock() = Some(control.clone());
            shared.sink.emit(PeerEvent::ControlAvailable(control));
        }
        self.network
            .links
            .lock()
            .insert(shared.token.clone(), shared.clone());
        debug!(token = %shared.token, %role, "loopback link created");
        Ok(Arc::new(LoopbackLink {
            shared,
            network: self.network.clone(),
        }))
    }
}

struct LinkShared {
    token: String,
    role: Role,
    sink: EventSink,
    tracks: Mutex<Vec<Arc<MediaTrack>>>,
    remote_token: Mutex<Option<String>>,
    remote_candidates: Mutex<Vec<CandidateInit>>,
    control: Mutex<Option<Arc<LoopbackControl>>>,
    peer: Mutex<Option<Arc<LinkShared>>>,
    closed: AtomicBool,
}

impl LinkShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn describe(&self, kind: SdpKind) -> SessionDescription {
        let mut sdp = format!(
            "v=0\r\no=duet-loopback 0 0 IN IP4 127.0.0.1\r\ns=-\r\n{}{}\r\n",
            TOKEN_ATTR, self.token
        );
        for track in self.tracks.lock().iter() {
            sdp.push_str(&format!(
                "{}{} {} {}\r\n",
                TRACK_ATTR,
                track.kind(),
                track.id(),
                track.stream_id()
            ));
        }
        SessionDescription { kind, sdp }
    }

    fn announce_tracks_to(&self, other: &LinkShared) {
        for track in self.tracks.lock().iter() {
            other.sink.emit(PeerEvent::RemoteTrack(RemoteTrackInfo {
                track_id: track.id().to_string(),
                stream_id: track.stream_id().to_string(),
                kind: track.kind(),
            }));
        }
    }
}

fn token_of(description: &SessionDescription) -> Option<&str> {
    description
        .sdp
        .lines()
        .find_map(|line| line.trim().strip_prefix(TOKEN_ATTR))
}

pub struct LoopbackLink {
    shared: Arc<LinkShared>,
    network: LoopbackNetwork,
}

impl LoopbackLink {
    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.shared.is_closed() {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }

    fn emit_local_candidate(&self) {
        let candidate = CandidateInit {
            candidate: format!(
                "candidate:1 1 udp 2122260223 127.0.0.1 {} typ host",
                self.network.port()
            ),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        self.shared.sink.emit(PeerEvent::LocalCandidate(candidate));
    }

    /// Brings up the pair once the initiator has the joiner's answer.
    fn connect(&self, joiner: Arc<LinkShared>) -> Result<(), PeerError> {
        let initiator = &self.shared;
        if joiner.is_closed() {
            return Err(PeerError::Setup("remote link is closed".into()));
        }
        if joiner.remote_token.lock().as_deref() != Some(initiator.token.as_str()) {
            return Err(PeerError::Setup("answer does not match our offer".into()));
        }

        let initiator_end = initiator
            .control
            .lock()
            .clone()
            .ok_or_else(|| PeerError::Setup("initiator has no control stream".into()))?;
        let joiner_end = Arc::new(LoopbackControl::new());
        initiator_end.bind(joiner.sink.clone(), &joiner_end);
        joiner_end.bind(initiator.sink.clone(), &initiator_end);
        *joiner.control.lock() = Some(joiner_end.clone());
        *initiator.peer.lock() = Some(joiner.clone());
        *joiner.peer.lock() = Some(initiator.clone());

        joiner.sink.emit(PeerEvent::ControlAvailable(joiner_end.clone()));
        for (side, other) in [(initiator, &joiner), (&joiner, initiator)] {
            side.sink.emit(PeerEvent::LinkState(LinkState::Connecting));
            side.sink.emit(PeerEvent::LinkState(LinkState::Connected));
            other.announce_tracks_to(side);
        }
        initiator_end.open.store(true, Ordering::SeqCst);
        joiner_end.open.store(true, Ordering::SeqCst);
        initiator.sink.emit(PeerEvent::ControlOpen);
        joiner.sink.emit(PeerEvent::ControlOpen);
        debug!(initiator = %initiator.token, joiner = %joiner.token, "loopback pair connected");
        Ok(())
    }

    pub fn remote_candidates(&self) -> Vec<CandidateInit> {
        self.shared.remote_candidates.lock().clone()
    }
}

#[async_trait]
impl PeerLink for LoopbackLink {
    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.shared.tracks.lock().push(track);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        if self.shared.role != Role::Initiator {
            return Err(PeerError::Setup("only the initiator creates offers".into()));
        }
        let offer = self.shared.describe(SdpKind::Offer);
        self.emit_local_candidate();
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        if self.shared.remote_token.lock().is_none() {
            return Err(PeerError::Setup("no remote offer applied".into()));
        }
        let answer = self.shared.describe(SdpKind::Answer);
        self.emit_local_candidate();
        Ok(answer)
    }

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.ensure_open()?;
        let token = token_of(&description)
            .ok_or_else(|| PeerError::Setup("description has no loopback token".into()))?
            .to_string();
        match (self.shared.role, description.kind) {
            (Role::Joiner, SdpKind::Offer) => {
                *self.shared.remote_token.lock() = Some(token);
                Ok(())
            }
            (Role::Initiator, SdpKind::Answer) => {
                let joiner = self
                    .network
                    .lookup(&token)
                    .ok_or_else(|| PeerError::Setup("answering link is gone".into()))?;
                *self.shared.remote_token.lock() = Some(token);
                self.connect(joiner)
            }
            (role, kind) => Err(PeerError::Setup(format!(
                "{} cannot apply a remote {}",
                role, kind
            ))),
        }
    }

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.shared.remote_candidates.lock().push(candidate);
        Ok(())
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.network.links.lock().remove(&self.shared.token);
        let control = self.shared.control.lock().take();
        if let Some(control) = control {
            control.close().await;
        }
        let peer = self.shared.peer.lock().take();
        if let Some(peer) = peer {
            peer.peer.lock().take();
            if !peer.is_closed() {
                peer.sink.emit(PeerEvent::LinkState(LinkState::Disconnected));
            }
        }
        debug!(token = %self.shared.token, "loopback link closed");
    }
}

struct ControlBinding {
    remote_sink: EventSink,
    remote_end: std::sync::Weak<LoopbackControl>,
}

pub struct LoopbackControl {
    open: AtomicBool,
    binding: Mutex<Option<ControlBinding>>,
}

impl LoopbackControl {
    fn new() -> Self {
        Self {
            open: AtomicBool::new(false),
            binding: Mutex::new(None),
        }
    }

    fn bind(&self, remote_sink: EventSink, remote_end: &Arc<LoopbackControl>) {
        *self.binding.lock() = Some(ControlBinding {
            remote_sink,
            remote_end: Arc::downgrade(remote_end),
        });
    }
}

#[async_trait]
impl ControlStream for LoopbackControl {
    fn label(&self) -> &str {
        CONTROL_CHANNEL_LABEL
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: String) -> Result<(), PeerError> {
        if !self.is_open() {
            return Err(PeerError::Closed);
        }
        let binding = self.binding.lock();
        match binding.as_ref() {
            Some(binding) if binding.remote_sink.emit(PeerEvent::ControlMessage(text)) => Ok(()),
            _ => Err(PeerError::Closed),
        }
    }

    async fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let binding = self.binding.lock().take();
        if let Some(binding) = binding {
            if let Some(remote) = binding.remote_end.upgrade() {
                remote.open.store(false, Ordering::SeqCst);
            }
            binding.remote_sink.emit(PeerEvent::ControlClosed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackKind;
    use crate::session::SessionEvent;
    use tokio::sync::mpsc;

    fn sink(epoch: u64) -> (EventSink, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink::new(epoch, tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<PeerEvent> {
        let mut events = Vec::new();
        while let Ok(SessionEvent::Peer { event, .. }) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn has_state(events: &[PeerEvent], wanted: LinkState) -> bool {
        events
            .iter()
            .any(|event| matches!(event, PeerEvent::LinkState(state) if *state == wanted))
    }

    #[test_timeout::tokio_timeout_test]
    async fn offer_answer_connects_both_sides() {
        let network = LoopbackNetwork::new();
        let factory = network.factory();
        let (a_sink, mut a_rx) = sink(1);
        let (b_sink, mut b_rx) = sink(7);

        let a = factory.create(Role::Initiator, a_sink).await.unwrap();
        let b = factory.create(Role::Joiner, b_sink).await.unwrap();
        a.add_track(Arc::new(MediaTrack::new(TrackKind::Audio, "a-stream")))
            .await
            .unwrap();

        let offer = a.create_offer().await.unwrap();
        b.apply_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        a.apply_remote_description(answer).await.unwrap();

        let a_events = drain(&mut a_rx);
        let b_events = drain(&mut b_rx);
        assert!(matches!(a_events[0], PeerEvent::ControlAvailable(_)));
        assert!(has_state(&a_events, LinkState::Connected));
        assert!(has_state(&b_events, LinkState::Connected));
        assert!(b_events.iter().any(|e| matches!(
            e,
            PeerEvent::RemoteTrack(info) if info.kind == TrackKind::Audio && info.stream_id == "a-stream"
        )));
        assert!(matches!(b_events.last(), Some(PeerEvent::ControlOpen)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn control_frames_cross_and_close_disconnects_peer() {
        let network = LoopbackNetwork::new();
        let factory = network.factory();
        let (a_sink, mut a_rx) = sink(1);
        let (b_sink, mut b_rx) = sink(1);
        let a = factory.create(Role::Initiator, a_sink).await.unwrap();
        let b = factory.create(Role::Joiner, b_sink).await.unwrap();
        let offer = a.create_offer().await.unwrap();
        b.apply_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        a.apply_remote_description(answer).await.unwrap();

        let control = match drain(&mut a_rx).into_iter().next() {
            Some(PeerEvent::ControlAvailable(stream)) => stream,
            other => panic!("expected control stream, got {:?}", other),
        };
        drain(&mut b_rx);
        control.send_text("{\"type\":\"callEnded\"}".into()).await.unwrap();
        a.close().await;

        let b_events = drain(&mut b_rx);
        assert!(matches!(&b_events[0], PeerEvent::ControlMessage(text) if text.contains("callEnded")));
        assert!(matches!(b_events[1], PeerEvent::ControlClosed));
        assert!(has_state(&b_events, LinkState::Disconnected));
        assert_eq!(network.open_links(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn answer_from_unrelated_offer_is_rejected() {
        let network = LoopbackNetwork::new();
        let factory = network.factory();
        let (a_sink, _a_rx) = sink(1);
        let (other_sink, _other_rx) = sink(1);
        let (b_sink, _b_rx) = sink(1);
        let a = factory.create(Role::Initiator, a_sink).await.unwrap();
        let other = factory.create(Role::Initiator, other_sink).await.unwrap();
        let b = factory.create(Role::Joiner, b_sink).await.unwrap();

        let foreign_offer = other.create_offer().await.unwrap();
        b.apply_remote_description(foreign_offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        assert!(a.apply_remote_description(answer).await.is_err());
    }
}
