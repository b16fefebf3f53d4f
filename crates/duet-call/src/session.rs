//! Call negotiation and lifecycle.
//!
//! A [`CallSession`] owns everything one call needs: the peer link, local
//! tracks, the control channel and the answer poll. It is driven from a
//! single task. Backend callbacks, timers and the poll all report back
//! through one event queue, and every queued event carries the epoch it
//! was scheduled in. Teardown advances the epoch, which turns anything
//! still in flight from the previous attempt into a no-op.

use std::sync::Arc;
use std::time::Duration;

use duet_proto::{
    session_id_from_reference, share_link, AnswerBundle, CandidateInit, ControlMessage, MediaState,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::CallConfig;
use crate::control::{decode_incoming, ControlChannel};
use crate::error::{
    CallError, RelayError, MSG_CONNECTION_LOST, MSG_CREATE_FAILED, MSG_JOIN_FAILED, MSG_NO_ROOM,
    MSG_TIMEOUT,
};
use crate::identity::{resolve_session_id, MemorySessionIdStore, SessionIdStore};
use crate::media::{
    acquire_local_media, LocalMedia, MediaSource, NullPresenter, Presenter, RemoteMedia,
    RemoteTrack, TrackKind,
};
use crate::peer::{EventSink, LinkState, PeerEvent, PeerFactory, PeerLink, Role};
use crate::relay::SignalingApi;
use crate::state::{ConnectionState, StateMachine};

const NOTICE_CAPACITY: usize = 64;

#[derive(Debug)]
pub enum SessionEvent {
    Peer { epoch: u64, event: PeerEvent },
    AnswerReady { epoch: u64, bundle: AnswerBundle },
    PollExhausted { epoch: u64, attempts: u32 },
    FlushControl { epoch: u64 },
    DebounceElapsed { epoch: u64, seq: u64 },
}

impl SessionEvent {
    pub fn epoch(&self) -> u64 {
        match self {
            SessionEvent::Peer { epoch, .. }
            | SessionEvent::AnswerReady { epoch, .. }
            | SessionEvent::PollExhausted { epoch, .. }
            | SessionEvent::FlushControl { epoch }
            | SessionEvent::DebounceElapsed { epoch, .. } => *epoch,
        }
    }
}

/// User-facing notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallNotice {
    Error(String),
    Warning(String),
    ShareLink { session_id: String, link: String },
    LocalMedia(MediaState),
    RemoteMedia(MediaState),
    Ended { by_peer: bool },
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSnapshot {
    pub state: ConnectionState,
    pub role: Option<Role>,
    pub session_id: Option<String>,
    pub share_link: Option<String>,
    pub local: MediaState,
    pub remote: MediaState,
    pub polling: bool,
}

pub struct CallSession {
    config: CallConfig,
    relay: Arc<dyn SignalingApi>,
    peers: Arc<dyn PeerFactory>,
    media: Arc<dyn MediaSource>,
    presenter: Arc<dyn Presenter>,
    identity: Arc<dyn SessionIdStore>,
    state: StateMachine,
    notices: broadcast::Sender<CallNotice>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    epoch: u64,
    role: Option<Role>,
    session_id: Option<String>,
    share_link: Option<String>,
    link: Option<Arc<dyn PeerLink>>,
    local_media: Option<LocalMedia>,
    remote_media: Option<RemoteMedia>,
    local_state: MediaState,
    remote_state: MediaState,
    control: ControlChannel,
    local_candidates: Vec<CandidateInit>,
    poll_task: Option<JoinHandle<()>>,
}

impl CallSession {
    pub fn new(
        config: CallConfig,
        relay: Arc<dyn SignalingApi>,
        peers: Arc<dyn PeerFactory>,
        media: Arc<dyn MediaSource>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            config,
            relay,
            peers,
            media,
            presenter: Arc::new(NullPresenter),
            identity: Arc::new(MemorySessionIdStore::new()),
            state: StateMachine::new(),
            notices,
            events_tx,
            events_rx,
            epoch: 0,
            role: None,
            session_id: None,
            share_link: None,
            link: None,
            local_media: None,
            remote_media: None,
            local_state: MediaState::default(),
            remote_state: MediaState::default(),
            control: ControlChannel::new(),
            local_candidates: Vec::new(),
            poll_task: None,
        }
    }

    pub fn with_presenter(mut self, presenter: Arc<dyn Presenter>) -> Self {
        self.presenter = presenter;
        self
    }

    pub fn with_identity(mut self, identity: Arc<dyn SessionIdStore>) -> Self {
        self.identity = identity;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state.current()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<CallNotice> {
        self.notices.subscribe()
    }

    pub(crate) fn notice_sender(&self) -> broadcast::Sender<CallNotice> {
        self.notices.clone()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn remote_media(&self) -> Option<&RemoteMedia> {
        self.remote_media.as_ref()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            state: self.state.current(),
            role: self.role,
            session_id: self.session_id.clone(),
            share_link: self.share_link.clone(),
            local: self.local_state,
            remote: self.remote_state,
            polling: self.poll_task.is_some(),
        }
    }

    fn notify(&self, notice: CallNotice) {
        // No subscribers is fine.
        let _ = self.notices.send(notice);
    }

    fn ensure_idle(&self) -> Result<(), CallError> {
        match self.state.current() {
            ConnectionState::Idle => Ok(()),
            busy => Err(CallError::Busy(busy)),
        }
    }

    fn schedule(&self, delay: Duration, event: SessionEvent) {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        });
    }

    fn reset_media_flags(&mut self) {
        self.local_state = MediaState::default();
        self.remote_state = MediaState::default();
    }

    /// Starts a call as initiator. If the chosen session already has an
    /// offer waiting, joins it instead.
    pub async fn start_call(&mut self, requested: Option<&str>) -> Result<(), CallError> {
        self.ensure_idle()?;
        let session_id = match resolve_session_id(requested, self.identity.as_ref()) {
            Ok(session_id) => session_id,
            Err(err) => {
                self.notify(CallNotice::Error(err.user_message(MSG_NO_ROOM)));
                return Err(err);
            }
        };
        self.reset_media_flags();

        match self.relay.fetch_offer(&session_id).await {
            Ok(_) => {
                info!(session = %session_id, "session already offered, joining");
                return self.join_resolved(session_id).await;
            }
            Err(RelayError::NotFound(_)) => {}
            Err(err) => {
                debug!(session = %session_id, error = %err, "offer lookup failed, creating session");
            }
        }

        let epoch = self.epoch;
        match self.create_session(session_id, epoch).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if self.epoch == epoch {
                    self.fail(&err, MSG_CREATE_FAILED).await;
                }
                Err(err)
            }
        }
    }

    /// Joins an existing session as the answering side. `reference` is a
    /// session id or a share link.
    pub async fn join_call(&mut self, reference: &str) -> Result<(), CallError> {
        self.ensure_idle()?;
        let session_id = session_id_from_reference(reference);
        if session_id.is_empty() {
            let err = CallError::Validation(MSG_NO_ROOM.to_string());
            self.notify(CallNotice::Error(err.user_message(MSG_NO_ROOM)));
            return Err(err);
        }
        self.reset_media_flags();
        self.join_resolved(session_id).await
    }

    async fn join_resolved(&mut self, session_id: String) -> Result<(), CallError> {
        let epoch = self.epoch;
        match self.join_session(session_id, epoch).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if self.epoch == epoch {
                    self.fail(&err, MSG_JOIN_FAILED).await;
                }
                Err(err)
            }
        }
    }

    async fn create_session(&mut self, session_id: String, epoch: u64) -> Result<(), CallError> {
        let base = self.config.share_base()?;
        self.session_id = Some(session_id.clone());
        self.role = Some(Role::Initiator);
        self.state.transition(ConnectionState::Creating)?;

        let link = self.prepare_peer(Role::Initiator).await?;
        let offer = link.create_offer().await?;
        if !self.gather_candidates(epoch).await {
            return Ok(());
        }

        let candidates = self.local_candidates.clone();
        debug!(session = %session_id, candidates = candidates.len(), "publishing offer");
        self.relay
            .publish_offer(&session_id, offer, candidates)
            .await?;

        let link_url = share_link(&base, &session_id).to_string();
        self.share_link = Some(link_url.clone());
        self.notify(CallNotice::ShareLink {
            session_id: session_id.clone(),
            link: link_url,
        });
        self.state.transition(ConnectionState::Waiting)?;

        self.poll_task = Some(spawn_answer_poll(
            self.relay.clone(),
            session_id.clone(),
            epoch,
            self.config.poll_interval,
            self.config.max_poll_attempts,
            self.events_tx.clone(),
        ));
        info!(session = %session_id, role = %Role::Initiator, "waiting for answer");
        Ok(())
    }

    async fn join_session(&mut self, session_id: String, epoch: u64) -> Result<(), CallError> {
        self.session_id = Some(session_id.clone());
        self.role = Some(Role::Joiner);
        self.state.transition(ConnectionState::Connecting)?;

        let link = self.prepare_peer(Role::Joiner).await?;
        let bundle = self
            .relay
            .fetch_offer(&session_id)
            .await
            .map_err(|err| match err {
                RelayError::NotFound(_) => CallError::NotFound(session_id.clone()),
                other => CallError::Relay(other),
            })?;
        link.apply_remote_description(bundle.offer).await?;
        apply_remote_candidates(link.as_ref(), bundle.candidates).await;

        let answer = link.create_answer().await?;
        if !self.gather_candidates(epoch).await {
            return Ok(());
        }

        let candidates = self.local_candidates.clone();
        debug!(session = %session_id, candidates = candidates.len(), "publishing answer");
        self.relay
            .publish_answer(&session_id, answer, candidates)
            .await?;
        info!(session = %session_id, role = %Role::Joiner, "answer published");
        Ok(())
    }

    /// Captures media, opens the peer link and attaches local tracks.
    async fn prepare_peer(&mut self, role: Role) -> Result<Arc<dyn PeerLink>, CallError> {
        let (media, warning) = acquire_local_media(self.media.as_ref()).await?;
        if let Some(warning) = warning {
            self.notify(CallNotice::Warning(warning.to_string()));
        }
        self.local_state = MediaState::new(false, !media.has(TrackKind::Video));
        self.notify(CallNotice::LocalMedia(self.local_state));
        self.presenter.attach_local(&media);
        let tracks = media.tracks().to_vec();
        self.local_media = Some(media);

        let sink = EventSink::new(self.epoch, self.events_tx.clone());
        let link = self.peers.create(role, sink).await?;
        self.link = Some(link.clone());
        for track in tracks {
            link.add_track(track).await?;
        }
        debug!(%role, epoch = self.epoch, "peer link ready");
        Ok(link)
    }

    /// Collects local candidates for the gathering window while still
    /// servicing other events. Returns false if the attempt was torn down
    /// meanwhile.
    async fn gather_candidates(&mut self, epoch: u64) -> bool {
        let deadline = Instant::now() + self.config.gather_window;
        loop {
            let next = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => None,
                event = self.events_rx.recv() => event,
            };
            match next {
                Some(event) => self.handle_event(event).await,
                None => break,
            }
            if self.epoch != epoch {
                return false;
            }
        }
        self.epoch == epoch
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events_rx.recv().await
    }

    pub async fn handle_event(&mut self, event: SessionEvent) {
        if event.epoch() != self.epoch {
            trace!(event_epoch = event.epoch(), epoch = self.epoch, ?event, "dropping stale event");
            return;
        }
        match event {
            SessionEvent::Peer { event, .. } => self.handle_peer_event(event).await,
            SessionEvent::AnswerReady { bundle, .. } => self.accept_answer(bundle).await,
            SessionEvent::PollExhausted { attempts, .. } => {
                self.poll_task = None;
                if self.state.current() == ConnectionState::Waiting {
                    self.fail(&CallError::NegotiationTimeout { attempts }, MSG_TIMEOUT)
                        .await;
                }
            }
            SessionEvent::FlushControl { .. } => {
                let current = self.local_state;
                self.control.flush(current).await;
            }
            SessionEvent::DebounceElapsed { seq, .. } => {
                if self.control.is_current_debounce(seq) {
                    let current = self.local_state;
                    self.control.publish(current).await;
                }
            }
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => self.local_candidates.push(candidate),
            PeerEvent::LinkState(LinkState::Connected) => {
                if self.state.current() == ConnectionState::Connecting {
                    if let Err(err) = self.state.transition(ConnectionState::Connected) {
                        warn!(error = %err, "could not mark call connected");
                    } else {
                        info!(session = ?self.session_id, role = ?self.role, "call connected");
                    }
                }
            }
            PeerEvent::LinkState(LinkState::Failed | LinkState::Disconnected) => {
                if self.state.current() != ConnectionState::Idle {
                    self.fail(&CallError::LinkFailure, MSG_CONNECTION_LOST).await;
                }
            }
            PeerEvent::LinkState(other) => {
                debug!(state = ?other, "link state");
            }
            PeerEvent::RemoteTrack(info) => {
                let remote = self
                    .remote_media
                    .get_or_insert_with(|| RemoteMedia::new(info.stream_id.clone()));
                remote.add_track(RemoteTrack {
                    id: info.track_id,
                    kind: info.kind,
                });
                self.presenter.attach_remote(remote);
            }
            PeerEvent::ControlAvailable(stream) => {
                let open = stream.is_open();
                self.control.attach(stream);
                if open {
                    self.control_opened();
                }
            }
            PeerEvent::ControlOpen => self.control_opened(),
            PeerEvent::ControlMessage(text) => {
                if let Some(message) = decode_incoming(&text) {
                    self.handle_control_message(message).await;
                }
            }
            PeerEvent::ControlClosed => debug!("control stream closed"),
        }
    }

    fn control_opened(&mut self) {
        if self.control.mark_opened() {
            self.schedule(
                self.config.control_open_delay,
                SessionEvent::FlushControl { epoch: self.epoch },
            );
        }
    }

    async fn handle_control_message(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::MediaState(state) => {
                debug!(?state, "peer media state");
                self.remote_state = state;
                self.notify(CallNotice::RemoteMedia(state));
            }
            ControlMessage::CallEnded => {
                info!(session = ?self.session_id, "peer ended the call");
                self.teardown().await;
                self.state.reset();
                self.forget_session();
                self.notify(CallNotice::Ended { by_peer: true });
            }
        }
    }

    async fn accept_answer(&mut self, bundle: AnswerBundle) {
        self.poll_task = None;
        if self.state.current() != ConnectionState::Waiting {
            debug!(state = %self.state.current(), "ignoring answer outside waiting");
            return;
        }
        if let Err(err) = self.apply_answer(bundle).await {
            self.fail(&err, MSG_CREATE_FAILED).await;
        }
    }

    async fn apply_answer(&mut self, bundle: AnswerBundle) -> Result<(), CallError> {
        self.state.transition(ConnectionState::Connecting)?;
        let link = self
            .link
            .clone()
            .ok_or_else(|| CallError::Negotiation("no peer link for answer".into()))?;
        link.apply_remote_description(bundle.answer).await?;
        apply_remote_candidates(link.as_ref(), bundle.candidates).await;
        debug!(session = ?self.session_id, "answer applied");
        Ok(())
    }

    pub fn toggle_mute(&mut self) -> MediaState {
        let Some(media) = &self.local_media else {
            return self.local_state;
        };
        let muted = !self.local_state.audio_muted;
        if media.set_enabled(TrackKind::Audio, !muted) {
            self.local_state.audio_muted = muted;
            self.local_media_changed();
        }
        self.local_state
    }

    pub fn toggle_video(&mut self) -> MediaState {
        let Some(media) = &self.local_media else {
            return self.local_state;
        };
        let off = !self.local_state.video_off;
        if media.set_enabled(TrackKind::Video, !off) {
            self.local_state.video_off = off;
            self.local_media_changed();
        }
        self.local_state
    }

    fn local_media_changed(&mut self) {
        let seq = self.control.arm_debounce();
        self.schedule(
            self.config.media_state_debounce,
            SessionEvent::DebounceElapsed {
                epoch: self.epoch,
                seq,
            },
        );
        self.notify(CallNotice::LocalMedia(self.local_state));
    }

    /// Hangs up. Tells the peer if the control stream is open and removes
    /// an unanswered session from the relay.
    pub async fn end_call(&mut self) {
        let prior = self.state.current();
        if prior == ConnectionState::Idle && self.link.is_none() {
            return;
        }
        if self.control.send_call_ended().await {
            debug!("sent callEnded");
        }
        if matches!(prior, ConnectionState::Creating | ConnectionState::Waiting) {
            if let Some(session_id) = self.session_id.clone() {
                if let Err(err) = self.relay.delete_session(&session_id).await {
                    debug!(session = %session_id, error = %err, "relay cleanup failed");
                }
            }
        }
        self.teardown().await;
        self.state.reset();
        self.forget_session();
        self.notify(CallNotice::Ended { by_peer: false });
        info!(from = %prior, "call ended");
    }

    async fn fail(&mut self, err: &CallError, fallback: &str) {
        warn!(session = ?self.session_id, error = %err, "call attempt failed");
        self.notify(CallNotice::Error(err.user_message(fallback)));
        self.teardown().await;
        self.state.reset();
        self.forget_session();
    }

    fn forget_session(&mut self) {
        self.session_id = None;
        self.share_link = None;
    }

    /// Releases every resource of the current attempt. Safe to call more
    /// than once and never signals the peer.
    pub async fn teardown(&mut self) {
        self.epoch += 1;
        if let Some(poll) = self.poll_task.take() {
            poll.abort();
        }
        self.control.shutdown().await;
        if let Some(media) = self.local_media.take() {
            media.stop_all();
        }
        self.remote_media = None;
        if let Some(link) = self.link.take() {
            link.close().await;
        }
        self.presenter.detach_local();
        self.presenter.detach_remote();
        self.local_candidates.clear();
        self.remote_state = MediaState::default();
        self.role = None;
        debug!(epoch = self.epoch, "session torn down");
    }
}

async fn apply_remote_candidates(link: &dyn PeerLink, candidates: Vec<CandidateInit>) {
    for candidate in candidates {
        if let Err(err) = link.add_remote_candidate(candidate).await {
            warn!(error = %err, "failed to add remote candidate");
        }
    }
}

/// Polls the relay for the answer every `interval`, at most `max_attempts`
/// times. Per-attempt failures are ignored; only running out of attempts
/// is reported.
fn spawn_answer_poll(
    relay: Arc<dyn SignalingApi>,
    session_id: String,
    epoch: u64,
    interval: Duration,
    max_attempts: u32,
    tx: mpsc::UnboundedSender<SessionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        for attempt in 1..=max_attempts {
            tokio::time::sleep(interval).await;
            match relay.fetch_answer(&session_id).await {
                Ok(bundle) => {
                    debug!(session = %session_id, attempt, "answer received");
                    let _ = tx.send(SessionEvent::AnswerReady { epoch, bundle });
                    return;
                }
                Err(RelayError::NotFound(_)) => {
                    trace!(session = %session_id, attempt, "answer not ready");
                }
                Err(err) => {
                    debug!(session = %session_id, attempt, error = %err, "answer poll failed");
                }
            }
        }
        debug!(session = %session_id, attempts = max_attempts, "giving up on answer");
        let _ = tx.send(SessionEvent::PollExhausted {
            epoch,
            attempts: max_attempts,
        });
    })
}
