//! Local capture and remote presentation seams.
//!
//! Device selection and rendering live outside this crate. A session only
//! needs tracks it can enable, disable and stop, and somewhere to hand
//! local and remote streams for display.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{CallError, MediaError, MSG_AUDIO_ONLY, MSG_NO_MICROPHONE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    stream_id: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, stream_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            stream_id: stream_id.into(),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub const AUDIO_VIDEO: MediaConstraints = MediaConstraints {
        audio: true,
        video: true,
    };
    pub const AUDIO_ONLY: MediaConstraints = MediaConstraints {
        audio: true,
        video: false,
    };
}

/// One captured stream of local tracks.
#[derive(Debug, Clone)]
pub struct LocalMedia {
    stream_id: String,
    tracks: Vec<Arc<MediaTrack>>,
}

impl LocalMedia {
    pub fn new(stream_id: impl Into<String>, tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self {
            stream_id: stream_id.into(),
            tracks,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(move |track| track.kind() == kind)
    }

    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks_of(kind).next().is_some()
    }

    /// Sets the enabled flag of every track of `kind`. Returns false if
    /// there was no such track.
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) -> bool {
        let mut touched = false;
        for track in self.tracks_of(kind) {
            track.set_enabled(enabled);
            touched = true;
        }
        touched
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError>;
}

/// Produces tracks without touching any device. Either kind can be made to
/// fail to exercise the capture fallbacks.
#[derive(Debug, Default)]
pub struct SyntheticMediaSource {
    refuse_audio: AtomicBool,
    refuse_video: AtomicBool,
}

impl SyntheticMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_audio(self, refuse: bool) -> Self {
        self.refuse_audio.store(refuse, Ordering::SeqCst);
        self
    }

    pub fn refuse_video(self, refuse: bool) -> Self {
        self.refuse_video.store(refuse, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
        if constraints.audio && self.refuse_audio.load(Ordering::SeqCst) {
            return Err(MediaError::Unavailable("microphone refused".into()));
        }
        if constraints.video && self.refuse_video.load(Ordering::SeqCst) {
            return Err(MediaError::Unavailable("camera refused".into()));
        }
        let stream_id = Uuid::new_v4().to_string();
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(MediaTrack::new(TrackKind::Audio, stream_id.clone())));
        }
        if constraints.video {
            tracks.push(Arc::new(MediaTrack::new(TrackKind::Video, stream_id.clone())));
        }
        Ok(LocalMedia::new(stream_id, tracks))
    }
}

/// Captures audio and video, falling back to audio alone. The second value
/// is a warning to surface when the fallback was taken.
pub async fn acquire_local_media(
    source: &dyn MediaSource,
) -> Result<(LocalMedia, Option<&'static str>), CallError> {
    match source.acquire(MediaConstraints::AUDIO_VIDEO).await {
        Ok(media) => Ok((media, None)),
        Err(err) => {
            warn!(error = %err, "camera capture failed, retrying audio only");
            match source.acquire(MediaConstraints::AUDIO_ONLY).await {
                Ok(media) => Ok((media, Some(MSG_AUDIO_ONLY))),
                Err(err) => {
                    warn!(error = %err, "microphone capture failed");
                    Err(CallError::Media(MSG_NO_MICROPHONE.to_string()))
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// The stream announced by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMedia {
    pub stream_id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteMedia {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            tracks: Vec::new(),
        }
    }

    pub fn add_track(&mut self, track: RemoteTrack) {
        if !self.tracks.iter().any(|existing| existing.id == track.id) {
            self.tracks.push(track);
        }
    }
}

/// Where video surfaces get attached. Implementations must tolerate detach
/// calls for surfaces that were never attached.
pub trait Presenter: Send + Sync {
    fn attach_local(&self, media: &LocalMedia);
    fn detach_local(&self);
    fn attach_remote(&self, media: &RemoteMedia);
    fn detach_remote(&self);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullPresenter;

impl Presenter for NullPresenter {
    fn attach_local(&self, media: &LocalMedia) {
        debug!(stream = media.stream_id(), tracks = media.tracks().len(), "local media ready");
    }

    fn detach_local(&self) {}

    fn attach_remote(&self, media: &RemoteMedia) {
        debug!(stream = %media.stream_id, tracks = media.tracks.len(), "remote media ready");
    }

    fn detach_remote(&self) {}
}
