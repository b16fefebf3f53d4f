//! Peer backend on the `webrtc` crate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use duet_proto::{CandidateInit, SdpKind, SessionDescription};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::PeerError;
use crate::media::{MediaTrack, TrackKind};
use crate::peer::{
    ControlStream, EventSink, LinkState, PeerEvent, PeerFactory, PeerLink, RemoteTrackInfo, Role,
    CONTROL_CHANNEL_LABEL,
};

/// One 20 ms Opus frame of silence.
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const AUDIO_FRAME: Duration = Duration::from_millis(20);

fn to_setup_error<E: std::fmt::Display>(err: E) -> PeerError {
    PeerError::Setup(err.to_string())
}

fn build_api() -> Result<API, PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp).map_err(to_setup_error),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp).map_err(to_setup_error),
        SdpKind::Pranswer => {
            RTCSessionDescription::pranswer(description.sdp).map_err(to_setup_error)
        }
        SdpKind::Rollback => Err(PeerError::Setup("rollback is not supported".into())),
    }
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(PeerError::Setup("local description has no type".into()))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp,
    })
}

fn link_state(state: RTCPeerConnectionState) -> LinkState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => LinkState::New,
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
    }
}

/// Builds links on the `webrtc` crate using the configured ICE servers.
#[derive(Debug, Clone, Default)]
pub struct WebRtcPeerFactory {
    ice_servers: Vec<String>,
}

impl WebRtcPeerFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(&self, role: Role, sink: EventSink) -> Result<Arc<dyn PeerLink>, PeerError> {
        let api = build_api()?;
        let pc = Arc::new(
            api.new_peer_connection(self.rtc_configuration())
                .await
                .map_err(to_setup_error)?,
        );

        let candidate_sink = sink.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        sink.emit(PeerEvent::LocalCandidate(CandidateInit {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(target = "duet::rtc", error = %err, "failed to encode local candidate");
                    }
                }
            })
        }));

        let state_sink = sink.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = state_sink.clone();
            Box::pin(async move {
                tracing::debug!(target = "duet::rtc", state = ?state, "peer connection state");
                sink.emit(PeerEvent::LinkState(link_state(state)));
            })
        }));

        let track_sink = sink.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = track_sink.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        RTPCodecType::Video => TrackKind::Video,
                        RTPCodecType::Unspecified => return,
                    };
                    sink.emit(PeerEvent::RemoteTrack(RemoteTrackInfo {
                        track_id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                    }));
                })
            },
        ));

        match role {
            Role::Initiator => {
                let init = RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                };
                let dc = pc
                    .create_data_channel(CONTROL_CHANNEL_LABEL, Some(init))
                    .await
                    .map_err(to_setup_error)?;
                sink.emit(PeerEvent::ControlAvailable(wire_control(dc, sink.clone())));
            }
            Role::Joiner => {
                let channel_sink = sink.clone();
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let sink = channel_sink.clone();
                    Box::pin(async move {
                        if dc.label() != CONTROL_CHANNEL_LABEL {
                            tracing::debug!(target = "duet::rtc", label = dc.label(), "ignoring unexpected data channel");
                            return;
                        }
                        let open = dc.ready_state() == RTCDataChannelState::Open;
                        sink.emit(PeerEvent::ControlAvailable(wire_control(dc, sink.clone())));
                        if open {
                            sink.emit(PeerEvent::ControlOpen);
                        }
                    })
                }));
            }
        }

        tracing::debug!(target = "duet::rtc", %role, epoch = sink.epoch(), "peer connection created");
        Ok(Arc::new(RtcPeerLink {
            pc,
            pumps: Mutex::new(Vec::new()),
        }))
    }
}

fn wire_control(dc: Arc<RTCDataChannel>, sink: EventSink) -> Arc<dyn ControlStream> {
    let open_sink = sink.clone();
    dc.on_open(Box::new(move || {
        let sink = open_sink.clone();
        Box::pin(async move {
            sink.emit(PeerEvent::ControlOpen);
        })
    }));

    let message_sink = sink.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let sink = message_sink.clone();
        Box::pin(async move {
            if !msg.is_string {
                tracing::debug!(target = "duet::rtc", bytes = msg.data.len(), "ignoring binary control frame");
                return;
            }
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    sink.emit(PeerEvent::ControlMessage(text));
                }
                Err(err) => {
                    tracing::warn!(target = "duet::rtc", error = %err, "control frame is not utf-8");
                }
            }
        })
    }));

    dc.on_close(Box::new(move || {
        let sink = sink.clone();
        Box::pin(async move {
            sink.emit(PeerEvent::ControlClosed);
        })
    }));

    Arc::new(RtcControlStream {
        label: dc.label().to_string(),
        dc,
    })
}

struct RtcControlStream {
    label: String,
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl ControlStream for RtcControlStream {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<(), PeerError> {
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(to_setup_error)
    }

    async fn close(&self) {
        if let Err(err) = self.dc.close().await {
            tracing::debug!(target = "duet::rtc", error = %err, "data channel close failed");
        }
    }
}

pub struct RtcPeerLink {
    pc: Arc<RTCPeerConnection>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

/// Keeps RTP flowing on a synthetic audio track so the remote side sees
/// it. Nothing is written while the track is disabled. Video tracks carry
/// no samples.
fn spawn_silence_pump(track: Arc<MediaTrack>, local: Arc<TrackLocalStaticSample>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(AUDIO_FRAME);
        loop {
            ticker.tick().await;
            if track.is_stopped() {
                break;
            }
            if !track.is_enabled() {
                continue;
            }
            let sample = Sample {
                data: Bytes::from_static(&OPUS_SILENCE),
                duration: AUDIO_FRAME,
                ..Default::default()
            };
            if let Err(err) = local.write_sample(&sample).await {
                tracing::trace!(target = "duet::rtc", error = %err, "sample write failed");
            }
        }
    })
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), PeerError> {
        let mime_type = match track.kind() {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id().to_string(),
            track.stream_id().to_string(),
        ));
        self.pc
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(to_setup_error)?;
        if track.kind() == TrackKind::Audio {
            self.pumps.lock().push(spawn_silence_pump(track, local));
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(to_setup_error)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(to_setup_error)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(to_setup_error)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(to_setup_error)?;
        from_rtc_description(answer)
    }

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(to_setup_error)
    }

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(to_setup_error)
    }

    async fn close(&self) {
        let pumps = std::mem::take(&mut *self.pumps.lock());
        for pump in pumps {
            pump.abort();
        }
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target = "duet::rtc", error = %err, "peer connection close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn ice_servers_follow_configuration() {
        let config = WebRtcPeerFactory::new(vec!["stun:stun.example:3478".into()]).rtc_configuration();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls, vec!["stun:stun.example:3478".to_string()]);

        let config = WebRtcPeerFactory::default().rtc_configuration();
        assert!(config.ice_servers.is_empty());
    }

    #[test_timeout::timeout]
    fn rollback_descriptions_are_rejected() {
        let rollback = SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        };
        assert!(to_rtc_description(rollback).is_err());
    }
}
