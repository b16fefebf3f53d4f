//! Two-party calls negotiated through the Duet signaling relay.
//!
//! [`CallSession`] holds the negotiation logic and is written against three
//! seams: [`SignalingApi`] for the relay, [`PeerFactory`] for the media
//! transport and [`MediaSource`] for capture. [`spawn_call`] runs a session
//! on its own task and hands back a [`CallHandle`].

pub mod config;
pub mod control;
pub mod driver;
pub mod error;
pub mod identity;
pub mod loopback;
pub mod media;
pub mod peer;
pub mod relay;
pub mod rtc;
pub mod session;
pub mod state;

pub use config::CallConfig;
pub use driver::{spawn_call, CallHandle, CallTask};
pub use error::{CallError, MediaError, PeerError, RelayError};
pub use identity::{FileSessionIdStore, MemorySessionIdStore, SessionIdStore};
pub use loopback::LoopbackNetwork;
pub use media::{
    LocalMedia, MediaSource, MediaTrack, NullPresenter, Presenter, RemoteMedia,
    SyntheticMediaSource, TrackKind,
};
pub use peer::{PeerEvent, PeerFactory, PeerLink, Role};
pub use relay::{HttpRelay, SignalingApi};
pub use rtc::WebRtcPeerFactory;
pub use session::{CallNotice, CallSession, CallSnapshot, SessionEvent};
pub use state::ConnectionState;
