#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use duet_call::{
    spawn_call, CallConfig, CallHandle, CallNotice, CallSession, CallTask, LoopbackNetwork,
    MediaSource, MemorySessionIdStore, RelayError, SignalingApi, SyntheticMediaSource,
};
use duet_proto::{
    AnswerBundle, CandidateInit, CreateSessionRequest, OfferBundle, PublishAnswerRequest,
    SessionDescription,
};
use duet_relay::{EphemeralStore, GatewayError, SignalingGateway};
use tokio::sync::broadcast;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

pub fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Short timings so flows settle quickly.
pub fn fast_config() -> CallConfig {
    CallConfig {
        relay_url: "http://relay.test".to_string(),
        base_url: "https://duet.test/call".to_string(),
        gather_window: Duration::from_millis(30),
        poll_interval: Duration::from_millis(50),
        max_poll_attempts: 20,
        control_open_delay: Duration::from_millis(20),
        media_state_debounce: Duration::from_millis(10),
        ice_servers: Vec::new(),
    }
}

/// Relay that calls the gateway directly and counts answer polls.
pub struct GatewayRelay {
    gateway: SignalingGateway,
    answer_fetches: AtomicU32,
}

impl GatewayRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gateway: SignalingGateway::new(EphemeralStore::in_memory()),
            answer_fetches: AtomicU32::new(0),
        })
    }

    pub fn gateway(&self) -> &SignalingGateway {
        &self.gateway
    }

    pub fn answer_fetches(&self) -> u32 {
        self.answer_fetches.load(Ordering::SeqCst)
    }
}

fn relay_error(err: GatewayError) -> RelayError {
    match err {
        GatewayError::InvalidRequest(message) => RelayError::Invalid(message),
        GatewayError::NotFound(message) => RelayError::NotFound(message),
        GatewayError::Store(err) => RelayError::Backend {
            status: 500,
            message: err.to_string(),
        },
    }
}

#[async_trait]
impl SignalingApi for GatewayRelay {
    async fn publish_offer(
        &self,
        session_id: &str,
        offer: SessionDescription,
        candidates: Vec<CandidateInit>,
    ) -> Result<(), RelayError> {
        self.gateway
            .publish_offer(CreateSessionRequest {
                session_id: Some(session_id.to_string()),
                offer: Some(offer),
                candidates,
            })
            .await
            .map_err(relay_error)
    }

    async fn fetch_offer(&self, session_id: &str) -> Result<OfferBundle, RelayError> {
        self.gateway
            .fetch_offer(session_id)
            .await
            .map_err(relay_error)
    }

    async fn publish_answer(
        &self,
        session_id: &str,
        answer: SessionDescription,
        candidates: Vec<CandidateInit>,
    ) -> Result<(), RelayError> {
        self.gateway
            .publish_answer(PublishAnswerRequest {
                session_id: Some(session_id.to_string()),
                answer: Some(answer),
                candidates,
            })
            .await
            .map_err(relay_error)
    }

    async fn fetch_answer(&self, session_id: &str) -> Result<AnswerBundle, RelayError> {
        self.answer_fetches.fetch_add(1, Ordering::SeqCst);
        self.gateway
            .fetch_answer_and_retire(session_id)
            .await
            .map_err(relay_error)
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), RelayError> {
        self.gateway
            .delete_session(session_id)
            .await
            .map_err(relay_error)
    }
}

pub struct Party {
    pub handle: CallHandle,
    pub task: CallTask,
    pub notices: broadcast::Receiver<CallNotice>,
}

pub fn party(
    config: CallConfig,
    relay: Arc<dyn SignalingApi>,
    network: &LoopbackNetwork,
    media: impl MediaSource + 'static,
) -> Party {
    let session = CallSession::new(config, relay, Arc::new(network.factory()), Arc::new(media))
        .with_identity(Arc::new(MemorySessionIdStore::new()));
    let (handle, task) = spawn_call(session);
    let notices = handle.subscribe();
    Party {
        handle,
        task,
        notices,
    }
}

pub fn default_party(relay: Arc<dyn SignalingApi>, network: &LoopbackNetwork) -> Party {
    party(fast_config(), relay, network, SyntheticMediaSource::new())
}

/// Waits for the first notice matching `wanted`, skipping others.
pub async fn expect_notice(
    notices: &mut broadcast::Receiver<CallNotice>,
    wanted: impl Fn(&CallNotice) -> bool,
) -> CallNotice {
    loop {
        match notices.recv().await {
            Ok(notice) if wanted(&notice) => return notice,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => panic!("notice stream closed"),
        }
    }
}

/// Notices already delivered, without waiting.
pub fn drain_notices(notices: &mut broadcast::Receiver<CallNotice>) -> Vec<CallNotice> {
    let mut seen = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        seen.push(notice);
    }
    seen
}
