use std::time::Duration;

use chrono::Utc;
use duet_proto::{
    validate_session_id, AnswerBundle, CandidateInit, CreateSessionRequest, OfferBundle,
    PublishAnswerRequest, SdpKind, SessionDescription,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::store::{EphemeralStore, StoreError};

pub const DEFAULT_OFFER_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_ANSWER_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What the relay keeps under `session:{id}` while the initiator waits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub offer: SessionDescription,
    #[serde(default)]
    pub candidates: Vec<CandidateInit>,
    pub created_at: i64,
}

impl From<SessionRecord> for OfferBundle {
    fn from(record: SessionRecord) -> Self {
        OfferBundle {
            offer: record.offer,
            candidates: record.candidates,
            created_at: record.created_at,
        }
    }
}

fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

fn answer_key(session_id: &str) -> String {
    format!("session:{}:answer", session_id)
}

fn both_keys(session_id: &str) -> [String; 2] {
    [session_key(session_id), answer_key(session_id)]
}

/// Unwraps a required id field and checks its shape.
pub fn require_session_id(session_id: Option<String>) -> Result<String, GatewayError> {
    let session_id = session_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| GatewayError::InvalidRequest("Session ID is required".into()))?;
    check_session_id(&session_id)?;
    Ok(session_id)
}

fn check_session_id(session_id: &str) -> Result<(), GatewayError> {
    validate_session_id(session_id)
        .map_err(|err| GatewayError::InvalidRequest(format!("Invalid session ID: {}", err)))
}

/// Brokers the one-time offer/answer exchange on top of the ephemeral store.
#[derive(Clone)]
pub struct SignalingGateway {
    store: EphemeralStore,
    offer_ttl: Duration,
    answer_ttl: Duration,
}

impl SignalingGateway {
    pub fn new(store: EphemeralStore) -> Self {
        Self::with_ttls(store, DEFAULT_OFFER_TTL, DEFAULT_ANSWER_TTL)
    }

    pub fn with_ttls(store: EphemeralStore, offer_ttl: Duration, answer_ttl: Duration) -> Self {
        Self {
            store,
            offer_ttl,
            answer_ttl,
        }
    }

    pub fn store(&self) -> &EphemeralStore {
        &self.store
    }

    /// Stores a fresh offer, discarding any earlier record and answer that
    /// used the same id.
    pub async fn publish_offer(&self, request: CreateSessionRequest) -> Result<(), GatewayError> {
        let (session_id, offer) = match (request.session_id, request.offer) {
            (Some(id), Some(offer)) if !id.is_empty() => (id, offer),
            _ => {
                return Err(GatewayError::InvalidRequest(
                    "Session ID and offer are required".into(),
                ))
            }
        };
        check_session_id(&session_id)?;
        if offer.kind != SdpKind::Offer {
            return Err(GatewayError::InvalidRequest(format!(
                "expected an offer description, got {}",
                offer.kind
            )));
        }

        if self
            .store
            .get(&session_key(&session_id))
            .await?
            .is_some()
        {
            debug!(session = %session_id, "replacing existing session");
            self.store.delete(&both_keys(&session_id)).await?;
        }

        let record = SessionRecord {
            session_id: session_id.clone(),
            offer,
            candidates: request.candidates,
            created_at: Utc::now().timestamp_millis(),
        };
        self.store
            .set_json(&session_key(&session_id), &record, self.offer_ttl)
            .await?;
        debug!(
            session = %session_id,
            candidates = record.candidates.len(),
            ttl_secs = self.offer_ttl.as_secs(),
            "stored offer"
        );
        Ok(())
    }

    pub async fn fetch_offer(&self, session_id: &str) -> Result<OfferBundle, GatewayError> {
        check_session_id(session_id)?;
        match self
            .store
            .get_json::<SessionRecord>(&session_key(session_id))
            .await?
        {
            Some(record) => Ok(record.into()),
            None => Err(GatewayError::NotFound("Session not found".into())),
        }
    }

    /// Stores the joiner's answer. The session must still be live.
    pub async fn publish_answer(&self, request: PublishAnswerRequest) -> Result<(), GatewayError> {
        let (session_id, answer) = match (request.session_id, request.answer) {
            (Some(id), Some(answer)) if !id.is_empty() => (id, answer),
            _ => {
                return Err(GatewayError::InvalidRequest(
                    "Session ID and answer are required".into(),
                ))
            }
        };
        check_session_id(&session_id)?;
        if answer.kind != SdpKind::Answer {
            return Err(GatewayError::InvalidRequest(format!(
                "expected an answer description, got {}",
                answer.kind
            )));
        }

        if self.store.get(&session_key(&session_id)).await?.is_none() {
            return Err(GatewayError::NotFound("Session not found".into()));
        }

        let bundle = AnswerBundle {
            answer,
            candidates: request.candidates,
        };
        self.store
            .set_json(&answer_key(&session_id), &bundle, self.answer_ttl)
            .await?;
        debug!(
            session = %session_id,
            candidates = bundle.candidates.len(),
            "stored answer"
        );
        Ok(())
    }

    /// Hands the answer out once. A successful read removes both the answer
    /// and its session record.
    pub async fn fetch_answer_and_retire(
        &self,
        session_id: &str,
    ) -> Result<AnswerBundle, GatewayError> {
        check_session_id(session_id)?;
        let bundle = self
            .store
            .get_json::<AnswerBundle>(&answer_key(session_id))
            .await?
            .ok_or_else(|| GatewayError::NotFound("Answer not found".into()))?;
        self.store.delete(&both_keys(session_id)).await?;
        debug!(session = %session_id, "answer consumed, session retired");
        Ok(bundle)
    }

    /// Removes the session and any answer. Missing sessions are not an error.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), GatewayError> {
        check_session_id(session_id)?;
        self.store.delete(&both_keys(session_id)).await?;
        debug!(session = %session_id, "session deleted");
        Ok(())
    }
}
