//! Request and response bodies of the relay's `/signaling/*` endpoints.
//!
//! Field names follow the JSON the browser client sends (`sessionId`,
//! `candidates`); `roomId` and `iceCandidates` are accepted as aliases.
//! Request fields are optional so the relay can answer a missing field with
//! its own validation error instead of a generic deserialization failure.

use serde::{Deserialize, Serialize};

use crate::description::{CandidateInit, SessionDescription};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    #[serde(default, alias = "roomId")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub offer: Option<SessionDescription>,
    #[serde(default, alias = "iceCandidates")]
    pub candidates: Vec<CandidateInit>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishAnswerRequest {
    #[serde(default, alias = "roomId")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub answer: Option<SessionDescription>,
    #[serde(default, alias = "iceCandidates")]
    pub candidates: Vec<CandidateInit>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionQuery {
    #[serde(default, alias = "roomId")]
    pub session_id: Option<String>,
}

/// Response of `GET /signaling/get`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferBundle {
    pub offer: SessionDescription,
    #[serde(default, alias = "iceCandidates")]
    pub candidates: Vec<CandidateInit>,
    pub created_at: i64,
}

/// Response of `GET /signaling/get-answer`, also the stored answer record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerBundle {
    pub answer: SessionDescription,
    #[serde(default, alias = "iceCandidates")]
    pub candidates: Vec<CandidateInit>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SuccessBody {
    pub success: bool,
}

impl SuccessBody {
    pub const OK: SuccessBody = SuccessBody { success: true };
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub backend: String,
}
