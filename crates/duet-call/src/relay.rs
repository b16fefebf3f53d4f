use std::time::Duration;

use async_trait::async_trait;
use duet_proto::{
    AnswerBundle, CandidateInit, CreateSessionRequest, ErrorBody, OfferBundle,
    PublishAnswerRequest, SessionDescription,
};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::trace;
use url::Url;

use crate::error::RelayError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The five relay operations a call needs.
#[async_trait]
pub trait SignalingApi: Send + Sync {
    async fn publish_offer(
        &self,
        session_id: &str,
        offer: SessionDescription,
        candidates: Vec<CandidateInit>,
    ) -> Result<(), RelayError>;

    async fn fetch_offer(&self, session_id: &str) -> Result<OfferBundle, RelayError>;

    async fn publish_answer(
        &self,
        session_id: &str,
        answer: SessionDescription,
        candidates: Vec<CandidateInit>,
    ) -> Result<(), RelayError>;

    /// Fetches the answer. A successful read retires the session on the
    /// relay.
    async fn fetch_answer(&self, session_id: &str) -> Result<AnswerBundle, RelayError>;

    async fn delete_session(&self, session_id: &str) -> Result<(), RelayError>;
}

/// [`SignalingApi`] over the relay's HTTP endpoints.
#[derive(Clone)]
pub struct HttpRelay {
    client: Client,
    base: Url,
}

impl HttpRelay {
    pub fn new(base_url: &str) -> Result<Self, RelayError> {
        let mut base = Url::parse(base_url)
            .map_err(|err| RelayError::Invalid(format!("invalid relay url {}: {}", base_url, err)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| RelayError::Transport(err.to_string()))?;
        Ok(Self { client, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url, RelayError> {
        self.base
            .join(path)
            .map_err(|err| RelayError::Invalid(err.to_string()))
    }
}

fn transport_error(err: reqwest::Error) -> RelayError {
    RelayError::Transport(err.to_string())
}

async fn check_status(response: Response) -> Result<Response, RelayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    };
    Err(match status {
        StatusCode::BAD_REQUEST => RelayError::Invalid(message),
        StatusCode::NOT_FOUND => RelayError::NotFound(message),
        other => RelayError::Backend {
            status: other.as_u16(),
            message,
        },
    })
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, RelayError> {
    let response = check_status(response).await?;
    response
        .json::<T>()
        .await
        .map_err(|err| RelayError::Transport(format!("invalid relay response: {}", err)))
}

#[async_trait]
impl SignalingApi for HttpRelay {
    async fn publish_offer(
        &self,
        session_id: &str,
        offer: SessionDescription,
        candidates: Vec<CandidateInit>,
    ) -> Result<(), RelayError> {
        let body = CreateSessionRequest {
            session_id: Some(session_id.to_string()),
            offer: Some(offer),
            candidates,
        };
        trace!(session = %session_id, candidates = body.candidates.len(), "posting offer");
        let response = self
            .client
            .post(self.endpoint("signaling/create")?)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await.map(|_| ())
    }

    async fn fetch_offer(&self, session_id: &str) -> Result<OfferBundle, RelayError> {
        let response = self
            .client
            .get(self.endpoint("signaling/get")?)
            .query(&[("sessionId", session_id)])
            .send()
            .await
            .map_err(transport_error)?;
        read_json(response).await
    }

    async fn publish_answer(
        &self,
        session_id: &str,
        answer: SessionDescription,
        candidates: Vec<CandidateInit>,
    ) -> Result<(), RelayError> {
        let body = PublishAnswerRequest {
            session_id: Some(session_id.to_string()),
            answer: Some(answer),
            candidates,
        };
        trace!(session = %session_id, candidates = body.candidates.len(), "posting answer");
        let response = self
            .client
            .post(self.endpoint("signaling/answer")?)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await.map(|_| ())
    }

    async fn fetch_answer(&self, session_id: &str) -> Result<AnswerBundle, RelayError> {
        let response = self
            .client
            .get(self.endpoint("signaling/get-answer")?)
            .query(&[("sessionId", session_id)])
            .send()
            .await
            .map_err(transport_error)?;
        read_json(response).await
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), RelayError> {
        let response = self
            .client
            .delete(self.endpoint("signaling/delete")?)
            .query(&[("sessionId", session_id)])
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await.map(|_| ())
    }
}
