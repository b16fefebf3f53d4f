use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use duet_proto::{
    AnswerBundle, CreateSessionRequest, ErrorBody, HealthStatus, OfferBundle,
    PublishAnswerRequest, SessionQuery, SuccessBody,
};
use tracing::{debug, error, warn};

use crate::signaling::{require_session_id, GatewayError, SignalingGateway};

#[derive(Debug)]
pub enum ApiError {
    Gateway(GatewayError),
    MalformedBody(String),
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        ApiError::Gateway(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::MalformedBody(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::MalformedBody(detail) => {
                debug!(%detail, "rejected malformed request body");
                (StatusCode::BAD_REQUEST, format!("Invalid request body: {}", detail))
            }
            ApiError::Gateway(GatewayError::InvalidRequest(message)) => {
                (StatusCode::BAD_REQUEST, message)
            }
            ApiError::Gateway(GatewayError::NotFound(message)) => (StatusCode::NOT_FOUND, message),
            ApiError::Gateway(GatewayError::Store(err)) => {
                error!(error = %err, "signaling store failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

/// POST /signaling/create
pub async fn create_session(
    State(gateway): State<SignalingGateway>,
    payload: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Result<Json<SuccessBody>, ApiError> {
    let Json(request) = payload?;
    gateway.publish_offer(request).await?;
    Ok(Json(SuccessBody::OK))
}

/// GET /signaling/get?sessionId=
pub async fn get_offer(
    State(gateway): State<SignalingGateway>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<OfferBundle>, ApiError> {
    let session_id = require_session_id(query.session_id)?;
    let bundle = gateway.fetch_offer(&session_id).await?;
    Ok(Json(bundle))
}

/// POST /signaling/answer
pub async fn post_answer(
    State(gateway): State<SignalingGateway>,
    payload: Result<Json<PublishAnswerRequest>, JsonRejection>,
) -> Result<Json<SuccessBody>, ApiError> {
    let Json(request) = payload?;
    gateway.publish_answer(request).await?;
    Ok(Json(SuccessBody::OK))
}

/// GET /signaling/get-answer?sessionId=
pub async fn get_answer(
    State(gateway): State<SignalingGateway>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<AnswerBundle>, ApiError> {
    let session_id = require_session_id(query.session_id)?;
    let bundle = gateway.fetch_answer_and_retire(&session_id).await?;
    Ok(Json(bundle))
}

/// DELETE /signaling/delete?sessionId=
pub async fn delete_session(
    State(gateway): State<SignalingGateway>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<SuccessBody>, ApiError> {
    let session_id = require_session_id(query.session_id)?;
    if let Err(err) = gateway.delete_session(&session_id).await {
        warn!(session = %session_id, error = %err, "failed to delete session");
        return Err(err.into());
    }
    Ok(Json(SuccessBody::OK))
}

/// GET /health
pub async fn health_check(State(gateway): State<SignalingGateway>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok".to_string(),
        backend: gateway.store().backend_name().to_string(),
    })
}
