//! Shared protocol definitions for the Duet relay and call client.
//! Kept in a dedicated crate so the relay does not pull in the peer
//! connection stack and the client does not pull in the HTTP server.

pub mod api;
pub mod control;
pub mod description;
pub mod session_id;

pub use api::{
    AnswerBundle, CreateSessionRequest, ErrorBody, HealthStatus, OfferBundle,
    PublishAnswerRequest, SessionQuery, SuccessBody,
};
pub use control::{ControlMessage, MediaState};
pub use description::{CandidateInit, SdpKind, SessionDescription};
pub use session_id::{
    generate_session_id, normalize_session_id, session_id_from_reference, share_link,
    validate_session_id, SessionIdError, MAX_SESSION_ID_LEN, SHARE_QUERY_PARAM,
};
