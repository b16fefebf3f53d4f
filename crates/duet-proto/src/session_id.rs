use rand::Rng;
use thiserror::Error;
use url::Url;

/// Longest session identifier the relay accepts.
pub const MAX_SESSION_ID_LEN: usize = 50;

/// Query parameter carrying the session identifier in a share link.
pub const SHARE_QUERY_PARAM: &str = "room";

const GENERATED_ID_LEN: usize = 13;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionIdError {
    #[error("session id is empty")]
    Empty,
    #[error("session id exceeds {MAX_SESSION_ID_LEN} characters")]
    TooLong,
    #[error("session id contains invalid character {0:?}")]
    InvalidCharacter(char),
}

fn is_allowed(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_'
}

/// Lowercases `raw` and strips everything outside `[a-z0-9_-]`, keeping at
/// most [`MAX_SESSION_ID_LEN`] characters. May return an empty string.
pub fn normalize_session_id(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .filter(|c| is_allowed(*c))
        .take(MAX_SESSION_ID_LEN)
        .collect()
}

/// Reads a join reference: either a bare identifier or a share link, in
/// which case the `room` parameter is used. The result is normalized.
pub fn session_id_from_reference(reference: &str) -> String {
    let reference = reference.trim();
    match Url::parse(reference) {
        Ok(link) => link
            .query_pairs()
            .find(|(key, _)| key == SHARE_QUERY_PARAM)
            .map(|(_, value)| normalize_session_id(&value))
            .unwrap_or_default(),
        Err(_) => normalize_session_id(reference),
    }
}

/// Checks an identifier that is expected to be normalized already.
pub fn validate_session_id(id: &str) -> Result<(), SessionIdError> {
    if id.is_empty() {
        return Err(SessionIdError::Empty);
    }
    if id.chars().count() > MAX_SESSION_ID_LEN {
        return Err(SessionIdError::TooLong);
    }
    match id.chars().find(|c| !is_allowed(*c)) {
        Some(c) => Err(SessionIdError::InvalidCharacter(c)),
        None => Ok(()),
    }
}

/// Fresh random base-36 token.
pub fn generate_session_id() -> String {
    let mut rng = rand::thread_rng();
    (0..GENERATED_ID_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect()
}

/// Builds `<base>?room=<id>`, replacing any existing `room` parameter.
pub fn share_link(base: &Url, session_id: &str) -> Url {
    let mut link = base.clone();
    let retained: Vec<(String, String)> = base
        .query_pairs()
        .filter(|(key, _)| key != SHARE_QUERY_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    {
        let mut pairs = link.query_pairs_mut();
        pairs.clear();
        for (key, value) in &retained {
            pairs.append_pair(key, value);
        }
        pairs.append_pair(SHARE_QUERY_PARAM, session_id);
    }
    link
}
