use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use directories::BaseDirs;
use duet_proto::{generate_session_id, normalize_session_id};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::error::{CallError, MSG_NO_ROOM};

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("unable to determine home directory")]
    NoHome,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize session file: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Remembers the last session id this client used, so a bare "start"
/// reopens the same room.
pub trait SessionIdStore: Send + Sync {
    fn remembered(&self) -> Option<String>;
    fn remember(&self, session_id: &str) -> Result<(), IdentityError>;
}

#[derive(Debug, Default)]
pub struct MemorySessionIdStore {
    last: Mutex<Option<String>>,
}

impl MemorySessionIdStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_remembered(session_id: impl Into<String>) -> Self {
        Self {
            last: Mutex::new(Some(session_id.into())),
        }
    }
}

impl SessionIdStore for MemorySessionIdStore {
    fn remembered(&self) -> Option<String> {
        self.last.lock().clone()
    }

    fn remember(&self, session_id: &str) -> Result<(), IdentityError> {
        *self.last.lock() = Some(session_id.to_string());
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_session_id: Option<String>,
}

/// Keeps the remembered id in `~/.duet/session.toml`.
#[derive(Debug, Clone)]
pub struct FileSessionIdStore {
    path: PathBuf,
}

impl FileSessionIdStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_location() -> Result<Self, IdentityError> {
        let base = BaseDirs::new().ok_or(IdentityError::NoHome)?;
        Ok(Self::new(base.home_dir().join(".duet").join("session.toml")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<SessionFile, IdentityError> {
        if !self.path.exists() {
            return Ok(SessionFile::default());
        }
        let raw = fs::read_to_string(&self.path)?;
        toml::from_str(&raw).map_err(|source| IdentityError::Parse {
            path: self.path.clone(),
            source,
        })
    }
}

impl SessionIdStore for FileSessionIdStore {
    fn remembered(&self) -> Option<String> {
        match self.load() {
            Ok(file) => file.last_session_id.filter(|id| !id.is_empty()),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "ignoring unreadable session file");
                None
            }
        }
    }

    fn remember(&self, session_id: &str) -> Result<(), IdentityError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = SessionFile {
            last_session_id: Some(session_id.to_string()),
        };
        fs::write(&self.path, toml::to_string_pretty(&file)?)?;
        Ok(())
    }
}

/// Picks the id for a new call: the normalized request, else the
/// remembered id, else a fresh one. The choice is remembered.
pub fn resolve_session_id(
    requested: Option<&str>,
    store: &dyn SessionIdStore,
) -> Result<String, CallError> {
    let requested = requested.map(str::trim).filter(|raw| !raw.is_empty());
    let session_id = match requested {
        Some(raw) => {
            let normalized = normalize_session_id(raw);
            if normalized.is_empty() {
                return Err(CallError::Validation(MSG_NO_ROOM.to_string()));
            }
            normalized
        }
        None => store
            .remembered()
            .map(|id| normalize_session_id(&id))
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_session_id),
    };
    if let Err(err) = store.remember(&session_id) {
        warn!(error = %err, "failed to remember session id");
    }
    Ok(session_id)
}
