use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parley_core::{ChatMessage, PluginId, Session, SessionId, SessionMeta};
use parley_logging::{parley_debug, parley_info, parley_warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lock::{self, LockError};
use crate::persist::{ensure_dir, AtomicFileWriter, PersistError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session '{0}' not found")]
    NotFound(SessionId),
    #[error("invalid session id {0:?}")]
    InvalidId(String),
    #[error("session '{id}' is locked by process {pid}")]
    Locked { id: SessionId, pid: u32 },
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error(transparent)]
    Lock(#[from] LockError),
}

pub trait SessionStore: Send + Sync {
    fn list(&self) -> Result<Vec<SessionMeta>, StoreError>;
    fn load(&self, id: &str) -> Result<Session, StoreError>;
    /// Reads a session without taking its lock.
    fn read(&self, id: &str) -> Result<Session, StoreError>;

    fn save(&self, id: &str, messages: &[ChatMessage], now: DateTime<Utc>) -> Result<(), StoreError>;
    /// Creates, saves and locks a new empty session.
    fn create(&self, now: DateTime<Utc>) -> Result<Session, StoreError>;
    /// Stores a copy of `session` under a fresh id. The copy is not locked.
    fn import(&self, session: Session, now: DateTime<Utc>) -> Result<SessionMeta, StoreError>;
    fn lock_session(&self, id: &str) -> Result<(), StoreError>;
    fn unlock_session(&self, id: &str) -> Result<(), StoreError>;
    /// PID of another live process holding the session, if any.
    fn check_lock(&self, id: &str) -> Result<Option<u32>, StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionFile {
    id: SessionId,
    name: String,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    enabled_plugins: Vec<PluginId>,
    #[serde(default)]
    messages: Vec<ChatMessage>,
}

impl From<SessionFile> for Session {
    fn from(file: SessionFile) -> Self {
        Session {
            id: file.id,
            name: file.name,
            enabled_plugins: file.enabled_plugins,
            messages: file.messages,
        }
    }
}

fn new_id(now: DateTime<Utc>) -> SessionId {
    now.format("%Y%m%d-%H%M%S%3f").to_string()
}

/// Session ids become file names inside the sessions directory, so they must
/// stay a single plain path component.
fn valid_id(id: &str) -> Result<&str, StoreError> {
    let plain = !id.is_empty() && !id.starts_with('.') && !id.contains(['/', '\\', '\0']);
    if plain {
        Ok(id)
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}

/// One JSON file per session plus a `<id>.lock` PID file while it is open.
#[derive(Debug, Clone)]
pub struct FsSessionStore {
    dir: PathBuf,
    writer: AtomicFileWriter,
    pid: u32,
}

impl FsSessionStore {
    pub fn open(dir: PathBuf, pid: u32) -> Result<Self, StoreError> {
        ensure_dir(&dir)?;
        Ok(Self {
            writer: AtomicFileWriter::new(dir.clone()),
            dir,
            pid,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        Ok(self.dir.join(format!("{}.json", valid_id(id)?)))
    }

    fn lock_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        Ok(self.dir.join(format!("{}.lock", valid_id(id)?)))
    }

    fn read_file(&self, id: &str) -> Result<SessionFile, StoreError> {
        let path = self.session_path(id)?;
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()))
            }
            Err(source) => return Err(StoreError::Read { path, source }),
        };
        serde_json::from_str(&content).map_err(|source| StoreError::Parse { path, source })
    }

    fn write_file(&self, file: &SessionFile) -> Result<(), StoreError> {
        self.writer
            .write_json(&format!("{}.json", valid_id(&file.id)?), file)
            .map(|_| ())
            .map_err(StoreError::from)
    }
}

impl SessionStore for FsSessionStore {
    fn list(&self) -> Result<Vec<SessionMeta>, StoreError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| StoreError::Read {
            path: self.dir.clone(),
            source,
        })?;

        let mut sessions = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match self.read_file(id) {
                Ok(file) => sessions.push(SessionMeta {
                    id: file.id,
                    name: file.name,
                    updated_at: file.updated_at,
                }),
                Err(err) => parley_warn!("Skipping unreadable session {:?}: {}", path, err),
            }
        }
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }

    fn load(&self, id: &str) -> Result<Session, StoreError> {
        self.lock_session(id)?;
        match self.read_file(id) {
            Ok(file) => {
                parley_info!("Loaded session '{}' ({} messages)", id, file.messages.len());
                Ok(file.into())
            }
            Err(err) => {
                if let Err(unlock_err) = self.unlock_session(id) {
                    parley_warn!("Failed to unlock '{}' after load error: {}", id, unlock_err);
                }
                Err(err)
            }
        }
    }

    fn read(&self, id: &str) -> Result<Session, StoreError> {
        self.read_file(id).map(Session::from)
    }

    fn save(&self, id: &str, messages: &[ChatMessage], now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut file = self.read_file(id)?;
        file.messages = messages.to_vec();
        file.updated_at = now;
        self.write_file(&file)?;
        parley_debug!("Saved session '{}' ({} messages)", id, messages.len());
        Ok(())
    }

    fn create(&self, now: DateTime<Utc>) -> Result<Session, StoreError> {
        let id = new_id(now);
        let file = SessionFile {
            id: id.clone(),
            name: format!("Chat {}", now.format("%Y-%m-%d %H:%M")),
            updated_at: now,
            enabled_plugins: Vec::new(),
            messages: Vec::new(),
        };
        self.write_file(&file)?;
        self.lock_session(&id)?;
        parley_info!("Created session '{}'", id);
        Ok(file.into())
    }

    fn import(&self, session: Session, now: DateTime<Utc>) -> Result<SessionMeta, StoreError> {
        let mut id = new_id(now);
        let mut suffix = 1;
        while self.session_path(&id)?.exists() {
            suffix += 1;
            id = format!("{}-{suffix}", new_id(now));
        }
        let file = SessionFile {
            id,
            name: session.name,
            updated_at: now,
            enabled_plugins: session.enabled_plugins,
            messages: session.messages,
        };
        self.write_file(&file)?;
        parley_info!("Imported session '{}' ({} messages)", file.id, file.messages.len());
        Ok(SessionMeta {
            id: file.id,
            name: file.name,
            updated_at: file.updated_at,
        })
    }

    fn lock_session(&self, id: &str) -> Result<(), StoreError> {
        lock::acquire(&self.lock_path(id)?, self.pid).map_err(|err| match err {
            LockError::Held { pid, .. } => StoreError::Locked {
                id: id.to_string(),
                pid,
            },
            other => StoreError::Lock(other),
        })
    }

    fn unlock_session(&self, id: &str) -> Result<(), StoreError> {
        lock::release(&self.lock_path(id)?, self.pid)?;
        parley_debug!("Released session lock '{}'", id);
        Ok(())
    }

    fn check_lock(&self, id: &str) -> Result<Option<u32>, StoreError> {
        let owner = lock::holder(&self.lock_path(id)?)?;
        Ok(owner.filter(|pid| *pid != self.pid))
    }
}
