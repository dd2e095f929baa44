//! Session export and import.
//!
//! Both run on a blocking thread and check their cancellation token between
//! steps. An export that is cancelled after its file landed reports the file
//! as partial; the caller decides when to remove it.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parley_core::{Session, SessionMeta};
use parley_logging::{parley_debug, parley_info};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::persist::ensure_dir;
use crate::session_store::{SessionStore, StoreError};

#[derive(Debug, Error)]
pub enum TransferError {
    /// Cancellation was observed. `partial` names a file this run created.
    #[error("cancelled")]
    Cancelled { partial: Option<PathBuf> },
    #[error("{} already exists", .0.display())]
    Exists(PathBuf),
    #[error("invalid session file: {0}")]
    Invalid(String),
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn checkpoint(token: &CancellationToken) -> Result<(), TransferError> {
    if token.is_cancelled() {
        return Err(TransferError::Cancelled { partial: None });
    }
    Ok(())
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> TransferError + '_ {
    move |source| TransferError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Writes session `id` as pretty JSON to `path`. Never overwrites.
pub fn export_session(
    store: &dyn SessionStore,
    id: &str,
    path: &Path,
    token: &CancellationToken,
) -> Result<PathBuf, TransferError> {
    checkpoint(token)?;
    let session = store.read(id)?;

    checkpoint(token)?;
    let content = serde_json::to_string_pretty(&session)
        .map_err(|err| TransferError::Invalid(err.to_string()))?;

    checkpoint(token)?;
    if path.exists() {
        return Err(TransferError::Exists(path.to_path_buf()));
    }
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    ensure_dir(&dir).map_err(|err| TransferError::Io {
        path: dir.clone(),
        source: io::Error::other(err.to_string()),
    })?;

    checkpoint(token)?;
    let mut tmp = NamedTempFile::new_in(&dir).map_err(io_error(&dir))?;
    tmp.write_all(content.as_bytes()).map_err(io_error(path))?;
    tmp.as_file_mut().sync_all().map_err(io_error(path))?;
    tmp.persist_noclobber(path)
        .map_err(|err| match err.error.kind() {
            io::ErrorKind::AlreadyExists => TransferError::Exists(path.to_path_buf()),
            _ => TransferError::Io {
                path: path.to_path_buf(),
                source: err.error,
            },
        })?;

    if token.is_cancelled() {
        parley_debug!("Export of '{}' cancelled after writing {:?}", id, path);
        return Err(TransferError::Cancelled {
            partial: Some(path.to_path_buf()),
        });
    }
    parley_info!("Exported session '{}' to {:?}", id, path);
    Ok(path.to_path_buf())
}

/// Reads an exported session from `path` and stores it under a fresh id.
pub fn import_session(
    store: &dyn SessionStore,
    path: &Path,
    now: DateTime<Utc>,
    token: &CancellationToken,
) -> Result<SessionMeta, TransferError> {
    checkpoint(token)?;
    let content = fs::read_to_string(path).map_err(io_error(path))?;

    checkpoint(token)?;
    let session: Session =
        serde_json::from_str(&content).map_err(|err| TransferError::Invalid(err.to_string()))?;
    if session.name.trim().is_empty() {
        return Err(TransferError::Invalid("missing name".to_string()));
    }
    if session.messages.is_empty() {
        return Err(TransferError::Invalid("no messages".to_string()));
    }

    checkpoint(token)?;
    let meta = store.import(session, now)?;
    parley_info!("Imported {:?} as session '{}'", path, meta.id);
    Ok(meta)
}

/// Deletes a file left behind by a cancelled export. A missing file is fine.
pub fn remove_partial(path: &Path) -> Result<(), TransferError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(TransferError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
