//! Host-local PID lock files.
//!
//! A lock file holds the PID of its owner. A lock whose owner is no longer
//! running is stale and may be taken over.

use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use parley_logging::{parley_debug, parley_warn};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("{} is held by process {pid}", path.display())]
    Held { path: PathBuf, pid: u32 },
    #[error("lock file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LockError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Takes the lock at `path` for `pid`. Re-acquiring a lock already owned by
/// `pid` succeeds.
pub fn acquire(path: &Path, pid: u32) -> Result<(), LockError> {
    for _ in 0..2 {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                write!(file, "{pid}").map_err(|err| LockError::io(path, err))?;
                file.sync_all().map_err(|err| LockError::io(path, err))?;
                parley_debug!("Acquired lock {:?}", path);
                return Ok(());
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => match holder(path)? {
                Some(owner) if owner == pid => return Ok(()),
                Some(owner) => {
                    return Err(LockError::Held {
                        path: path.to_path_buf(),
                        pid: owner,
                    })
                }
                None => {
                    parley_warn!("Removing stale lock {:?}", path);
                    remove_if_exists(path)?;
                }
            },
            Err(err) => return Err(LockError::io(path, err)),
        }
    }
    Err(LockError::io(path, io::Error::other("lock file keeps reappearing")))
}

/// Removes the lock at `path` if `pid` owns it (or nobody live does).
pub fn release(path: &Path, pid: u32) -> Result<(), LockError> {
    match holder(path)? {
        Some(owner) if owner != pid => Err(LockError::Held {
            path: path.to_path_buf(),
            pid: owner,
        }),
        _ => remove_if_exists(path),
    }
}

/// PID of the live owner of the lock at `path`, if any.
pub fn holder(path: &Path) -> Result<Option<u32>, LockError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(LockError::io(path, err)),
    };
    match content.trim().parse::<u32>() {
        Ok(pid) if process_alive(pid) => Ok(Some(pid)),
        Ok(_) => Ok(None),
        Err(_) => {
            parley_warn!("Ignoring unreadable lock file {:?}", path);
            Ok(None)
        }
    }
}

fn remove_if_exists(path: &Path) -> Result<(), LockError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(LockError::io(path, err)),
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    pid == std::process::id() || Path::new("/proc").join(pid.to_string()).exists()
}

// Without a cheap liveness check every recorded owner counts as alive.
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Lock held for as long as the value lives.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    pid: u32,
}

impl LockGuard {
    pub fn acquire(path: PathBuf, pid: u32) -> Result<Self, LockError> {
        acquire(&path, pid)?;
        Ok(Self { path, pid })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = release(&self.path, self.pid) {
            parley_warn!("Failed to release lock {:?}: {}", self.path, err);
        }
    }
}
