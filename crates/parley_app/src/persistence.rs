//! Machine-wide settings in `system.ron`.
//!
//! Holds the durable pointer to the active data directory, the last active
//! session per data directory, logging options and core setting overrides.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use parley_core::{CoreSettings, SessionId};
use parley_engine::{AtomicFileWriter, DataDirPointer, PointerError};
use parley_logging::{parley_info, parley_warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SYSTEM_CONFIG_FILE: &str = "system.ron";
pub const CONFIG_DIR_ENV: &str = "PARLEY_CONFIG_DIR";
pub const DATA_DIR_ENV: &str = "PARLEY_DATA_DIR";

#[derive(Debug, Error)]
pub enum SystemConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: ron::error::SpannedError,
    },
    #[error("failed to serialize system config: {0}")]
    Serialize(#[from] ron::Error),
    #[error(transparent)]
    Persist(#[from] parley_engine::PersistError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LogOutput {
    #[default]
    File,
    Terminal,
    Both,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Active data directory. `None` means the default location.
    pub data_dir: Option<PathBuf>,
    pub log_output: LogOutput,
    pub log_level: String,
    pub settings: CoreSettings,
    /// Last active session per data directory, used to resume after restart.
    pub active_sessions: BTreeMap<PathBuf, SessionId>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            log_output: LogOutput::File,
            log_level: "info".to_string(),
            settings: CoreSettings::default(),
            active_sessions: BTreeMap::new(),
        }
    }
}

/// `$PARLEY_CONFIG_DIR`, else `$HOME/.config/parley`.
pub fn config_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
        return PathBuf::from(dir);
    }
    home_dir().join(".config").join("parley")
}

/// `$HOME/.local/share/parley`.
pub fn default_data_dir() -> PathBuf {
    home_dir().join(".local").join("share").join("parley")
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Loads `system.ron` from `dir`; a missing file yields defaults.
pub fn load_system_config(dir: &Path) -> Result<SystemConfig, SystemConfigError> {
    let path = dir.join(SYSTEM_CONFIG_FILE);
    let content = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(SystemConfig::default()),
        Err(source) => return Err(SystemConfigError::Read { path, source }),
    };
    let config = ron::from_str(&content).map_err(|source| SystemConfigError::Parse {
        path: path.clone(),
        source,
    })?;
    parley_info!("Loaded system config from {:?}", path);
    Ok(config)
}

pub fn save_system_config(dir: &Path, config: &SystemConfig) -> Result<(), SystemConfigError> {
    let pretty = ron::ser::PrettyConfig::new();
    let content = ron::ser::to_string_pretty(config, pretty)?;
    AtomicFileWriter::new(dir.to_path_buf()).write(SYSTEM_CONFIG_FILE, &content)?;
    Ok(())
}

/// Shared, write-through view of `system.ron`.
#[derive(Debug)]
pub struct SystemConfigStore {
    dir: PathBuf,
    config: Mutex<SystemConfig>,
    data_dir_override: Mutex<Option<PathBuf>>,
}

impl SystemConfigStore {
    pub fn open(dir: PathBuf) -> Result<Self, SystemConfigError> {
        let config = load_system_config(&dir)?;
        Ok(Self {
            dir,
            config: Mutex::new(config),
            data_dir_override: Mutex::new(std::env::var_os(DATA_DIR_ENV).map(PathBuf::from)),
        })
    }

    #[cfg(test)]
    pub fn with_config(dir: PathBuf, config: SystemConfig) -> Self {
        Self {
            dir,
            config: Mutex::new(config),
            data_dir_override: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SystemConfig> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> SystemConfig {
        self.lock().clone()
    }

    /// The directory the app should open: the environment override wins until
    /// the user switches away from it.
    pub fn active_data_dir(&self) -> PathBuf {
        let data_dir_override = self
            .data_dir_override
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        data_dir_override
            .or_else(|| self.lock().data_dir.clone())
            .unwrap_or_else(default_data_dir)
    }

    pub fn active_session(&self, data_dir: &Path) -> Option<SessionId> {
        self.lock().active_sessions.get(data_dir).cloned()
    }

    pub fn set_active_session(
        &self,
        data_dir: &Path,
        session_id: Option<SessionId>,
    ) -> Result<(), SystemConfigError> {
        let mut config = self.lock();
        let changed = match session_id {
            Some(id) => config.active_sessions.insert(data_dir.to_path_buf(), id.clone()) != Some(id),
            None => config.active_sessions.remove(data_dir).is_some(),
        };
        if changed {
            save_system_config(&self.dir, &config)?;
        }
        Ok(())
    }

    fn set_data_dir(&self, dir: &Path) -> Result<(), SystemConfigError> {
        let mut config = self.lock();
        config.data_dir = Some(dir.to_path_buf());
        save_system_config(&self.dir, &config)
    }
}

impl DataDirPointer for SystemConfigStore {
    fn get(&self) -> Result<PathBuf, PointerError> {
        Ok(self.active_data_dir())
    }

    fn set(&self, dir: &Path) -> Result<(), PointerError> {
        let mut data_dir_override = self
            .data_dir_override
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if data_dir_override.take().is_some() {
            parley_warn!("{} no longer names the active data directory", DATA_DIR_ENV);
        }
        self.set_data_dir(dir)
            .map_err(|err| PointerError(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let temp = TempDir::new().unwrap();
        let config = load_system_config(temp.path()).unwrap();
        assert_eq!(config, SystemConfig::default());
    }

    #[test]
    fn pointer_changes_are_written_through() {
        let temp = TempDir::new().unwrap();
        let store = SystemConfigStore::with_config(temp.path().to_path_buf(), SystemConfig::default());
        let target = temp.path().join("work");

        store.set(&target).unwrap();
        store
            .set_active_session(&target, Some("s1".to_string()))
            .unwrap();

        let reloaded = load_system_config(temp.path()).unwrap();
        assert_eq!(reloaded.data_dir, Some(target.clone()));
        assert_eq!(reloaded.active_sessions.get(&target), Some(&"s1".to_string()));
        assert_eq!(store.get().unwrap(), target);
    }

    #[test]
    fn clearing_the_active_session_removes_it() {
        let temp = TempDir::new().unwrap();
        let store = SystemConfigStore::with_config(temp.path().to_path_buf(), SystemConfig::default());
        let dir = temp.path().join("data");
        store.set_active_session(&dir, Some("s1".to_string())).unwrap();
        store.set_active_session(&dir, None).unwrap();
        assert_eq!(store.active_session(&dir), None);
        assert!(load_system_config(temp.path()).unwrap().active_sessions.is_empty());
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(SYSTEM_CONFIG_FILE), "(data_dir: [").unwrap();
        assert!(matches!(
            load_system_config(temp.path()),
            Err(SystemConfigError::Parse { .. })
        ));
    }
}
