//! Opening and validating a data directory.
//!
//! `EnvironmentLoader::validate` moves the durable active-directory pointer to
//! the target, opens every storage component in turn, and puts the pointer
//! back if any of them fails.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parley_core::{EnvironmentSummary, Secret, ValidationFailure, ValidationStage};
use parley_logging::{parley_error, parley_info, parley_warn};
use thiserror::Error;

use crate::lock::LockGuard;
use crate::persist::ensure_dir;
use crate::plugin::PLUGINS_DIR;
use crate::plugin_config::{PassphraseCheck, PluginConfigStore, PluginRegistry, UserConfig};
use crate::provider::{ChatProvider, EchoProvider};
use crate::session_store::{FsSessionStore, SessionStore};

pub const SESSIONS_DIR: &str = "sessions";
pub const INSTANCE_LOCK_FILE: &str = "parley.lock";

#[derive(Debug, Error)]
#[error("data directory pointer: {0}")]
pub struct PointerError(pub String);

/// Durable record of the active data directory.
pub trait DataDirPointer: Send + Sync {
    fn get(&self) -> Result<PathBuf, PointerError>;
    fn set(&self, dir: &Path) -> Result<(), PointerError>;
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("a passphrase is required")]
    PassphraseRequired,
    #[error("incorrect passphrase")]
    WrongPassphrase,
    #[error("{stage}: {message}")]
    Stage {
        stage: ValidationStage,
        message: String,
    },
    #[error(transparent)]
    Pointer(#[from] PointerError),
}

impl ValidationError {
    fn stage(stage: ValidationStage, err: impl ToString) -> Self {
        Self::Stage {
            stage,
            message: err.to_string(),
        }
    }

    pub fn to_failure(&self) -> ValidationFailure {
        match self {
            ValidationError::PassphraseRequired => ValidationFailure::PassphraseRequired,
            ValidationError::WrongPassphrase => ValidationFailure::WrongPassphrase,
            ValidationError::Stage { stage, message } => ValidationFailure::Invalid {
                stage: *stage,
                message: message.clone(),
            },
            ValidationError::Pointer(err) => ValidationFailure::Invalid {
                stage: ValidationStage::UserConfig,
                message: err.to_string(),
            },
        }
    }
}

/// Services opened for one data directory. Dropping it releases the instance lock.
pub struct Environment {
    pub data_dir: PathBuf,
    pub user_config: UserConfig,
    pub sessions: Arc<dyn SessionStore>,
    pub plugin_config: PluginConfigStore,
    pub provider: Arc<dyn ChatProvider>,
    instance_lock: LockGuard,
}

impl Environment {
    pub fn summary(&self) -> EnvironmentSummary {
        EnvironmentSummary {
            data_dir: self.data_dir.clone(),
            default_model: self.user_config.default_model.clone(),
            plugins_enabled: self.user_config.plugins_enabled,
            enabled_plugins: self.plugin_config.enabled_plugins().unwrap_or_else(|err| {
                parley_warn!("Reading enabled plugins failed: {}", err);
                Default::default()
            }),
            last_session: None,
        }
    }

    pub fn instance_lock_path(&self) -> &Path {
        self.instance_lock.path()
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("data_dir", &self.data_dir)
            .field("user_config", &self.user_config)
            .finish_non_exhaustive()
    }
}

pub struct EnvironmentLoader {
    pointer: Arc<dyn DataDirPointer>,
    pid: u32,
}

impl EnvironmentLoader {
    pub fn new(pointer: Arc<dyn DataDirPointer>, pid: u32) -> Self {
        Self { pointer, pid }
    }

    /// Opens the directory the pointer currently names. Used at startup.
    pub fn open_current(&self, passphrase: Option<&Secret>) -> Result<Environment, ValidationError> {
        let dir = self.pointer.get()?;
        open(&dir, passphrase, self.pid)
    }

    /// Points the durable pointer at `target` and opens it; on any failure the
    /// pointer is restored to its previous value.
    pub fn validate(&self, target: &Path, passphrase: Option<&Secret>) -> Result<Environment, ValidationError> {
        let previous = self.pointer.get()?;
        self.pointer.set(target)?;
        parley_info!("Validating data directory {:?} (previous {:?})", target, previous);

        let result = open(target, passphrase, self.pid);
        if let Err(err) = &result {
            parley_warn!("Validation of {:?} failed: {}; restoring pointer", target, err);
            if let Err(restore_err) = self.pointer.set(&previous) {
                parley_error!("Failed to restore data directory pointer: {}", restore_err);
            }
        }
        result
    }
}

fn open(dir: &Path, passphrase: Option<&Secret>, pid: u32) -> Result<Environment, ValidationError> {
    let sessions = FsSessionStore::open(dir.join(SESSIONS_DIR), pid)
        .map_err(|err| ValidationError::stage(ValidationStage::SessionStorage, err))?;
    ensure_dir(&dir.join(PLUGINS_DIR))
        .map_err(|err| ValidationError::stage(ValidationStage::PluginStorage, err))?;
    let plugin_config = PluginConfigStore::open(dir)
        .map_err(|err| ValidationError::stage(ValidationStage::PluginConfig, err))?;
    PluginRegistry::load(dir)
        .map_err(|err| ValidationError::stage(ValidationStage::PluginRegistry, err))?;
    let user_config = UserConfig::load(dir)
        .map_err(|err| ValidationError::stage(ValidationStage::UserConfig, err))?;

    match user_config.check_passphrase(passphrase) {
        PassphraseCheck::NotRequired | PassphraseCheck::Accepted => {}
        PassphraseCheck::Required => return Err(ValidationError::PassphraseRequired),
        PassphraseCheck::Rejected => return Err(ValidationError::WrongPassphrase),
    }

    let instance_lock = LockGuard::acquire(dir.join(INSTANCE_LOCK_FILE), pid)
        .map_err(|err| ValidationError::stage(ValidationStage::InstanceLock, err))?;

    let mut models = user_config.models.clone();
    if !models.contains(&user_config.default_model) {
        models.insert(0, user_config.default_model.clone());
    }
    let provider = EchoProvider::new(models).with_tool_models(user_config.tool_models.clone());

    parley_info!("Opened data directory {:?}", dir);
    Ok(Environment {
        data_dir: dir.to_path_buf(),
        user_config,
        sessions: Arc::new(sessions),
        plugin_config,
        provider: Arc::new(provider),
        instance_lock,
    })
}
