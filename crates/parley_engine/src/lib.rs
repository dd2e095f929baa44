//! Parley engine: effect scheduling and the services effects run against.
mod environment;
mod lock;
mod persist;
mod plugin;
mod plugin_config;
mod provider;
mod scheduler;
mod session_store;
mod transfer;

pub use environment::{
    DataDirPointer, Environment, EnvironmentLoader, PointerError, ValidationError,
    INSTANCE_LOCK_FILE, SESSIONS_DIR,
};
pub use lock::{LockError, LockGuard};
pub use persist::{ensure_dir, AtomicFileWriter, PersistError};
pub use plugin::{
    PluginError, PluginInfra, PluginManager, ProcessPluginManager, StartProgressSink,
    PLUGINS_DIR, SESSION_ENV,
};
pub use plugin_config::{
    passphrase_digest, ConfigError, PassphraseCheck, PluginConfigStore, PluginEntry,
    PluginRegistry, PluginSpec, PluginsConfig, UserConfig, PLUGINS_CONFIG_FILE, REGISTRY_FILE,
    USER_CONFIG_FILE,
};
pub use provider::{ChatProvider, EchoProvider, ProviderError};
pub use scheduler::{
    progress_channel, CancelHandle, ProgressSender, ProgressStream, Resolution, Scheduler,
};
pub use session_store::{FsSessionStore, SessionStore, StoreError};
pub use transfer::{export_session, import_session, remove_partial, TransferError};

/// Lock file helpers, exposed for tools that inspect session locks.
pub mod locks {
    pub use crate::lock::{acquire, holder, release};
}
