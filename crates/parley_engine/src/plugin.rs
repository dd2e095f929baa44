//! Plugin tool servers as child processes.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::join_all;
use parley_core::{PluginId, SessionRef, StartProgress};
use parley_logging::{parley_debug, parley_info, parley_warn};
use thiserror::Error;
use tokio::process::{Child, Command};

use crate::persist::{ensure_dir, PersistError};
use crate::plugin_config::{ConfigError, PluginConfigStore, PluginRegistry, PluginSpec};
use crate::scheduler::ProgressSender;

pub const PLUGINS_DIR: &str = "plugins";
pub const SESSION_ENV: &str = "PARLEY_SESSION_ID";

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin '{0}' is not installed")]
    NotInstalled(PluginId),
    #[error("failed to spawn plugin '{id}': {source}")]
    Spawn {
        id: PluginId,
        #[source]
        source: io::Error,
    },
    #[error("plugin '{id}' did not exit cleanly: {source}")]
    Stop {
        id: PluginId,
        #[source]
        source: io::Error,
    },
    #[error("plugin system is not running")]
    Unavailable,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// Receives per-plugin start progress.
pub trait StartProgressSink: Send + Sync {
    fn emit(&self, progress: StartProgress);
}

impl StartProgressSink for ProgressSender<StartProgress> {
    fn emit(&self, progress: StartProgress) {
        if !self.send(progress) {
            parley_debug!("Start progress dropped: nobody is listening");
        }
    }
}

#[async_trait::async_trait]
pub trait PluginManager: Send + Sync {
    /// Starts every enabled plugin, reporting `Started`/`Failed` per plugin and
    /// a final `Complete`.
    async fn start_all_enabled(&self, sink: &dyn StartProgressSink) -> Result<(), PluginError>;
    /// Asks every running plugin to exit and waits for it. Plugins that exit are
    /// no longer listed by `active_plugins`.
    async fn shutdown(&self) -> Result<(), PluginError>;
    async fn start_plugin(&self, plugin_id: &str) -> Result<(), PluginError>;
    async fn stop_plugin(&self, plugin_id: &str) -> Result<(), PluginError>;
    fn set_session(&self, session: Option<SessionRef>);
    fn session(&self) -> Option<SessionRef>;
    /// Display names of plugins still running.
    fn active_plugins(&self) -> Vec<String>;
    /// Kills whatever is still running without waiting.
    fn abandon(&self);
}

struct RunningPlugin {
    name: String,
    child: Arc<tokio::sync::Mutex<Child>>,
}

pub struct ProcessPluginManager {
    registry: PluginRegistry,
    config: PluginConfigStore,
    running: Mutex<BTreeMap<PluginId, RunningPlugin>>,
    session: Mutex<Option<SessionRef>>,
}

impl ProcessPluginManager {
    pub fn new(registry: PluginRegistry, config: PluginConfigStore) -> Self {
        Self {
            registry,
            config,
            running: Mutex::new(BTreeMap::new()),
            session: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, BTreeMap<PluginId, RunningPlugin>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn(&self, spec: &PluginSpec) -> Result<(), PluginError> {
        if self.running().contains_key(&spec.id) {
            return Ok(());
        }

        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(session) = self.session() {
            command.env(SESSION_ENV, &session.id);
        }
        let child = command.spawn().map_err(|source| PluginError::Spawn {
            id: spec.id.clone(),
            source,
        })?;
        parley_info!("Started plugin '{}' pid={:?}", spec.id, child.id());

        self.running().insert(
            spec.id.clone(),
            RunningPlugin {
                name: spec.name.clone(),
                child: Arc::new(tokio::sync::Mutex::new(child)),
            },
        );
        Ok(())
    }

    /// Closes stdin (the exit request) and waits for the process to go away.
    async fn stop_one(&self, plugin_id: &str) -> Result<(), PluginError> {
        let Some(child) = self
            .running()
            .get(plugin_id)
            .map(|plugin| Arc::clone(&plugin.child))
        else {
            return Ok(());
        };

        {
            let mut child = child.lock().await;
            drop(child.stdin.take());
            child.wait().await.map_err(|source| PluginError::Stop {
                id: plugin_id.to_string(),
                source,
            })?;
        }
        self.running().remove(plugin_id);
        parley_debug!("Plugin '{}' exited", plugin_id);
        Ok(())
    }
}

#[async_trait::async_trait]
impl PluginManager for ProcessPluginManager {
    async fn start_all_enabled(&self, sink: &dyn StartProgressSink) -> Result<(), PluginError> {
        let enabled = self.config.enabled_plugins()?;
        let mut failures = BTreeMap::new();

        for plugin_id in enabled {
            let result = match self.registry.get(&plugin_id) {
                Some(spec) => self.spawn(spec),
                None => Err(PluginError::NotInstalled(plugin_id.clone())),
            };
            match result {
                Ok(()) => sink.emit(StartProgress::Started {
                    plugin: plugin_id.clone(),
                }),
                Err(err) => {
                    parley_warn!("Plugin '{}' failed to start: {}", plugin_id, err);
                    sink.emit(StartProgress::Failed {
                        plugin: plugin_id.clone(),
                        error: err.to_string(),
                    });
                    failures.insert(plugin_id, err.to_string());
                }
            }
        }

        sink.emit(StartProgress::Complete { failures });
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), PluginError> {
        let ids: Vec<PluginId> = self.running().keys().cloned().collect();
        parley_info!("Shutting down {} plugins", ids.len());

        let results = join_all(ids.iter().map(|id| self.stop_one(id))).await;
        match results.into_iter().find_map(Result::err) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn start_plugin(&self, plugin_id: &str) -> Result<(), PluginError> {
        let spec = self
            .registry
            .get(plugin_id)
            .ok_or_else(|| PluginError::NotInstalled(plugin_id.to_string()))?;
        self.spawn(spec)
    }

    async fn stop_plugin(&self, plugin_id: &str) -> Result<(), PluginError> {
        self.stop_one(plugin_id).await
    }

    fn set_session(&self, session: Option<SessionRef>) {
        parley_debug!(
            "Plugin manager bound to session {:?}",
            session.as_ref().map(|s| s.id.as_str())
        );
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = session;
    }

    fn session(&self) -> Option<SessionRef> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn active_plugins(&self) -> Vec<String> {
        self.running()
            .values()
            .map(|plugin| plugin.name.clone())
            .collect()
    }

    fn abandon(&self) {
        let abandoned = std::mem::take(&mut *self.running());
        for (id, plugin) in abandoned {
            match plugin.child.try_lock() {
                Ok(mut child) => {
                    if let Err(err) = child.start_kill() {
                        parley_debug!("Kill of plugin '{}' failed: {}", id, err);
                    }
                }
                // Still held by a dropped wait; kill_on_drop reaps it with the last handle.
                Err(_) => parley_debug!("Plugin '{}' busy; relying on kill_on_drop", id),
            }
            parley_warn!("Abandoned plugin '{}'", id);
        }
    }
}

/// Registry, config and manager factory for one data directory.
#[derive(Debug, Clone)]
pub struct PluginInfra {
    plugins_dir: PathBuf,
    registry: PluginRegistry,
    config: PluginConfigStore,
}

impl PluginInfra {
    pub fn open(data_dir: &Path) -> Result<Self, PluginError> {
        let plugins_dir = data_dir.join(PLUGINS_DIR);
        ensure_dir(&plugins_dir)?;
        Ok(Self {
            plugins_dir,
            registry: PluginRegistry::load(data_dir)?,
            config: PluginConfigStore::open(data_dir)?,
        })
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    pub fn manager(&self) -> Arc<dyn PluginManager> {
        Arc::new(ProcessPluginManager::new(
            self.registry.clone(),
            self.config.clone(),
        ))
    }
}
