//! Effect execution.
//!
//! The core returns effects as plain data; `EffectRunner` turns each one into
//! a scheduled task (or a quick synchronous call) against the services of the
//! active data directory. Every asynchronous effect reports back through
//! exactly one `Event`, which `absorb` turns into the next `Msg`. Storage
//! calls block, so they run on tokio's blocking pool.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parley_core::{
    ChatMessage, Effect, EffectKey, LoadFailure, Msg, PluginId, RequestId, Secret, SessionId,
    SessionRef, StartProgress, StopOutcome, StreamFailure, StreamFailureKind, TransferOutcome,
    ValidationStage,
};
use parley_engine::{
    export_session, import_session, progress_channel, remove_partial, Environment,
    EnvironmentLoader, PluginInfra, PluginManager, ProgressStream, Resolution, Scheduler,
    SessionStore, StoreError, TransferError, ValidationError,
};
use parley_logging::{parley_debug, parley_error, parley_info, parley_warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::persistence::SystemConfigStore;

/// Everything that reaches the dispatch loop, in arrival order.
#[derive(Debug)]
pub enum Event {
    /// A stdin line; `None` at end of input.
    Input(Option<String>),
    Clock(DateTime<Utc>),
    Msg(Msg),
    Validated {
        migration_id: u64,
        result: Result<Environment, ValidationError>,
    },
    /// One item of a start progress stream. The stream comes back with the
    /// item so the next `AwaitStartProgress` can keep reading it.
    StartProgress {
        attempt: u64,
        progress: StartProgress,
        stream: Option<ProgressStream<StartProgress>>,
    },
    /// The task driving `start_all_enabled` ended. Its outcome travels on the
    /// progress stream.
    StartSettled { attempt: u64 },
}

/// Whether the dispatch loop keeps running after a batch of effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct EffectRunner {
    scheduler: Scheduler<Event>,
    loader: Arc<EnvironmentLoader>,
    system: Arc<SystemConfigStore>,
    environment: Environment,
    /// Generation of `environment`, as numbered by the core.
    generation: u64,
    /// Session stores of directories switched away from, for late lock releases.
    retired: HashMap<u64, Arc<dyn SessionStore>>,
    staged: HashMap<u64, Environment>,
    plugin_infra: Option<PluginInfra>,
    plugins: Option<Arc<dyn PluginManager>>,
    bound_session: Option<SessionRef>,
    progress: HashMap<u64, ProgressStream<StartProgress>>,
}

impl EffectRunner {
    pub fn new(
        events: mpsc::UnboundedSender<Event>,
        loader: Arc<EnvironmentLoader>,
        system: Arc<SystemConfigStore>,
        environment: Environment,
    ) -> Self {
        Self {
            scheduler: Scheduler::new(events),
            loader,
            system,
            environment,
            generation: 0,
            retired: HashMap::new(),
            staged: HashMap::new(),
            plugin_infra: None,
            plugins: None,
            bound_session: None,
            progress: HashMap::new(),
        }
    }

    /// Executes effects in order. Stops at `Effect::Exit`.
    pub fn run(&mut self, effects: Vec<Effect>) -> Flow {
        for effect in effects {
            if self.execute(effect) == Flow::Exit {
                return Flow::Exit;
            }
        }
        Flow::Continue
    }

    /// Turns an event into the message the core should see next.
    pub fn absorb(&mut self, event: Event) -> Option<Msg> {
        match event {
            Event::Msg(msg) => Some(msg),
            Event::Clock(now) => Some(Msg::Tick { now }),
            Event::Input(_) => {
                parley_warn!("Input reached the effect runner; it belongs to the dispatch loop");
                None
            }
            Event::Validated {
                migration_id,
                result,
            } => {
                let result = match result {
                    Ok(environment) => {
                        let mut summary = environment.summary();
                        summary.last_session = self.system.active_session(&summary.data_dir);
                        self.staged.insert(migration_id, environment);
                        Ok(summary)
                    }
                    Err(err) => Err(err.to_failure()),
                };
                Some(Msg::EnvironmentValidated {
                    migration_id,
                    result,
                })
            }
            Event::StartProgress {
                attempt,
                progress,
                stream,
            } => {
                if let Some(stream) = stream.filter(|_| !progress.is_terminal()) {
                    self.progress.insert(attempt, stream);
                } else {
                    self.progress.remove(&attempt);
                }
                Some(Msg::PluginStartProgress { attempt, progress })
            }
            Event::StartSettled { attempt } => {
                parley_debug!("Plugin start task settled attempt={}", attempt);
                None
            }
        }
    }

    /// Cancels outstanding work and kills plugins that are still running.
    pub fn shutdown(&mut self) {
        self.scheduler.cancel_all();
        self.progress.clear();
        self.staged.clear();
        if let Some(manager) = self.plugins.take() {
            manager.abandon();
        }
    }

    fn execute(&mut self, effect: Effect) -> Flow {
        match effect {
            Effect::StreamResponse {
                request_id,
                model,
                messages,
                tools_enabled,
            } => self.stream_response(request_id, model, messages, tools_enabled),
            Effect::ScheduleDisplayTick { request_id, delay } => {
                self.schedule_display_tick(request_id, delay)
            }
            Effect::Cancel(key) => {
                if !self.scheduler.cancel(key) {
                    parley_debug!("Cancel {:?}: nothing in flight", key);
                }
            }
            Effect::SaveSession {
                session_id,
                messages,
            } => self.save_session(session_id, messages),
            Effect::StartAllPlugins { attempt, timeout } => self.start_all_plugins(attempt, timeout),
            Effect::AwaitStartProgress { attempt } => self.await_start_progress(attempt),
            Effect::StopAllPlugins { attempt, timeout } => self.stop_all_plugins(attempt, timeout),
            Effect::DestroyPluginManager { forced } => {
                if let Some(manager) = self.plugins.take() {
                    if forced {
                        manager.abandon();
                    }
                    parley_info!("Plugin manager destroyed (forced={})", forced);
                }
            }
            Effect::EnablePlugin {
                op_id,
                plugin_id,
                timeout,
            } => self.enable_plugin(op_id, plugin_id, timeout),
            Effect::DisablePlugin {
                op_id,
                plugin_id,
                timeout,
            } => self.disable_plugin(op_id, plugin_id, timeout),
            Effect::SavePluginFlag { plugin_id, enabled } => {
                if let Err(err) = self
                    .environment
                    .plugin_config
                    .set_plugin_enabled(&plugin_id, enabled)
                {
                    parley_error!("Saving plugin flag for '{}' failed: {}", plugin_id, err);
                }
            }
            Effect::SavePluginsEnabled(enabled) => {
                self.environment.user_config.plugins_enabled = enabled;
                if let Err(err) = self
                    .environment
                    .user_config
                    .save(&self.environment.data_dir)
                {
                    parley_error!("Saving plugins_enabled={} failed: {}", enabled, err);
                }
            }
            Effect::RefreshPluginConfig => {
                let config = self.environment.plugin_config.clone();
                self.spawn(None, None, async move {
                    Msg::PluginConfigRefreshed(
                        blocking(move || config.enabled_plugins().map_err(|err| err.to_string()))
                            .await
                            .and_then(|result| result),
                    )
                });
            }
            Effect::ValidateEnvironment {
                migration_id,
                target,
                passphrase,
            } => self.validate_environment(migration_id, target, passphrase),
            Effect::CommitEnvironment {
                migration_id,
                generation,
            } => self.commit_environment(migration_id, generation),
            Effect::RecreatePluginInfra { migration_id } => {
                let result = PluginInfra::open(&self.environment.data_dir);
                let result = match result {
                    Ok(infra) => {
                        self.plugin_infra = Some(infra);
                        Ok(())
                    }
                    Err(err) => Err(err.to_string()),
                };
                self.spawn(None, None, async move {
                    Msg::PluginInfraReady {
                        migration_id,
                        result,
                    }
                });
            }
            Effect::ListSessions { generation } => {
                let sessions = Arc::clone(&self.environment.sessions);
                self.spawn(None, None, async move {
                    let result = blocking(move || sessions.list().map_err(|err| err.to_string()))
                        .await
                        .and_then(|result| result);
                    Msg::SessionsListed { generation, result }
                });
            }
            Effect::RefreshModels { generation } => {
                let provider = Arc::clone(&self.environment.provider);
                self.spawn(None, None, async move {
                    let result = provider.list_models().await.map_err(|err| err.to_string());
                    Msg::ModelsRefreshed { generation, result }
                });
            }
            Effect::LoadSession {
                session_id,
                generation,
            } => {
                let sessions = Arc::clone(&self.environment.sessions);
                self.spawn(None, None, async move {
                    let result = match blocking(move || sessions.load(&session_id)).await {
                        Ok(Ok(session)) => Ok(session),
                        Ok(Err(StoreError::Locked { id, .. })) => {
                            Err(LoadFailure::Locked { session_id: id })
                        }
                        Ok(Err(other)) => Err(LoadFailure::Other(other.to_string())),
                        Err(err) => Err(LoadFailure::Other(err)),
                    };
                    Msg::SessionLoaded { generation, result }
                });
            }
            Effect::CreateSession { generation } => {
                let sessions = Arc::clone(&self.environment.sessions);
                self.spawn(None, None, async move {
                    let result =
                        blocking(move || sessions.create(Utc::now()).map_err(|err| err.to_string()))
                            .await
                            .and_then(|result| result);
                    Msg::SessionCreated { generation, result }
                });
            }
            Effect::ReleaseSessionLock {
                session_id,
                generation,
            } => self.release_session_lock(&session_id, generation),
            Effect::ExportSession {
                transfer_id,
                session_id,
                path,
            } => {
                let sessions = Arc::clone(&self.environment.sessions);
                self.transfer(transfer_id, move |token| {
                    export_session(sessions.as_ref(), &session_id, &path, &token)
                        .map(TransferOutcome::Exported)
                });
            }
            Effect::ImportSession { transfer_id, path } => {
                let sessions = Arc::clone(&self.environment.sessions);
                self.transfer(transfer_id, move |token| {
                    import_session(sessions.as_ref(), &path, Utc::now(), &token)
                        .map(TransferOutcome::Imported)
                });
            }
            Effect::RemovePartialExport { transfer_id, path } => {
                self.spawn(None, None, async move {
                    let removed =
                        blocking(move || remove_partial(&path).map_err(|err| err.to_string()))
                            .await
                            .and_then(|result| result);
                    if let Err(err) = removed {
                        parley_warn!("Removing partial export failed: {}", err);
                    }
                    Msg::PartialExportRemoved { transfer_id }
                });
            }
            Effect::BindSession(session) => {
                if let Some(manager) = &self.plugins {
                    manager.set_session(session.clone());
                }
                self.bound_session = session;
            }
            Effect::PersistActiveSession(session_id) => {
                if let Err(err) = self
                    .system
                    .set_active_session(&self.environment.data_dir, session_id)
                {
                    parley_warn!("Persisting active session failed: {}", err);
                }
            }
            Effect::Exit => return Flow::Exit,
        }
        Flow::Continue
    }

    /// Schedules a task that always yields a message; interrupted runs
    /// resolve to `Msg::NoOp`.
    fn spawn<F>(&self, key: Option<EffectKey>, timeout: Option<Duration>, work: F)
    where
        F: std::future::Future<Output = Msg> + Send + 'static,
    {
        self.scheduler.schedule(
            key,
            timeout,
            move |_| async move { Event::Msg(work.await) },
            |resolution| {
                parley_warn!("Effect task ended early: {:?}", resolution);
                Event::Msg(Msg::NoOp)
            },
        );
    }

    /// Runs an export or import on the blocking pool under `EffectKey::Transfer`.
    /// A cancellation is reported by the transfer itself once it notices.
    fn transfer<F>(&self, transfer_id: u64, work: F)
    where
        F: FnOnce(CancellationToken) -> Result<TransferOutcome, TransferError> + Send + 'static,
    {
        self.scheduler.schedule(
            Some(EffectKey::Transfer(transfer_id)),
            None,
            move |token| async move {
                let outcome = match tokio::task::spawn_blocking(move || work(token)).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(TransferError::Cancelled { partial })) => {
                        TransferOutcome::Cancelled { partial }
                    }
                    Ok(Err(err)) => TransferOutcome::Failed(err.to_string()),
                    Err(err) => TransferOutcome::Failed(format!("transfer task failed: {err}")),
                };
                Event::Msg(Msg::TransferFinished {
                    transfer_id,
                    outcome,
                })
            },
            move |resolution| {
                Event::Msg(Msg::TransferFinished {
                    transfer_id,
                    outcome: TransferOutcome::Failed(format!("transfer {resolution:?}")),
                })
            },
        );
    }

    fn release_session_lock(&self, session_id: &str, generation: u64) {
        let store = if generation == self.generation {
            Some(&self.environment.sessions)
        } else {
            self.retired.get(&generation)
        };
        let Some(store) = store else {
            parley_warn!(
                "No session store for generation {}; '{}' stays locked",
                generation,
                session_id
            );
            return;
        };
        if let Err(err) = store.unlock_session(session_id) {
            parley_warn!("Releasing session lock '{}' failed: {}", session_id, err);
        }
    }

    fn stream_response(
        &mut self,
        request_id: RequestId,
        model: String,
        messages: Vec<ChatMessage>,
        tools_enabled: bool,
    ) {
        let provider = Arc::clone(&self.environment.provider);
        parley_info!(
            "Streaming request_id={} model={} tools={}",
            request_id,
            model,
            tools_enabled
        );
        self.scheduler.schedule(
            Some(EffectKey::Stream(request_id)),
            None,
            move |token| async move {
                let result = provider
                    .stream(&model, &messages, tools_enabled, &token)
                    .await
                    .map_err(|err| err.to_failure());
                Event::Msg(Msg::StreamCollected { request_id, result })
            },
            move |resolution| {
                let failure = match resolution {
                    Resolution::Cancelled => StreamFailure::cancelled(),
                    Resolution::TimedOut => {
                        StreamFailure::new(StreamFailureKind::Timeout, "provider timed out")
                    }
                    Resolution::Panicked => {
                        StreamFailure::new(StreamFailureKind::Provider, "provider task panicked")
                    }
                };
                Event::Msg(Msg::StreamCollected {
                    request_id,
                    result: Err(failure),
                })
            },
        );
    }

    fn schedule_display_tick(&mut self, request_id: RequestId, delay: Duration) {
        self.scheduler.schedule(
            Some(EffectKey::DisplayTick(request_id)),
            None,
            move |token| async move {
                tokio::select! {
                    _ = token.cancelled() => Event::Msg(Msg::NoOp),
                    _ = tokio::time::sleep(delay) => Event::Msg(Msg::DisplayTick { request_id }),
                }
            },
            |_| Event::Msg(Msg::NoOp),
        );
    }

    fn save_session(&mut self, session_id: SessionId, messages: Vec<ChatMessage>) {
        let sessions = Arc::clone(&self.environment.sessions);
        self.spawn(None, None, async move {
            Msg::SessionSaved(
                blocking(move || {
                    sessions
                        .save(&session_id, &messages, Utc::now())
                        .map_err(|err| err.to_string())
                })
                .await
                .and_then(|result| result),
            )
        });
    }

    fn plugin_infra(&mut self) -> Result<&PluginInfra, String> {
        if self.plugin_infra.is_none() {
            let infra = PluginInfra::open(&self.environment.data_dir).map_err(|err| err.to_string())?;
            parley_debug!("Plugin infrastructure opened at {:?}", infra.plugins_dir());
            self.plugin_infra = Some(infra);
        }
        self.plugin_infra
            .as_ref()
            .ok_or_else(|| "plugin infrastructure unavailable".to_string())
    }

    /// The live plugin manager, created on first use.
    fn plugin_manager(&mut self) -> Result<Arc<dyn PluginManager>, String> {
        if let Some(manager) = &self.plugins {
            return Ok(Arc::clone(manager));
        }
        let manager = self.plugin_infra()?.manager();
        manager.set_session(self.bound_session.clone());
        self.plugins = Some(Arc::clone(&manager));
        Ok(manager)
    }

    fn start_all_plugins(&mut self, attempt: u64, timeout: Duration) {
        let (tx, stream) = progress_channel();
        self.progress.insert(attempt, stream);

        let manager = match self.plugin_manager() {
            Ok(manager) => manager,
            Err(err) => {
                parley_error!("Cannot start plugins: {}", err);
                tx.send(StartProgress::Error(err));
                return;
            }
        };

        let settle_tx = tx.clone();
        self.scheduler.schedule(
            Some(EffectKey::StartPlugins(attempt)),
            Some(timeout),
            move |_| async move {
                if let Err(err) = manager.start_all_enabled(&tx).await {
                    tx.send(StartProgress::Error(err.to_string()));
                }
                Event::StartSettled { attempt }
            },
            move |resolution| {
                let message = match resolution {
                    Resolution::TimedOut => format!("plugins did not start within {timeout:?}"),
                    Resolution::Panicked => "plugin start panicked".to_string(),
                    Resolution::Cancelled => "plugin start cancelled".to_string(),
                };
                settle_tx.send(StartProgress::Error(message));
                Event::StartSettled { attempt }
            },
        );
    }

    fn await_start_progress(&mut self, attempt: u64) {
        let Some(mut stream) = self.progress.remove(&attempt) else {
            parley_warn!("No start progress stream for attempt={}", attempt);
            self.scheduler.schedule(
                None,
                None,
                move |_| async move {
                    Event::StartProgress {
                        attempt,
                        progress: StartProgress::Error("start progress is unavailable".to_string()),
                        stream: None,
                    }
                },
                move |_| Event::StartSettled { attempt },
            );
            return;
        };

        self.scheduler.schedule(
            None,
            None,
            move |token| async move {
                let next = tokio::select! {
                    _ = token.cancelled() => None,
                    item = stream.next() => Some(item),
                };
                match next {
                    Some(Some(progress)) => Event::StartProgress {
                        attempt,
                        progress,
                        stream: Some(stream),
                    },
                    Some(None) => Event::StartProgress {
                        attempt,
                        progress: StartProgress::Error(
                            "plugin start ended without completing".to_string(),
                        ),
                        stream: None,
                    },
                    None => Event::StartProgress {
                        attempt,
                        progress: StartProgress::Error("plugin start cancelled".to_string()),
                        stream: None,
                    },
                }
            },
            move |resolution| Event::StartProgress {
                attempt,
                progress: StartProgress::Error(format!("start progress lost: {resolution:?}")),
                stream: None,
            },
        );
    }

    fn stop_all_plugins(&mut self, attempt: u64, timeout: Duration) {
        let Some(manager) = self.plugins.clone() else {
            self.spawn(None, None, async move {
                Msg::PluginsStopped {
                    attempt,
                    outcome: StopOutcome::default(),
                }
            });
            return;
        };

        let watcher = Arc::clone(&manager);
        self.scheduler.schedule(
            Some(EffectKey::StopPlugins(attempt)),
            Some(timeout),
            move |_| async move {
                let error = manager.shutdown().await.err().map(|err| err.to_string());
                Event::Msg(Msg::PluginsStopped {
                    attempt,
                    outcome: StopOutcome {
                        unresponsive: manager.active_plugins(),
                        error,
                    },
                })
            },
            move |resolution| {
                let unresponsive = watcher.active_plugins();
                parley_warn!(
                    "Plugin shutdown {:?} after {:?}; still running: {:?}",
                    resolution,
                    timeout,
                    unresponsive
                );
                let error = match resolution {
                    Resolution::TimedOut => None,
                    other => Some(format!("plugin shutdown {other:?}")),
                };
                Event::Msg(Msg::PluginsStopped {
                    attempt,
                    outcome: StopOutcome {
                        unresponsive,
                        error,
                    },
                })
            },
        );
    }

    fn enable_plugin(&mut self, op_id: u64, plugin_id: PluginId, timeout: Duration) {
        let manager = self.plugin_manager();
        self.plugin_operation(op_id, timeout, async move {
            let manager = manager?;
            manager
                .start_plugin(&plugin_id)
                .await
                .map_err(|err| err.to_string())
        });
    }

    fn disable_plugin(&mut self, op_id: u64, plugin_id: PluginId, timeout: Duration) {
        let config = self.environment.plugin_config.clone();
        let manager = self.plugins.clone();
        self.plugin_operation(op_id, timeout, async move {
            config
                .set_plugin_enabled(&plugin_id, false)
                .map_err(|err| err.to_string())?;
            match manager {
                Some(manager) => manager
                    .stop_plugin(&plugin_id)
                    .await
                    .map_err(|err| err.to_string()),
                None => Ok(()),
            }
        });
    }

    fn plugin_operation<F>(&self, op_id: u64, timeout: Duration, work: F)
    where
        F: std::future::Future<Output = Result<(), String>> + Send + 'static,
    {
        self.scheduler.schedule(
            None,
            Some(timeout),
            move |_| async move {
                Event::Msg(Msg::PluginOperationDone {
                    op_id,
                    result: work.await,
                })
            },
            move |resolution| {
                let error = match resolution {
                    Resolution::TimedOut => format!("timed out after {}s", timeout.as_secs()),
                    other => format!("plugin operation {other:?}"),
                };
                Event::Msg(Msg::PluginOperationDone {
                    op_id,
                    result: Err(error),
                })
            },
        );
    }

    fn validate_environment(
        &mut self,
        migration_id: u64,
        target: PathBuf,
        passphrase: Option<Secret>,
    ) {
        // Only one switch runs at a time; older staged directories are dead.
        self.staged.clear();
        let loader = Arc::clone(&self.loader);
        self.scheduler.schedule(
            None,
            None,
            move |_| async move {
                let result = blocking(move || loader.validate(&target, passphrase.as_ref()))
                    .await
                    .unwrap_or_else(|message| {
                        Err(ValidationError::Stage {
                            stage: ValidationStage::UserConfig,
                            message,
                        })
                    });
                Event::Validated {
                    migration_id,
                    result,
                }
            },
            move |resolution| Event::Validated {
                migration_id,
                result: Err(ValidationError::Stage {
                    stage: ValidationStage::UserConfig,
                    message: format!("validation {resolution:?}"),
                }),
            },
        );
    }

    fn commit_environment(&mut self, migration_id: u64, generation: u64) {
        let Some(environment) = self.staged.remove(&migration_id) else {
            parley_error!("No staged environment for migration_id={}", migration_id);
            return;
        };
        self.staged.clear();
        self.progress.clear();
        self.plugin_infra = None;
        if let Some(manager) = self.plugins.take() {
            parley_warn!("Plugin manager still alive at commit; abandoning it");
            manager.abandon();
        }
        let previous = std::mem::replace(&mut self.environment, environment);
        self.retired
            .insert(self.generation, Arc::clone(&previous.sessions));
        self.generation = generation;
        parley_info!(
            "Committed data directory {:?} generation={} (was {:?})",
            self.environment.data_dir,
            generation,
            previous.data_dir
        );
    }
}

/// Runs blocking storage work on tokio's blocking pool.
async fn blocking<R, F>(work: F) -> Result<R, String>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| format!("storage task failed: {err}"))
}
