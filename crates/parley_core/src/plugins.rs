//! Plugin lifecycle supervision.
//!
//! Two independent protocols live here: the system-wide start/stop of every
//! enabled plugin (`PluginSystemState`), and the single-plugin enable/disable
//! operation (`PluginOperationState`). Both tag their effects with an id so a
//! completion that arrives after the state moved on is recognized and dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parley_logging::{parley_debug, parley_info, parley_warn};

use crate::{migration, session, AppState, Effect, Notice, PluginId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginOperation {
    Starting,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginPhase {
    Waiting,
    Unresponsive,
    Error,
    Complete,
}

/// System-wide start/stop in progress. Absent (`None` in `AppState`) when idle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSystemState {
    pub operation: PluginOperation,
    pub phase: PluginPhase,
    pub attempt: u64,
    pub unresponsive_plugins: BTreeSet<String>,
    pub error_msg: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Plugins reported as started by the progress stream so far.
    pub started_plugins: Vec<PluginId>,
    /// Persist the global "plugins enabled" flag once start succeeds.
    pub(crate) commit_toggle: bool,
}

impl PluginSystemState {
    fn new(operation: PluginOperation, attempt: u64, now: DateTime<Utc>) -> Self {
        Self {
            operation,
            phase: PluginPhase::Waiting,
            attempt,
            unresponsive_plugins: BTreeSet::new(),
            error_msg: None,
            started_at: now,
            started_plugins: Vec::new(),
            commit_toggle: false,
        }
    }

    fn is_waiting_for(&self, operation: PluginOperation, attempt: u64) -> bool {
        self.operation == operation && self.phase == PluginPhase::Waiting && self.attempt == attempt
    }
}

/// What to do once the plugin system has been shut down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingCallback {
    DatadirSwitch { migration_id: u64, target: PathBuf },
    PluginDisable,
    AppQuit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownChoice {
    /// Re-issue the stop with a fresh timeout.
    Wait,
    /// Stop waiting and drop the manager handle.
    Force,
}

/// One item of the plugin start progress stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartProgress {
    Started { plugin: PluginId },
    Failed { plugin: PluginId, error: String },
    /// Terminal. `failures` maps plugin id to its start error.
    Complete { failures: BTreeMap<PluginId, String> },
    /// Terminal. The start as a whole failed (including timeout).
    Error(String),
}

impl StartProgress {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StartProgress::Complete { .. } | StartProgress::Error(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StopOutcome {
    /// Display names of plugins that did not stop within the timeout.
    pub unresponsive: Vec<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginOpPhase {
    Enabling,
    Disabling,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginOperationState {
    pub op_id: u64,
    pub phase: PluginOpPhase,
    pub plugin_id: PluginId,
    pub error_msg: Option<String>,
}

impl PluginOperationState {
    fn in_flight(&self) -> bool {
        matches!(self.phase, PluginOpPhase::Enabling | PluginOpPhase::Disabling)
    }
}

pub(crate) fn begin_start(state: &mut AppState, commit_toggle: bool) -> Vec<Effect> {
    if state.plugin_system.is_some() || state.plugins_running {
        parley_debug!(
            "Plugin start skipped: active={} running={}",
            state.plugin_system.is_some(),
            state.plugins_running
        );
        return Vec::new();
    }

    state.next_attempt += 1;
    let attempt = state.next_attempt;
    let mut system = PluginSystemState::new(PluginOperation::Starting, attempt, state.now);
    system.commit_toggle = commit_toggle;
    state.plugin_system = Some(system);
    state.mark_dirty();
    parley_info!("Starting plugin system attempt={}", attempt);

    vec![
        Effect::StartAllPlugins {
            attempt,
            timeout: state.settings.plugin_start_timeout(),
        },
        Effect::AwaitStartProgress { attempt },
    ]
}

/// Starts the stop protocol. Returns `None` when no plugin is running, in which
/// case nothing changed and the caller continues with its own next step.
pub(crate) fn begin_stop(state: &mut AppState, callback: PendingCallback) -> Option<Vec<Effect>> {
    if !state.plugins_running {
        return None;
    }
    if state.plugin_system.is_some() {
        parley_warn!("Plugin stop refused: another plugin system operation is active");
        return Some(Vec::new());
    }

    state.next_attempt += 1;
    let attempt = state.next_attempt;
    state.plugin_system = Some(PluginSystemState::new(
        PluginOperation::Stopping,
        attempt,
        state.now,
    ));
    parley_info!(
        "Stopping plugin system attempt={} callback={:?}",
        attempt,
        callback
    );
    state.pending_callback = Some(callback);
    state.mark_dirty();

    Some(vec![Effect::StopAllPlugins {
        attempt,
        timeout: state.settings.plugin_stop_timeout(),
    }])
}

pub(crate) fn set_plugins_enabled(state: &mut AppState, enabled: bool) -> Vec<Effect> {
    if enabled {
        if state.environment.plugins_enabled && state.plugins_running {
            return Vec::new();
        }
        return begin_start(state, true);
    }

    match begin_stop(state, PendingCallback::PluginDisable) {
        Some(effects) => effects,
        None if state.environment.plugins_enabled => {
            state.environment.plugins_enabled = false;
            state.mark_dirty();
            vec![Effect::SavePluginsEnabled(false)]
        }
        None => Vec::new(),
    }
}

pub(crate) fn on_start_progress(
    state: &mut AppState,
    attempt: u64,
    progress: StartProgress,
) -> Vec<Effect> {
    let Some(system) = state.plugin_system.as_mut() else {
        parley_debug!("Dropping start progress for attempt={} (idle)", attempt);
        return Vec::new();
    };
    if !system.is_waiting_for(PluginOperation::Starting, attempt) {
        parley_debug!("Dropping stale start progress attempt={}", attempt);
        return Vec::new();
    }

    match progress {
        StartProgress::Started { plugin } => {
            parley_info!("Plugin '{}' started", plugin);
            system.started_plugins.push(plugin);
            state.mark_dirty();
            vec![Effect::AwaitStartProgress { attempt }]
        }
        StartProgress::Failed { plugin, error } => {
            parley_warn!("Plugin '{}' failed to start: {}", plugin, error);
            vec![Effect::AwaitStartProgress { attempt }]
        }
        StartProgress::Complete { failures } if failures.is_empty() => {
            let commit_toggle = system.commit_toggle;
            state.plugin_system = None;
            state.plugins_running = true;
            state.mark_dirty();
            parley_info!("Plugin system started attempt={}", attempt);

            let mut effects = Vec::new();
            if commit_toggle {
                state.environment.plugins_enabled = true;
                effects.push(Effect::SavePluginsEnabled(true));
            }
            effects.push(Effect::RefreshPluginConfig);
            effects
        }
        StartProgress::Complete { failures } => {
            let summary = failures
                .iter()
                .map(|(plugin, error)| format!("{plugin}: {error}"))
                .collect::<Vec<_>>()
                .join("\n");
            // The plugins that did start are live and must be stopped on quit.
            if !system.started_plugins.is_empty() {
                state.plugins_running = true;
            }
            system.phase = PluginPhase::Error;
            system.error_msg = Some(format!("Some plugins failed to start:\n{summary}"));
            parley_warn!("Plugin start finished with {} failures", failures.len());
            state.mark_dirty();
            Vec::new()
        }
        StartProgress::Error(error) => {
            parley_warn!("Plugin start failed attempt={}: {}", attempt, error);
            system.phase = PluginPhase::Error;
            system.error_msg = Some(format!("Failed to start plugins: {error}"));
            state.mark_dirty();
            Vec::new()
        }
    }
}

pub(crate) fn on_stopped(state: &mut AppState, attempt: u64, outcome: StopOutcome) -> Vec<Effect> {
    let Some(system) = state.plugin_system.as_mut() else {
        parley_debug!("Dropping stop outcome for attempt={} (idle)", attempt);
        return Vec::new();
    };
    if !system.is_waiting_for(PluginOperation::Stopping, attempt) {
        parley_debug!("Dropping stale stop outcome attempt={}", attempt);
        return Vec::new();
    }

    if !outcome.unresponsive.is_empty() {
        parley_warn!(
            "Plugin shutdown attempt={} unresponsive: {:?}",
            attempt,
            outcome.unresponsive
        );
        system.phase = PluginPhase::Unresponsive;
        system.unresponsive_plugins = outcome.unresponsive.into_iter().collect();
        system.error_msg = outcome.error;
        state.mark_dirty();
        return Vec::new();
    }

    if let Some(error) = outcome.error {
        parley_warn!("Plugin shutdown attempt={} failed: {}", attempt, error);
        system.phase = PluginPhase::Error;
        system.error_msg = Some(format!("Failed to stop plugins: {error}"));
        state.mark_dirty();
        return Vec::new();
    }

    complete_stop(state, false)
}

pub(crate) fn on_shutdown_choice(state: &mut AppState, choice: ShutdownChoice) -> Vec<Effect> {
    let now = state.now;
    let timeout = state.settings.plugin_stop_timeout();
    let Some(system) = state.plugin_system.as_mut() else {
        return Vec::new();
    };
    if system.operation != PluginOperation::Stopping || system.phase != PluginPhase::Unresponsive {
        return Vec::new();
    }

    match choice {
        ShutdownChoice::Wait => {
            state.next_attempt += 1;
            let attempt = state.next_attempt;
            *system = PluginSystemState::new(PluginOperation::Stopping, attempt, now);
            parley_info!("Waiting longer for plugin shutdown attempt={}", attempt);
            state.mark_dirty();
            vec![Effect::StopAllPlugins { attempt, timeout }]
        }
        ShutdownChoice::Force => {
            parley_warn!(
                "Forcing plugin shutdown; abandoning {:?}",
                system.unresponsive_plugins
            );
            complete_stop(state, true)
        }
    }
}

pub(crate) fn dismiss_system(state: &mut AppState) -> Vec<Effect> {
    let is_error = state
        .plugin_system
        .as_ref()
        .is_some_and(|system| system.phase == PluginPhase::Error);
    if !is_error {
        return Vec::new();
    }
    state.plugin_system = None;
    state.mark_dirty();

    match state.pending_callback.take() {
        Some(PendingCallback::AppQuit) => {
            let mut effects = vec![Effect::DestroyPluginManager { forced: true }];
            state.plugins_running = false;
            effects.extend(session::quit_now(state));
            effects
        }
        Some(PendingCallback::DatadirSwitch { migration_id, .. }) => {
            migration::abandon(
                state,
                migration_id,
                Notice::error(
                    "Data Directory Switch Failed",
                    "Plugin shutdown failed. The data directory was not changed.",
                ),
            );
            Vec::new()
        }
        Some(PendingCallback::PluginDisable) | None => Vec::new(),
    }
}

fn complete_stop(state: &mut AppState, forced: bool) -> Vec<Effect> {
    state.plugin_system = None;
    state.plugins_running = false;
    state.mark_dirty();
    parley_info!("Plugin system stopped (forced={})", forced);

    let mut effects = vec![Effect::DestroyPluginManager { forced }];
    match state.pending_callback.take() {
        Some(PendingCallback::AppQuit) => effects.extend(session::quit_now(state)),
        Some(PendingCallback::PluginDisable) => {
            state.environment.plugins_enabled = false;
            effects.push(Effect::SavePluginsEnabled(false));
        }
        Some(PendingCallback::DatadirSwitch { migration_id, .. }) => {
            effects.extend(migration::resume_after_shutdown(state, migration_id));
        }
        None => {}
    }
    effects
}

pub(crate) fn enable_plugin(state: &mut AppState, plugin_id: PluginId) -> Vec<Effect> {
    if state.plugin_op.as_ref().is_some_and(PluginOperationState::in_flight) {
        parley_debug!("Enable '{}' ignored: another plugin operation is running", plugin_id);
        return Vec::new();
    }
    state.next_op_id += 1;
    let op_id = state.next_op_id;
    state.plugin_op = Some(PluginOperationState {
        op_id,
        phase: PluginOpPhase::Enabling,
        plugin_id: plugin_id.clone(),
        error_msg: None,
    });
    state.mark_dirty();
    parley_info!("Enabling plugin '{}' op_id={}", plugin_id, op_id);
    vec![Effect::EnablePlugin {
        op_id,
        plugin_id,
        timeout: state.settings.plugin_operation_timeout(),
    }]
}

pub(crate) fn disable_plugin(state: &mut AppState, plugin_id: PluginId) -> Vec<Effect> {
    if state.plugin_op.as_ref().is_some_and(PluginOperationState::in_flight) {
        parley_debug!("Disable '{}' ignored: another plugin operation is running", plugin_id);
        return Vec::new();
    }
    state.next_op_id += 1;
    let op_id = state.next_op_id;
    state.plugin_op = Some(PluginOperationState {
        op_id,
        phase: PluginOpPhase::Disabling,
        plugin_id: plugin_id.clone(),
        error_msg: None,
    });
    // The effect writes the disabled flag before stopping; mirror it now.
    state.environment.enabled_plugins.remove(&plugin_id);
    state.mark_dirty();
    parley_info!("Disabling plugin '{}' op_id={}", plugin_id, op_id);
    vec![Effect::DisablePlugin {
        op_id,
        plugin_id,
        timeout: state.settings.plugin_operation_timeout(),
    }]
}

pub(crate) fn on_operation_done(
    state: &mut AppState,
    op_id: u64,
    result: Result<(), String>,
) -> Vec<Effect> {
    let Some(op) = state
        .plugin_op
        .as_mut()
        .filter(|op| op.op_id == op_id && op.in_flight())
    else {
        parley_info!("Ignoring stale plugin operation result op_id={}", op_id);
        return Vec::new();
    };

    let effects = match result {
        Ok(()) => {
            let plugin_id = op.plugin_id.clone();
            let was_enabling = op.phase == PluginOpPhase::Enabling;
            op.phase = PluginOpPhase::Complete;
            if was_enabling {
                parley_info!("Plugin '{}' enabled; saving config", plugin_id);
                state.environment.enabled_plugins.insert(plugin_id.clone());
                vec![Effect::SavePluginFlag {
                    plugin_id,
                    enabled: true,
                }]
            } else {
                parley_info!("Plugin '{}' disabled", plugin_id);
                Vec::new()
            }
        }
        Err(error) => {
            parley_warn!(
                "Plugin operation op_id={} on '{}' failed: {}",
                op_id,
                op.plugin_id,
                error
            );
            op.phase = PluginOpPhase::Error;
            op.error_msg = Some(error);
            Vec::new()
        }
    };
    state.mark_dirty();
    effects
}

pub(crate) fn dismiss_operation(state: &mut AppState) -> Vec<Effect> {
    if state.plugin_op.take().is_some() {
        state.mark_dirty();
    }
    Vec::new()
}

pub(crate) fn on_config_refreshed(
    state: &mut AppState,
    result: Result<BTreeSet<PluginId>, String>,
) -> Vec<Effect> {
    match result {
        Ok(enabled) => {
            state.environment.enabled_plugins = enabled;
            state.mark_dirty();
        }
        Err(error) => parley_warn!("Plugin config refresh failed: {}", error),
    }
    Vec::new()
}
