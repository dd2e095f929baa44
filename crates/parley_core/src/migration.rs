//! Data directory switch.
//!
//! A switch walks through: stop plugins, validate the target storage (with an
//! optional passphrase round trip), commit the new environment, recreate the
//! plugin infrastructure, then pick a session from the new directory. Any
//! failure before commit leaves the previous directory fully active. Commit
//! bumps the environment generation, which retires every result still in
//! flight against the old directory.

use std::path::PathBuf;

use parley_logging::{parley_debug, parley_info, parley_warn};

use crate::msg::ValidationFailure;
use crate::plugins::{self, PendingCallback};
use crate::{session, AppState, Effect, EnvironmentSummary, Notice, Secret, UiCaches};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStep {
    /// Waiting for the plugin system to stop.
    AwaitingShutdown,
    Validating,
    AwaitingPassphrase { error: Option<String> },
    AwaitingPluginInfra,
    /// Committed; waiting for the first session list from the new directory.
    AwaitingSessionList,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationContext {
    pub id: u64,
    pub target_data_dir: PathBuf,
    pub step: MigrationStep,
    /// Wrong passphrases entered so far.
    pub attempts: u32,
}

impl MigrationContext {
    pub fn awaiting_passphrase(&self) -> bool {
        matches!(self.step, MigrationStep::AwaitingPassphrase { .. })
    }

    pub fn committed(&self) -> bool {
        matches!(
            self.step,
            MigrationStep::AwaitingPluginInfra | MigrationStep::AwaitingSessionList
        )
    }
}

pub(crate) fn begin(state: &mut AppState, target: PathBuf) -> Vec<Effect> {
    let busy = state.migration.is_some()
        || state.plugin_system.is_some()
        || state.transfer.is_some()
        || state.quitting;
    if busy {
        parley_debug!("Data directory switch to {:?} ignored: busy", target);
        return Vec::new();
    }
    if !state.streaming.is_idle() {
        parley_debug!("Data directory switch ignored while streaming");
        return Vec::new();
    }
    if target == state.environment.data_dir {
        state.show_notice(Notice::info(
            "Data Directory",
            format!("Already using {}", target.display()),
        ));
        return Vec::new();
    }

    state.next_migration_id += 1;
    let migration_id = state.next_migration_id;
    parley_info!(
        "Switching data directory migration_id={} {:?} -> {:?}",
        migration_id,
        state.environment.data_dir,
        target
    );
    state.migration = Some(MigrationContext {
        id: migration_id,
        target_data_dir: target.clone(),
        step: MigrationStep::AwaitingShutdown,
        attempts: 0,
    });
    state.mark_dirty();

    let callback = PendingCallback::DatadirSwitch {
        migration_id,
        target,
    };
    match plugins::begin_stop(state, callback) {
        Some(effects) => effects,
        None => validate(state, None),
    }
}

pub(crate) fn resume_after_shutdown(state: &mut AppState, migration_id: u64) -> Vec<Effect> {
    if !at_step(state, migration_id, &MigrationStep::AwaitingShutdown) {
        parley_debug!("Shutdown callback for stale migration_id={}", migration_id);
        return Vec::new();
    }
    validate(state, None)
}

fn validate(state: &mut AppState, passphrase: Option<Secret>) -> Vec<Effect> {
    let Some(context) = state.migration.as_mut() else {
        return Vec::new();
    };
    context.step = MigrationStep::Validating;
    let effect = Effect::ValidateEnvironment {
        migration_id: context.id,
        target: context.target_data_dir.clone(),
        passphrase,
    };
    state.mark_dirty();
    vec![effect]
}

pub(crate) fn on_validated(
    state: &mut AppState,
    migration_id: u64,
    result: Result<EnvironmentSummary, ValidationFailure>,
) -> Vec<Effect> {
    let max_attempts = state.settings.max_passphrase_attempts;
    let Some(context) = state
        .migration
        .as_mut()
        .filter(|context| context.id == migration_id && context.step == MigrationStep::Validating)
    else {
        parley_debug!("Dropping stale validation result migration_id={}", migration_id);
        return Vec::new();
    };

    match result {
        Ok(summary) => commit(state, summary),
        Err(ValidationFailure::PassphraseRequired) => {
            parley_info!("Target data directory requires a passphrase");
            context.step = MigrationStep::AwaitingPassphrase { error: None };
            state.mark_dirty();
            Vec::new()
        }
        Err(ValidationFailure::WrongPassphrase) => {
            context.attempts += 1;
            let attempts = context.attempts;
            parley_warn!(
                "Wrong passphrase for target data directory ({}/{})",
                attempts,
                max_attempts
            );
            if attempts >= max_attempts {
                abandon(
                    state,
                    migration_id,
                    Notice::error(
                        "Data Directory Switch Failed",
                        "Too many incorrect passphrase attempts. The previous data directory is still active.",
                    ),
                );
            } else {
                context.step = MigrationStep::AwaitingPassphrase {
                    error: Some(format!(
                        "Incorrect passphrase ({} of {} attempts)",
                        attempts, max_attempts
                    )),
                };
                state.mark_dirty();
            }
            Vec::new()
        }
        Err(ValidationFailure::Invalid { stage, message }) => {
            abandon(
                state,
                migration_id,
                Notice::error(
                    "Data Directory Switch Failed",
                    format!("Failed to switch data directory:\n\n{stage}: {message}"),
                ),
            );
            Vec::new()
        }
    }
}

pub(crate) fn submit_passphrase(state: &mut AppState, passphrase: Secret) -> Vec<Effect> {
    let Some(context) = state
        .migration
        .as_mut()
        .filter(|context| context.awaiting_passphrase())
    else {
        return Vec::new();
    };
    if passphrase.is_empty() {
        context.step = MigrationStep::AwaitingPassphrase {
            error: Some("Passphrase cannot be empty".to_string()),
        };
        state.mark_dirty();
        return Vec::new();
    }
    validate(state, Some(passphrase))
}

pub(crate) fn cancel_passphrase(state: &mut AppState) -> Vec<Effect> {
    let Some(migration_id) = state
        .migration
        .as_ref()
        .filter(|context| context.awaiting_passphrase())
        .map(|context| context.id)
    else {
        return Vec::new();
    };
    abandon(
        state,
        migration_id,
        Notice::info(
            "Data Directory Switch Cancelled",
            "A passphrase is required to open that data directory. The previous data directory is still active.",
        ),
    );
    Vec::new()
}

/// Drops the migration without touching the active environment.
pub(crate) fn abandon(state: &mut AppState, migration_id: u64, notice: Notice) {
    if current(state, migration_id).is_none() {
        return;
    }
    parley_warn!("Abandoning migration_id={}: {}", migration_id, notice.title);
    state.migration = None;
    state.show_notice(notice);
}

fn commit(state: &mut AppState, summary: EnvironmentSummary) -> Vec<Effect> {
    let Some(migration_id) = state.migration.as_ref().map(|context| context.id) else {
        return Vec::new();
    };
    parley_info!(
        "Committing data directory {:?} migration_id={}",
        summary.data_dir,
        migration_id
    );

    let mut effects = session::release_for_switch(state);
    state.env_generation += 1;
    effects.push(Effect::CommitEnvironment {
        migration_id,
        generation: state.env_generation,
    });

    state.model = summary.default_model.clone();
    state.environment = summary;
    state.plugins_running = false;

    if state.environment.plugins_enabled {
        if let Some(context) = state.migration.as_mut() {
            context.step = MigrationStep::AwaitingPluginInfra;
        }
        effects.push(Effect::RecreatePluginInfra { migration_id });
    } else {
        effects.extend(finish(state, false));
    }
    effects
}

pub(crate) fn on_plugin_infra(
    state: &mut AppState,
    migration_id: u64,
    result: Result<(), String>,
) -> Vec<Effect> {
    if !at_step(state, migration_id, &MigrationStep::AwaitingPluginInfra) {
        parley_debug!("Dropping stale plugin infra result migration_id={}", migration_id);
        return Vec::new();
    }
    match result {
        Ok(()) => finish(state, true),
        Err(error) => {
            parley_warn!("Plugin infrastructure unavailable after switch: {}", error);
            finish(state, false)
        }
    }
}

fn finish(state: &mut AppState, plugins_available: bool) -> Vec<Effect> {
    state.caches = UiCaches::default();
    state.plugin_op = None;
    state.resume_session = state.environment.last_session.clone();
    state.pick_session = true;
    if let Some(context) = state.migration.as_mut() {
        context.step = MigrationStep::AwaitingSessionList;
    }
    state.mark_dirty();

    let mut effects = Vec::new();
    if plugins_available {
        effects.extend(plugins::begin_start(state, false));
    }
    let generation = state.env_generation;
    effects.push(Effect::ListSessions { generation });
    effects.push(Effect::RefreshModels { generation });
    effects
}

/// Called once the post-commit session list arrived.
pub(crate) fn complete(state: &mut AppState) {
    let done = state
        .migration
        .as_ref()
        .is_some_and(|context| context.step == MigrationStep::AwaitingSessionList);
    if done {
        parley_info!("Data directory switch complete: {:?}", state.environment.data_dir);
        state.migration = None;
        state.mark_dirty();
    }
}

fn current(state: &AppState, migration_id: u64) -> Option<&MigrationContext> {
    state
        .migration
        .as_ref()
        .filter(|context| context.id == migration_id)
}

fn at_step(state: &AppState, migration_id: u64, step: &MigrationStep) -> bool {
    current(state, migration_id).is_some_and(|context| &context.step == step)
}
