use parley_logging::parley_debug;

use crate::{migration, plugins, session, streaming, transfer, AppState, Effect, Msg};

/// Pure update function: applies a message to state and returns any effects.
pub fn update(mut state: AppState, msg: Msg) -> (AppState, Vec<Effect>) {
    let effects = match msg {
        Msg::Booted => {
            parley_debug!("Boot: data_dir={:?}", state.environment.data_dir);
            state.pick_session = true;
            let mut effects = Vec::new();
            if state.environment.plugins_enabled {
                effects.extend(plugins::begin_start(&mut state, false));
            }
            let generation = state.env_generation;
            effects.push(Effect::ListSessions { generation });
            effects.push(Effect::RefreshModels { generation });
            effects
        }
        Msg::Tick { now } => {
            state.now = now;
            if state.plugin_system.is_some() {
                // Elapsed time is shown while waiting on plugins.
                state.mark_dirty();
            }
            Vec::new()
        }
        Msg::Resize { width, height } => {
            state.viewport = (width, height);
            state.mark_dirty();
            Vec::new()
        }
        Msg::Submit(text) => streaming::submit(&mut state, text),
        Msg::CancelStreaming => streaming::cancel(&mut state),
        Msg::StreamCollected { request_id, result } => {
            streaming::on_collected(&mut state, request_id, result)
        }
        Msg::DisplayTick { request_id } => streaming::on_display_tick(&mut state, request_id),
        Msg::Quit => session::quit(&mut state),
        Msg::SetPluginsEnabled(enabled) => plugins::set_plugins_enabled(&mut state, enabled),
        Msg::EnablePlugin(plugin_id) => plugins::enable_plugin(&mut state, plugin_id),
        Msg::DisablePlugin(plugin_id) => plugins::disable_plugin(&mut state, plugin_id),
        Msg::DismissPluginOperation => plugins::dismiss_operation(&mut state),
        Msg::ShutdownChoice(choice) => plugins::on_shutdown_choice(&mut state, choice),
        Msg::DismissPluginSystem => plugins::dismiss_system(&mut state),
        Msg::PluginStartProgress { attempt, progress } => {
            plugins::on_start_progress(&mut state, attempt, progress)
        }
        Msg::PluginsStopped { attempt, outcome } => {
            plugins::on_stopped(&mut state, attempt, outcome)
        }
        Msg::PluginOperationDone { op_id, result } => {
            plugins::on_operation_done(&mut state, op_id, result)
        }
        Msg::PluginConfigRefreshed(result) => plugins::on_config_refreshed(&mut state, result),
        Msg::SwitchDataDir(target) => migration::begin(&mut state, target),
        Msg::PassphraseSubmitted(passphrase) => {
            migration::submit_passphrase(&mut state, passphrase)
        }
        Msg::PassphraseCancelled => migration::cancel_passphrase(&mut state),
        Msg::EnvironmentValidated {
            migration_id,
            result,
        } => migration::on_validated(&mut state, migration_id, result),
        Msg::PluginInfraReady {
            migration_id,
            result,
        } => migration::on_plugin_infra(&mut state, migration_id, result),
        Msg::NewSession => session::request_new(&mut state),
        Msg::LoadSession(session_id) => session::request_load(&mut state, session_id),
        Msg::SessionLoaded { generation, result } => {
            session::on_loaded(&mut state, generation, result)
        }
        Msg::SessionCreated { generation, result } => {
            session::on_created(&mut state, generation, result)
        }
        Msg::SessionsListed { generation, result } => {
            session::on_listed(&mut state, generation, result)
        }
        Msg::SessionSaved(result) => session::on_saved(result),
        Msg::ModelsRefreshed { generation, result } => {
            if !state.is_stale(generation, "model list") {
                match result {
                    Ok(models) => {
                        state.caches.models = models;
                        state.mark_dirty();
                    }
                    Err(error) => parley_debug!("Model refresh failed: {}", error),
                }
            }
            Vec::new()
        }
        Msg::ExportSession { session_id, path } => {
            transfer::export(&mut state, session_id, path)
        }
        Msg::ImportSession(path) => transfer::import(&mut state, path),
        Msg::CancelTransfer => transfer::cancel(&mut state),
        Msg::TransferFinished {
            transfer_id,
            outcome,
        } => transfer::on_finished(&mut state, transfer_id, outcome),
        Msg::PartialExportRemoved { transfer_id } => {
            transfer::on_partial_removed(&mut state, transfer_id)
        }
        Msg::DismissNotice => {
            if state.notice.take().is_some() {
                state.mark_dirty();
            }
            Vec::new()
        }
        Msg::NoOp => Vec::new(),
    };

    (state, effects)
}
