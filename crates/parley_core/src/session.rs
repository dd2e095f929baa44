//! Active session ownership.
//!
//! `set_current` is the only place that changes `current_session`. It
//! releases the previous session's lock and rebinds the plugin manager, so at
//! most one session is held by this client at any time.
//!
//! Results from the session store carry the environment generation they were
//! scheduled under. Anything from an older generation is dropped, and a
//! session it locked is released again in the directory it came from.

use parley_logging::{parley_debug, parley_info, parley_warn};

use crate::msg::LoadFailure;
use crate::{migration, plugins, AppState, Effect, Notice, Session, SessionId, SessionMeta};

pub(crate) fn activate(state: &mut AppState, session: Option<Session>) -> Vec<Effect> {
    set_current(state, session, true)
}

/// Lets go of the active session before a data directory switch. The
/// directory being left keeps its remembered session.
pub(crate) fn release_for_switch(state: &mut AppState) -> Vec<Effect> {
    set_current(state, None, false)
}

fn set_current(state: &mut AppState, session: Option<Session>, remember: bool) -> Vec<Effect> {
    let next_id = session.as_ref().map(|session| session.id.clone());
    let mut effects = Vec::new();

    if let Some(previous) = state.current_session.take() {
        if next_id.as_ref() != Some(&previous.id) {
            parley_debug!("Releasing session lock for '{}'", previous.id);
            effects.push(Effect::ReleaseSessionLock {
                session_id: previous.id,
                generation: state.env_generation,
            });
        }
    }

    state.messages = session
        .as_ref()
        .map(|session| session.messages.clone())
        .unwrap_or_default();
    effects.push(Effect::BindSession(session.as_ref().map(Session::session_ref)));
    if remember {
        effects.push(Effect::PersistActiveSession(next_id.clone()));
    }
    state.current_session = session;
    state.mark_dirty();
    parley_info!("Active session is now {:?}", next_id);
    effects
}

fn session_switch_blocked(state: &AppState) -> bool {
    !state.streaming.is_idle() || state.migration.is_some() || state.quitting
}

/// Drops a result scheduled against an earlier data directory.
fn discard_stale<T>(generation: u64, result: Result<Session, T>) -> Vec<Effect> {
    match result {
        Ok(session) => {
            parley_info!(
                "Releasing '{}' loaded from a previous data directory",
                session.id
            );
            vec![Effect::ReleaseSessionLock {
                session_id: session.id,
                generation,
            }]
        }
        Err(_) => {
            parley_debug!("Dropping session error from generation {}", generation);
            Vec::new()
        }
    }
}

pub(crate) fn request_load(state: &mut AppState, session_id: SessionId) -> Vec<Effect> {
    if session_switch_blocked(state) {
        parley_debug!("Load of '{}' ignored: busy", session_id);
        return Vec::new();
    }
    if state
        .current_session
        .as_ref()
        .is_some_and(|session| session.id == session_id)
    {
        return Vec::new();
    }
    vec![Effect::LoadSession {
        session_id,
        generation: state.env_generation,
    }]
}

pub(crate) fn request_new(state: &mut AppState) -> Vec<Effect> {
    if session_switch_blocked(state) {
        return Vec::new();
    }
    vec![Effect::CreateSession {
        generation: state.env_generation,
    }]
}

pub(crate) fn on_loaded(
    state: &mut AppState,
    generation: u64,
    result: Result<Session, LoadFailure>,
) -> Vec<Effect> {
    if state.is_stale(generation, "loaded session") {
        return discard_stale(generation, result);
    }
    match result {
        Ok(session) => {
            if !state.streaming.is_idle() {
                // The user started a request against the old session meanwhile.
                parley_warn!("Discarding loaded session '{}' while streaming", session.id);
                return vec![Effect::ReleaseSessionLock {
                    session_id: session.id,
                    generation,
                }];
            }
            let mut effects = activate(state, Some(session));
            let wants_plugins = state.environment.plugins_enabled && state.session_has_plugins();
            if wants_plugins && !state.plugins_running && state.plugin_system.is_none() {
                effects.extend(plugins::begin_start(state, false));
            }
            effects
        }
        Err(LoadFailure::Locked { session_id }) => {
            parley_info!("Session '{}' is locked by another instance", session_id);
            state.show_notice(Notice::info(
                "Session In Use",
                format!(
                    "Session '{session_id}' is open in another parley instance.\n\
                     Close it there first or pick another session."
                ),
            ));
            Vec::new()
        }
        Err(LoadFailure::Other(error)) => {
            parley_warn!("Session load failed: {}", error);
            state.show_notice(Notice::error("Failed to Load Session", error));
            Vec::new()
        }
    }
}

pub(crate) fn on_created(
    state: &mut AppState,
    generation: u64,
    result: Result<Session, String>,
) -> Vec<Effect> {
    if state.is_stale(generation, "created session") {
        return discard_stale(generation, result);
    }
    match result {
        Ok(session) if state.streaming.is_idle() && state.migration.is_none() => {
            let mut effects = activate(state, Some(session));
            effects.push(Effect::ListSessions { generation });
            effects
        }
        Ok(session) => vec![Effect::ReleaseSessionLock {
            session_id: session.id,
            generation,
        }],
        Err(error) => {
            state.show_notice(Notice::error("Failed to Create Session", error));
            Vec::new()
        }
    }
}

pub(crate) fn on_listed(
    state: &mut AppState,
    generation: u64,
    result: Result<Vec<SessionMeta>, String>,
) -> Vec<Effect> {
    if state.is_stale(generation, "session list") {
        return Vec::new();
    }
    let sessions = match result {
        Ok(sessions) => sessions,
        Err(error) => {
            parley_warn!("Listing sessions failed: {}", error);
            state.pick_session = false;
            migration::complete(state);
            return Vec::new();
        }
    };

    let pick = if std::mem::take(&mut state.pick_session) && state.current_session.is_none() {
        let resume = state.resume_session.take();
        resume
            .filter(|id| sessions.iter().any(|meta| &meta.id == id))
            .or_else(|| sessions.first().map(|meta| meta.id.clone()))
    } else {
        None
    };

    state.caches.sessions = sessions;
    state.mark_dirty();
    migration::complete(state);

    match pick {
        Some(session_id) => {
            parley_info!("Loading session '{}'", session_id);
            vec![Effect::LoadSession {
                session_id,
                generation,
            }]
        }
        None => Vec::new(),
    }
}

pub(crate) fn on_saved(result: Result<(), String>) -> Vec<Effect> {
    if let Err(error) = result {
        parley_warn!("Saving session failed: {}", error);
    }
    Vec::new()
}

/// Releases the session lock and exits.
pub(crate) fn quit_now(state: &mut AppState) -> Vec<Effect> {
    state.quitting = true;
    state.mark_dirty();
    let mut effects = Vec::new();
    if let Some(session) = state.current_session.as_ref() {
        effects.push(Effect::ReleaseSessionLock {
            session_id: session.id.clone(),
            generation: state.env_generation,
        });
    }
    effects.push(Effect::Exit);
    effects
}

pub(crate) fn quit(state: &mut AppState) -> Vec<Effect> {
    if state.quitting && state.plugin_system.is_none() {
        return Vec::new();
    }
    if state.plugin_system.is_some() {
        parley_warn!("Force quit while a plugin system operation is active");
        let mut effects = vec![Effect::DestroyPluginManager { forced: true }];
        state.plugin_system = None;
        state.pending_callback = None;
        state.plugins_running = false;
        effects.extend(quit_now(state));
        return effects;
    }

    state.quitting = true;
    match plugins::begin_stop(state, plugins::PendingCallback::AppQuit) {
        Some(effects) => effects,
        None => quit_now(state),
    }
}
