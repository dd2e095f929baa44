#![allow(dead_code)]

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Once;

use chrono::{DateTime, TimeZone, Utc};
use parley_core::{
    update, AppState, CoreSettings, Effect, EnvironmentSummary, Msg, Session, SessionMeta,
};

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(parley_logging::initialize_for_tests);
}

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

pub fn environment(dir: &str, plugins_enabled: bool) -> EnvironmentSummary {
    EnvironmentSummary {
        data_dir: PathBuf::from(dir),
        default_model: "llama3".to_string(),
        plugins_enabled,
        enabled_plugins: BTreeSet::new(),
        last_session: None,
    }
}

pub fn fresh_state(plugins_enabled: bool) -> AppState {
    init_logging();
    AppState::new(
        CoreSettings::default(),
        environment("/data/a", plugins_enabled),
        None,
        now(),
    )
}

pub fn session(id: &str, plugins: &[&str]) -> Session {
    Session {
        id: id.to_string(),
        name: format!("Session {id}"),
        enabled_plugins: plugins.iter().map(|p| p.to_string()).collect(),
        messages: Vec::new(),
    }
}

pub fn meta(id: &str) -> SessionMeta {
    SessionMeta {
        id: id.to_string(),
        name: format!("Session {id}"),
        updated_at: now(),
    }
}

/// A successful session list tagged with `generation`.
pub fn listed(generation: u64, ids: &[&str]) -> Msg {
    Msg::SessionsListed {
        generation,
        result: Ok(ids.iter().map(|id| meta(id)).collect()),
    }
}

pub fn loaded(generation: u64, id: &str, plugins: &[&str]) -> Msg {
    Msg::SessionLoaded {
        generation,
        result: Ok(session(id, plugins)),
    }
}

pub fn with_session(state: AppState, id: &str, plugins: &[&str]) -> AppState {
    let generation = state.env_generation();
    let (state, _) = update(state, loaded(generation, id, plugins));
    state
}

/// Applies every message in order and returns the effects of the last one.
pub fn apply(state: AppState, msgs: Vec<Msg>) -> (AppState, Vec<Effect>) {
    let mut state = state;
    let mut effects = Vec::new();
    for msg in msgs {
        let (next, produced) = update(state, msg);
        state = next;
        effects = produced;
    }
    (state, effects)
}
