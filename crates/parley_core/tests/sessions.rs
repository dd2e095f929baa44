mod common;

use parley_core::{
    update, AppState, CoreSettings, Effect, LoadFailure, Msg, NoticeKind, SessionRef,
};
use pretty_assertions::assert_eq;

fn resuming(session_id: &str) -> AppState {
    common::init_logging();
    AppState::new(
        CoreSettings::default(),
        common::environment("/data/a", false),
        Some(session_id.to_string()),
        common::now(),
    )
}

#[test]
fn boot_resumes_the_remembered_session() {
    let (state, _) = update(resuming("s2"), Msg::Booted);
    let (_, effects) = update(state, common::listed(0, &["s1", "s2"]));

    assert_eq!(
        effects,
        vec![Effect::LoadSession {
            session_id: "s2".to_string(),
            generation: 0,
        }]
    );
}

#[test]
fn boot_falls_back_to_first_session_when_remembered_one_is_gone() {
    let (state, _) = update(resuming("gone"), Msg::Booted);
    let (state, effects) = update(state, common::listed(0, &["s1", "s2"]));
    assert_eq!(
        effects,
        vec![Effect::LoadSession {
            session_id: "s1".to_string(),
            generation: 0,
        }]
    );

    let (_, effects) = update(state, common::listed(0, &["s1"]));
    assert!(effects.is_empty());
}

#[test]
fn switching_sessions_releases_the_previous_lock() {
    let state = common::with_session(common::fresh_state(false), "s1", &[]);
    let (state, effects) = update(state, common::loaded(0, "s2", &["weather"]));

    assert_eq!(
        effects,
        vec![
            Effect::ReleaseSessionLock {
                session_id: "s1".to_string(),
                generation: 0,
            },
            Effect::BindSession(Some(SessionRef {
                id: "s2".to_string(),
                enabled_plugins: vec!["weather".to_string()],
            })),
            Effect::PersistActiveSession(Some("s2".to_string())),
        ]
    );
    assert_eq!(state.current_session().map(|s| s.id.as_str()), Some("s2"));
}

#[test]
fn loading_the_active_session_is_a_noop() {
    let state = common::with_session(common::fresh_state(false), "s1", &[]);
    let (_, effects) = update(state, Msg::LoadSession("s1".to_string()));
    assert!(effects.is_empty());
}

#[test]
fn loading_another_session_asks_the_store() {
    let state = common::with_session(common::fresh_state(false), "s1", &[]);
    let (_, effects) = update(state, Msg::LoadSession("s2".to_string()));
    assert_eq!(
        effects,
        vec![Effect::LoadSession {
            session_id: "s2".to_string(),
            generation: 0,
        }]
    );
}

#[test]
fn locked_session_shows_info_notice() {
    let state = common::with_session(common::fresh_state(false), "s1", &[]);
    let (state, effects) = update(
        state,
        Msg::SessionLoaded {
            generation: 0,
            result: Err(LoadFailure::Locked {
                session_id: "s2".to_string(),
            }),
        },
    );

    assert!(effects.is_empty());
    assert_eq!(state.current_session().map(|s| s.id.as_str()), Some("s1"));
    let notice = state.notice().expect("locked notice");
    assert_eq!(notice.kind, NoticeKind::Info);
    assert_eq!(notice.title, "Session In Use");

    let (state, _) = update(state, Msg::DismissNotice);
    assert!(state.notice().is_none());
}

#[test]
fn loading_a_plugin_session_starts_plugins() {
    let state = common::fresh_state(true);
    let (state, effects) = update(state, common::loaded(0, "s1", &["weather"]));

    assert!(effects.contains(&Effect::AwaitStartProgress { attempt: 1 }));
    assert!(state.plugin_system().is_some());
}

#[test]
fn new_session_becomes_active_and_refreshes_list() {
    let state = common::with_session(common::fresh_state(false), "s1", &[]);
    let (state, effects) = update(state, Msg::NewSession);
    assert_eq!(effects, vec![Effect::CreateSession { generation: 0 }]);

    let (state, effects) = update(
        state,
        Msg::SessionCreated {
            generation: 0,
            result: Ok(common::session("s3", &[])),
        },
    );
    assert_eq!(
        effects.first(),
        Some(&Effect::ReleaseSessionLock {
            session_id: "s1".to_string(),
            generation: 0,
        })
    );
    assert_eq!(effects.last(), Some(&Effect::ListSessions { generation: 0 }));
    assert_eq!(state.current_session().map(|s| s.id.as_str()), Some("s3"));
}

#[test]
fn session_switch_is_refused_while_streaming() {
    let state = common::with_session(common::fresh_state(false), "s1", &[]);
    let (state, _) = update(state, Msg::Submit("hi".to_string()));
    let (_, effects) = update(state, Msg::LoadSession("s2".to_string()));
    assert!(effects.is_empty());
}
