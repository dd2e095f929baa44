mod common;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use parley_core::{
    update, AppState, Effect, MigrationStep, Msg, NoticeKind, PluginPhase, Secret, StartProgress,
    StopOutcome, ValidationFailure, ValidationStage,
};
use pretty_assertions::assert_eq;

fn target() -> PathBuf {
    PathBuf::from("/data/b")
}

fn switch(state: AppState) -> (AppState, Vec<Effect>) {
    update(state, Msg::SwitchDataDir(target()))
}

fn validated(
    state: AppState,
    result: Result<parley_core::EnvironmentSummary, ValidationFailure>,
) -> (AppState, Vec<Effect>) {
    update(
        state,
        Msg::EnvironmentValidated {
            migration_id: 1,
            result,
        },
    )
}

fn running_plugins(state: AppState) -> AppState {
    common::apply(
        state,
        vec![
            Msg::Booted,
            Msg::PluginStartProgress {
                attempt: 1,
                progress: StartProgress::Complete {
                    failures: BTreeMap::new(),
                },
            },
        ],
    )
    .0
}

#[test]
fn switch_without_plugins_validates_immediately() {
    let state = common::fresh_state(false);
    let (state, effects) = switch(state);

    assert_eq!(
        effects,
        vec![Effect::ValidateEnvironment {
            migration_id: 1,
            target: target(),
            passphrase: None,
        }]
    );
    assert_eq!(
        state.migration().map(|m| &m.step),
        Some(&MigrationStep::Validating)
    );
}

#[test]
fn invalid_target_keeps_previous_directory() {
    let state = common::with_session(common::fresh_state(false), "s1", &[]);
    let (state, _) = switch(state);
    let (state, effects) = validated(
        state,
        Err(ValidationFailure::Invalid {
            stage: ValidationStage::SessionStorage,
            message: "permission denied".to_string(),
        }),
    );

    assert!(effects.is_empty());
    assert!(state.migration().is_none());
    assert_eq!(state.data_dir(), PathBuf::from("/data/a").as_path());
    assert_eq!(state.current_session().map(|s| s.id.as_str()), Some("s1"));
    let notice = state.notice().expect("failure notice");
    assert_eq!(notice.kind, NoticeKind::Error);
    assert!(notice.body.contains("session storage: permission denied"));
}

#[test]
fn successful_switch_releases_old_session_and_lists_new_ones() {
    let state = common::with_session(common::fresh_state(false), "s1", &[]);
    let (state, _) = switch(state);
    let (state, effects) = validated(state, Ok(common::environment("/data/b", false)));

    assert_eq!(
        effects,
        vec![
            Effect::ReleaseSessionLock {
                session_id: "s1".to_string(),
                generation: 0,
            },
            Effect::BindSession(None),
            Effect::CommitEnvironment {
                migration_id: 1,
                generation: 1,
            },
            Effect::ListSessions { generation: 1 },
            Effect::RefreshModels { generation: 1 },
        ]
    );
    assert_eq!(state.data_dir(), target().as_path());
    assert!(state.current_session().is_none());
    assert!(state.messages().is_empty());
    assert_eq!(
        state.migration().map(|m| &m.step),
        Some(&MigrationStep::AwaitingSessionList)
    );

    let (state, effects) = update(state, common::listed(1, &["s9", "s8"]));
    assert_eq!(
        effects,
        vec![Effect::LoadSession {
            session_id: "s9".to_string(),
            generation: 1,
        }]
    );
    assert!(state.migration().is_none());
    assert_eq!(state.caches().sessions.len(), 2);
}

#[test]
fn switch_with_running_plugins_stops_them_first() {
    let state = running_plugins(common::fresh_state(true));
    let (state, effects) = switch(state);
    assert_eq!(
        effects,
        vec![Effect::StopAllPlugins {
            attempt: 2,
            timeout: Duration::from_secs(2),
        }]
    );
    assert_eq!(
        state.migration().map(|m| &m.step),
        Some(&MigrationStep::AwaitingShutdown)
    );

    let (state, effects) = update(
        state,
        Msg::PluginsStopped {
            attempt: 2,
            outcome: StopOutcome::default(),
        },
    );
    assert_eq!(
        effects,
        vec![
            Effect::DestroyPluginManager { forced: false },
            Effect::ValidateEnvironment {
                migration_id: 1,
                target: target(),
                passphrase: None,
            },
        ]
    );

    let (state, effects) = validated(state, Ok(common::environment("/data/b", true)));
    assert_eq!(
        effects,
        vec![
            Effect::BindSession(None),
            Effect::CommitEnvironment {
                migration_id: 1,
                generation: 1,
            },
            Effect::RecreatePluginInfra { migration_id: 1 },
        ]
    );

    let (state, effects) = update(
        state,
        Msg::PluginInfraReady {
            migration_id: 1,
            result: Ok(()),
        },
    );
    assert_eq!(
        effects,
        vec![
            Effect::StartAllPlugins {
                attempt: 3,
                timeout: Duration::from_secs(30),
            },
            Effect::AwaitStartProgress { attempt: 3 },
            Effect::ListSessions { generation: 1 },
            Effect::RefreshModels { generation: 1 },
        ]
    );
    assert!(state.plugin_system().is_some());
}

#[test]
fn plugin_infra_failure_continues_without_plugins() {
    let state = common::fresh_state(false);
    let (state, _) = switch(state);
    let (state, _) = validated(state, Ok(common::environment("/data/b", true)));
    let (state, effects) = update(
        state,
        Msg::PluginInfraReady {
            migration_id: 1,
            result: Err("registry unreadable".to_string()),
        },
    );

    assert_eq!(
        effects,
        vec![
            Effect::ListSessions { generation: 1 },
            Effect::RefreshModels { generation: 1 },
        ]
    );
    assert!(state.plugin_system().is_none());
}

#[test]
fn passphrase_prompt_accepts_a_retry() {
    let state = common::fresh_state(false);
    let (state, _) = switch(state);
    let (state, effects) = validated(state, Err(ValidationFailure::PassphraseRequired));
    assert!(effects.is_empty());
    assert!(state.view().passphrase_prompt.is_some());

    let (state, effects) = update(state, Msg::PassphraseSubmitted(Secret::new("  ")));
    assert!(effects.is_empty());
    assert_eq!(
        state.view().passphrase_prompt.and_then(|p| p.error),
        Some("Passphrase cannot be empty".to_string())
    );

    let (state, effects) = update(state, Msg::PassphraseSubmitted(Secret::new("open sesame")));
    assert_eq!(
        effects,
        vec![Effect::ValidateEnvironment {
            migration_id: 1,
            target: target(),
            passphrase: Some(Secret::new("open sesame")),
        }]
    );

    let (state, _) = validated(state, Ok(common::environment("/data/b", false)));
    assert_eq!(state.data_dir(), target().as_path());
}

#[test]
fn too_many_wrong_passphrases_abandon_the_switch() {
    let state = common::fresh_state(false);
    let (mut state, _) = switch(state);
    state = validated(state, Err(ValidationFailure::PassphraseRequired)).0;

    for attempt in 1..=3 {
        state = update(state, Msg::PassphraseSubmitted(Secret::new("wrong"))).0;
        state = validated(state, Err(ValidationFailure::WrongPassphrase)).0;
        if attempt < 3 {
            let migration = state.migration().expect("still prompting");
            assert_eq!(migration.attempts, attempt);
            assert!(migration.awaiting_passphrase());
        }
    }

    assert!(state.migration().is_none());
    assert_eq!(state.data_dir(), PathBuf::from("/data/a").as_path());
    assert_eq!(state.notice().map(|n| n.kind), Some(NoticeKind::Error));
}

#[test]
fn cancelling_the_passphrase_prompt_keeps_old_directory() {
    let state = common::fresh_state(false);
    let (state, _) = switch(state);
    let (state, _) = validated(state, Err(ValidationFailure::PassphraseRequired));
    let (state, effects) = update(state, Msg::PassphraseCancelled);

    assert!(effects.is_empty());
    assert!(state.migration().is_none());
    assert_eq!(state.notice().map(|n| n.kind), Some(NoticeKind::Info));
}

#[test]
fn stale_validation_result_is_ignored() {
    let state = common::fresh_state(false);
    let (state, _) = switch(state);
    let (state, effects) = update(
        state,
        Msg::EnvironmentValidated {
            migration_id: 99,
            result: Ok(common::environment("/data/z", false)),
        },
    );

    assert!(effects.is_empty());
    assert_eq!(state.data_dir(), PathBuf::from("/data/a").as_path());
}

#[test]
fn switch_is_refused_while_streaming() {
    let state = common::fresh_state(false);
    let (state, _) = update(state, Msg::Submit("hi".to_string()));
    let (state, effects) = switch(state);

    assert!(effects.is_empty());
    assert!(state.migration().is_none());
}

#[test]
fn failed_plugin_shutdown_abandons_the_switch_on_dismiss() {
    let state = running_plugins(common::fresh_state(true));
    let (state, _) = switch(state);
    let (state, _) = update(
        state,
        Msg::PluginsStopped {
            attempt: 2,
            outcome: StopOutcome {
                unresponsive: Vec::new(),
                error: Some("broken pipe".to_string()),
            },
        },
    );
    assert_eq!(state.plugin_system().map(|s| s.phase), Some(PluginPhase::Error));

    let (state, effects) = update(state, Msg::DismissPluginSystem);
    assert!(effects.is_empty());
    assert!(state.migration().is_none());
    assert!(state.plugins_running());
    assert_eq!(state.data_dir(), PathBuf::from("/data/a").as_path());
}

#[test]
fn results_from_the_old_directory_are_dropped_after_commit() {
    let state = common::with_session(common::fresh_state(false), "s1", &[]);
    let (state, effects) = update(state, Msg::LoadSession("s2-from-a".to_string()));
    assert_eq!(
        effects,
        vec![Effect::LoadSession {
            session_id: "s2-from-a".to_string(),
            generation: 0,
        }]
    );
    let (state, _) = switch(state);
    let (state, _) = validated(state, Ok(common::environment("/data/b", false)));
    assert_eq!(state.env_generation(), 1);

    let (state, effects) = update(
        state,
        Msg::ModelsRefreshed {
            generation: 0,
            result: Ok(vec!["old-dir-model".to_string()]),
        },
    );
    assert!(effects.is_empty());
    assert!(state.caches().models.is_empty());

    // The late load locked a session in /data/a; it goes back unused.
    let (state, effects) = update(state, common::loaded(0, "s2-from-a", &["weather"]));
    assert_eq!(
        effects,
        vec![Effect::ReleaseSessionLock {
            session_id: "s2-from-a".to_string(),
            generation: 0,
        }]
    );
    assert!(state.current_session().is_none());

    let (state, effects) = update(
        state,
        Msg::SessionCreated {
            generation: 0,
            result: Ok(common::session("new-in-a", &[])),
        },
    );
    assert_eq!(
        effects,
        vec![Effect::ReleaseSessionLock {
            session_id: "new-in-a".to_string(),
            generation: 0,
        }]
    );

    let (state, effects) = update(state, common::listed(0, &["old-a"]));
    assert!(effects.is_empty());
    assert!(state.caches().sessions.is_empty());
    assert_eq!(
        state.migration().map(|m| &m.step),
        Some(&MigrationStep::AwaitingSessionList)
    );

    let (state, effects) = update(
        state,
        Msg::ModelsRefreshed {
            generation: 1,
            result: Ok(vec!["mistral".to_string()]),
        },
    );
    assert!(effects.is_empty());
    assert_eq!(state.caches().models, vec!["mistral".to_string()]);

    let (state, _) = update(state, common::listed(1, &["b1"]));
    assert!(state.migration().is_none());
    assert_eq!(state.data_dir(), target().as_path());
}

#[test]
fn switch_keeps_the_old_directory_remembered_and_resumes_the_new_one() {
    let state = common::with_session(common::fresh_state(false), "s1", &[]);
    let (state, _) = switch(state);
    let mut summary = common::environment("/data/b", false);
    summary.last_session = Some("b2".to_string());
    let (state, effects) = validated(state, Ok(summary));

    assert!(!effects
        .iter()
        .any(|effect| matches!(effect, Effect::PersistActiveSession(_))));

    let (state, effects) = update(state, common::listed(1, &["b1", "b2"]));
    assert_eq!(
        effects,
        vec![Effect::LoadSession {
            session_id: "b2".to_string(),
            generation: 1,
        }]
    );

    let (_, effects) = update(state, common::loaded(1, "b2", &[]));
    assert_eq!(
        effects.last(),
        Some(&Effect::PersistActiveSession(Some("b2".to_string())))
    );
}
