mod common;

use std::path::PathBuf;

use parley_core::{
    update, Effect, EffectKey, Msg, NoticeKind, TransferOutcome, TransferPhase,
};
use pretty_assertions::assert_eq;

fn export_path() -> PathBuf {
    PathBuf::from("/tmp/chat.json")
}

fn exporting() -> parley_core::AppState {
    let state = common::with_session(common::fresh_state(false), "s1", &[]);
    let (state, effects) = update(
        state,
        Msg::ExportSession {
            session_id: "s1".to_string(),
            path: export_path(),
        },
    );
    assert_eq!(
        effects,
        vec![Effect::ExportSession {
            transfer_id: 1,
            session_id: "s1".to_string(),
            path: export_path(),
        }]
    );
    state
}

fn finished(transfer_id: u64, outcome: TransferOutcome) -> Msg {
    Msg::TransferFinished {
        transfer_id,
        outcome,
    }
}

#[test]
fn export_reports_where_it_wrote() {
    let state = exporting();
    let (state, effects) = update(state, finished(1, TransferOutcome::Exported(export_path())));

    assert!(effects.is_empty());
    assert!(state.transfer().is_none());
    let notice = state.notice().expect("export notice");
    assert_eq!(notice.title, "Session Exported");
    assert!(notice.body.contains("/tmp/chat.json"));
}

#[test]
fn cancel_waits_for_the_transfer_to_confirm() {
    let state = exporting();
    let (state, effects) = update(state, Msg::CancelTransfer);
    assert_eq!(effects, vec![Effect::Cancel(EffectKey::Transfer(1))]);
    assert_eq!(
        state.transfer().map(|t| t.phase),
        Some(TransferPhase::Cancelling)
    );

    // A second request while cancelling does nothing.
    let (state, effects) = update(state, Msg::CancelTransfer);
    assert!(effects.is_empty());

    let (state, effects) = update(
        state,
        finished(1, TransferOutcome::Cancelled { partial: None }),
    );
    assert!(effects.is_empty());
    assert!(state.transfer().is_none());
    assert_eq!(
        state.notice().map(|n| n.title.as_str()),
        Some("Export Cancelled")
    );
}

#[test]
fn export_that_won_the_race_against_cancel_is_reported_as_done() {
    let state = exporting();
    let (state, _) = update(state, Msg::CancelTransfer);
    let (state, _) = update(state, finished(1, TransferOutcome::Exported(export_path())));

    assert!(state.transfer().is_none());
    assert_eq!(
        state.notice().map(|n| n.title.as_str()),
        Some("Session Exported")
    );
}

#[test]
fn partial_export_is_cleaned_up_before_finishing() {
    let state = exporting();
    let (state, _) = update(state, Msg::CancelTransfer);
    let (state, effects) = update(
        state,
        finished(
            1,
            TransferOutcome::Cancelled {
                partial: Some(export_path()),
            },
        ),
    );
    assert_eq!(
        effects,
        vec![Effect::RemovePartialExport {
            transfer_id: 1,
            path: export_path(),
        }]
    );
    assert_eq!(
        state.transfer().map(|t| t.phase),
        Some(TransferPhase::CleaningUp)
    );
    assert!(state.notice().is_none());

    let (state, effects) = update(state, Msg::PartialExportRemoved { transfer_id: 1 });
    assert!(effects.is_empty());
    assert!(state.transfer().is_none());
    assert_eq!(
        state.notice().map(|n| n.body.as_str()),
        Some("The partial export file was removed.")
    );
}

#[test]
fn import_refreshes_the_session_list() {
    let state = common::fresh_state(false);
    let (state, effects) = update(state, Msg::ImportSession(export_path()));
    assert_eq!(
        effects,
        vec![Effect::ImportSession {
            transfer_id: 1,
            path: export_path(),
        }]
    );

    let mut meta = common::meta("imported");
    meta.name = "Trip plans".to_string();
    let (state, effects) = update(state, finished(1, TransferOutcome::Imported(meta)));
    assert_eq!(effects, vec![Effect::ListSessions { generation: 0 }]);
    assert!(state.transfer().is_none());
    assert!(state
        .notice()
        .is_some_and(|n| n.body.contains("Trip plans")));
}

#[test]
fn failed_import_shows_an_error() {
    let state = common::fresh_state(false);
    let (state, _) = update(state, Msg::ImportSession(export_path()));
    let (state, effects) = update(
        state,
        finished(1, TransferOutcome::Failed("invalid session file: no messages".to_string())),
    );

    assert!(effects.is_empty());
    let notice = state.notice().expect("failure notice");
    assert_eq!(notice.kind, NoticeKind::Error);
    assert_eq!(notice.title, "Import Failed");
}

#[test]
fn one_transfer_at_a_time_and_no_switch_meanwhile() {
    let state = exporting();
    let (state, effects) = update(state, Msg::ImportSession(export_path()));
    assert!(effects.is_empty());

    let (state, effects) = update(state, Msg::SwitchDataDir(PathBuf::from("/data/b")));
    assert!(effects.is_empty());
    assert!(state.migration().is_none());

    let (state, effects) = update(state, finished(7, TransferOutcome::Exported(export_path())));
    assert!(effects.is_empty());
    assert_eq!(state.transfer().map(|t| t.transfer_id), Some(1));
}
