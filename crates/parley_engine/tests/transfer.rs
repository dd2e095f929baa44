use chrono::{TimeZone, Utc};
use parley_core::{ChatMessage, Role};
use parley_engine::{
    export_session, import_session, remove_partial, FsSessionStore, SessionStore, TransferError,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn store_with_chat(temp: &TempDir) -> (FsSessionStore, String) {
    let store = FsSessionStore::open(temp.path().join("sessions"), std::process::id()).unwrap();
    let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    let session = store.create(now).unwrap();
    let messages = vec![
        ChatMessage::new(Role::User, "Hello", now),
        ChatMessage::new(Role::Assistant, "You said: Hello", now),
    ];
    store.save(&session.id, &messages, now).unwrap();
    (store, session.id)
}

#[test]
fn exported_session_imports_as_a_new_session() {
    let temp = TempDir::new().unwrap();
    let (store, id) = store_with_chat(&temp);
    let path = temp.path().join("out").join("chat.json");
    let token = CancellationToken::new();

    assert_eq!(export_session(&store, &id, &path, &token).unwrap(), path);
    assert!(path.exists());

    let now = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
    let meta = import_session(&store, &path, now, &token).unwrap();
    assert_ne!(meta.id, id);
    assert_eq!(
        store.read(&meta.id).unwrap().messages,
        store.read(&id).unwrap().messages
    );
}

#[test]
fn export_refuses_to_overwrite() {
    let temp = TempDir::new().unwrap();
    let (store, id) = store_with_chat(&temp);
    let path = temp.path().join("chat.json");
    std::fs::write(&path, "keep me").unwrap();

    let err = export_session(&store, &id, &path, &CancellationToken::new()).unwrap_err();
    assert!(matches!(err, TransferError::Exists(_)));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "keep me");
}

#[test]
fn cancelled_export_writes_nothing() {
    let temp = TempDir::new().unwrap();
    let (store, id) = store_with_chat(&temp);
    let path = temp.path().join("chat.json");
    let token = CancellationToken::new();
    token.cancel();

    let err = export_session(&store, &id, &path, &token).unwrap_err();
    assert!(matches!(err, TransferError::Cancelled { partial: None }));
    assert!(!path.exists());
}

#[test]
fn partial_export_is_removed_once() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("chat.json");
    std::fs::write(&path, "{").unwrap();

    remove_partial(&path).unwrap();
    assert!(!path.exists());
    remove_partial(&path).unwrap();
}

#[test]
fn import_rejects_sessions_without_messages() {
    let temp = TempDir::new().unwrap();
    let (store, _) = store_with_chat(&temp);
    let path = temp.path().join("empty.json");
    std::fs::write(&path, r#"{"id":"x","name":"Empty","messages":[]}"#).unwrap();

    let now = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
    let err = import_session(&store, &path, now, &CancellationToken::new()).unwrap_err();
    assert!(matches!(err, TransferError::Invalid(_)));
    assert_eq!(store.list().unwrap().len(), 1);
}
