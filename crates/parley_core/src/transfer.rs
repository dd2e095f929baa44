//! Session export and import.
//!
//! One transfer runs at a time. Cancelling only asks: the transfer sits in
//! `Cancelling` until its own completion arrives, and that completion decides
//! the result. An export that already wrote its file when the cancellation
//! was seen goes through `CleaningUp` until the file is removed.

use std::path::PathBuf;

use parley_logging::{parley_debug, parley_info, parley_warn};

use crate::{AppState, Effect, EffectKey, Notice, SessionId, SessionMeta};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferKind {
    Export { session_id: SessionId, path: PathBuf },
    Import { path: PathBuf },
}

impl TransferKind {
    fn noun(&self) -> &'static str {
        match self {
            TransferKind::Export { .. } => "Export",
            TransferKind::Import { .. } => "Import",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Running,
    Cancelling,
    CleaningUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferState {
    pub transfer_id: u64,
    pub kind: TransferKind,
    pub phase: TransferPhase,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Exported(PathBuf),
    Imported(SessionMeta),
    /// The transfer saw the cancellation. `partial` is a file it had already written.
    Cancelled { partial: Option<PathBuf> },
    Failed(String),
}

fn blocked(state: &AppState) -> bool {
    state.transfer.is_some() || state.migration.is_some() || state.quitting
}

fn begin(state: &mut AppState, kind: TransferKind) -> Option<u64> {
    if blocked(state) {
        parley_debug!("{} ignored: busy", kind.noun());
        return None;
    }
    state.next_transfer_id += 1;
    let transfer_id = state.next_transfer_id;
    parley_info!("{} started transfer_id={}", kind.noun(), transfer_id);
    state.transfer = Some(TransferState {
        transfer_id,
        kind,
        phase: TransferPhase::Running,
    });
    state.mark_dirty();
    Some(transfer_id)
}

pub(crate) fn export(state: &mut AppState, session_id: SessionId, path: PathBuf) -> Vec<Effect> {
    let kind = TransferKind::Export {
        session_id: session_id.clone(),
        path: path.clone(),
    };
    match begin(state, kind) {
        Some(transfer_id) => vec![Effect::ExportSession {
            transfer_id,
            session_id,
            path,
        }],
        None => Vec::new(),
    }
}

pub(crate) fn import(state: &mut AppState, path: PathBuf) -> Vec<Effect> {
    let kind = TransferKind::Import { path: path.clone() };
    match begin(state, kind) {
        Some(transfer_id) => vec![Effect::ImportSession { transfer_id, path }],
        None => Vec::new(),
    }
}

pub(crate) fn cancel(state: &mut AppState) -> Vec<Effect> {
    let Some(transfer) = state
        .transfer
        .as_mut()
        .filter(|transfer| transfer.phase == TransferPhase::Running)
    else {
        return Vec::new();
    };
    transfer.phase = TransferPhase::Cancelling;
    let transfer_id = transfer.transfer_id;
    parley_info!("Cancelling transfer_id={}", transfer_id);
    state.mark_dirty();
    vec![Effect::Cancel(EffectKey::Transfer(transfer_id))]
}

pub(crate) fn on_finished(
    state: &mut AppState,
    transfer_id: u64,
    outcome: TransferOutcome,
) -> Vec<Effect> {
    let Some(transfer) = state
        .transfer
        .as_mut()
        .filter(|transfer| transfer.transfer_id == transfer_id)
    else {
        parley_debug!("Dropping stale transfer result transfer_id={}", transfer_id);
        return Vec::new();
    };
    let noun = transfer.kind.noun();

    match outcome {
        TransferOutcome::Cancelled {
            partial: Some(path),
        } => {
            parley_info!("{} cancelled; removing {:?}", noun, path);
            transfer.phase = TransferPhase::CleaningUp;
            state.mark_dirty();
            vec![Effect::RemovePartialExport { transfer_id, path }]
        }
        TransferOutcome::Cancelled { partial: None } => {
            finish(state, Notice::info(format!("{noun} Cancelled"), "Nothing was written."));
            Vec::new()
        }
        TransferOutcome::Exported(path) => {
            finish(
                state,
                Notice::info("Session Exported", format!("Saved to {}", path.display())),
            );
            Vec::new()
        }
        TransferOutcome::Imported(meta) => {
            finish(
                state,
                Notice::info("Session Imported", format!("Added '{}' ({})", meta.name, meta.id)),
            );
            vec![Effect::ListSessions {
                generation: state.env_generation,
            }]
        }
        TransferOutcome::Failed(error) => {
            parley_warn!("{} failed: {}", noun, error);
            finish(state, Notice::error(format!("{noun} Failed"), error));
            Vec::new()
        }
    }
}

pub(crate) fn on_partial_removed(state: &mut AppState, transfer_id: u64) -> Vec<Effect> {
    let cleaning = state.transfer.as_ref().is_some_and(|transfer| {
        transfer.transfer_id == transfer_id && transfer.phase == TransferPhase::CleaningUp
    });
    if !cleaning {
        parley_debug!("Dropping stale cleanup result transfer_id={}", transfer_id);
        return Vec::new();
    }
    finish(
        state,
        Notice::info("Export Cancelled", "The partial export file was removed."),
    );
    Vec::new()
}

fn finish(state: &mut AppState, notice: Notice) {
    state.transfer = None;
    state.show_notice(notice);
}
