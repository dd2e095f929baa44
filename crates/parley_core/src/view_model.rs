use std::path::PathBuf;

use crate::migration::MigrationStep;
use crate::plugins::{PluginOpPhase, PluginOperation, PluginPhase};
use crate::streaming::StreamPhase;
use crate::transfer::TransferState;
use crate::{AppState, ChatMessage, Notice};

/// Snapshot of everything the terminal renders.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AppViewModel {
    pub data_dir: PathBuf,
    pub model: String,
    pub session_name: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub stream: Option<StreamView>,
    pub plugins_enabled: bool,
    pub plugins_running: bool,
    pub plugin_modal: Option<PluginModalView>,
    pub plugin_operation: Option<PluginOperationView>,
    pub passphrase_prompt: Option<PassphrasePromptView>,
    pub switching_data_dir: bool,
    pub transfer: Option<TransferState>,
    pub notice: Option<Notice>,
    pub quitting: bool,
    pub dirty: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamView {
    pub phase: StreamPhase,
    pub partial: String,
    pub revealed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginModalView {
    pub operation: PluginOperation,
    pub phase: PluginPhase,
    pub elapsed_secs: i64,
    pub unresponsive: Vec<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginOperationView {
    pub plugin_id: String,
    pub phase: PluginOpPhase,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassphrasePromptView {
    pub target: PathBuf,
    pub error: Option<String>,
}

impl AppViewModel {
    pub(crate) fn from_state(state: &AppState, dirty: bool) -> Self {
        let stream = (!state.streaming.is_idle()).then(|| StreamView {
            phase: state.streaming.phase(),
            partial: state.streaming.partial().to_string(),
            revealed: state.streaming.reveal_index(),
            total: state.streaming.chunks().len(),
        });

        let plugin_modal = state.plugin_system.as_ref().map(|system| PluginModalView {
            operation: system.operation,
            phase: system.phase,
            elapsed_secs: (state.now - system.started_at).num_seconds().max(0),
            unresponsive: system.unresponsive_plugins.iter().cloned().collect(),
            error: system.error_msg.clone(),
        });

        let plugin_operation = state.plugin_op.as_ref().map(|op| PluginOperationView {
            plugin_id: op.plugin_id.clone(),
            phase: op.phase,
            error: op.error_msg.clone(),
        });

        let passphrase_prompt = state.migration.as_ref().and_then(|context| match &context.step {
            MigrationStep::AwaitingPassphrase { error } => Some(PassphrasePromptView {
                target: context.target_data_dir.clone(),
                error: error.clone(),
            }),
            _ => None,
        });

        Self {
            data_dir: state.environment.data_dir.clone(),
            model: state.model.clone(),
            session_name: state.current_session.as_ref().map(|s| s.name.clone()),
            messages: state.messages.clone(),
            stream,
            plugins_enabled: state.environment.plugins_enabled,
            plugins_running: state.plugins_running,
            plugin_modal,
            plugin_operation,
            passphrase_prompt,
            switching_data_dir: state.migration.is_some(),
            transfer: state.transfer.clone(),
            notice: state.notice.clone(),
            quitting: state.quitting,
            dirty,
        }
    }
}
