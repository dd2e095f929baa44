use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parley_logging::parley_debug;
use serde::{Deserialize, Serialize};

use crate::migration::MigrationContext;
use crate::plugins::{PendingCallback, PluginOperationState, PluginSystemState};
use crate::streaming::StreamingState;
use crate::transfer::TransferState;
use crate::view_model::AppViewModel;
use crate::CoreSettings;

pub type SessionId = String;
pub type PluginId = String;
pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            role,
            content: content.into(),
            at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    #[serde(default)]
    pub enabled_plugins: Vec<PluginId>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

impl Session {
    pub fn session_ref(&self) -> SessionRef {
        SessionRef {
            id: self.id.clone(),
            enabled_plugins: self.enabled_plugins.clone(),
        }
    }
}

/// What the plugin manager needs to know about the active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRef {
    pub id: SessionId,
    pub enabled_plugins: Vec<PluginId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: SessionId,
    pub name: String,
    pub updated_at: DateTime<Utc>,
}

/// Everything the core knows about a validated data directory.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EnvironmentSummary {
    pub data_dir: PathBuf,
    pub default_model: String,
    pub plugins_enabled: bool,
    pub enabled_plugins: BTreeSet<PluginId>,
    /// Session that was active the last time this directory was used.
    pub last_session: Option<SessionId>,
}

/// A string that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Info,
    Error,
}

/// An acknowledgeable message box. Dismissed with `Msg::DismissNotice`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub title: String,
    pub body: String,
}

impl Notice {
    pub fn info(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Info,
            title: title.into(),
            body: body.into(),
        }
    }

    pub fn error(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Error,
            title: title.into(),
            body: body.into(),
        }
    }
}

/// Data-directory dependent view caches. Wiped on every data directory switch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UiCaches {
    pub models: Vec<String>,
    pub sessions: Vec<SessionMeta>,
    pub search_query: String,
    pub search_results: Vec<usize>,
    pub session_filter: String,
    pub model_filter: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AppState {
    pub(crate) settings: CoreSettings,
    pub(crate) now: DateTime<Utc>,
    pub(crate) viewport: (u16, u16),
    pub(crate) environment: EnvironmentSummary,
    /// Bumped on every committed data directory switch. Results tagged with
    /// an older generation belong to a directory that is no longer active.
    pub(crate) env_generation: u64,
    pub(crate) model: String,
    pub(crate) messages: Vec<ChatMessage>,
    pub(crate) current_session: Option<Session>,
    /// Session to prefer when the next session list arrives.
    pub(crate) resume_session: Option<SessionId>,
    /// Set while a session list refresh should pick and load a session.
    pub(crate) pick_session: bool,
    pub(crate) streaming: StreamingState,
    pub(crate) next_request_id: RequestId,
    pub(crate) plugins_running: bool,
    pub(crate) plugin_system: Option<PluginSystemState>,
    pub(crate) pending_callback: Option<PendingCallback>,
    pub(crate) next_attempt: u64,
    pub(crate) plugin_op: Option<PluginOperationState>,
    pub(crate) next_op_id: u64,
    pub(crate) migration: Option<MigrationContext>,
    pub(crate) next_migration_id: u64,
    pub(crate) transfer: Option<TransferState>,
    pub(crate) next_transfer_id: u64,
    pub(crate) caches: UiCaches,
    pub(crate) notice: Option<Notice>,
    pub(crate) quitting: bool,
    dirty: bool,
}

impl AppState {
    pub fn new(
        settings: CoreSettings,
        environment: EnvironmentSummary,
        resume_session: Option<SessionId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            settings,
            now,
            model: environment.default_model.clone(),
            environment,
            resume_session,
            ..Self::default()
        }
    }

    pub fn view(&self) -> AppViewModel {
        AppViewModel::from_state(self, self.dirty)
    }

    pub fn consume_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn settings(&self) -> &CoreSettings {
        &self.settings
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn data_dir(&self) -> &Path {
        &self.environment.data_dir
    }

    pub fn environment(&self) -> &EnvironmentSummary {
        &self.environment
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn current_session(&self) -> Option<&Session> {
        self.current_session.as_ref()
    }

    pub fn streaming(&self) -> &StreamingState {
        &self.streaming
    }

    pub fn plugins_running(&self) -> bool {
        self.plugins_running
    }

    pub fn plugin_system(&self) -> Option<&PluginSystemState> {
        self.plugin_system.as_ref()
    }

    pub fn pending_callback(&self) -> Option<&PendingCallback> {
        self.pending_callback.as_ref()
    }

    pub fn plugin_operation(&self) -> Option<&PluginOperationState> {
        self.plugin_op.as_ref()
    }

    pub fn enabled_plugins(&self) -> &BTreeSet<PluginId> {
        &self.environment.enabled_plugins
    }

    pub fn migration(&self) -> Option<&MigrationContext> {
        self.migration.as_ref()
    }

    pub fn env_generation(&self) -> u64 {
        self.env_generation
    }

    pub fn transfer(&self) -> Option<&TransferState> {
        self.transfer.as_ref()
    }

    pub fn caches(&self) -> &UiCaches {
        &self.caches
    }

    pub fn notice(&self) -> Option<&Notice> {
        self.notice.as_ref()
    }

    pub fn is_quitting(&self) -> bool {
        self.quitting
    }

    pub(crate) fn push_message(&mut self, role: Role, content: impl Into<String>) {
        let message = ChatMessage::new(role, content, self.now);
        self.messages.push(message);
        self.mark_dirty();
    }

    pub(crate) fn show_notice(&mut self, notice: Notice) {
        self.notice = Some(notice);
        self.mark_dirty();
    }

    /// True when `generation` names a data directory that is no longer active.
    pub(crate) fn is_stale(&self, generation: u64, what: &str) -> bool {
        if generation == self.env_generation {
            return false;
        }
        parley_debug!(
            "Dropping {} from generation {} (now {})",
            what,
            generation,
            self.env_generation
        );
        true
    }

    /// True when the active session asks for at least one plugin.
    pub(crate) fn session_has_plugins(&self) -> bool {
        self.current_session
            .as_ref()
            .is_some_and(|session| !session.enabled_plugins.is_empty())
    }
}
