use std::path::PathBuf;
use std::time::Duration;

use crate::{ChatMessage, PluginId, RequestId, Secret, SessionId, SessionRef};

/// Identifies a scheduled effect so the core can ask for its cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EffectKey {
    Stream(RequestId),
    DisplayTick(RequestId),
    StartPlugins(u64),
    StopPlugins(u64),
    Transfer(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Open the provider stream and collect every chunk.
    StreamResponse {
        request_id: RequestId,
        model: String,
        messages: Vec<ChatMessage>,
        tools_enabled: bool,
    },
    /// Fire `Msg::DisplayTick` after `delay`.
    ScheduleDisplayTick {
        request_id: RequestId,
        delay: Duration,
    },
    /// Signal the cancellation token of a scheduled effect.
    Cancel(EffectKey),
    SaveSession {
        session_id: SessionId,
        messages: Vec<ChatMessage>,
    },
    /// Start every enabled plugin; progress is drained with `AwaitStartProgress`.
    StartAllPlugins { attempt: u64, timeout: Duration },
    /// Wait for the next item of the start progress stream.
    AwaitStartProgress { attempt: u64 },
    /// Shut down every plugin, reporting the unresponsive ones after `timeout`.
    StopAllPlugins { attempt: u64, timeout: Duration },
    /// Drop the plugin manager handle. `forced` also kills lingering children.
    DestroyPluginManager { forced: bool },
    EnablePlugin {
        op_id: u64,
        plugin_id: PluginId,
        timeout: Duration,
    },
    /// Persists `enabled = false` for the plugin, then stops it.
    DisablePlugin {
        op_id: u64,
        plugin_id: PluginId,
        timeout: Duration,
    },
    SavePluginFlag { plugin_id: PluginId, enabled: bool },
    SavePluginsEnabled(bool),
    RefreshPluginConfig,
    ValidateEnvironment {
        migration_id: u64,
        target: PathBuf,
        passphrase: Option<Secret>,
    },
    /// Swap the staged storage and providers in for the live ones. The new
    /// directory is known as `generation` from here on.
    CommitEnvironment { migration_id: u64, generation: u64 },
    RecreatePluginInfra { migration_id: u64 },
    ListSessions { generation: u64 },
    RefreshModels { generation: u64 },
    LoadSession {
        session_id: SessionId,
        generation: u64,
    },
    CreateSession { generation: u64 },
    /// Release a session lock in the directory of `generation`, which may
    /// already have been switched away from.
    ReleaseSessionLock {
        session_id: SessionId,
        generation: u64,
    },
    ExportSession {
        transfer_id: u64,
        session_id: SessionId,
        path: PathBuf,
    },
    ImportSession { transfer_id: u64, path: PathBuf },
    /// Delete the file a cancelled export left behind.
    RemovePartialExport { transfer_id: u64, path: PathBuf },
    /// Point the plugin manager at the active session. Applied synchronously.
    BindSession(Option<SessionRef>),
    PersistActiveSession(Option<SessionId>),
    Exit,
}
