use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::plugins::{ShutdownChoice, StartProgress, StopOutcome};
use crate::transfer::TransferOutcome;
use crate::{EnvironmentSummary, PluginId, RequestId, Secret, Session, SessionId, SessionMeta};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Msg {
    /// Runtime finished wiring services; kick off the initial refreshes.
    Booted,
    /// Clock tick from the runtime. The only way time enters the core.
    Tick { now: DateTime<Utc> },
    /// Terminal was resized.
    Resize { width: u16, height: u16 },
    /// User submitted a chat message.
    Submit(String),
    /// User asked to stop the in-flight response.
    CancelStreaming,
    /// User asked to quit the application.
    Quit,
    /// Settings toggle for the whole plugin system.
    SetPluginsEnabled(bool),
    /// User enabled a single plugin.
    EnablePlugin(PluginId),
    /// User disabled a single plugin.
    DisablePlugin(PluginId),
    /// User closed the per-plugin operation modal.
    DismissPluginOperation,
    /// User answered the unresponsive-plugins prompt.
    ShutdownChoice(ShutdownChoice),
    /// User acknowledged a plugin system error.
    DismissPluginSystem,
    /// User asked to move to another data directory.
    SwitchDataDir(PathBuf),
    /// User typed the passphrase for the target data directory.
    PassphraseSubmitted(Secret),
    /// User cancelled the passphrase prompt.
    PassphraseCancelled,
    /// User asked for a fresh session.
    NewSession,
    /// User picked a session to load.
    LoadSession(SessionId),
    /// User acknowledged the current notice.
    DismissNotice,
    /// User asked to write a session to a file.
    ExportSession { session_id: SessionId, path: PathBuf },
    /// User asked to add a session from an exported file.
    ImportSession(PathBuf),
    /// User asked to stop the running export or import.
    CancelTransfer,
    /// Provider stream finished collecting (or failed, or acknowledged a cancel).
    StreamCollected {
        request_id: RequestId,
        result: Result<Vec<String>, StreamFailure>,
    },
    /// Typewriter timer fired.
    DisplayTick { request_id: RequestId },
    /// Session persisted (or not).
    SessionSaved(Result<(), String>),
    /// One item of the plugin start progress stream.
    PluginStartProgress {
        attempt: u64,
        progress: StartProgress,
    },
    /// Shutdown of every plugin resolved (possibly by timeout).
    PluginsStopped { attempt: u64, outcome: StopOutcome },
    /// Single-plugin enable/disable resolved.
    PluginOperationDone {
        op_id: u64,
        result: Result<(), String>,
    },
    /// Storage layer validation for a data directory switch resolved.
    EnvironmentValidated {
        migration_id: u64,
        result: Result<EnvironmentSummary, ValidationFailure>,
    },
    /// Plugin registry/installer/manager recreated for the new directory.
    PluginInfraReady {
        migration_id: u64,
        result: Result<(), String>,
    },
    /// Plugin flags re-read from durable config.
    PluginConfigRefreshed(Result<BTreeSet<PluginId>, String>),
    SessionsListed {
        generation: u64,
        result: Result<Vec<SessionMeta>, String>,
    },
    SessionLoaded {
        generation: u64,
        result: Result<Session, LoadFailure>,
    },
    SessionCreated {
        generation: u64,
        result: Result<Session, String>,
    },
    ModelsRefreshed {
        generation: u64,
        result: Result<Vec<String>, String>,
    },
    /// Export or import ended, including an acknowledged cancellation.
    TransferFinished {
        transfer_id: u64,
        outcome: TransferOutcome,
    },
    /// The partial file of a cancelled export is gone.
    PartialExportRemoved { transfer_id: u64 },
    /// Fallback for placeholder wiring.
    NoOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFailureKind {
    /// The provider acknowledged a cancellation request.
    Cancelled,
    /// The model cannot call tools but the request carried tool definitions.
    ToolsUnsupported,
    Timeout,
    Provider,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFailure {
    pub kind: StreamFailureKind,
    pub message: String,
}

impl StreamFailure {
    pub fn new(kind: StreamFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(StreamFailureKind::Cancelled, "cancelled")
    }
}

/// Which part of the new data directory failed to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStage {
    SessionStorage,
    PluginStorage,
    PluginConfig,
    PluginRegistry,
    UserConfig,
    InstanceLock,
}

impl fmt::Display for ValidationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationStage::SessionStorage => write!(f, "session storage"),
            ValidationStage::PluginStorage => write!(f, "plugin storage"),
            ValidationStage::PluginConfig => write!(f, "plugin config"),
            ValidationStage::PluginRegistry => write!(f, "plugin registry"),
            ValidationStage::UserConfig => write!(f, "user config"),
            ValidationStage::InstanceLock => write!(f, "instance lock"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    /// Key material is encrypted; ask the user.
    PassphraseRequired,
    /// The supplied passphrase did not unlock the key material.
    WrongPassphrase,
    Invalid {
        stage: ValidationStage,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadFailure {
    /// Another running client holds the session lock.
    Locked { session_id: SessionId },
    Other(String),
}
