//! Parley core: pure state machine and view-model helpers.
mod effect;
mod migration;
mod msg;
mod plugins;
mod session;
mod settings;
mod state;
mod streaming;
mod transfer;
mod update;
mod view_model;

pub use effect::{Effect, EffectKey};
pub use migration::{MigrationContext, MigrationStep};
pub use msg::{LoadFailure, Msg, StreamFailure, StreamFailureKind, ValidationFailure, ValidationStage};
pub use plugins::{
    PendingCallback, PluginOpPhase, PluginOperation, PluginOperationState, PluginPhase,
    PluginSystemState, ShutdownChoice, StartProgress, StopOutcome,
};
pub use settings::CoreSettings;
pub use state::{
    AppState, ChatMessage, EnvironmentSummary, Notice, NoticeKind, PluginId, RequestId, Role,
    Secret, Session, SessionId, SessionMeta, SessionRef, UiCaches,
};
pub use streaming::{StreamPhase, StreamingState};
pub use transfer::{TransferKind, TransferOutcome, TransferPhase, TransferState};
pub use update::update;
pub use view_model::{
    AppViewModel, PassphrasePromptView, PluginModalView, PluginOperationView, StreamView,
};
