//! Typewriter delivery of a model response.
//!
//! The provider effect collects the whole response into chunks; display ticks
//! then reveal one chunk at a time. `partial` is always the concatenation of
//! `chunks[..reveal_index]`.

use parley_logging::{parley_debug, parley_info, parley_warn};

use crate::msg::{StreamFailure, StreamFailureKind};
use crate::{AppState, ChatMessage, Effect, EffectKey, RequestId, Role};

const RESPONSE_CANCELLED_MARKER: &str = "\n\n⚠️ Response cancelled";
const REQUEST_CANCELLED: &str = "⚠️ Request cancelled";
const NO_RESPONSE: &str = "⚠️ No response received from the model";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamPhase {
    #[default]
    Idle,
    AwaitingFirst,
    Streaming,
    Finalized,
    /// Cancellation requested; waiting for the provider to acknowledge it.
    Cancelled,
    Errored,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamingState {
    phase: StreamPhase,
    request_id: Option<RequestId>,
    chunks: Vec<String>,
    reveal_index: usize,
    partial: String,
}

impl StreamingState {
    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn request_id(&self) -> Option<RequestId> {
        self.request_id
    }

    pub fn chunks(&self) -> &[String] {
        &self.chunks
    }

    pub fn reveal_index(&self) -> usize {
        self.reveal_index
    }

    pub fn partial(&self) -> &str {
        &self.partial
    }

    pub fn is_idle(&self) -> bool {
        self.phase == StreamPhase::Idle
    }

    fn is_current(&self, request_id: RequestId) -> bool {
        self.request_id == Some(request_id)
    }

    fn reveal_next(&mut self) {
        if let Some(chunk) = self.chunks.get(self.reveal_index) {
            self.partial.push_str(chunk);
            self.reveal_index += 1;
        }
    }

    fn fully_revealed(&self) -> bool {
        self.reveal_index >= self.chunks.len()
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

pub(crate) fn submit(state: &mut AppState, text: String) -> Vec<Effect> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    if !state.streaming.is_idle() || state.migration.is_some() || state.quitting {
        parley_debug!("Submit ignored: streaming={:?}", state.streaming.phase);
        return Vec::new();
    }

    state.push_message(Role::User, text);

    state.next_request_id += 1;
    let request_id = state.next_request_id;
    state.streaming = StreamingState {
        phase: StreamPhase::AwaitingFirst,
        request_id: Some(request_id),
        ..StreamingState::default()
    };

    let messages: Vec<ChatMessage> = state
        .messages
        .iter()
        .filter(|message| message.role != Role::System)
        .cloned()
        .collect();
    let tools_enabled = state.plugins_running && state.session_has_plugins();
    parley_info!(
        "Submit request_id={} model={} history={} tools={}",
        request_id,
        state.model,
        messages.len(),
        tools_enabled
    );

    vec![Effect::StreamResponse {
        request_id,
        model: state.model.clone(),
        messages,
        tools_enabled,
    }]
}

pub(crate) fn on_collected(
    state: &mut AppState,
    request_id: RequestId,
    result: Result<Vec<String>, StreamFailure>,
) -> Vec<Effect> {
    if !state.streaming.is_current(request_id) {
        parley_debug!("Dropping stale stream result request_id={}", request_id);
        return Vec::new();
    }

    match state.streaming.phase {
        StreamPhase::Cancelled => {
            // Any completion of a cancelled request is its acknowledgement.
            parley_info!("Stream request_id={} acknowledged cancellation", request_id);
            finish_cancelled(state);
            Vec::new()
        }
        StreamPhase::AwaitingFirst => match result {
            Ok(chunks) if chunks.is_empty() => {
                parley_warn!("Stream request_id={} returned no chunks", request_id);
                state.streaming.reset();
                state.push_message(Role::System, NO_RESPONSE);
                Vec::new()
            }
            Ok(chunks) => {
                parley_debug!(
                    "Stream request_id={} collected {} chunks",
                    request_id,
                    chunks.len()
                );
                state.streaming.chunks = chunks;
                state.streaming.phase = StreamPhase::Streaming;
                state.mark_dirty();
                vec![Effect::ScheduleDisplayTick {
                    request_id,
                    delay: state.settings.first_tick_delay(),
                }]
            }
            Err(failure) if failure.kind == StreamFailureKind::Cancelled => {
                finish_cancelled(state);
                Vec::new()
            }
            Err(failure) => {
                fail(state, failure);
                Vec::new()
            }
        },
        StreamPhase::Idle
        | StreamPhase::Streaming
        | StreamPhase::Finalized
        | StreamPhase::Errored => {
            parley_warn!(
                "Unexpected stream result request_id={} in phase {:?}",
                request_id,
                state.streaming.phase
            );
            Vec::new()
        }
    }
}

pub(crate) fn on_display_tick(state: &mut AppState, request_id: RequestId) -> Vec<Effect> {
    if !state.streaming.is_current(request_id) || state.streaming.phase != StreamPhase::Streaming
    {
        return Vec::new();
    }

    state.streaming.reveal_next();
    state.mark_dirty();

    if state.streaming.fully_revealed() {
        return finalize(state);
    }
    vec![Effect::ScheduleDisplayTick {
        request_id,
        delay: state.settings.tick_interval(),
    }]
}

pub(crate) fn cancel(state: &mut AppState) -> Vec<Effect> {
    let Some(request_id) = state.streaming.request_id else {
        return Vec::new();
    };
    match state.streaming.phase {
        StreamPhase::AwaitingFirst => {
            parley_info!("Cancelling stream request_id={}", request_id);
            state.streaming.phase = StreamPhase::Cancelled;
            state.mark_dirty();
            vec![Effect::Cancel(EffectKey::Stream(request_id))]
        }
        StreamPhase::Streaming => {
            parley_info!(
                "Cancelling typewriter request_id={} at {}/{}",
                request_id,
                state.streaming.reveal_index,
                state.streaming.chunks.len()
            );
            finish_cancelled(state);
            vec![Effect::Cancel(EffectKey::DisplayTick(request_id))]
        }
        StreamPhase::Idle
        | StreamPhase::Cancelled
        | StreamPhase::Finalized
        | StreamPhase::Errored => Vec::new(),
    }
}

fn finalize(state: &mut AppState) -> Vec<Effect> {
    state.streaming.phase = StreamPhase::Finalized;
    let content = std::mem::take(&mut state.streaming.partial);
    parley_info!(
        "Stream request_id={:?} finalized ({} chars)",
        state.streaming.request_id,
        content.len()
    );
    state.streaming.reset();
    state.push_message(Role::Assistant, content);

    match &state.current_session {
        Some(session) => vec![Effect::SaveSession {
            session_id: session.id.clone(),
            messages: state.messages.clone(),
        }],
        None => Vec::new(),
    }
}

fn finish_cancelled(state: &mut AppState) {
    state.streaming.phase = StreamPhase::Cancelled;
    let partial = std::mem::take(&mut state.streaming.partial);
    state.streaming.reset();
    if partial.is_empty() {
        state.push_message(Role::System, REQUEST_CANCELLED);
    } else {
        state.push_message(Role::Assistant, format!("{partial}{RESPONSE_CANCELLED_MARKER}"));
    }
}

fn fail(state: &mut AppState, failure: StreamFailure) {
    state.streaming.phase = StreamPhase::Errored;
    parley_warn!(
        "Stream request_id={:?} failed: {:?}",
        state.streaming.request_id,
        failure
    );
    state.streaming.reset();

    let text = if failure.kind == StreamFailureKind::ToolsUnsupported && state.session_has_plugins()
    {
        format!(
            "❌ Error: {} does not support tool calling.\n\n\
             Your session has enabled plugins that require tool support.\n\
             Switch to a tool-capable model.",
            state.model
        )
    } else {
        format!("❌ Error: {}", failure.message)
    };
    state.push_message(Role::System, text);
}
