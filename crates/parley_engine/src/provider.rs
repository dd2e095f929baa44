use std::time::Duration;

use parley_core::{ChatMessage, Role, StreamFailure, StreamFailureKind};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("request cancelled")]
    Cancelled,
    #[error("{model} does not support tool calling")]
    ToolsUnsupported { model: String },
    #[error("provider timed out")]
    Timeout,
    #[error("{0}")]
    Provider(String),
}

impl ProviderError {
    pub fn to_failure(&self) -> StreamFailure {
        let kind = match self {
            ProviderError::Cancelled => StreamFailureKind::Cancelled,
            ProviderError::ToolsUnsupported { .. } => StreamFailureKind::ToolsUnsupported,
            ProviderError::Timeout => StreamFailureKind::Timeout,
            ProviderError::Provider(_) => StreamFailureKind::Provider,
        };
        StreamFailure::new(kind, self.to_string())
    }
}

#[async_trait::async_trait]
pub trait ChatProvider: Send + Sync {
    /// Streams a response and collects every chunk. Implementations must check
    /// `cancel` between chunks and return `ProviderError::Cancelled` once it fires.
    async fn stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools_enabled: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ProviderError>;

    async fn list_models(&self) -> Result<Vec<String>, ProviderError>;
}

/// Offline provider that answers by echoing the last user message word by word.
#[derive(Debug, Clone)]
pub struct EchoProvider {
    models: Vec<String>,
    tool_models: Vec<String>,
    chunk_delay: Duration,
}

impl EchoProvider {
    pub fn new(models: Vec<String>) -> Self {
        Self {
            models,
            tool_models: Vec::new(),
            chunk_delay: Duration::from_millis(15),
        }
    }

    /// Models listed here accept requests that carry tool definitions.
    pub fn with_tool_models(mut self, tool_models: Vec<String>) -> Self {
        self.tool_models = tool_models;
        self
    }
}

#[async_trait::async_trait]
impl ChatProvider for EchoProvider {
    async fn stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools_enabled: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ProviderError> {
        if tools_enabled && !self.tool_models.iter().any(|m| m == model) {
            return Err(ProviderError::ToolsUnsupported {
                model: model.to_string(),
            });
        }

        let prompt = messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.as_str())
            .unwrap_or_default();
        let reply = format!("You said: {prompt}");

        let mut chunks = Vec::new();
        for word in reply.split_inclusive(' ') {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                _ = tokio::time::sleep(self.chunk_delay) => chunks.push(word.to_string()),
            }
        }
        Ok(chunks)
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        Ok(self.models.clone())
    }
}
