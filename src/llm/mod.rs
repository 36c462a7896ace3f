//! # LLM Client
//!
//! The seam between the agent loop and a chat-completion service. The loop only
//! speaks these types; concrete transports live in submodules.

use crate::error::LlmError;
use crate::tools::ToolDefinition;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

pub mod openrouter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model. `arguments` is the raw JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool(call_id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            name: Some(name.into()),
            ..Self::new(Role::Tool, content)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub chat_id: Option<String>,
    /// Empty means the request is sent without a tool catalog.
    pub tools: Vec<ToolDefinition>,
}

/// One assistant reply: text, requested tool calls, and the chat it landed in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantTurn {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub chat_id: Option<String>,
}

/// Reply to a plain [`LlmClient::send_message`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SentMessage {
    pub text: String,
    pub chat_id: Option<String>,
}

/// Incremental output of a streaming completion.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    AssistantDelta(String),
    ReasoningDelta(String),
    ToolCall(ToolCall),
    ToolResult(Value),
}

pub type StreamCallback<'a> = &'a (dyn Fn(StreamEvent) + Send + Sync);

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, LlmError>;

    /// Whether the current credentials are usable.
    async fn session_check(&self) -> Result<bool, LlmError> {
        Ok(true)
    }

    async fn login(&self) -> Result<(), LlmError> {
        Ok(())
    }

    /// Creates a remote chat and returns its id. Transports without server-side
    /// chats mint a local id.
    async fn create_chat(&self, _model: &str, _title: &str) -> Result<String, LlmError> {
        Ok(uuid::Uuid::new_v4().to_string())
    }

    async fn get_chat_history(&self, _chat_id: &str) -> Result<Vec<ChatMessage>, LlmError> {
        Ok(Vec::new())
    }

    async fn chat_completion(&self, request: &CompletionRequest) -> Result<AssistantTurn, LlmError>;

    /// Streams a completion, reporting deltas through `on_event`. The default
    /// delivers the whole reply as a single delta.
    async fn chat_completion_stream(
        &self,
        request: &CompletionRequest,
        on_event: StreamCallback<'_>,
    ) -> Result<AssistantTurn, LlmError> {
        let turn = self.chat_completion(request).await?;
        if !turn.content.is_empty() {
            on_event(StreamEvent::AssistantDelta(turn.content.clone()));
        }
        for call in &turn.tool_calls {
            on_event(StreamEvent::ToolCall(call.clone()));
        }
        Ok(turn)
    }

    /// Sends a plain message without a tool catalog. Used by the text protocol.
    async fn send_message(
        &self,
        model: &str,
        message: &str,
        chat_id: Option<&str>,
    ) -> Result<SentMessage, LlmError>;
}

/// Retries `call` on transient failures, up to `max_retries` extra attempts with
/// linear backoff.
pub async fn retry_transient<T, F, Fut>(max_retries: u32, mut call: F) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Err(err) if err.is_transient() && attempt < max_retries => {
                attempt += 1;
                warn!(attempt, error = %err, "transient model request failure, retrying");
                tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
            }
            other => return other,
        }
    }
}
