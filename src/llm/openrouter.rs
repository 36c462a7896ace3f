//! # OpenRouter-compatible client
//!
//! [`LlmClient`] over `openrouter_api`, usable with any backend that speaks the
//! OpenAI chat-completions dialect (OpenRouter, OpenAI, Ollama). The service has no
//! server-side chats, so chat ids are local and history lives in the session store.

use super::{
    AssistantTurn, ChatMessage, CompletionRequest, LlmClient, ModelInfo, Role, SentMessage,
    StreamCallback, StreamEvent, ToolCall, retry_transient,
};
use crate::backend::Backend;
use crate::config::Config;
use crate::error::LlmError;
use crate::tools::ToolDefinition;
use async_trait::async_trait;
use futures::StreamExt;
use once_cell::sync::Lazy;
use openrouter_api::{
    OpenRouterClient, Ready,
    models::tool::{FunctionCall, FunctionDescription, Tool as ApiTool, ToolCall as ApiToolCall},
    types::chat::{ChatCompletionRequest, Message},
};
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

static HTTP_STATUS_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([45]\d{2})\b").expect("Invalid regex"));

pub struct OpenRouterLlm {
    backend: Backend,
    base_url: String,
    timeout: Duration,
    max_retries: u32,
    models: Vec<String>,
    client: RwLock<Option<Arc<OpenRouterClient<Ready>>>>,
}

impl OpenRouterLlm {
    pub fn new(config: &Config) -> Self {
        let mut models = vec![config.model.clone()];
        for model in &config.models {
            if !models.contains(model) {
                models.push(model.clone());
            }
        }
        Self {
            backend: config.backend,
            base_url: config.base_url(),
            timeout: Duration::from_secs(config.timeout_seconds),
            max_retries: config.max_retries,
            models,
            client: RwLock::new(None),
        }
    }

    fn build_client(&self) -> Result<OpenRouterClient<Ready>, LlmError> {
        let api_key = self.backend.api_key().map_err(LlmError::Authentication)?;
        let client = OpenRouterClient::new()
            .with_base_url(&self.base_url)
            .map_err(|e| LlmError::transport(e.to_string()))?
            .with_timeout(self.timeout)
            .with_api_key(api_key)
            .map_err(|e| LlmError::transport(e.to_string()))?;
        Ok(client)
    }

    async fn client(&self) -> Result<Arc<OpenRouterClient<Ready>>, LlmError> {
        if let Some(client) = self.client.read().await.as_ref() {
            return Ok(Arc::clone(client));
        }
        let client = Arc::new(self.build_client()?);
        *self.client.write().await = Some(Arc::clone(&client));
        Ok(client)
    }

    fn build_request(&self, model: &str, messages: &[ChatMessage], tools: &[ToolDefinition]) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: model.to_string(),
            messages: messages.iter().map(to_api_message).collect(),
            tools: if tools.is_empty() {
                None
            } else {
                Some(tools.iter().map(to_api_tool).collect())
            },
            stream: Some(true),
            response_format: None,
            provider: None,
            models: None,
            transforms: None,
        }
    }

    /// Streams one request and folds the chunks into a single turn.
    async fn stream_and_collect(
        &self,
        request: ChatCompletionRequest,
        on_event: Option<StreamCallback<'_>>,
    ) -> Result<AssistantTurn, LlmError> {
        let client = self.client().await?;
        let chat = client.chat().map_err(|e| classify_error(&e.to_string()))?;
        let mut stream = chat.chat_completion_stream(request);

        let mut content = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| classify_error(&e.to_string()))?;
            let choice = chunk.choices.first();

            if let Some(delta) = choice.and_then(|c| c.delta.content.as_deref()) {
                if !delta.is_empty() {
                    content.push_str(delta);
                    if let Some(on_event) = on_event {
                        on_event(StreamEvent::AssistantDelta(delta.to_string()));
                    }
                }
            }

            if let Some(chunks) = choice.and_then(|c| c.delta.tool_calls.as_ref()) {
                for chunk in chunks {
                    merge_tool_call_chunk(&mut tool_calls, chunk);
                }
            }
        }

        if let Some(on_event) = on_event {
            for call in &tool_calls {
                on_event(StreamEvent::ToolCall(call.clone()));
            }
        }
        debug!(chars = content.len(), tool_calls = tool_calls.len(), "collected completion");

        Ok(AssistantTurn {
            content,
            tool_calls,
            chat_id: None,
        })
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        on_event: Option<StreamCallback<'_>>,
    ) -> Result<AssistantTurn, LlmError> {
        let mut turn = retry_transient(self.max_retries, || {
            let api_request = self.build_request(&request.model, &request.messages, &request.tools);
            self.stream_and_collect(api_request, on_event)
        })
        .await?;
        turn.chat_id = request.chat_id.clone();
        Ok(turn)
    }
}

#[async_trait]
impl LlmClient for OpenRouterLlm {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, LlmError> {
        Ok(self
            .models
            .iter()
            .map(|id| ModelInfo {
                id: id.clone(),
                name: None,
            })
            .collect())
    }

    async fn session_check(&self) -> Result<bool, LlmError> {
        Ok(self.client().await.is_ok())
    }

    /// Re-reads the API key from the environment and rebuilds the client.
    async fn login(&self) -> Result<(), LlmError> {
        let client = Arc::new(self.build_client()?);
        *self.client.write().await = Some(client);
        info!(backend = ?self.backend, "model client re-authenticated");
        Ok(())
    }

    /// The service only offers streaming; the reply is collected without
    /// reporting deltas.
    async fn chat_completion(&self, request: &CompletionRequest) -> Result<AssistantTurn, LlmError> {
        self.complete(request, None).await
    }

    async fn chat_completion_stream(
        &self,
        request: &CompletionRequest,
        on_event: StreamCallback<'_>,
    ) -> Result<AssistantTurn, LlmError> {
        self.complete(request, Some(on_event)).await
    }

    async fn send_message(
        &self,
        model: &str,
        message: &str,
        chat_id: Option<&str>,
    ) -> Result<SentMessage, LlmError> {
        let request = CompletionRequest {
            model: model.to_string(),
            messages: vec![ChatMessage::user(message)],
            chat_id: chat_id.map(str::to_string),
            tools: Vec::new(),
        };
        let turn = self.complete(&request, None).await?;
        Ok(SentMessage {
            text: turn.content,
            chat_id: turn.chat_id,
        })
    }
}

fn to_api_message(message: &ChatMessage) -> Message {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    Message {
        role: role.to_string(),
        content: message.content.clone(),
        name: message.name.clone(),
        tool_calls: if message.tool_calls.is_empty() {
            None
        } else {
            Some(
                message
                    .tool_calls
                    .iter()
                    .map(|call| ApiToolCall {
                        id: call.id.clone(),
                        kind: "function".to_string(),
                        function_call: FunctionCall {
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                        },
                    })
                    .collect(),
            )
        },
        tool_call_id: message.tool_call_id.clone(),
    }
}

fn to_api_tool(definition: &ToolDefinition) -> ApiTool {
    ApiTool::Function {
        function: FunctionDescription {
            name: definition.name.to_string(),
            description: Some(definition.description.to_string()),
            parameters: definition.parameters.clone(),
            strict: None,
        },
    }
}

/// Streams deliver a call's id and name once, then argument fragments with an
/// empty id. Fragments are appended to the call they continue.
fn merge_tool_call_chunk(calls: &mut Vec<ToolCall>, chunk: &ApiToolCall) {
    let continues_last = chunk.id.is_empty() && !calls.is_empty();
    if continues_last {
        if let Some(last) = calls.last_mut() {
            if last.name.is_empty() {
                last.name = chunk.function_call.name.clone();
            }
            last.arguments.push_str(&chunk.function_call.arguments);
        }
        return;
    }
    calls.push(ToolCall {
        id: chunk.id.clone(),
        name: chunk.function_call.name.clone(),
        arguments: chunk.function_call.arguments.clone(),
    });
}

/// Maps a transport error message onto [`LlmError`]. The transport only exposes
/// errors as text, so the HTTP status is recovered from the message when present.
fn classify_error(message: &str) -> LlmError {
    let status = HTTP_STATUS_REGEX
        .captures(message)
        .and_then(|caps| caps[1].parse::<u16>().ok())
        .unwrap_or(0);
    match status {
        401 | 403 => LlmError::Authentication(message.to_string()),
        _ => LlmError::RequestFailed {
            status,
            body: message.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_chunk(id: &str, name: &str, arguments: &str) -> ApiToolCall {
        ApiToolCall {
            id: id.to_string(),
            kind: "function".to_string(),
            function_call: FunctionCall {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        }
    }

    #[test]
    fn test_merges_streamed_argument_fragments() {
        let mut calls = Vec::new();
        merge_tool_call_chunk(&mut calls, &api_chunk("call_1", "read_file", "{\"pa"));
        merge_tool_call_chunk(&mut calls, &api_chunk("", "", "th\": \"a.rs\"}"));
        merge_tool_call_chunk(&mut calls, &api_chunk("call_2", "list_files", "{}"));
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].arguments, "{\"path\": \"a.rs\"}");
        assert_eq!(calls[1].name, "list_files");
    }

    #[test]
    fn test_classify_error_extracts_status() {
        assert_eq!(
            classify_error("API error 422: tools not supported"),
            LlmError::RequestFailed {
                status: 422,
                body: "API error 422: tools not supported".to_string()
            }
        );
        assert!(matches!(
            classify_error("HTTP 401 Unauthorized"),
            LlmError::Authentication(_)
        ));
        assert!(classify_error("connection reset").is_transient());
    }

    #[test]
    fn test_models_include_default_once() {
        let config = Config {
            models: vec!["a/b".to_string(), Config::default().model],
            ..Config::default()
        };
        let llm = OpenRouterLlm::new(&config);
        assert_eq!(llm.models, vec![Config::default().model, "a/b".to_string()]);
    }
}
