//! # Agent Task Loop
//!
//! Drives one task through a bounded tool-calling conversation with the model.
//! When the model or transport cannot do native tool calls, the loop degrades to
//! a text protocol where the model answers with JSON actions (see [`fallback`]).
//!
//! The agent owns the process-wide change-set registries and the short-term chat
//! memory. Everything else is per task.

use crate::config::Config;
use crate::error::{AgentError, LlmError, ToolError};
use crate::llm::{
    AssistantTurn, ChatMessage, CompletionRequest, LlmClient, StreamCallback, StreamEvent,
};
use crate::policy::SharedToolGate;
use crate::store::SessionStore;
use crate::tool_collection::ToolCollection;
use crate::tools::{Args, MutationReport, ToolOutput};
use serde::Serialize;
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod changes;
pub mod events;
mod fallback;
pub mod intent;
pub mod memory;
pub mod parse;
pub mod prompts;

use self::changes::{ApplyReport, ChangeRegistry, DiscardReport, PendingChange, UndoReport};
use self::events::{LoopEvent, ToolResultEvent};
use self::intent::{ChangeIntent, KeywordIntent};
use self::memory::ChatMemory;
use self::parse::{canonical_tool_name, decode_call_arguments, normalize_args};

const TIMEOUT_SUMMARY: &str = "Agent reached max tool iterations without final answer.";

#[derive(Debug, Clone, PartialEq)]
pub struct AgentSettings {
    pub default_model: String,
    pub max_steps: usize,
    pub history_limit: usize,
    pub repair_attempts: usize,
    pub system_prompt: String,
}

impl AgentSettings {
    pub fn from_config(config: &Config) -> Self {
        let system_prompt = if config.agent.system_prompt.trim().is_empty() {
            prompts::DEFAULT_SYSTEM_PROMPT.to_string()
        } else {
            config.agent.system_prompt.clone()
        };
        Self {
            default_model: config.model.clone(),
            max_steps: config.agent.max_steps,
            history_limit: config.agent.history_limit,
            repair_attempts: config.agent.repair_attempts,
            system_prompt,
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskRequest {
    pub message: String,
    /// `None` means the configured default model.
    pub model_id: Option<String>,
    /// `None` creates a new chat titled after the message.
    pub chat_id: Option<String>,
    pub auto_apply: bool,
}

/// Per-task hooks supplied by the caller.
#[derive(Clone, Default)]
pub struct TaskContext {
    pub cancel: CancellationToken,
    pub events: Option<UnboundedSender<LoopEvent>>,
    pub gate: Option<SharedToolGate>,
}

impl TaskContext {
    /// Delivery is fire-and-forget: a closed receiver never fails the task.
    pub fn emit(&self, event: LoopEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn check_cancelled(&self) -> Result<(), AgentError> {
        if self.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        Ok(())
    }
}

/// Outcome of one tool invocation as fed back to the model.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    pub ok: bool,
    pub name: String,
    pub result: Option<ToolOutput>,
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(name: impl Into<String>, output: ToolOutput) -> Self {
        Self {
            ok: true,
            name: name.into(),
            result: Some(output),
            error: None,
        }
    }

    pub fn failure(name: impl Into<String>, error: impl ToString) -> Self {
        Self {
            ok: false,
            name: name.into(),
            result: None,
            error: Some(error.to_string()),
        }
    }

    fn mutation(&self) -> Option<&MutationReport> {
        self.result.as_ref().and_then(ToolOutput::as_mutation)
    }

    /// Path of a file this call changed on disk.
    pub fn changed_path(&self) -> Option<&str> {
        self.mutation()
            .filter(|report| report.is_applied_change() && !report.path.is_empty())
            .map(|report| report.path.as_str())
    }

    pub fn pending_change(&self) -> Option<PendingChange> {
        self.mutation()
            .and_then(|report| PendingChange::from_report(&self.name, report))
    }
}

/// File effects accumulated over a task. Pending changes are deduplicated on
/// their exact operation, path and arguments.
#[derive(Debug, Default)]
struct ChangeTracker {
    applied_files: Vec<String>,
    pending: Vec<PendingChange>,
    seen: HashSet<String>,
}

impl ChangeTracker {
    /// Records the effects of `result`; returns whether it had any.
    fn record(&mut self, result: &ToolResult) -> bool {
        let mut effect = false;
        if let Some(path) = result.changed_path() {
            effect = true;
            if !self.applied_files.iter().any(|p| p == path) {
                self.applied_files.push(path.to_string());
            }
        }
        if let Some(change) = result.pending_change() {
            effect = true;
            if self.seen.insert(change.dedup_key()) {
                self.pending.push(change);
            }
        }
        effect
    }

    fn has_changes(&self) -> bool {
        !self.applied_files.is_empty() || !self.pending.is_empty()
    }
}

/// Mutable state of one task invocation.
struct TaskState {
    message: String,
    model: String,
    chat_id: Option<String>,
    chat_title: Option<String>,
    history: Vec<ChatMessage>,
    auto_apply: bool,
    requires_changes: bool,
    tracker: ChangeTracker,
    tool_steps: usize,
    successful_calls: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskOutcome {
    pub chat_id: Option<String>,
    pub chat_title: Option<String>,
    pub model_id: String,
    pub assistant_message: String,
    pub applied_files: Vec<String>,
    pub pending_id: Option<String>,
    pub pending_changes: Vec<PendingChange>,
    pub tool_steps: usize,
    pub fallback_used: bool,
}

pub struct AgentRuntime {
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn SessionStore>,
    tools: Arc<ToolCollection>,
    settings: AgentSettings,
    intent: Box<dyn ChangeIntent>,
    changes: ChangeRegistry,
    memory: ChatMemory,
}

impl AgentRuntime {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        store: Arc<dyn SessionStore>,
        tools: Arc<ToolCollection>,
        settings: AgentSettings,
    ) -> Self {
        let memory = ChatMemory::new(settings.history_limit);
        Self {
            llm,
            store,
            tools,
            settings,
            intent: Box::new(KeywordIntent::default()),
            changes: ChangeRegistry::default(),
            memory,
        }
    }

    /// Replaces the classifier deciding whether a task must change files.
    pub fn with_intent(mut self, intent: Box<dyn ChangeIntent>) -> Self {
        self.intent = intent;
        self
    }

    pub fn tools(&self) -> &ToolCollection {
        &self.tools
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Runs one task to a final answer.
    pub async fn run_task(&self, request: TaskRequest, ctx: &TaskContext) -> Result<TaskOutcome, AgentError> {
        let message = request.message.trim().to_string();
        if message.is_empty() {
            return Err(AgentError::InvalidInput("message is required".to_string()));
        }
        ctx.check_cancelled()?;

        self.ensure_authenticated().await?;
        let model = self.resolve_model(request.model_id.as_deref()).await?;
        let (chat_id, chat_title) = self
            .ensure_chat(&model, request.chat_id.as_deref(), &message)
            .await?;
        let history = self.load_history(chat_id.as_deref()).await;
        info!(model = %model, chat_id = ?chat_id, auto_apply = request.auto_apply, "starting agent task");

        let mut task = TaskState {
            requires_changes: self.intent.requires_file_changes(&message),
            message,
            model,
            chat_id,
            chat_title,
            history,
            auto_apply: request.auto_apply,
            tracker: ChangeTracker::default(),
            tool_steps: 0,
            successful_calls: 0,
        };
        self.tool_loop(&mut task, ctx).await
    }

    async fn tool_loop(&self, task: &mut TaskState, ctx: &TaskContext) -> Result<TaskOutcome, AgentError> {
        let definitions = self.tools.definitions();
        let mut conversation = vec![ChatMessage::system(&self.settings.system_prompt)];
        conversation.extend(task.history.iter().cloned());
        conversation.push(ChatMessage::user(&task.message));

        for step in 1..=self.settings.max_steps {
            ctx.check_cancelled()?;
            ctx.emit(LoopEvent::status(format!("Step {step}: requesting model")));

            let request = CompletionRequest {
                model: task.model.clone(),
                messages: conversation.clone(),
                chat_id: task.chat_id.clone(),
                tools: definitions.clone(),
            };
            let turn = match self.request_turn(&request, ctx).await {
                Ok(turn) => turn,
                Err(err) if err.is_payload_rejection() && task.successful_calls == 0 => {
                    warn!(error = %err, "model rejected tool-calling payload, switching to text protocol");
                    ctx.emit(LoopEvent::status(
                        "Model does not support tool calls in this format, using fallback mode",
                    ));
                    let text = self.run_fallback(task, ctx).await?.text;
                    return Ok(self.finish(task, ctx, text, true));
                }
                Err(err) => return Err(err.into()),
            };
            if task.chat_id.is_none() {
                task.chat_id = turn.chat_id.clone();
            }

            if turn.tool_calls.is_empty() {
                return self.finalize(task, ctx, turn).await;
            }

            let mut assistant = ChatMessage::assistant(&turn.content);
            assistant.tool_calls = turn.tool_calls.clone();
            conversation.push(assistant);

            for call in &turn.tool_calls {
                ctx.check_cancelled()?;
                let args = decode_call_arguments(&call.arguments);
                let result = self.execute_tool(task, ctx, step, &call.name, args);
                let call_id = if call.id.trim().is_empty() {
                    format!("tool_call_{}", task.tool_steps)
                } else {
                    call.id.clone()
                };
                let content = serde_json::to_string(&result).unwrap_or_default();
                conversation.push(ChatMessage::tool(call_id, &result.name, content));
            }
        }

        let mut text = TIMEOUT_SUMMARY.to_string();
        if !task.tracker.applied_files.is_empty() {
            text.push_str("\n\n");
            text.push_str(&prompts::file_list("Updated files:", &task.tracker.applied_files));
        }
        if !task.tracker.pending.is_empty() {
            text.push_str("\n\n");
            text.push_str(&prompts::summarize_pending(&task.tracker.pending));
        }
        warn!(steps = self.settings.max_steps, "agent task hit the step limit");
        Ok(self.finish(task, ctx, text, false))
    }

    /// Handles a reply without tool calls: a rescue attempt through the text
    /// protocol when the task looks unfinished, otherwise the final answer.
    async fn finalize(
        &self,
        task: &mut TaskState,
        ctx: &TaskContext,
        turn: AssistantTurn,
    ) -> Result<TaskOutcome, AgentError> {
        let unmet_changes = task.requires_changes && !task.tracker.has_changes();
        if task.successful_calls == 0 || unmet_changes {
            debug!(
                successful_calls = task.successful_calls,
                unmet_changes, "no tool calls in reply, trying text protocol"
            );
            match self.run_fallback(task, ctx).await {
                Ok(outcome) if outcome.has_effect => {
                    return Ok(self.finish(task, ctx, outcome.text, true));
                }
                Ok(_) => {}
                Err(AgentError::Llm(err)) if err.is_request_failure() => {
                    debug!(error = %err, "text protocol rescue failed");
                }
                Err(err) => return Err(err),
            }
        }

        let mut text = turn.content.trim().to_string();
        if !task.tracker.applied_files.is_empty() {
            text.push_str("\n\n");
            text.push_str(&prompts::file_list("Updated files:", &task.tracker.applied_files));
        }
        if task.requires_changes && !task.tracker.has_changes() {
            text.push_str("\n\n");
            text.push_str(prompts::UNMET_CHANGES_WARNING);
        }
        if !task.tracker.pending.is_empty() {
            text.push_str("\n\n");
            text.push_str(&prompts::summarize_pending(&task.tracker.pending));
        }
        Ok(self.finish(task, ctx, text, false))
    }

    /// Remembers the turn, registers pending changes and builds the outcome.
    fn finish(&self, task: &mut TaskState, ctx: &TaskContext, text: String, fallback_used: bool) -> TaskOutcome {
        ctx.emit(LoopEvent::status("Answer ready"));
        if let Some(chat_id) = &task.chat_id {
            let turn = [
                ChatMessage::user(&task.message),
                ChatMessage::assistant(prompts::strip_reasoning(&text)),
            ];
            self.memory.remember(chat_id, &turn);
            if let Err(e) = self.store.append_chat_messages(chat_id, &turn) {
                warn!(chat_id = %chat_id, error = %e, "failed to cache chat turn");
            }
        }
        let pending_changes = std::mem::take(&mut task.tracker.pending);
        let pending_id = self.changes.register_pending(&pending_changes);
        TaskOutcome {
            chat_id: task.chat_id.clone(),
            chat_title: task.chat_title.clone(),
            model_id: task.model.clone(),
            assistant_message: text,
            applied_files: task.tracker.applied_files.clone(),
            pending_id,
            pending_changes,
            tool_steps: task.tool_steps,
            fallback_used,
        }
    }

    /// Streams one completion; a rejected streaming payload is retried once
    /// without streaming.
    async fn request_turn(&self, request: &CompletionRequest, ctx: &TaskContext) -> Result<AssistantTurn, LlmError> {
        let on_event = |event: StreamEvent| match event {
            StreamEvent::AssistantDelta(text) => ctx.emit(LoopEvent::AssistantDelta { text }),
            StreamEvent::ReasoningDelta(text) => ctx.emit(LoopEvent::ReasoningDelta { text }),
            StreamEvent::ToolCall(_) | StreamEvent::ToolResult(_) => {}
        };
        let callback: StreamCallback<'_> = &on_event;

        match self
            .with_login(|| self.llm.chat_completion_stream(request, callback))
            .await
        {
            Err(err) if err.is_payload_rejection() => {
                debug!(error = %err, "streaming payload rejected, retrying without streaming");
                let turn = self.with_login(|| self.llm.chat_completion(request)).await?;
                ctx.emit(LoopEvent::status("Streaming unavailable, continuing without streaming"));
                Ok(turn)
            }
            other => other,
        }
    }

    /// Runs one tool call: policy check, execution in the task's mode, events.
    /// Failures become error results; they never abort the task.
    fn execute_tool(
        &self,
        task: &mut TaskState,
        ctx: &TaskContext,
        step: usize,
        raw_name: &str,
        args: Result<Args, ToolError>,
    ) -> ToolResult {
        task.tool_steps += 1;
        let name = canonical_tool_name(raw_name).to_string();
        let args = args.map(|args| normalize_args(&name, args));
        let args_value = Value::Object(args.clone().unwrap_or_default());
        ctx.emit(LoopEvent::ToolStart {
            step,
            name: name.clone(),
            args: args_value.clone(),
        });

        let mutating = self.tools.is_mutating(&name);
        let policy = ctx
            .gate
            .as_ref()
            .map(|gate| gate.decide(&name, &args_value, mutating));

        let result = match (args, &policy) {
            (_, Some(decision)) if decision.is_denied() => {
                info!(tool = %name, source = %decision.source, "tool call denied by policy");
                ToolResult::failure(&name, ToolError::Denied(decision.reason.clone()))
            }
            (Err(e), _) => ToolResult::failure(&name, e),
            (Ok(_), _) => match self.tools.execute(&name, &args_value, task.auto_apply) {
                Ok(output) => ToolResult::success(&name, output),
                Err(e) => {
                    debug!(tool = %name, error = %e, "tool call failed");
                    ToolResult::failure(&name, e)
                }
            },
        };

        if result.ok {
            task.successful_calls += 1;
        }
        task.tracker.record(&result);
        let mutation = result.mutation();
        ctx.emit(LoopEvent::ToolResult(ToolResultEvent {
            step,
            name: name.clone(),
            ok: result.ok,
            path: result
                .result
                .as_ref()
                .and_then(ToolOutput::path)
                .map(str::to_string),
            error: result.error.clone(),
            changed: mutation.is_some_and(|m| m.changed),
            pending: mutation.is_some_and(MutationReport::is_pending),
            policy,
        }));
        result
    }

    /// Calls the model once, logging in again and retrying once on an
    /// authentication failure.
    async fn with_login<T, F, Fut>(&self, mut call: F) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        match call().await {
            Err(LlmError::Authentication(reason)) => {
                warn!(%reason, "model authentication failed, logging in again");
                self.llm.login().await?;
                call().await
            }
            other => other,
        }
    }

    async fn ensure_authenticated(&self) -> Result<(), AgentError> {
        match self.llm.session_check().await {
            Ok(true) => Ok(()),
            Ok(false) | Err(LlmError::Authentication(_)) => {
                info!("model session not authenticated, logging in");
                Ok(self.llm.login().await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn resolve_model(&self, requested: Option<&str>) -> Result<String, AgentError> {
        let model = requested
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.settings.default_model.as_str())
            .to_string();
        let models = self.with_login(|| self.llm.list_models()).await?;
        if models.iter().any(|m| m.id == model) {
            Ok(model)
        } else {
            Err(LlmError::ModelNotFound(model).into())
        }
    }

    /// Returns the chat to use and, for a newly created chat, its title. A
    /// service that cannot create chats leaves the task without one.
    async fn ensure_chat(
        &self,
        model: &str,
        requested: Option<&str>,
        message: &str,
    ) -> Result<(Option<String>, Option<String>), AgentError> {
        if let Some(chat_id) = requested.map(str::trim).filter(|id| !id.is_empty()) {
            return Ok((Some(chat_id.to_string()), None));
        }
        let title = prompts::chat_title(message);
        match self.with_login(|| self.llm.create_chat(model, &title)).await {
            Ok(chat_id) => {
                debug!(chat_id = %chat_id, title = %title, "created chat");
                Ok((Some(chat_id), Some(title)))
            }
            Err(err) if err.is_request_failure() => {
                warn!(error = %err, "could not create chat, continuing without one");
                Ok((None, None))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Prior turns of a chat: remote history when available (refreshing the local
    /// cache), else the local cache, else short-term memory.
    async fn load_history(&self, chat_id: Option<&str>) -> Vec<ChatMessage> {
        let Some(chat_id) = chat_id else {
            return Vec::new();
        };
        let limit = self.settings.history_limit;

        let local = match self.store.list_chat_messages(chat_id, Some(limit)) {
            Ok(messages) => prompts::normalize_history(&messages, limit),
            Err(e) => {
                warn!(chat_id, error = %e, "failed to read cached chat history");
                Vec::new()
            }
        };
        let history = match self.with_login(|| self.llm.get_chat_history(chat_id)).await {
            Ok(remote) => {
                let remote = prompts::normalize_history(&remote, limit);
                if remote.is_empty() {
                    local
                } else {
                    if let Err(e) = self.store.replace_chat_messages(chat_id, &remote) {
                        warn!(chat_id, error = %e, "failed to refresh cached chat history");
                    }
                    remote
                }
            }
            Err(e) => {
                debug!(chat_id, error = %e, "remote chat history unavailable");
                local
            }
        };
        if history.is_empty() {
            self.memory.recent(chat_id, limit)
        } else {
            history
        }
    }

    pub fn apply_pending_changes(&self, pending_id: &str) -> Result<ApplyReport, AgentError> {
        let report = self.changes.apply_pending(pending_id, &self.tools)?;
        info!(pending_id, applied = report.applied_count, errors = report.errors.len(), "applied pending changes");
        Ok(report)
    }

    pub fn discard_pending_changes(&self, pending_id: &str) -> Result<DiscardReport, AgentError> {
        self.changes.discard_pending(pending_id)
    }

    pub fn undo_applied_changes(&self, applied_change_id: &str) -> Result<UndoReport, AgentError> {
        let report = self.changes.undo_applied(applied_change_id, &self.tools)?;
        info!(applied_change_id, undone = report.undone_count, "undid applied changes");
        Ok(report)
    }

    pub fn discard_applied_changes(&self, applied_change_id: &str) -> Result<DiscardReport, AgentError> {
        self.changes.discard_applied(applied_change_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::FileContent;

    #[test]
    fn test_tracker_dedups_pending_changes() {
        let pending = ToolResult::success(
            "write_file",
            ToolOutput::Mutation(MutationReport {
                path: "a.py".into(),
                operation: "write_file",
                changed: true,
                applied: false,
                diff: Some("+x\n".into()),
                apply_args: Some(serde_json::json!({"path": "a.py", "content": "x"})),
                ..MutationReport::default()
            }),
        );
        let applied = ToolResult::success(
            "replace_in_file",
            ToolOutput::Mutation(MutationReport {
                path: "b.py".into(),
                operation: "replace_in_file",
                changed: true,
                applied: true,
                ..MutationReport::default()
            }),
        );
        let read = ToolResult::success(
            "read_file",
            ToolOutput::Content(FileContent {
                path: "a.py".into(),
                content: String::new(),
                truncated: false,
                total_chars: 0,
            }),
        );

        let mut tracker = ChangeTracker::default();
        assert!(!tracker.record(&read));
        assert!(tracker.record(&pending));
        assert!(tracker.record(&pending));
        assert!(tracker.record(&applied));
        assert_eq!(tracker.pending.len(), 1);
        assert_eq!(tracker.applied_files, vec!["b.py"]);
        assert!(tracker.has_changes());
        assert!(ToolResult::failure("x", "boom").changed_path().is_none());
    }

    #[test]
    fn test_tool_result_serialization() {
        let failed = serde_json::to_value(ToolResult::failure("read_file", "File not found: a")).unwrap();
        assert_eq!(
            failed,
            serde_json::json!({"ok": false, "name": "read_file", "error": "File not found: a"})
        );
    }

    #[test]
    fn test_settings_default_prompt() {
        let settings = AgentSettings::default();
        assert_eq!(settings.system_prompt, prompts::DEFAULT_SYSTEM_PROMPT);
        assert_eq!(settings.max_steps, 8);
        assert_eq!(settings.repair_attempts, 6);
    }
}
