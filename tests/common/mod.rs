#![allow(dead_code)]

use agent_runtime::agent::{AgentRuntime, AgentSettings};
use agent_runtime::error::LlmError;
use agent_runtime::llm::{
    AssistantTurn, CompletionRequest, LlmClient, ModelInfo, SentMessage, ToolCall,
};
use agent_runtime::runtime::{ProtocolRuntime, RuntimeEvent, RuntimeSettings};
use agent_runtime::sandbox::Workspace;
use agent_runtime::store::FileSessionStore;
use agent_runtime::tool_collection::ToolCollection;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, mpsc};

pub const MODEL: &str = "model-x";

/// An `LlmClient` replaying canned replies in order.
#[derive(Default)]
pub struct ScriptedLlm {
    turns: Mutex<VecDeque<Result<AssistantTurn, LlmError>>>,
    replies: Mutex<VecDeque<String>>,
    /// When set, every completion waits for a permit first.
    hold: Option<Arc<Notify>>,
    /// `session_check` reports an expired session until the next login.
    expired: AtomicBool,
    logins: AtomicUsize,
    pub completions: Mutex<Vec<CompletionRequest>>,
    pub sent: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turn(self, turn: AssistantTurn) -> Self {
        self.turns.lock().unwrap().push_back(Ok(turn));
        self
    }

    pub fn failure(self, err: LlmError) -> Self {
        self.turns.lock().unwrap().push_back(Err(err));
        self
    }

    pub fn reply(self, text: &str) -> Self {
        self.replies.lock().unwrap().push_back(text.to_string());
        self
    }

    pub fn expired(self) -> Self {
        self.expired.store(true, Ordering::SeqCst);
        self
    }

    pub fn login_count(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn held(mut self, hold: Arc<Notify>) -> Self {
        self.hold = Some(hold);
        self
    }
}

pub fn tool_call(name: &str, args: Value) -> AssistantTurn {
    AssistantTurn {
        content: String::new(),
        tool_calls: vec![ToolCall {
            id: format!("call_{name}"),
            name: name.to_string(),
            arguments: args.to_string(),
        }],
        chat_id: None,
    }
}

pub fn answer(text: &str) -> AssistantTurn {
    AssistantTurn {
        content: text.to_string(),
        ..AssistantTurn::default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, LlmError> {
        Ok(vec![ModelInfo {
            id: MODEL.to_string(),
            name: None,
        }])
    }

    async fn session_check(&self) -> Result<bool, LlmError> {
        Ok(!self.expired.load(Ordering::SeqCst))
    }

    async fn login(&self) -> Result<(), LlmError> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        self.expired.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn chat_completion(&self, request: &CompletionRequest) -> Result<AssistantTurn, LlmError> {
        if let Some(hold) = &self.hold {
            hold.notified().await;
        }
        self.completions.lock().unwrap().push(request.clone());
        self.turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(answer("done")))
    }

    async fn send_message(
        &self,
        _model: &str,
        message: &str,
        chat_id: Option<&str>,
    ) -> Result<SentMessage, LlmError> {
        self.sent.lock().unwrap().push(message.to_string());
        let text = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "Nothing to do.".to_string());
        Ok(SentMessage {
            text,
            chat_id: chat_id.map(str::to_string),
        })
    }
}

pub fn agent(root: &Path, llm: Arc<ScriptedLlm>) -> Arc<AgentRuntime> {
    let workspace = Workspace::new(root).unwrap();
    let store = Arc::new(FileSessionStore::new(root, root.join(".agent-runtime")));
    let settings = AgentSettings {
        default_model: MODEL.to_string(),
        repair_attempts: 2,
        ..AgentSettings::default()
    };
    Arc::new(AgentRuntime::new(
        llm,
        store,
        Arc::new(ToolCollection::with_default_tools(workspace)),
        settings,
    ))
}

pub fn runtime(root: &Path, llm: Arc<ScriptedLlm>) -> (ProtocolRuntime, mpsc::UnboundedReceiver<RuntimeEvent>) {
    let store = Arc::new(FileSessionStore::new(root, root.join(".agent-runtime")));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let runtime = ProtocolRuntime::new(agent(root, llm), store, RuntimeSettings::default(), Some(events_tx));
    (runtime, events_rx)
}

pub fn drain(events: &mut mpsc::UnboundedReceiver<RuntimeEvent>) -> Vec<RuntimeEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
