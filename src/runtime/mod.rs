//! # Protocol Runtime
//!
//! Session and run lifecycle on top of the agent loop. A run moves through
//! `queued -> running -> {completed, failed, cancelled}`; runs found unfinished
//! after a restart become `interrupted` and are never resumed.
//!
//! One lock guards the session and run tables. It serializes the check-and-set
//! of a session's active run, so a session never has two unfinished runs. Each
//! run executes as its own task; the full table is written to the session store
//! after every change, best-effort.

use crate::agent::events::{LoopEvent, Phase};
use crate::agent::{AgentRuntime, TaskContext, TaskRequest};
use crate::config::Config;
use crate::error::{AgentError, RuntimeError};
use crate::policy::ToolPolicy;
use crate::store::SessionStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};
use serde_with::skip_serializing_none;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod state;
pub mod verify;

pub use self::state::{PersistedState, Run, RunError, RunStatus, STATE_VERSION, Session};

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    pub verify_commands: Vec<String>,
    pub verify_timeout: Duration,
    pub run_retention: usize,
    pub tool_policy: ToolPolicy,
}

impl RuntimeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            verify_commands: config.verify.commands.clone(),
            verify_timeout: Duration::from_secs(config.verify.timeout_seconds),
            run_retention: config.runtime.run_retention,
            tool_policy: ToolPolicy::default(),
        }
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// A phase-tagged notification about a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeEvent {
    pub event: &'static str,
    pub session_id: String,
    pub run_id: String,
    pub phase: Phase,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateSession {
    pub model_id: Option<String>,
    pub chat_id: Option<String>,
    pub metadata: Map<String, Value>,
}

/// Partial session update. `None` leaves a field unchanged; `Some(None)` or an
/// empty value clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionUpdate {
    pub model_id: Option<Option<String>>,
    pub chat_id: Option<Option<String>>,
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptRequest {
    pub session_id: String,
    pub message: String,
    pub auto_apply: bool,
    /// Overrides the session's `metadata.tool_policy`.
    pub tool_policy: Option<Value>,
    /// Overrides the session's `metadata.verify_commands`.
    pub verify_commands: Option<Vec<String>>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelOutcome {
    pub cancelled: bool,
    pub run_id: Option<String>,
    pub reason: Option<String>,
}

impl CancelOutcome {
    fn rejected(run_id: Option<String>, reason: &str) -> Self {
        Self {
            cancelled: false,
            run_id,
            reason: Some(reason.to_string()),
        }
    }
}

struct RunHandle {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

/// How a run ended, as recorded on the run and its session.
struct Outcome {
    status: RunStatus,
    result: Option<Value>,
    error: Option<RunError>,
    chat_id: Option<String>,
}

fn aborted() -> RunError {
    RunError::new("InternalError", "run task aborted unexpectedly")
}

#[derive(Default)]
struct Tables {
    sessions: HashMap<String, Session>,
    /// Oldest first.
    runs: Vec<Run>,
    handles: HashMap<String, RunHandle>,
}

impl Tables {
    fn from_state(state: PersistedState) -> (Self, bool) {
        let mut changed = false;
        let now = Utc::now();
        let mut runs = state.runs;
        for run in runs.iter_mut().filter(|run| !run.is_terminal()) {
            warn!(run_id = %run.id, status = ?run.status, "marking unfinished run as interrupted");
            run.finish(RunStatus::Interrupted);
            run.error = Some(RunError::new("Interrupted", "run was interrupted by a runtime restart"));
            changed = true;
        }

        let mut sessions = HashMap::new();
        for mut session in state.sessions {
            if let Some(active) = &session.active_run_id {
                let dangling = runs
                    .iter()
                    .find(|run| &run.id == active)
                    .is_none_or(Run::is_terminal);
                if dangling {
                    session.active_run_id = None;
                    session.updated_at = now;
                    changed = true;
                }
            }
            sessions.insert(session.id.clone(), session);
        }

        let tables = Self {
            sessions,
            runs,
            handles: HashMap::new(),
        };
        (tables, changed)
    }

    fn snapshot(&self) -> PersistedState {
        let mut sessions: Vec<Session> = self.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        PersistedState {
            version: STATE_VERSION,
            sessions,
            runs: self.runs.clone(),
        }
    }

    fn session(&self, id: &str) -> Result<&Session, RuntimeError> {
        self.sessions
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(format!("session not found: {id}")))
    }

    fn session_mut(&mut self, id: &str) -> Result<&mut Session, RuntimeError> {
        self.sessions
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(format!("session not found: {id}")))
    }

    fn run(&self, id: &str) -> Option<&Run> {
        self.runs.iter().find(|run| run.id == id)
    }

    fn run_mut(&mut self, id: &str) -> Option<&mut Run> {
        self.runs.iter_mut().find(|run| run.id == id)
    }

    /// Moves an unfinished run to its terminal state and releases the session's
    /// active pointer and the cancel handle. Returns the run only if this call
    /// finished it.
    fn finish_run(&mut self, run_id: &str, session_id: &str, outcome: Outcome) -> Option<Run> {
        let finished = self
            .run_mut(run_id)
            .filter(|run| !run.is_terminal())
            .map(|run| {
                run.finish(outcome.status);
                run.result = outcome.result;
                run.error = outcome.error;
                run.clone()
            });
        if let Ok(session) = self.session_mut(session_id) {
            if session.active_run_id.as_deref() == Some(run_id) {
                session.active_run_id = None;
            }
            if session.chat_id.is_none() {
                session.chat_id = outcome.chat_id;
            }
            session.updated_at = Utc::now();
        }
        self.handles.remove(run_id);
        finished
    }

    /// Drops the oldest finished runs beyond `retention`. Unfinished runs and
    /// runs a session still points at are kept.
    fn prune(&mut self, retention: usize) {
        while self.runs.len() > retention {
            let sessions = &self.sessions;
            let removable = self.runs.iter().position(|run| {
                run.is_terminal()
                    && !sessions
                        .values()
                        .any(|s| s.active_run_id.as_deref() == Some(run.id.as_str()))
            });
            match removable {
                Some(index) => {
                    let run = self.runs.remove(index);
                    debug!(run_id = %run.id, "pruned old run");
                }
                None => break,
            }
        }
    }
}

struct Inner {
    agent: Arc<AgentRuntime>,
    store: Arc<dyn SessionStore>,
    settings: RuntimeSettings,
    tables: Mutex<Tables>,
    /// Orders snapshot writes so an older snapshot never lands last.
    persist_lock: Mutex<()>,
    events: Option<mpsc::UnboundedSender<RuntimeEvent>>,
}

/// Cheaply cloneable handle to the runtime.
#[derive(Clone)]
pub struct ProtocolRuntime {
    inner: Arc<Inner>,
}

impl ProtocolRuntime {
    /// Creates the runtime and restores persisted sessions and runs.
    pub fn new(
        agent: Arc<AgentRuntime>,
        store: Arc<dyn SessionStore>,
        settings: RuntimeSettings,
        events: Option<mpsc::UnboundedSender<RuntimeEvent>>,
    ) -> Self {
        let loaded = match store.load_protocol_state() {
            Ok(Some(value)) => match serde_json::from_value::<PersistedState>(value) {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!(error = %e, "ignoring unreadable protocol state");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "failed to load protocol state");
                None
            }
        };

        let (tables, changed) = match loaded {
            Some(state) => {
                info!(sessions = state.sessions.len(), runs = state.runs.len(), "restored protocol state");
                Tables::from_state(state)
            }
            None => (Tables::default(), false),
        };
        if changed {
            if let Err(e) = store.save_protocol_state(&json!(tables.snapshot())) {
                warn!(error = %e, "failed to persist recovered protocol state");
            }
        }

        Self {
            inner: Arc::new(Inner {
                agent,
                store,
                settings,
                tables: Mutex::new(tables),
                persist_lock: Mutex::new(()),
                events,
            }),
        }
    }

    pub fn agent(&self) -> &AgentRuntime {
        &self.inner.agent
    }

    pub async fn create_session(&self, params: CreateSession) -> Session {
        let session = Session::new(
            clean(params.model_id),
            clean(params.chat_id),
            params.metadata,
        );
        {
            let mut tables = self.inner.tables.lock().await;
            tables.sessions.insert(session.id.clone(), session.clone());
        }
        info!(session_id = %session.id, "created session");
        self.inner.persist().await;
        session
    }

    pub async fn list_sessions(&self) -> Vec<Session> {
        self.inner.tables.lock().await.snapshot().sessions
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session, RuntimeError> {
        self.inner.tables.lock().await.session(session_id).cloned()
    }

    pub async fn update_session(&self, session_id: &str, update: SessionUpdate) -> Result<Session, RuntimeError> {
        let session = {
            let mut tables = self.inner.tables.lock().await;
            let session = tables.session_mut(session_id)?;
            if let Some(model_id) = update.model_id {
                session.model_id = clean(model_id);
            }
            if let Some(chat_id) = update.chat_id {
                session.chat_id = clean(chat_id);
            }
            if let Some(metadata) = update.metadata {
                session.metadata = metadata;
            }
            session.updated_at = Utc::now();
            session.clone()
        };
        self.inner.persist().await;
        Ok(session)
    }

    /// The session's active run, or else its most recent one.
    pub async fn latest_run(&self, session_id: &str) -> Result<Option<Run>, RuntimeError> {
        let tables = self.inner.tables.lock().await;
        let session = tables.session(session_id)?;
        if let Some(run) = session.active_run_id.as_deref().and_then(|id| tables.run(id)) {
            return Ok(Some(run.clone()));
        }
        Ok(tables
            .runs
            .iter()
            .rev()
            .find(|run| run.session_id == session_id)
            .cloned())
    }

    /// Queues a run for the session and starts it in the background.
    pub async fn start_prompt(&self, request: PromptRequest) -> Result<Run, RuntimeError> {
        let message = request.message.trim().to_string();
        if message.is_empty() {
            return Err(RuntimeError::InvalidParams("message is required".to_string()));
        }

        let (run, session, cancel, done_tx) = {
            let mut tables = self.inner.tables.lock().await;
            let session = tables.session(&request.session_id)?.clone();
            if let Some(active) = &session.active_run_id {
                if tables.run(active).is_some_and(|run| !run.is_terminal()) {
                    return Err(RuntimeError::RunInProgress {
                        run_id: active.clone(),
                    });
                }
            }

            let tool_policy = ToolPolicy::resolve(
                request.tool_policy.as_ref(),
                session.metadata.get("tool_policy"),
                &self.inner.settings.tool_policy,
            );
            let verify_commands = request
                .verify_commands
                .or_else(|| string_list(session.metadata.get("verify_commands")))
                .unwrap_or_else(|| self.inner.settings.verify_commands.clone());

            let run = Run {
                id: uuid::Uuid::new_v4().to_string(),
                session_id: session.id.clone(),
                message,
                auto_apply: request.auto_apply,
                tool_policy,
                verify_commands,
                status: RunStatus::Queued,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
                result: None,
                error: None,
            };

            let cancel = CancellationToken::new();
            let (done_tx, done_rx) = watch::channel(false);
            tables.handles.insert(
                run.id.clone(),
                RunHandle {
                    cancel: cancel.clone(),
                    done: done_rx,
                },
            );
            let session = {
                let session = tables.session_mut(&request.session_id)?;
                session.active_run_id = Some(run.id.clone());
                session.updated_at = Utc::now();
                session.clone()
            };
            tables.runs.push(run.clone());
            tables.prune(self.inner.settings.run_retention);
            (run, session, cancel, done_tx)
        };

        info!(session_id = %session.id, run_id = %run.id, "queued run");
        self.inner.persist().await;

        let inner = Arc::clone(&self.inner);
        let queued = run.clone();
        tokio::spawn(async move {
            let (run_id, session_id) = (queued.id.clone(), queued.session_id.clone());
            let worker = {
                let inner = Arc::clone(&inner);
                tokio::spawn(async move { inner.execute_run(queued, session, cancel).await })
            };
            if let Err(e) = worker.await {
                error!(run_id = %run_id, error = %e, "run driver panicked");
                let outcome = Outcome {
                    status: RunStatus::Failed,
                    result: None,
                    error: Some(aborted()),
                    chat_id: None,
                };
                inner.conclude(&run_id, &session_id, outcome).await;
            }
            let _ = done_tx.send(true);
        });
        Ok(run)
    }

    /// Waits until the run is finished or `timeout` elapses. A timeout only ends
    /// the wait; the run keeps going.
    pub async fn wait_run(&self, run_id: &str, timeout: Option<Duration>) -> Result<Run, RuntimeError> {
        let mut done = {
            let tables = self.inner.tables.lock().await;
            let run = tables
                .run(run_id)
                .ok_or_else(|| RuntimeError::NotFound(format!("run not found: {run_id}")))?;
            if run.is_terminal() {
                return Ok(run.clone());
            }
            match tables.handles.get(run_id) {
                Some(handle) => handle.done.clone(),
                None => return Ok(run.clone()),
            }
        };

        let finished = done.wait_for(|done| *done);
        match timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, finished).await.is_err() {
                    return Err(RuntimeError::Timeout(format!(
                        "run {run_id} did not finish within {:.1}s",
                        limit.as_secs_f64()
                    )));
                }
            }
            None => {
                let _ = finished.await;
            }
        }
        self.get_run(run_id).await
    }

    /// Requests cooperative cancellation of the session's active run, or of
    /// `run_id` when given.
    pub async fn cancel_run(&self, session_id: &str, run_id: Option<&str>) -> Result<CancelOutcome, RuntimeError> {
        let tables = self.inner.tables.lock().await;
        let session = tables.session(session_id)?;
        let Some(target) = run_id
            .map(str::to_string)
            .or_else(|| session.active_run_id.clone())
        else {
            return Ok(CancelOutcome::rejected(None, "no_active_run"));
        };

        let Some(run) = tables.run(&target).filter(|run| run.session_id == session_id) else {
            return Ok(CancelOutcome::rejected(Some(target), "no_active_run"));
        };
        if run.is_terminal() {
            return Ok(CancelOutcome::rejected(Some(target), "run_already_finished"));
        }
        match tables.handles.get(&target) {
            Some(handle) => {
                handle.cancel.cancel();
                info!(session_id, run_id = %target, "cancellation requested");
                Ok(CancelOutcome {
                    cancelled: true,
                    run_id: Some(target),
                    reason: None,
                })
            }
            None => Ok(CancelOutcome::rejected(Some(target), "no_active_run")),
        }
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Run, RuntimeError> {
        self.inner
            .tables
            .lock()
            .await
            .run(run_id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(format!("run not found: {run_id}")))
    }
}

impl Inner {
    fn emit(&self, event: &'static str, run: &Run, phase: Phase, payload: Value) {
        if let Some(events) = &self.events {
            let _ = events.send(RuntimeEvent {
                event,
                session_id: run.session_id.clone(),
                run_id: run.id.clone(),
                phase,
                timestamp: Utc::now(),
                payload,
            });
        }
    }

    /// Writes the whole table to the store. Failures are logged and ignored;
    /// the in-memory state stays authoritative.
    async fn persist(&self) {
        let _ordered = self.persist_lock.lock().await;
        let snapshot = json!(self.tables.lock().await.snapshot());
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.save_protocol_state(&snapshot)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to persist protocol state"),
            Err(e) => warn!(error = %e, "protocol state writer panicked"),
        }
    }

    async fn update_run(&self, run_id: &str, update: impl FnOnce(&mut Run)) -> Option<Run> {
        let mut tables = self.tables.lock().await;
        let run = tables.run_mut(run_id)?;
        update(run);
        Some(run.clone())
    }

    async fn execute_run(self: &Arc<Self>, queued: Run, session: Session, cancel: CancellationToken) {
        let run_id = queued.id.clone();
        let Some(run) = self
            .update_run(&run_id, |run| {
                run.status = RunStatus::Running;
                run.started_at = Some(Utc::now());
            })
            .await
        else {
            return;
        };
        self.persist().await;
        self.emit(
            "run.started",
            &run,
            Phase::Plan,
            json!({"message": run.message, "auto_apply": run.auto_apply}),
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let relay = tokio::spawn(Arc::clone(self).relay_events(run.clone(), event_rx));

        let ctx = TaskContext {
            cancel: cancel.clone(),
            events: Some(event_tx),
            gate: Some(Arc::new(run.tool_policy.clone())),
        };
        let request = TaskRequest {
            message: run.message.clone(),
            model_id: session.model_id.clone(),
            chat_id: session.chat_id.clone(),
            auto_apply: run.auto_apply,
        };
        let agent = Arc::clone(&self.agent);
        let task = tokio::spawn(async move { agent.run_task(request, &ctx).await });
        let joined = task.await;
        // The sender lived in the task's context; the relay drains and stops.
        if let Err(e) = relay.await {
            warn!(run_id = %run_id, error = %e, "event relay failed");
        }

        let (status, result, run_error, chat_id) = match joined {
            Ok(Ok(outcome)) => {
                let root = self.store.project_root().to_path_buf();
                let verification =
                    verify::verify(&root, &run.verify_commands, self.settings.verify_timeout, &outcome).await;
                self.emit(
                    "run.verified",
                    &run,
                    Phase::Verify,
                    json!(verification),
                );
                let mut result = json!(outcome);
                result["verification"] = json!(verification);
                (RunStatus::Completed, Some(result), None, outcome.chat_id)
            }
            Ok(Err(AgentError::Cancelled)) => (
                RunStatus::Cancelled,
                None,
                Some(RunError::new("Cancelled", AgentError::Cancelled.to_string())),
                None,
            ),
            Ok(Err(e)) => {
                warn!(run_id = %run_id, error = %e, "run failed");
                (
                    RunStatus::Failed,
                    None,
                    Some(RunError::new(e.kind(), e.to_string())),
                    None,
                )
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "run task panicked");
                (RunStatus::Failed, None, Some(aborted()), None)
            }
        };

        let outcome = Outcome {
            status,
            result,
            error: run_error,
            chat_id,
        };
        self.conclude(&run_id, &run.session_id, outcome).await;
    }

    /// Records the run's final state, persists it and emits the terminal event.
    /// A run that is already finished keeps its state; only the session pointer
    /// and the cancel handle are released.
    async fn conclude(&self, run_id: &str, session_id: &str, outcome: Outcome) {
        let finished = {
            let mut tables = self.tables.lock().await;
            let finished = tables.finish_run(run_id, session_id, outcome);
            tables.prune(self.settings.run_retention);
            finished
        };
        self.persist().await;

        let Some(finished) = finished else {
            return;
        };
        info!(run_id = %run_id, status = ?finished.status, "run finished");
        let (event, payload) = match finished.status {
            RunStatus::Completed => ("run.completed", json!({"result": finished.result})),
            RunStatus::Cancelled => ("run.cancelled", json!({"error": finished.error})),
            _ => ("run.failed", json!({"error": finished.error})),
        };
        self.emit(event, &finished, Phase::Final, payload);
    }

    /// Forwards loop events as `run.progress`; tool results additionally go out
    /// as `tool.result` carrying the policy decision.
    async fn relay_events(self: Arc<Self>, run: Run, mut events: mpsc::UnboundedReceiver<LoopEvent>) {
        while let Some(event) = events.recv().await {
            let phase = event.phase();
            let payload = json!(event);
            self.emit("run.progress", &run, phase, payload);

            if let LoopEvent::ToolResult(result) = event {
                let mut payload = json!(result);
                if let Some(policy) = &result.policy {
                    payload["decision"] = json!(policy.decision);
                    payload["reason"] = json!(policy.reason);
                    payload["source"] = json!(policy.source);
                }
                self.emit("tool.result", &run, Phase::Act, payload);
            }
        }
    }
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn string_list(value: Option<&Value>) -> Option<Vec<String>> {
    let items = value?.as_array()?;
    Some(
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    )
}
