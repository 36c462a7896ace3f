//! # JSON-RPC Server
//!
//! JSON-RPC 2.0 over newline-delimited stdio. Each request is handled on its own
//! task so a waiting `session.prompt` never blocks other calls; one writer task
//! owns the output stream. Run events are pushed as `session.event`
//! notifications.

use crate::error::RuntimeError;
use crate::runtime::{CreateSession, ProtocolRuntime, PromptRequest, RuntimeEvent, SessionUpdate};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const NOT_FOUND: i64 = -32004;
pub const TIMEOUT: i64 = -32008;
pub const RUN_IN_PROGRESS: i64 = -32009;
pub const RUNTIME_ERROR: i64 = -32000;

pub const PROTOCOL_VERSION: &str = "1";

pub const METHODS: &[&str] = &[
    "initialize",
    "ping",
    "shutdown",
    "session.create",
    "session.list",
    "session.get",
    "session.update",
    "session.resume",
    "session.prompt",
    "session.cancel",
    "run.get",
    "changes.apply",
    "changes.discard",
    "changes.undo",
    "changes.discard_applied",
];

#[derive(Debug, Clone, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    pub fn internal() -> Self {
        Self::new(INTERNAL_ERROR, "internal error")
    }

    fn to_value(&self) -> Value {
        let mut error = json!({"code": self.code, "message": self.message});
        if let Some(data) = &self.data {
            error["data"] = data.clone();
        }
        error
    }
}

impl From<RuntimeError> for RpcError {
    fn from(err: RuntimeError) -> Self {
        let code = match err.code() {
            "invalid_params" => INVALID_PARAMS,
            "not_found" => NOT_FOUND,
            "timeout" => TIMEOUT,
            "run_in_progress" => RUN_IN_PROGRESS,
            _ => RUNTIME_ERROR,
        };
        Self {
            code,
            message: err.to_string(),
            data: err.data(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[serde(default)]
    jsonrpc: Option<String>,
    method: String,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    params: Option<Value>,
}

pub fn response(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

pub fn error_response(id: Value, error: &RpcError) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": error.to_value()})
}

pub fn notification(method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "method": method, "params": params})
}

/// Turns one input line into a request, or into the error response owed for it.
fn parse_frame(line: &str) -> Result<JsonRpcRequest, Value> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| error_response(Value::Null, &RpcError::new(PARSE_ERROR, format!("parse error: {e}"))))?;
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    let invalid = |message: &str| error_response(id.clone(), &RpcError::new(INVALID_REQUEST, message));

    if !value.is_object() {
        return Err(invalid("request must be a JSON object"));
    }
    let request: JsonRpcRequest =
        serde_json::from_value(value.clone()).map_err(|_| invalid("request must carry a string method"))?;
    if request.jsonrpc.as_deref().is_some_and(|v| v != "2.0") {
        return Err(invalid("unsupported jsonrpc version"));
    }
    Ok(request)
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(|e| RpcError::invalid_params(format!("invalid params: {e}")))
}

fn to_result(value: impl serde::Serialize) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| {
        warn!(error = %e, "failed to serialize response");
        RpcError::internal()
    })
}

#[derive(Deserialize)]
struct SessionCreateParams {
    #[serde(default)]
    model_id: Option<String>,
    #[serde(default)]
    chat_id: Option<String>,
    #[serde(default)]
    metadata: Map<String, Value>,
}

#[derive(Deserialize)]
struct SessionIdParams {
    session_id: String,
}

#[derive(Deserialize)]
struct SessionUpdateParams {
    session_id: String,
    #[serde(default, with = "::serde_with::rust::double_option")]
    model_id: Option<Option<String>>,
    #[serde(default, with = "::serde_with::rust::double_option")]
    chat_id: Option<Option<String>>,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
struct PromptParams {
    session_id: String,
    message: String,
    #[serde(default)]
    auto_apply: bool,
    #[serde(default)]
    wait: bool,
    #[serde(default)]
    timeout_seconds: Option<f64>,
    #[serde(default)]
    tool_policy: Option<Value>,
    #[serde(default)]
    verify_commands: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct CancelParams {
    session_id: String,
    #[serde(default)]
    run_id: Option<String>,
}

#[derive(Deserialize)]
struct RunIdParams {
    run_id: String,
}

#[derive(Deserialize)]
struct PendingIdParams {
    pending_id: String,
}

#[derive(Deserialize)]
struct AppliedIdParams {
    applied_change_id: String,
}

#[derive(Clone)]
pub struct RpcServer {
    runtime: ProtocolRuntime,
}

impl RpcServer {
    pub fn new(runtime: ProtocolRuntime) -> Self {
        Self { runtime }
    }

    /// Dispatches one method call.
    pub async fn handle(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let runtime = &self.runtime;
        match method {
            "initialize" => Ok(json!({
                "protocol_version": PROTOCOL_VERSION,
                "server": {"name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION")},
                "capabilities": {
                    "methods": METHODS,
                    "notifications": ["session.event"],
                    "tools": runtime.agent().tools().definitions(),
                },
            })),
            "ping" => Ok(json!({})),
            "shutdown" => Ok(json!({"ok": true})),
            "session.create" => {
                let p: SessionCreateParams = parse_params(params)?;
                let session = runtime
                    .create_session(CreateSession {
                        model_id: p.model_id,
                        chat_id: p.chat_id,
                        metadata: p.metadata,
                    })
                    .await;
                Ok(json!({"session": to_result(session)?}))
            }
            "session.list" => Ok(json!({"sessions": to_result(runtime.list_sessions().await)?})),
            "session.get" => {
                let p: SessionIdParams = parse_params(params)?;
                let session = runtime.get_session(&p.session_id).await?;
                Ok(json!({"session": to_result(session)?}))
            }
            "session.update" => {
                let p: SessionUpdateParams = parse_params(params)?;
                let update = SessionUpdate {
                    model_id: p.model_id,
                    chat_id: p.chat_id,
                    metadata: p.metadata,
                };
                let session = runtime.update_session(&p.session_id, update).await?;
                Ok(json!({"session": to_result(session)?}))
            }
            "session.resume" => {
                let p: SessionIdParams = parse_params(params)?;
                let session = runtime.get_session(&p.session_id).await?;
                let run = runtime.latest_run(&p.session_id).await?;
                Ok(json!({"session": to_result(session)?, "run": to_result(run)?}))
            }
            "session.prompt" => self.prompt(parse_params(params)?).await,
            "session.cancel" => {
                let p: CancelParams = parse_params(params)?;
                to_result(runtime.cancel_run(&p.session_id, p.run_id.as_deref()).await?)
            }
            "run.get" => {
                let p: RunIdParams = parse_params(params)?;
                Ok(json!({"run": to_result(runtime.get_run(&p.run_id).await?)?}))
            }
            "changes.apply" => {
                let p: PendingIdParams = parse_params(params)?;
                let report = runtime
                    .agent()
                    .apply_pending_changes(&p.pending_id)
                    .map_err(RuntimeError::from)?;
                to_result(report)
            }
            "changes.discard" => {
                let p: PendingIdParams = parse_params(params)?;
                let report = runtime
                    .agent()
                    .discard_pending_changes(&p.pending_id)
                    .map_err(RuntimeError::from)?;
                to_result(report)
            }
            "changes.undo" => {
                let p: AppliedIdParams = parse_params(params)?;
                let report = runtime
                    .agent()
                    .undo_applied_changes(&p.applied_change_id)
                    .map_err(RuntimeError::from)?;
                to_result(report)
            }
            "changes.discard_applied" => {
                let p: AppliedIdParams = parse_params(params)?;
                let report = runtime
                    .agent()
                    .discard_applied_changes(&p.applied_change_id)
                    .map_err(RuntimeError::from)?;
                to_result(report)
            }
            _ => Err(RpcError::new(METHOD_NOT_FOUND, format!("method not found: {method}"))),
        }
    }

    async fn prompt(&self, p: PromptParams) -> Result<Value, RpcError> {
        let timeout = match p.timeout_seconds {
            Some(secs) if !secs.is_finite() || secs < 0.0 => {
                return Err(RpcError::invalid_params("timeout_seconds must be a non-negative number"));
            }
            Some(secs) => Some(Duration::from_secs_f64(secs)),
            None => None,
        };
        let run = self
            .runtime
            .start_prompt(PromptRequest {
                session_id: p.session_id,
                message: p.message,
                auto_apply: p.auto_apply,
                tool_policy: p.tool_policy,
                verify_commands: p.verify_commands,
            })
            .await?;

        let mut result = json!({"accepted": true, "run_id": run.id});
        if p.wait {
            let finished = self.runtime.wait_run(&run.id, timeout).await?;
            result["run"] = to_result(finished)?;
        }
        Ok(result)
    }

    /// Serves requests from `reader` until end of input or `shutdown`.
    pub async fn serve<R, W>(
        self,
        reader: R,
        writer: W,
        events: Option<mpsc::UnboundedReceiver<RuntimeEvent>>,
    ) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(frame) = out_rx.recv().await {
                let mut line = serde_json::to_string(&frame)?;
                line.push('\n');
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await?;
            }
            Ok::<(), std::io::Error>(())
        });

        let forwarder = events.map(|mut events| {
            let out = out_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    let params = serde_json::to_value(&event).unwrap_or(Value::Null);
                    if out.send(notification("session.event", params)).is_err() {
                        break;
                    }
                }
            })
        });

        let mut requests = JoinSet::new();
        let mut lines = reader.lines();
        let mut shutdown = false;
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let request = match parse_frame(&line) {
                Ok(request) => request,
                Err(error) => {
                    let _ = out_tx.send(error);
                    continue;
                }
            };
            debug!(method = %request.method, "rpc request");

            if request.method == "shutdown" {
                if let Some(id) = request.id {
                    let _ = out_tx.send(response(id, json!({"ok": true})));
                }
                info!("shutdown requested");
                shutdown = true;
                break;
            }

            let server = self.clone();
            let out = out_tx.clone();
            requests.spawn(async move {
                let params = request.params.unwrap_or_else(|| json!({}));
                let result = if params.is_object() {
                    let method = request.method.clone();
                    // A panicking handler still gets an answer.
                    tokio::spawn(async move { server.handle(&method, params).await })
                        .await
                        .unwrap_or_else(|e| {
                            warn!(method = %request.method, error = %e, "rpc handler aborted");
                            Err(RpcError::internal())
                        })
                } else {
                    Err(RpcError::invalid_params("params must be an object"))
                };
                let Some(id) = request.id else {
                    return;
                };
                let frame = match result {
                    Ok(value) => response(id, value),
                    Err(error) => error_response(id, &error),
                };
                let _ = out.send(frame);
            });
        }

        if shutdown {
            requests.abort_all();
        }
        while requests.join_next().await.is_some() {}
        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }
        drop(out_tx);
        writer_task.await.unwrap_or_else(|e| Err(std::io::Error::other(e)))
    }
}
