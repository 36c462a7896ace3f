//! # Errors
//!
//! Typed failures for each layer. Tool errors are rendered verbatim into the
//! conversation, so their `Display` text is written for the model to read.

use serde_json::{Value, json};
use thiserror::Error;

/// A failure of a single workspace tool invocation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("tool arguments must be a JSON object")]
    ArgumentsNotObject,
    #[error("invalid tool arguments: {0}")]
    InvalidArguments(String),
    #[error("{0} is required")]
    MissingArgument(String),
    #[error("{0} must not be empty")]
    EmptyArgument(String),
    #[error("Expected integer argument")]
    ExpectedInteger,
    #[error("Path escapes project root")]
    PathEscapesRoot,
    #[error("Path does not exist")]
    PathDoesNotExist,
    #[error("File not found: {0}")]
    FileNotFound(String),
    #[error("Path is not a file")]
    NotAFile,
    #[error(
        "Refusing full overwrite of existing non-empty file. Use replace_in_file for targeted edits or set allow_overwrite=true."
    )]
    OverwriteRefused,
    #[error("denied by tool policy: {0}")]
    Denied(String),
    #[error("{0}")]
    Io(String),
}

impl From<std::io::Error> for ToolError {
    fn from(err: std::io::Error) -> Self {
        ToolError::Io(err.to_string())
    }
}

/// Failures reported by an [`crate::llm::LlmClient`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("model not found: {0}")]
    ModelNotFound(String),
    /// `status` is 0 when the request failed below HTTP (connect, timeout, decode).
    #[error("request failed with status {status}: {body}")]
    RequestFailed { status: u16, body: String },
}

impl LlmError {
    pub fn transport(body: impl Into<String>) -> Self {
        LlmError::RequestFailed {
            status: 0,
            body: body.into(),
        }
    }

    /// The server rejected the payload shape rather than failing.
    pub fn is_payload_rejection(&self) -> bool {
        matches!(self, LlmError::RequestFailed { status, .. } if matches!(status, 400 | 404 | 422))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::RequestFailed { status, .. } if *status == 0 || *status >= 500)
    }

    pub fn is_request_failure(&self) -> bool {
        matches!(self, LlmError::RequestFailed { .. })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store contains malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to persist {path}: {reason}")]
    Persist { path: String, reason: String },
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("run cancelled")]
    Cancelled,
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0} not found or already handled")]
    ChangesNotFound(&'static str),
}

impl AgentError {
    /// Short machine-readable kind used in run error records.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Llm(LlmError::Authentication(_)) => "AuthenticationError",
            AgentError::Llm(LlmError::ModelNotFound(_)) => "ModelNotFound",
            AgentError::Llm(LlmError::RequestFailed { .. }) => "RequestFailed",
            AgentError::Cancelled => "Cancelled",
            AgentError::InvalidInput(_) => "InvalidInput",
            AgentError::ChangesNotFound(_) => "NotFound",
        }
    }
}

/// Errors surfaced by the protocol runtime, each carrying a stable code.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{0}")]
    InvalidParams(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Timeout(String),
    #[error("session already has an active run")]
    RunInProgress { run_id: String },
    #[error(transparent)]
    Agent(#[from] AgentError),
}

impl RuntimeError {
    pub fn code(&self) -> &'static str {
        match self {
            RuntimeError::InvalidParams(_) => "invalid_params",
            RuntimeError::NotFound(_) => "not_found",
            RuntimeError::Timeout(_) => "timeout",
            RuntimeError::RunInProgress { .. } => "run_in_progress",
            RuntimeError::Agent(AgentError::ChangesNotFound(_)) => "not_found",
            RuntimeError::Agent(AgentError::InvalidInput(_)) => "invalid_params",
            RuntimeError::Agent(_) => "runtime_error",
        }
    }

    pub fn data(&self) -> Option<Value> {
        match self {
            RuntimeError::RunInProgress { run_id } => Some(json!({ "run_id": run_id })),
            _ => None,
        }
    }
}
