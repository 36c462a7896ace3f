use crate::policy::ToolPolicyDecision;
use serde::Serialize;
use serde_json::Value;
use serde_with::skip_serializing_none;

/// Progress reported by the agent loop while a task runs.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    Status { text: String },
    ToolStart { step: usize, name: String, args: Value },
    ToolResult(ToolResultEvent),
    AssistantDelta { text: String },
    ReasoningDelta { text: String },
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolResultEvent {
    pub step: usize,
    pub name: String,
    pub ok: bool,
    pub path: Option<String>,
    pub error: Option<String>,
    pub changed: bool,
    pub pending: bool,
    pub policy: Option<ToolPolicyDecision>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Plan,
    Act,
    Verify,
    Final,
}

impl LoopEvent {
    pub fn status(text: impl Into<String>) -> Self {
        LoopEvent::Status { text: text.into() }
    }

    pub fn phase(&self) -> Phase {
        match self {
            LoopEvent::ToolStart { .. } | LoopEvent::ToolResult(_) => Phase::Act,
            LoopEvent::AssistantDelta { .. } => Phase::Final,
            LoopEvent::Status { .. } | LoopEvent::ReasoningDelta { .. } => Phase::Plan,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LoopEvent::Status { .. } => "status",
            LoopEvent::ToolStart { .. } => "tool_start",
            LoopEvent::ToolResult(_) => "tool_result",
            LoopEvent::AssistantDelta { .. } => "assistant_delta",
            LoopEvent::ReasoningDelta { .. } => "reasoning_delta",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_phase_tags() {
        assert_eq!(LoopEvent::status("thinking").phase(), Phase::Plan);
        assert_eq!(
            LoopEvent::AssistantDelta { text: "hi".into() }.phase(),
            Phase::Final
        );
        let start = LoopEvent::ToolStart {
            step: 1,
            name: "list_files".into(),
            args: json!({}),
        };
        assert_eq!(start.phase(), Phase::Act);
    }

    #[test]
    fn test_serialized_shape() {
        let event = LoopEvent::ToolResult(ToolResultEvent {
            step: 2,
            name: "delete_file".into(),
            ok: false,
            path: None,
            error: Some("denied".into()),
            changed: false,
            pending: false,
            policy: Some(ToolPolicyDecision::deny("no", "deny_tools")),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tool_result");
        assert_eq!(json["policy"]["decision"], "deny");
        assert!(json.get("path").is_none());
    }
}
