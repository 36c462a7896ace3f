//! # Tool Policy
//!
//! Per-run gate deciding whether a tool call may execute. Rules are checked in a
//! fixed order and the first match wins:
//!
//! 1. the tool is on `deny_tools`
//! 2. `deny_mutations` is set and the tool writes to the workspace
//! 3. `allow_tools` is non-empty and does not list the tool
//! 4. otherwise `default_decision`

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    #[default]
    Approve,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPolicyDecision {
    pub decision: Decision,
    pub reason: String,
    pub source: String,
}

impl ToolPolicyDecision {
    pub fn approve(reason: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            decision: Decision::Approve,
            reason: reason.into(),
            source: source.into(),
        }
    }

    pub fn deny(reason: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            decision: Decision::Deny,
            reason: reason.into(),
            source: source.into(),
        }
    }

    pub fn is_denied(&self) -> bool {
        self.decision == Decision::Deny
    }
}

/// Consulted by the agent loop before every tool execution.
pub trait ToolGate: Send + Sync {
    fn decide(&self, tool: &str, args: &Value, mutating: bool) -> ToolPolicyDecision;
}

pub type SharedToolGate = Arc<dyn ToolGate>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPolicy {
    pub deny_tools: Vec<String>,
    pub allow_tools: Vec<String>,
    pub deny_mutations: bool,
    pub default_decision: Decision,
}

impl ToolPolicy {
    /// Parses an override object leniently. Unknown keys are ignored, and a
    /// malformed override yields `None` so the next layer applies.
    pub fn from_value(value: &Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }

    /// First policy present wins: prompt override, then session metadata, then
    /// the configured default.
    pub fn resolve(prompt: Option<&Value>, metadata: Option<&Value>, fallback: &ToolPolicy) -> Self {
        prompt
            .and_then(Self::from_value)
            .or_else(|| metadata.and_then(Self::from_value))
            .unwrap_or_else(|| fallback.clone())
    }
}

impl ToolGate for ToolPolicy {
    fn decide(&self, tool: &str, _args: &Value, mutating: bool) -> ToolPolicyDecision {
        if self.deny_tools.iter().any(|t| t == tool) {
            return ToolPolicyDecision::deny(format!("tool '{tool}' is in deny_tools"), "deny_tools");
        }
        if self.deny_mutations && mutating {
            return ToolPolicyDecision::deny(
                format!("tool '{tool}' mutates the workspace"),
                "deny_mutations",
            );
        }
        if !self.allow_tools.is_empty() && !self.allow_tools.iter().any(|t| t == tool) {
            return ToolPolicyDecision::deny(
                format!("tool '{tool}' is not in allow_tools"),
                "allow_tools",
            );
        }
        match self.default_decision {
            Decision::Approve => ToolPolicyDecision::approve("default decision", "default"),
            Decision::Deny => ToolPolicyDecision::deny("default decision", "default"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rule_order() {
        let policy = ToolPolicy {
            deny_tools: vec!["delete_file".to_string()],
            allow_tools: vec!["read_file".to_string(), "delete_file".to_string()],
            deny_mutations: true,
            default_decision: Decision::Approve,
        };
        let args = json!({});
        assert_eq!(policy.decide("delete_file", &args, true).source, "deny_tools");
        assert_eq!(policy.decide("write_file", &args, true).source, "deny_mutations");
        assert_eq!(policy.decide("list_files", &args, false).source, "allow_tools");
        let approved = policy.decide("read_file", &args, false);
        assert_eq!(approved.decision, Decision::Approve);
        assert_eq!(approved.source, "default");
    }

    #[test]
    fn test_empty_policy_approves_everything() {
        let decision = ToolPolicy::default().decide("delete_file", &json!({}), true);
        assert!(!decision.is_denied());
    }

    #[test]
    fn test_resolution_priority() {
        let prompt = json!({"deny_tools": ["delete_file"]});
        let metadata = json!({"deny_mutations": true});
        let fallback = ToolPolicy::default();

        let policy = ToolPolicy::resolve(Some(&prompt), Some(&metadata), &fallback);
        assert_eq!(policy.deny_tools, vec!["delete_file"]);
        assert!(!policy.deny_mutations);

        let policy = ToolPolicy::resolve(None, Some(&metadata), &fallback);
        assert!(policy.deny_mutations);

        let policy = ToolPolicy::resolve(Some(&json!("nonsense")), None, &fallback);
        assert_eq!(policy, fallback);
    }

    #[test]
    fn test_default_decision_deny() {
        let policy: ToolPolicy = serde_json::from_value(json!({"default_decision": "deny"})).unwrap();
        assert!(policy.decide("read_file", &json!({}), false).is_denied());
    }
}
