//! # Tool Collection
//!
//! The `ToolCollection` is the central hub for discovering and executing workspace tools.
//! It owns the sandbox root and dispatches calls by tool name, choosing apply or preview
//! mode per call.

use crate::error::ToolError;
use crate::sandbox::Workspace;
use crate::tools::{
    DeleteFileTool, ListFilesTool, ReadFileTool, ReplaceInFileTool, SearchInFilesTool, Tool,
    ToolDefinition, ToolOutput, WriteFileTool,
};
use serde_json::Value;
use tracing::debug;

/// A collection responsible for registering and dispatching tool calls.
pub struct ToolCollection {
    tools: Vec<Box<dyn Tool>>,
    workspace: Workspace,
}

impl ToolCollection {
    /// Creates an empty collection bound to `workspace`.
    pub fn new(workspace: Workspace) -> Self {
        Self {
            tools: Vec::new(),
            workspace,
        }
    }

    /// Creates a collection with the full workspace catalog registered.
    pub fn with_default_tools(workspace: Workspace) -> Self {
        let mut collection = Self::new(workspace);
        collection.register(Box::new(ListFilesTool));
        collection.register(Box::new(ReadFileTool));
        collection.register(Box::new(SearchInFilesTool));
        collection.register(Box::new(WriteFileTool));
        collection.register(Box::new(ReplaceInFileTool));
        collection.register(Box::new(DeleteFileTool));
        collection
    }

    /// Registers a tool, replacing any previous tool of the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.retain(|existing| existing.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Definitions of all registered tools, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|tool| tool.definition()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn is_mutating(&self, name: &str) -> bool {
        self.get(name).is_some_and(|tool| tool.is_mutating())
    }

    /// Executes `name` with `args`. With `auto_apply` false, mutating tools only
    /// preview their effect.
    pub fn execute(&self, name: &str, args: &Value, auto_apply: bool) -> Result<ToolOutput, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        let args = args.as_object().ok_or(ToolError::ArgumentsNotObject)?;

        debug!(tool = name, auto_apply, "executing tool");
        if auto_apply {
            tool.execute(args, &self.workspace)
        } else {
            tool.preview(args, &self.workspace)
        }
    }

    fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|tool| tool.name() == name)
            .map(|tool| &**tool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::Builder;

    fn setup_collection() -> (tempfile::TempDir, ToolCollection) {
        let tmp_dir = Builder::new().prefix("test-collection").tempdir().unwrap();
        fs::write(tmp_dir.path().join("keep.txt"), "keep").unwrap();
        let workspace = Workspace::new(tmp_dir.path()).unwrap();
        (tmp_dir, ToolCollection::with_default_tools(workspace))
    }

    #[test]
    fn test_catalog_order_and_mutating_flags() {
        let (_tmp_dir, tools) = setup_collection();
        let names: Vec<&str> = tools.definitions().iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec![
                "list_files",
                "read_file",
                "search_in_files",
                "write_file",
                "replace_in_file",
                "delete_file"
            ]
        );
        assert!(tools.is_mutating("write_file"));
        assert!(tools.is_mutating("delete_file"));
        assert!(!tools.is_mutating("read_file"));
        assert!(!tools.is_mutating("nope"));
    }

    #[test]
    fn test_dispatch_errors() {
        let (_tmp_dir, tools) = setup_collection();
        assert_eq!(
            tools.execute("launch_rocket", &json!({}), true).unwrap_err().to_string(),
            "Unknown tool: launch_rocket"
        );
        assert_eq!(
            tools.execute("read_file", &json!(["keep.txt"]), true).unwrap_err(),
            ToolError::ArgumentsNotObject
        );
    }

    #[test]
    fn test_every_tool_rejects_escape_in_both_modes() {
        let (_tmp_dir, tools) = setup_collection();
        let args = json!({
            "path": "../../etc/passwd",
            "query": "root",
            "content": "x",
            "find": "root",
            "replace": "",
        });
        for definition in tools.definitions() {
            for auto_apply in [true, false] {
                let err = tools.execute(definition.name, &args, auto_apply).unwrap_err();
                assert_eq!(err, ToolError::PathEscapesRoot, "{}", definition.name);
            }
        }
    }

    #[test]
    fn test_preview_mode_never_mutates() {
        let (tmp_dir, tools) = setup_collection();
        tools
            .execute("delete_file", &json!({"path": "keep.txt"}), false)
            .unwrap();
        tools
            .execute("write_file", &json!({"path": "new.txt", "content": "n"}), false)
            .unwrap();
        assert!(tmp_dir.path().join("keep.txt").exists());
        assert!(!tmp_dir.path().join("new.txt").exists());
    }
}
