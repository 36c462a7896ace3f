use super::args::{int_arg, required_path};
use super::{Args, FileContent, Tool, ToolDefinition, ToolOutput};
use crate::error::ToolError;
use crate::sandbox::Workspace;
use serde_json::json;
use std::fs;

const DEFAULT_MAX_CHARS: i64 = 50_000;
const MAX_CHARS: i64 = 500_000;

pub struct ReadFileTool;

impl Tool for ReadFileTool {
    fn name(&self) -> &'static str {
        "read_file"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name(),
            description: "Read a text file from the project. Long files are truncated to max_chars characters.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "File path relative to the project root."
                    },
                    "max_chars": {
                        "type": "integer",
                        "description": "Maximum number of characters to return (default 50000)."
                    }
                },
                "required": ["path"]
            }),
        }
    }

    fn execute(&self, args: &Args, workspace: &Workspace) -> Result<ToolOutput, ToolError> {
        let raw = required_path(args, "path")?;
        let max_chars = int_arg(args, "max_chars", DEFAULT_MAX_CHARS, 1, MAX_CHARS)? as usize;
        let path = workspace.resolve(raw)?;
        if !path.is_file() {
            return Err(ToolError::FileNotFound(raw.to_string()));
        }

        let bytes = fs::read(&path)?;
        let text = String::from_utf8_lossy(&bytes);
        let total_chars = text.chars().count();
        let content: String = text.chars().take(max_chars).collect();

        Ok(ToolOutput::Content(FileContent {
            path: workspace.relative(&path),
            content,
            truncated: total_chars > max_chars,
            total_chars,
        }))
    }
}
