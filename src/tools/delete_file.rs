use super::args::required_path;
use super::{Args, MutationReport, Tool, ToolDefinition, ToolOutput, read_text};
use crate::diff::unified_diff;
use crate::error::ToolError;
use crate::sandbox::Workspace;
use serde_json::json;
use std::fs;
use std::path::PathBuf;

fn plan_delete(args: &Args, workspace: &Workspace) -> Result<(PathBuf, String), ToolError> {
    let raw = required_path(args, "path")?;
    let path = workspace.resolve(raw)?;
    if !path.is_file() {
        return Err(ToolError::FileNotFound(raw.to_string()));
    }
    let rel = workspace.relative(&path);
    Ok((path, rel))
}

pub struct DeleteFileTool;

impl Tool for DeleteFileTool {
    fn name(&self) -> &'static str {
        "delete_file"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name(),
            description: "Delete a file from the project.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "File path relative to the project root."
                    }
                },
                "required": ["path"]
            }),
        }
    }

    fn is_mutating(&self) -> bool {
        true
    }

    fn preview(&self, args: &Args, workspace: &Workspace) -> Result<ToolOutput, ToolError> {
        let (path, rel) = plan_delete(args, workspace)?;
        let before = read_text(&path)?;
        let diff = unified_diff(&rel, Some(&before), None);
        Ok(ToolOutput::Mutation(MutationReport {
            changed: true,
            applied: false,
            deleted: Some(false),
            diff: Some(diff),
            apply_args: Some(json!({ "path": rel })),
            path: rel,
            operation: "delete_file",
            ..Default::default()
        }))
    }

    fn execute(&self, args: &Args, workspace: &Workspace) -> Result<ToolOutput, ToolError> {
        let (path, rel) = plan_delete(args, workspace)?;
        fs::remove_file(&path)?;
        Ok(ToolOutput::Mutation(MutationReport {
            changed: true,
            applied: true,
            deleted: Some(true),
            path: rel,
            operation: "delete_file",
            ..Default::default()
        }))
    }
}
