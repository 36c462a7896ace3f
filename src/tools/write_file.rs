use super::args::{bool_arg, required_path, required_str};
use super::{Args, MutationReport, Tool, ToolDefinition, ToolOutput, read_text};
use crate::diff::unified_diff;
use crate::error::ToolError;
use crate::sandbox::Workspace;
use serde_json::json;
use std::fs;
use std::path::PathBuf;

/// Validated intent of a write, shared by preview and execute.
struct WritePlan {
    path: PathBuf,
    rel: String,
    before: Option<String>,
    content: String,
    allow_overwrite: bool,
}

impl WritePlan {
    fn changed(&self) -> bool {
        self.before.as_deref() != Some(self.content.as_str())
    }
}

fn plan_write(args: &Args, workspace: &Workspace) -> Result<WritePlan, ToolError> {
    let raw = required_path(args, "path")?;
    let content = required_str(args, "content")?.to_string();
    let allow_overwrite = bool_arg(args, "allow_overwrite", false);
    let path = workspace.resolve(raw)?;

    if path.exists() && !path.is_file() {
        return Err(ToolError::NotAFile);
    }
    let before = if path.is_file() {
        Some(read_text(&path)?)
    } else {
        None
    };
    if let Some(existing) = &before {
        if !existing.is_empty() && *existing != content && !allow_overwrite {
            return Err(ToolError::OverwriteRefused);
        }
    }

    Ok(WritePlan {
        rel: workspace.relative(&path),
        path,
        before,
        content,
        allow_overwrite,
    })
}

pub struct WriteFileTool;

impl Tool for WriteFileTool {
    fn name(&self) -> &'static str {
        "write_file"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name(),
            description: "Create a new file, or overwrite an existing one when allow_overwrite is true. Prefer replace_in_file for edits to existing files.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "File path relative to the project root."
                    },
                    "content": {
                        "type": "string",
                        "description": "Full file content."
                    },
                    "allow_overwrite": {
                        "type": "boolean",
                        "description": "Required to replace a non-empty file with different content."
                    }
                },
                "required": ["path", "content"]
            }),
        }
    }

    fn is_mutating(&self) -> bool {
        true
    }

    fn preview(&self, args: &Args, workspace: &Workspace) -> Result<ToolOutput, ToolError> {
        let plan = plan_write(args, workspace)?;
        Ok(ToolOutput::Mutation(MutationReport {
            changed: plan.changed(),
            applied: false,
            created: Some(plan.before.is_none()),
            bytes: Some(plan.content.len()),
            diff: Some(unified_diff(
                &plan.rel,
                plan.before.as_deref(),
                Some(&plan.content),
            )),
            apply_args: Some(json!({
                "path": plan.rel,
                "content": plan.content,
                "allow_overwrite": plan.allow_overwrite,
            })),
            path: plan.rel,
            operation: "write_file",
            ..Default::default()
        }))
    }

    fn execute(&self, args: &Args, workspace: &Workspace) -> Result<ToolOutput, ToolError> {
        let plan = plan_write(args, workspace)?;
        if let Some(parent) = plan.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&plan.path, &plan.content)?;

        Ok(ToolOutput::Mutation(MutationReport {
            changed: plan.changed(),
            applied: true,
            created: Some(plan.before.is_none()),
            bytes: Some(plan.content.len()),
            path: plan.rel,
            operation: "write_file",
            ..Default::default()
        }))
    }
}
