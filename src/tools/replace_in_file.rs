use super::args::{int_arg, required_path, required_str};
use super::{Args, MutationReport, Tool, ToolDefinition, ToolOutput, read_text};
use crate::diff::unified_diff;
use crate::error::ToolError;
use crate::sandbox::Workspace;
use serde_json::json;
use std::fs;
use std::path::PathBuf;

const MAX_COUNT: i64 = 1_000_000;

struct ReplacePlan {
    path: PathBuf,
    rel: String,
    before: String,
    after: String,
    find: String,
    replace: String,
    count: i64,
    occurrences: usize,
    replaced: usize,
}

fn plan_replace(args: &Args, workspace: &Workspace) -> Result<ReplacePlan, ToolError> {
    let raw = required_path(args, "path")?;
    let find = required_str(args, "find")?;
    if find.is_empty() {
        return Err(ToolError::EmptyArgument("find".to_string()));
    }
    let replace = required_str(args, "replace")?;
    let count = int_arg(args, "count", 0, 0, MAX_COUNT)?;

    let path = workspace.resolve(raw)?;
    if !path.is_file() {
        return Err(ToolError::FileNotFound(raw.to_string()));
    }
    let before = read_text(&path)?;
    let occurrences = before.matches(find).count();
    let (after, replaced) = if count == 0 {
        (before.replace(find, replace), occurrences)
    } else {
        let limit = count as usize;
        (before.replacen(find, replace, limit), occurrences.min(limit))
    };

    Ok(ReplacePlan {
        rel: workspace.relative(&path),
        path,
        before,
        after,
        find: find.to_string(),
        replace: replace.to_string(),
        count,
        occurrences,
        replaced,
    })
}

pub struct ReplaceInFileTool;

impl Tool for ReplaceInFileTool {
    fn name(&self) -> &'static str {
        "replace_in_file"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name(),
            description: "Replace exact text in an existing file. count=0 replaces every occurrence. Finding nothing is not an error; changed is false.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "File path relative to the project root."
                    },
                    "find": {
                        "type": "string",
                        "description": "Exact text to find."
                    },
                    "replace": {
                        "type": "string",
                        "description": "Replacement text."
                    },
                    "count": {
                        "type": "integer",
                        "description": "Maximum replacements, 0 for all (default 0)."
                    }
                },
                "required": ["path", "find", "replace"]
            }),
        }
    }

    fn is_mutating(&self) -> bool {
        true
    }

    fn preview(&self, args: &Args, workspace: &Workspace) -> Result<ToolOutput, ToolError> {
        let plan = plan_replace(args, workspace)?;
        Ok(ToolOutput::Mutation(MutationReport {
            changed: plan.before != plan.after,
            applied: false,
            occurrences: Some(plan.occurrences),
            replaced: Some(plan.replaced),
            diff: Some(unified_diff(&plan.rel, Some(&plan.before), Some(&plan.after))),
            apply_args: Some(json!({
                "path": plan.rel,
                "find": plan.find,
                "replace": plan.replace,
                "count": plan.count,
            })),
            path: plan.rel,
            operation: "replace_in_file",
            ..Default::default()
        }))
    }

    fn execute(&self, args: &Args, workspace: &Workspace) -> Result<ToolOutput, ToolError> {
        let plan = plan_replace(args, workspace)?;
        let changed = plan.before != plan.after;
        if changed {
            fs::write(&plan.path, &plan.after)?;
        }
        Ok(ToolOutput::Mutation(MutationReport {
            changed,
            applied: changed,
            occurrences: Some(plan.occurrences),
            replaced: Some(plan.replaced),
            path: plan.rel,
            operation: "replace_in_file",
            ..Default::default()
        }))
    }
}
