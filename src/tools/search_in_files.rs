use super::args::{bool_arg, int_arg, optional_str, required_str};
use super::walk::{PathFilter, collect_files};
use super::{Args, SearchMatch, SearchReport, Tool, ToolDefinition, ToolOutput};
use crate::error::ToolError;
use crate::sandbox::Workspace;
use serde_json::json;
use std::fs;

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 5000;
const MAX_LINE_CHARS: usize = 500;

pub struct SearchInFilesTool;

impl Tool for SearchInFilesTool {
    fn name(&self) -> &'static str {
        "search_in_files"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name(),
            description: "Search project files line by line for a plain substring. Returns path, 1-based line number and line text for each match.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Substring to search for."
                    },
                    "path": {
                        "type": "string",
                        "description": "Directory or file to search, relative to the project root. Defaults to the root."
                    },
                    "glob": {
                        "type": "string",
                        "description": "Optional glob restricting which files are searched."
                    },
                    "limit": {
                        "type": "integer",
                        "description": "Maximum number of matches (1-5000, default 100)."
                    },
                    "ignore_case": {
                        "type": "boolean",
                        "description": "Case-insensitive matching (default true)."
                    }
                },
                "required": ["query"]
            }),
        }
    }

    fn execute(&self, args: &Args, workspace: &Workspace) -> Result<ToolOutput, ToolError> {
        let query = required_str(args, "query")?;
        if query.is_empty() {
            return Err(ToolError::MissingArgument("query".to_string()));
        }
        let raw = optional_str(args, "path").unwrap_or(".");
        let limit = int_arg(args, "limit", DEFAULT_LIMIT, 1, MAX_LIMIT)? as usize;
        let ignore_case = bool_arg(args, "ignore_case", true);
        let filter = PathFilter::new(optional_str(args, "glob"))?;

        let needle = if ignore_case {
            query.to_lowercase()
        } else {
            query.to_string()
        };

        let (_, files) = collect_files(workspace, raw, &filter)?;
        let mut matches = Vec::new();
        let mut files_scanned = 0;

        for (path, rel) in files {
            let Ok(bytes) = fs::read(&path) else {
                continue;
            };
            files_scanned += 1;
            let text = String::from_utf8_lossy(&bytes);
            for (index, line) in text.lines().enumerate() {
                let found = if ignore_case {
                    line.to_lowercase().contains(&needle)
                } else {
                    line.contains(&needle)
                };
                if !found {
                    continue;
                }
                matches.push(SearchMatch {
                    path: rel.clone(),
                    line: index + 1,
                    text: line.chars().take(MAX_LINE_CHARS).collect(),
                });
                if matches.len() >= limit {
                    return Ok(ToolOutput::Matches(SearchReport {
                        matches,
                        files_scanned,
                        truncated: true,
                    }));
                }
            }
        }

        Ok(ToolOutput::Matches(SearchReport {
            matches,
            files_scanned,
            truncated: false,
        }))
    }
}
