//! # Tool Trait
//!
//! This module defines the `Tool` trait that every workspace tool implements, and
//! the structured outputs tools hand back to the agent loop.
//!
//! Each tool runs in one of two modes. `execute` applies the operation to disk.
//! `preview` validates the same arguments and reports what would happen, including
//! a unified diff and the exact arguments needed to apply it later, without
//! touching the filesystem.

use crate::error::ToolError;
use crate::sandbox::Workspace;
use serde::Serialize;
use serde_json::{Map, Value};
use serde_with::skip_serializing_none;

pub mod args;
pub mod delete_file;
pub mod list_files;
pub mod read_file;
pub mod replace_in_file;
pub mod search_in_files;
pub mod walk;
pub mod write_file;

pub use self::delete_file::DeleteFileTool;
pub use self::list_files::ListFilesTool;
pub use self::read_file::ReadFileTool;
pub use self::replace_in_file::ReplaceInFileTool;
pub use self::search_in_files::SearchInFilesTool;
pub use self::write_file::WriteFileTool;

/// Tool arguments as decoded from the model.
pub type Args = Map<String, Value>;

/// Name, description and JSON schema of a tool, as advertised to the model.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

/// A trait representing a self-contained workspace tool.
///
/// This trait is object-safe, allowing dynamic dispatch via `Box<dyn Tool>`.
pub trait Tool: Send + Sync {
    /// Returns the unique, static name of the tool.
    fn name(&self) -> &'static str;

    /// Returns the definition advertised to the model.
    fn definition(&self) -> ToolDefinition;

    /// Whether the tool writes to the workspace.
    fn is_mutating(&self) -> bool {
        false
    }

    /// Performs a dry run. Read-only tools have nothing to hold back, so the
    /// default simply executes.
    fn preview(&self, args: &Args, workspace: &Workspace) -> Result<ToolOutput, ToolError> {
        self.execute(args, workspace)
    }

    /// Executes the tool against the workspace.
    fn execute(&self, args: &Args, workspace: &Workspace) -> Result<ToolOutput, ToolError>;
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ToolOutput {
    Files(FileListing),
    Content(FileContent),
    Matches(SearchReport),
    Mutation(MutationReport),
}

impl ToolOutput {
    pub fn as_mutation(&self) -> Option<&MutationReport> {
        match self {
            ToolOutput::Mutation(report) => Some(report),
            _ => None,
        }
    }

    /// The workspace-relative path the output refers to, if any.
    pub fn path(&self) -> Option<&str> {
        match self {
            ToolOutput::Files(listing) => Some(&listing.path),
            ToolOutput::Content(content) => Some(&content.path),
            ToolOutput::Matches(_) => None,
            ToolOutput::Mutation(report) => Some(&report.path),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FileListing {
    pub path: String,
    pub files: Vec<String>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FileContent {
    pub path: String,
    pub content: String,
    pub truncated: bool,
    pub total_chars: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchMatch {
    pub path: String,
    pub line: usize,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchReport {
    pub matches: Vec<SearchMatch>,
    pub files_scanned: usize,
    pub truncated: bool,
}

/// Outcome of a mutating tool in either mode.
///
/// In preview mode `applied` is false and `diff`/`apply_args` are filled in.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct MutationReport {
    pub path: String,
    pub operation: &'static str,
    pub changed: bool,
    pub applied: bool,
    pub created: Option<bool>,
    pub bytes: Option<usize>,
    pub occurrences: Option<usize>,
    pub replaced: Option<usize>,
    pub deleted: Option<bool>,
    pub diff: Option<String>,
    pub apply_args: Option<Value>,
}

impl MutationReport {
    /// A preview that would change something, i.e. a pending change.
    pub fn is_pending(&self) -> bool {
        !self.applied && self.changed
    }

    pub fn is_applied_change(&self) -> bool {
        self.applied && self.changed
    }
}

/// Reads a file as text, replacing invalid UTF-8 sequences.
pub(crate) fn read_text(path: &std::path::Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
