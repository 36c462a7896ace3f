//! # Change Sets
//!
//! Pending changes are previews waiting to be applied; applied snapshots hold the
//! pre-mutation state of each touched file so one application can be undone.
//! Both registries are bounded and evict their oldest entry first.

use crate::error::{AgentError, ToolError};
use crate::tool_collection::ToolCollection;
use crate::tools::{MutationReport, read_text};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::fs;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};
use uuid::Uuid;

pub const CHANGE_SET_CAPACITY: usize = 64;

const MUTATING_OPERATIONS: &[&str] = &["write_file", "replace_in_file", "delete_file"];

/// A computed, not yet applied file mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    pub operation: String,
    pub path: String,
    pub diff: String,
    pub apply_args: Value,
}

impl PendingChange {
    pub fn from_report(tool: &str, report: &MutationReport) -> Option<Self> {
        if !report.is_pending() || !MUTATING_OPERATIONS.contains(&tool) {
            return None;
        }
        Some(Self {
            operation: report.operation.to_string(),
            path: report.path.clone(),
            diff: report.diff.clone().unwrap_or_default(),
            apply_args: report.apply_args.clone().unwrap_or_else(|| json!({})),
        })
    }

    /// Identity used to deduplicate changes: the exact operation, path and
    /// arguments. Two different edits of one path stay distinct.
    pub fn dedup_key(&self) -> String {
        json!({
            "operation": self.operation,
            "path": self.path,
            "apply_args": self.apply_args,
        })
        .to_string()
    }
}

/// State of one file before an applied change set touched it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub path: String,
    pub existed: bool,
    pub content: String,
}

/// Insertion-ordered map from opaque ids to values, capped at `capacity`.
#[derive(Debug)]
pub struct BoundedRegistry<T> {
    capacity: usize,
    entries: Mutex<VecDeque<(String, T)>>,
}

impl<T> BoundedRegistry<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Stores `value` under a fresh id, evicting the oldest entries over capacity.
    pub fn insert(&self, value: T) -> String {
        let id = Uuid::new_v4().to_string();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.push_back((id.clone(), value));
        while entries.len() > self.capacity.max(1) {
            if let Some((evicted, _)) = entries.pop_front() {
                debug!(id = %evicted, "evicted oldest change set");
            }
        }
        id
    }

    /// Removes and returns the entry for `id`.
    pub fn take(&self, id: &str) -> Option<T> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let index = entries.iter().position(|(key, _)| key == id)?;
        entries.remove(index).map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyReport {
    pub pending_id: String,
    pub applied_count: usize,
    pub applied_files: Vec<String>,
    pub errors: Vec<String>,
    pub applied_change_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UndoReport {
    pub applied_change_id: String,
    pub undone_files: Vec<String>,
    pub undone_count: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscardReport {
    pub id: String,
    pub discarded: bool,
}

/// Both change-set registries of one agent.
#[derive(Debug)]
pub struct ChangeRegistry {
    pending: BoundedRegistry<Vec<PendingChange>>,
    applied: BoundedRegistry<Vec<FileSnapshot>>,
}

impl Default for ChangeRegistry {
    fn default() -> Self {
        Self::new(CHANGE_SET_CAPACITY)
    }
}

impl ChangeRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: BoundedRegistry::new(capacity),
            applied: BoundedRegistry::new(capacity),
        }
    }

    /// Registers a non-empty set of pending changes and returns its id.
    pub fn register_pending(&self, changes: &[PendingChange]) -> Option<String> {
        if changes.is_empty() {
            return None;
        }
        Some(self.pending.insert(changes.to_vec()))
    }

    /// Replays a pending set in apply mode. The set is consumed whatever the
    /// outcome; each path is snapshotted before its first mutation.
    pub fn apply_pending(&self, pending_id: &str, tools: &ToolCollection) -> Result<ApplyReport, AgentError> {
        let pending_id = required_id(pending_id, "pending_id")?;
        let changes = self
            .pending
            .take(pending_id)
            .ok_or(AgentError::ChangesNotFound("pending changes"))?;

        let mut snapshots: Vec<FileSnapshot> = Vec::new();
        let mut applied_files: Vec<String> = Vec::new();
        let mut errors = Vec::new();
        let mut applied_count = 0;

        for change in &changes {
            if !MUTATING_OPERATIONS.contains(&change.operation.as_str()) {
                continue;
            }
            let path_hint = change
                .apply_args
                .get("path")
                .and_then(Value::as_str)
                .unwrap_or(change.path.as_str())
                .trim()
                .to_string();
            if !path_hint.is_empty() && !snapshots.iter().any(|s| s.path == path_hint) {
                match snapshot_file(tools, &path_hint) {
                    Ok(snapshot) => snapshots.push(snapshot),
                    Err(e) => {
                        errors.push(format!("{}: {e}", change.operation));
                        continue;
                    }
                }
            }

            match tools.execute(&change.operation, &change.apply_args, true) {
                Ok(output) => {
                    let Some(report) = output.as_mutation().filter(|r| r.changed) else {
                        continue;
                    };
                    applied_count += 1;
                    if !report.path.is_empty() && !applied_files.contains(&report.path) {
                        applied_files.push(report.path.clone());
                    }
                }
                Err(e) => {
                    warn!(operation = %change.operation, path = %change.path, error = %e, "pending change failed");
                    errors.push(format!("{}: {e}", change.operation));
                }
            }
        }

        let applied_change_id = if applied_count > 0 && !snapshots.is_empty() {
            Some(self.applied.insert(snapshots))
        } else {
            None
        };

        Ok(ApplyReport {
            pending_id: pending_id.to_string(),
            applied_count,
            applied_files,
            errors,
            applied_change_id,
        })
    }

    pub fn discard_pending(&self, pending_id: &str) -> Result<DiscardReport, AgentError> {
        let id = required_id(pending_id, "pending_id")?;
        Ok(DiscardReport {
            id: id.to_string(),
            discarded: self.pending.take(id).is_some(),
        })
    }

    /// Restores every snapshotted file: rewrites prior content, or removes files
    /// that did not exist before.
    pub fn undo_applied(&self, applied_change_id: &str, tools: &ToolCollection) -> Result<UndoReport, AgentError> {
        let id = required_id(applied_change_id, "applied_change_id")?;
        let snapshots = self
            .applied
            .take(id)
            .ok_or(AgentError::ChangesNotFound("applied changes"))?;

        let mut undone_files: Vec<String> = Vec::new();
        let mut errors = Vec::new();
        for snapshot in &snapshots {
            match restore_file(tools, snapshot) {
                Ok(()) => {
                    if !undone_files.contains(&snapshot.path) {
                        undone_files.push(snapshot.path.clone());
                    }
                }
                Err(e) => errors.push(format!("{}: {e}", snapshot.path)),
            }
        }

        Ok(UndoReport {
            applied_change_id: id.to_string(),
            undone_count: undone_files.len(),
            undone_files,
            errors,
        })
    }

    pub fn discard_applied(&self, applied_change_id: &str) -> Result<DiscardReport, AgentError> {
        let id = required_id(applied_change_id, "applied_change_id")?;
        Ok(DiscardReport {
            id: id.to_string(),
            discarded: self.applied.take(id).is_some(),
        })
    }
}

fn required_id<'a>(id: &'a str, name: &str) -> Result<&'a str, AgentError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(AgentError::InvalidInput(format!("{name} is required")));
    }
    Ok(id)
}

fn snapshot_file(tools: &ToolCollection, path: &str) -> Result<FileSnapshot, ToolError> {
    let target = tools.workspace().resolve(path)?;
    let existed = target.is_file();
    let content = if existed { read_text(&target)? } else { String::new() };
    Ok(FileSnapshot {
        path: path.to_string(),
        existed,
        content,
    })
}

fn restore_file(tools: &ToolCollection, snapshot: &FileSnapshot) -> Result<(), ToolError> {
    let target = tools.workspace().resolve(&snapshot.path)?;
    if snapshot.existed {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, &snapshot.content)?;
    } else if target.exists() {
        if !target.is_file() {
            return Err(ToolError::NotAFile);
        }
        fs::remove_file(&target)?;
    }
    Ok(())
}
