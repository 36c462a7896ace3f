//! # Session Store
//!
//! Local transcript cache and protocol state persistence. The runtime treats the
//! store as best-effort; in-memory state stays authoritative.

use crate::error::StoreError;
use crate::llm::ChatMessage;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub trait SessionStore: Send + Sync {
    /// The sandbox boundary for all workspace tools.
    fn project_root(&self) -> &Path;

    /// Cached messages of a chat, oldest first. `limit` keeps the newest entries.
    fn list_chat_messages(&self, chat_id: &str, limit: Option<usize>) -> Result<Vec<ChatMessage>, StoreError>;

    fn append_chat_messages(&self, chat_id: &str, messages: &[ChatMessage]) -> Result<(), StoreError>;

    fn replace_chat_messages(&self, chat_id: &str, messages: &[ChatMessage]) -> Result<(), StoreError>;

    fn delete_chat_messages(&self, chat_id: &str) -> Result<(), StoreError>;

    fn load_protocol_state(&self) -> Result<Option<Value>, StoreError>;

    fn save_protocol_state(&self, state: &Value) -> Result<(), StoreError>;
}

/// JSON files under a state directory: one file per chat plus one state blob.
pub struct FileSessionStore {
    project_root: PathBuf,
    state_dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(project_root: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            state_dir: state_dir.into(),
        }
    }

    fn chat_path(&self, chat_id: &str) -> PathBuf {
        let safe: String = chat_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.state_dir.join("chats").join(format!("{safe}.json"))
    }

    fn state_path(&self) -> PathBuf {
        self.state_dir.join("protocol_state.json")
    }

    fn read_chat(&self, chat_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        let path = self.chat_path(chat_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Writes `bytes` to a temp file next to `path` and renames it into place, so a
/// crash never leaves a half-written file behind.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(path).map_err(|e| StoreError::Persist {
        path: path.display().to_string(),
        reason: e.error.to_string(),
    })?;
    Ok(())
}

impl SessionStore for FileSessionStore {
    fn project_root(&self) -> &Path {
        &self.project_root
    }

    fn list_chat_messages(&self, chat_id: &str, limit: Option<usize>) -> Result<Vec<ChatMessage>, StoreError> {
        let mut messages = self.read_chat(chat_id)?;
        if let Some(limit) = limit {
            let skip = messages.len().saturating_sub(limit);
            messages.drain(..skip);
        }
        Ok(messages)
    }

    fn append_chat_messages(&self, chat_id: &str, messages: &[ChatMessage]) -> Result<(), StoreError> {
        let mut existing = self.read_chat(chat_id)?;
        existing.extend_from_slice(messages);
        self.replace_chat_messages(chat_id, &existing)
    }

    fn replace_chat_messages(&self, chat_id: &str, messages: &[ChatMessage]) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(messages)?;
        write_atomic(&self.chat_path(chat_id), &bytes)
    }

    fn delete_chat_messages(&self, chat_id: &str) -> Result<(), StoreError> {
        let path = self.chat_path(chat_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn load_protocol_state(&self) -> Result<Option<Value>, StoreError> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    fn save_protocol_state(&self, state: &Value) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(state)?;
        write_atomic(&self.state_path(), &bytes)
    }
}
