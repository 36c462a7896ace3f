use crate::llm::ChatMessage;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Short-term per-chat transcript, used when neither the remote service nor the
/// local store has history for a chat.
#[derive(Debug)]
pub struct ChatMemory {
    limit: usize,
    chats: Mutex<HashMap<String, Vec<ChatMessage>>>,
}

impl ChatMemory {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            chats: Mutex::new(HashMap::new()),
        }
    }

    pub fn remember(&self, chat_id: &str, messages: &[ChatMessage]) {
        let mut chats = self.chats.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = chats.entry(chat_id.to_string()).or_default();
        entry.extend_from_slice(messages);
        let overflow = entry.len().saturating_sub(self.limit);
        entry.drain(..overflow);
    }

    /// Up to `limit` most recent messages, oldest first.
    pub fn recent(&self, chat_id: &str, limit: usize) -> Vec<ChatMessage> {
        let chats = self.chats.lock().unwrap_or_else(PoisonError::into_inner);
        chats
            .get(chat_id)
            .map(|messages| {
                let skip = messages.len().saturating_sub(limit);
                messages[skip..].to_vec()
            })
            .unwrap_or_default()
    }
}
