//! Message history shared by the coordinator and its consumers.
//!
//! Messages are kept in arrival order. Read receipts mutate entries in place
//! and never reorder them.

use std::collections::HashSet;

use chatwire_shared::{ChatMessage, ReadReceipt};

#[derive(Debug, Default, Clone)]
pub struct MessageHistory {
    messages: Vec<ChatMessage>,
    ids: HashSet<String>,
}

impl MessageHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message. Returns false if a message with the same id is
    /// already stored (deduplication).
    pub fn insert(&mut self, msg: ChatMessage) -> bool {
        if !self.ids.insert(msg.id.clone()) {
            return false;
        }
        self.messages.push(msg);
        true
    }

    /// Mark the receipt's messages read. Returns how many entries changed.
    pub fn apply_read_receipt(&mut self, receipt: &ReadReceipt) -> usize {
        let wanted: HashSet<&str> = receipt.message_ids.iter().map(String::as_str).collect();
        let mut changed = 0;
        for msg in self
            .messages
            .iter_mut()
            .filter(|m| wanted.contains(m.id.as_str()))
        {
            if !msg.read {
                msg.read = true;
                msg.read_at = Some(receipt.read_at);
                changed += 1;
            }
        }
        changed
    }

    pub fn get(&self, id: &str) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
    }
}
