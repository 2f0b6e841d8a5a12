use crate::db::models::{
    Attachment, AttachmentId, Conversation, ConversationId, ConversationSummary,
};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Backing store for conversation history across sessions.
pub trait ConversationStorage: Send + Sync {
    fn load(&self, id: &ConversationId) -> Result<Option<Conversation>, StorageError>;
    /// Replaces the stored copy of `conversation` with the given one.
    fn save(&self, conversation: &Conversation) -> Result<(), StorageError>;
    fn delete(&self, id: &ConversationId) -> Result<(), StorageError>;
    fn list(&self) -> Result<Vec<ConversationSummary>, StorageError>;
}

pub trait AttachmentStore: Send + Sync {
    fn put_attachment(&self, attachment: &Attachment) -> Result<(), StorageError>;
    fn get_attachment(&self, id: &AttachmentId) -> Result<Option<Attachment>, StorageError>;
}

/// Process-local storage, used by tests and `--ephemeral` runs.
#[derive(Default)]
pub struct MemoryStorage {
    conversations: Mutex<HashMap<ConversationId, Conversation>>,
    attachments: Mutex<HashMap<AttachmentId, Attachment>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversationStorage for MemoryStorage {
    fn load(&self, id: &ConversationId) -> Result<Option<Conversation>, StorageError> {
        let map = self
            .conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(map.get(id).cloned())
    }

    fn save(&self, conversation: &Conversation) -> Result<(), StorageError> {
        let mut map = self
            .conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        map.insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    fn delete(&self, id: &ConversationId) -> Result<(), StorageError> {
        let mut map = self
            .conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        map.remove(id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<ConversationSummary>, StorageError> {
        let map = self
            .conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut summaries: Vec<ConversationSummary> = map
            .values()
            .map(|c| ConversationSummary {
                id: c.id.clone(),
                title: c.title.clone(),
                created_at: c.created_at,
                message_count: c.messages.len(),
            })
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }
}

impl AttachmentStore for MemoryStorage {
    fn put_attachment(&self, attachment: &Attachment) -> Result<(), StorageError> {
        let mut map = self
            .attachments
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        map.insert(attachment.id.clone(), attachment.clone());
        Ok(())
    }

    fn get_attachment(&self, id: &AttachmentId) -> Result<Option<Attachment>, StorageError> {
        let map = self
            .attachments
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(map.get(id).cloned())
    }
}
