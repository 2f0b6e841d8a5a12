//! In-memory conversation state with optional write-through persistence.
//!
//! A [`ConversationStore`] is an ordinary value owned by whoever drives the
//! chat; there is no global instance. Every mutation is announced on a
//! broadcast channel so views can refresh.

pub mod storage;

use crate::db::models::{
    AttachmentId, Conversation, ConversationId, ConversationSummary, Message, MessageId,
    MessageStatus, Role,
};
use crate::stream::StreamDelta;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use storage::{ConversationStorage, StorageError};
use tokio::sync::broadcast;

const TITLE_CHARS: usize = 30;
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    #[error("Conversation not found: {0}")]
    NotFound(ConversationId),
    #[error("Delta for message {message_id} arrived after it was finalized")]
    LateDelta { message_id: MessageId },
    #[error("Conversation {conversation_id} already has a turn in progress ({message_id})")]
    TurnInProgress {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    #[error("Message {0} is not an assistant message")]
    NotAssistant(MessageId),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    MessageAppended,
    DeltaApplied,
    TurnClosed,
    Deleted,
}

/// Refresh notification sent after each mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateEvent {
    pub conversation_id: ConversationId,
    pub message_id: Option<MessageId>,
    pub kind: ChangeKind,
}

/// A user submission as recorded in history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewMessage {
    pub content: String,
    pub image: Option<AttachmentId>,
    pub document: Option<AttachmentId>,
    pub model: Option<String>,
}

impl NewMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}

/// Ids handed out when a user turn is recorded. The reply id stays
/// reserved for the conversation until that reply is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTurn {
    pub user_message_id: MessageId,
    pub reply_id: MessageId,
}

/// Title shown for a conversation, taken from its first message.
pub fn derive_title(content: &str) -> String {
    let flat = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > TITLE_CHARS {
        let head: String = flat.chars().take(TITLE_CHARS).collect();
        format!("{}...", head.trim_end())
    } else if flat.is_empty() {
        "New chat".to_string()
    } else {
        flat
    }
}

pub struct ConversationStore {
    conversations: HashMap<ConversationId, Conversation>,
    /// Reply reserved or streaming, per conversation.
    open_turns: HashMap<ConversationId, MessageId>,
    storage: Option<Arc<dyn ConversationStorage>>,
    events: broadcast::Sender<StateEvent>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            conversations: HashMap::new(),
            open_turns: HashMap::new(),
            storage: None,
            events,
        }
    }

    pub fn with_storage(storage: Arc<dyn ConversationStorage>) -> Self {
        Self {
            storage: Some(storage),
            ..Self::new()
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    fn publish(
        &self,
        conversation_id: &ConversationId,
        message_id: Option<&MessageId>,
        kind: ChangeKind,
    ) {
        // No receivers is fine; lagging receivers skip ahead on their own.
        let _ = self.events.send(StateEvent {
            conversation_id: conversation_id.clone(),
            message_id: message_id.cloned(),
            kind,
        });
    }

    /// Makes `id` resident, loading it from storage if necessary. Returns
    /// whether the conversation exists.
    pub fn open(&mut self, id: &ConversationId) -> Result<bool, ConversationError> {
        if self.conversations.contains_key(id) {
            return Ok(true);
        }
        let Some(storage) = &self.storage else {
            return Ok(false);
        };
        match storage.load(id)? {
            Some(conversation) => {
                tracing::debug!(
                    conversation_id = %id,
                    messages = conversation.messages.len(),
                    "loaded conversation"
                );
                self.conversations.insert(id.clone(), conversation);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn conversation(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    /// Records a user turn, creating the conversation on its first one, and
    /// reserves the id of its reply. No other turn can start in the
    /// conversation until that reply is closed.
    pub fn append_user_turn(
        &mut self,
        conversation_id: &ConversationId,
        message: NewMessage,
    ) -> Result<PendingTurn, ConversationError> {
        if let Some(open) = self.open_turns.get(conversation_id) {
            return Err(ConversationError::TurnInProgress {
                conversation_id: conversation_id.clone(),
                message_id: open.clone(),
            });
        }

        let exists = self.open(conversation_id)?;
        if !exists {
            let conversation = Conversation {
                id: conversation_id.clone(),
                title: derive_title(&message.content),
                messages: Vec::new(),
                created_at: Utc::now(),
            };
            self.conversations
                .insert(conversation_id.clone(), conversation);
            self.publish(conversation_id, None, ChangeKind::Created);
        }

        let id = MessageId::new();
        let conversation = self
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| ConversationError::NotFound(conversation_id.clone()))?;
        conversation.messages.push(Message {
            id: id.clone(),
            role: Role::User,
            content: message.content,
            image: message.image,
            document: message.document,
            timestamp: Utc::now(),
            model: message.model,
            status: MessageStatus::Complete,
        });

        let reply_id = MessageId::new();
        self.open_turns
            .insert(conversation_id.clone(), reply_id.clone());
        self.publish(conversation_id, Some(&id), ChangeKind::MessageAppended);
        Ok(PendingTurn {
            user_message_id: id,
            reply_id,
        })
    }

    /// Applies one streamed delta to assistant message `message_id`. The
    /// first delta for an id creates the message; later ones extend it. A
    /// delta arriving after the final one is rejected and changes nothing.
    pub fn append_assistant_delta(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        delta: &StreamDelta,
    ) -> Result<(), ConversationError> {
        let message = self.assistant_message(conversation_id, message_id)?;
        if !message.status.is_open() {
            return Err(ConversationError::LateDelta {
                message_id: message_id.clone(),
            });
        }
        message.content.push_str(&delta.text);
        if delta.is_final {
            message.status = MessageStatus::Complete;
            self.open_turns.remove(conversation_id);
            self.publish(conversation_id, Some(message_id), ChangeKind::TurnClosed);
        } else {
            self.publish(conversation_id, Some(message_id), ChangeKind::DeltaApplied);
        }
        Ok(())
    }

    /// Closes an open assistant message whose stream ended without a
    /// completion marker; the partial text stays.
    pub fn finalize_truncated(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<(), ConversationError> {
        self.close_turn(conversation_id, message_id, MessageStatus::Truncated)
    }

    /// Closes an assistant message with an inline error.
    pub fn fail_turn(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        error: impl Into<String>,
    ) -> Result<(), ConversationError> {
        self.close_turn(
            conversation_id,
            message_id,
            MessageStatus::Failed {
                error: error.into(),
            },
        )
    }

    /// Replaces the text of a finished assistant message, e.g. after
    /// provider-specific cleanup.
    pub fn rewrite_content(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        content: String,
    ) -> Result<(), ConversationError> {
        let message = self.assistant_message(conversation_id, message_id)?;
        message.content = content;
        self.publish(conversation_id, Some(message_id), ChangeKind::DeltaApplied);
        Ok(())
    }

    fn close_turn(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        status: MessageStatus,
    ) -> Result<(), ConversationError> {
        let message = self.assistant_message(conversation_id, message_id)?;
        if !message.status.is_open() {
            return Err(ConversationError::LateDelta {
                message_id: message_id.clone(),
            });
        }
        message.status = status;
        self.open_turns.remove(conversation_id);
        self.publish(conversation_id, Some(message_id), ChangeKind::TurnClosed);
        Ok(())
    }

    /// Finds assistant message `message_id`, creating it in the streaming
    /// state if it does not exist yet. Creation is refused while another
    /// reply is reserved or open in the conversation.
    fn assistant_message(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<&mut Message, ConversationError> {
        let conversation = self
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| ConversationError::NotFound(conversation_id.clone()))?;

        let position = conversation
            .messages
            .iter()
            .rposition(|m| &m.id == message_id);

        let index = match position {
            Some(index) => {
                if conversation.messages[index].role != Role::Assistant {
                    return Err(ConversationError::NotAssistant(message_id.clone()));
                }
                index
            }
            None => {
                match self.open_turns.get(conversation_id) {
                    Some(open) if open != message_id => {
                        return Err(ConversationError::TurnInProgress {
                            conversation_id: conversation_id.clone(),
                            message_id: open.clone(),
                        });
                    }
                    _ => {}
                }
                let model = conversation
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .and_then(|m| m.model.clone());
                conversation.messages.push(Message {
                    id: message_id.clone(),
                    role: Role::Assistant,
                    content: String::new(),
                    image: None,
                    document: None,
                    timestamp: Utc::now(),
                    model,
                    status: MessageStatus::Streaming,
                });
                self.open_turns
                    .insert(conversation_id.clone(), message_id.clone());
                let _ = self.events.send(StateEvent {
                    conversation_id: conversation_id.clone(),
                    message_id: Some(message_id.clone()),
                    kind: ChangeKind::MessageAppended,
                });
                conversation.messages.len() - 1
            }
        };
        Ok(&mut conversation.messages[index])
    }

    /// The `max_turns` most recent messages, oldest first.
    pub fn bounded_history(
        &self,
        conversation_id: &ConversationId,
        max_turns: usize,
    ) -> Result<Vec<Message>, ConversationError> {
        let conversation = self
            .conversations
            .get(conversation_id)
            .ok_or_else(|| ConversationError::NotFound(conversation_id.clone()))?;
        let start = conversation.messages.len().saturating_sub(max_turns);
        Ok(conversation.messages[start..].to_vec())
    }

    /// Writes the conversation to storage, if any is configured.
    pub fn persist(&self, conversation_id: &ConversationId) -> Result<(), ConversationError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let conversation = self
            .conversations
            .get(conversation_id)
            .ok_or_else(|| ConversationError::NotFound(conversation_id.clone()))?;
        storage.save(conversation)?;
        Ok(())
    }

    pub fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ConversationError> {
        let mut summaries: HashMap<ConversationId, ConversationSummary> = match &self.storage {
            Some(storage) => storage
                .list()?
                .into_iter()
                .map(|s| (s.id.clone(), s))
                .collect(),
            None => HashMap::new(),
        };
        for conversation in self.conversations.values() {
            summaries.insert(
                conversation.id.clone(),
                ConversationSummary {
                    id: conversation.id.clone(),
                    title: conversation.title.clone(),
                    created_at: conversation.created_at,
                    message_count: conversation.messages.len(),
                },
            );
        }
        let mut summaries: Vec<ConversationSummary> = summaries.into_values().collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    /// Removes the conversation from memory and storage. Returns whether it
    /// existed in either.
    pub fn delete_conversation(&mut self, id: &ConversationId) -> Result<bool, ConversationError> {
        let mut existed = self.conversations.remove(id).is_some();
        self.open_turns.remove(id);
        if let Some(storage) = &self.storage {
            existed |= storage.load(id)?.is_some();
            storage.delete(id)?;
        }
        if existed {
            self.publish(id, None, ChangeKind::Deleted);
        }
        Ok(existed)
    }
}
