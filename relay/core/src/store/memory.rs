//! In-memory conversation store

use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use super::{Conversation, ConversationStore, StoreError, StoredMessage};
use crate::messages::MessageRole;

/// Conversation store backed by a concurrent map
///
/// Contents are lost when the process exits.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    conversations: DashMap<Uuid, Conversation>,
}

impl InMemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of conversations held
    #[must_use]
    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    /// Whether the store holds no conversations
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}

impl ConversationStore for InMemoryStore {
    fn find_or_create(
        &self,
        id: Option<Uuid>,
        user_id: &str,
        title: &str,
    ) -> Result<Conversation, StoreError> {
        if let Some(id) = id {
            if let Some(existing) = self.conversations.get(&id) {
                if existing.is_owned_by(user_id) {
                    return Ok(existing.clone());
                }
                debug!(conversation_id = %id, "Conversation owned by another user");
            }
        }

        let conversation = Conversation::new(user_id, title);
        self.conversations
            .insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    fn append_message(
        &self,
        conversation_id: Uuid,
        role: MessageRole,
        content: &str,
    ) -> Result<StoredMessage, StoreError> {
        self.conversations
            .get_mut(&conversation_id)
            .map(|mut conversation| conversation.push(role, content))
            .ok_or(StoreError::ConversationDeleted(conversation_id))
    }

    fn get(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        Ok(self.conversations.get(&id).map(|c| c.clone()))
    }

    fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.conversations.remove(&id).is_some())
    }
}
