//! Conversation Storage
//!
//! Conversations and their messages, behind the [`ConversationStore`] trait.
//!
//! # Design Philosophy
//!
//! Store calls are blocking (a file write, a database driver) and are always
//! dispatched onto the storage worker pool by their callers. The trait is
//! therefore synchronous; async callers go through
//! `tokio::task::spawn_blocking`.
//!
//! A conversation that disappears between lookup and update is reported as
//! [`StoreError::ConversationDeleted`], which callers treat as a benign race
//! rather than a failure.

mod file;
mod memory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::messages::MessageRole;

pub use file::FileStore;
pub use memory::InMemoryStore;

/// Errors raised by conversation stores
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The conversation was removed while the turn was in flight
    #[error("Conversation {0} was deleted")]
    ConversationDeleted(Uuid),

    /// Underlying I/O failed
    #[error("I/O failure: {0}")]
    Io(String),

    /// A stored document could not be encoded or decoded
    #[error("Serialization failure: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Short tag used when reporting the error to metrics
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConversationDeleted(_) => "conversation_deleted",
            Self::Io(_) => "storage_io",
            Self::Serialization(_) => "storage_serialization",
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// A message in a conversation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Unique message ID
    pub id: Uuid,
    /// Who sent this message
    pub role: MessageRole,
    /// Message content
    pub content: String,
    /// When the message was stored
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    /// Create a new message stamped with the current time
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// A conversation owned by one user
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique conversation ID
    pub id: Uuid,
    /// Owning user
    pub owner: String,
    /// Display title
    pub title: String,
    /// When the conversation was created
    pub created_at: DateTime<Utc>,
    /// When a message was last appended
    pub updated_at: DateTime<Utc>,
    /// Message history, oldest first
    pub messages: Vec<StoredMessage>,
}

impl Conversation {
    /// Create an empty conversation
    pub fn new(owner: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            title: title.into(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        }
    }

    /// Whether `user_id` owns this conversation
    #[must_use]
    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.owner == user_id
    }

    /// Append a message and return a copy of it
    pub fn push(&mut self, role: MessageRole, content: impl Into<String>) -> StoredMessage {
        let message = StoredMessage::new(role, content);
        self.updated_at = message.created_at;
        self.messages.push(message.clone());
        message
    }

    /// Messages with the given role, oldest first
    pub fn messages_by(&self, role: MessageRole) -> impl Iterator<Item = &StoredMessage> {
        self.messages.iter().filter(move |m| m.role == role)
    }
}

/// Storage for conversations and their messages
pub trait ConversationStore: Send + Sync {
    /// Return the conversation `id` if it exists and is owned by `user_id`,
    /// otherwise create a new conversation for `user_id` titled `title`
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    fn find_or_create(
        &self,
        id: Option<Uuid>,
        user_id: &str,
        title: &str,
    ) -> Result<Conversation, StoreError>;

    /// Append a message to an existing conversation
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ConversationDeleted`] if the conversation no
    /// longer exists, or another error if the write fails.
    fn append_message(
        &self,
        conversation_id: Uuid,
        role: MessageRole,
        content: &str,
    ) -> Result<StoredMessage, StoreError>;

    /// Look up a conversation by ID
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn get(&self, id: Uuid) -> Result<Option<Conversation>, StoreError>;

    /// Remove a conversation, returning whether it existed
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn delete(&self, id: Uuid) -> Result<bool, StoreError>;
}
