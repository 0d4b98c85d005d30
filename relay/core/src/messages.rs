//! Wire Messages
//!
//! Frames sent from the relay to a client, plus the role tag shared with the
//! conversation store.
//!
//! # Wire Format
//!
//! Each frame renders as one server-sent event:
//!
//! ```text
//! id: 3
//! event: message
//! data: {"conversationId":"<uuid>","content":"lo"}
//!
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RelayError;

/// Prefix of the content carried by the synthetic error frame
pub const ERROR_FRAME_PREFIX: &str = "Failed to process AI response: ";

/// Who authored a stored message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// User input
    User,
    /// Model reply
    Assistant,
    /// System message
    System,
}

impl MessageRole {
    /// Lowercase name, as stored and reported
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame identifier: a per-turn sequence number, or the literal `error`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameId {
    /// 1-based position among the turn's message frames
    Sequence(u64),
    /// The single synthetic error frame
    Error,
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequence(n) => write!(f, "{n}"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// SSE event name
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// A token of the reply
    Message,
    /// A failure report
    Error,
}

impl EventKind {
    /// Event name as written on the wire
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Error => "error",
        }
    }
}

/// JSON body of a frame
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FramePayload {
    /// Conversation the turn belongs to
    pub conversation_id: Uuid,
    /// Token text, or the error description
    pub content: String,
}

/// One unit of the client-facing streamed response
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireFrame {
    /// Frame identifier
    pub id: FrameId,
    /// Event name
    pub event: EventKind,
    /// JSON payload
    pub data: FramePayload,
}

impl WireFrame {
    /// A token frame
    pub fn message(sequence: u64, conversation_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            id: FrameId::Sequence(sequence),
            event: EventKind::Message,
            data: FramePayload {
                conversation_id,
                content: content.into(),
            },
        }
    }

    /// The synthetic error frame for a failed turn
    #[must_use]
    pub fn error(conversation_id: Uuid, error: &RelayError) -> Self {
        Self {
            id: FrameId::Error,
            event: EventKind::Error,
            data: FramePayload {
                conversation_id,
                content: format!("{ERROR_FRAME_PREFIX}{}", error.detail()),
            },
        }
    }

    /// Error frame for a request rejected before a conversation was resolved
    ///
    /// The conversation id is the nil UUID.
    #[must_use]
    pub fn rejection(error: &RelayError) -> Self {
        Self {
            id: FrameId::Error,
            event: EventKind::Error,
            data: FramePayload {
                conversation_id: Uuid::nil(),
                content: error.to_string(),
            },
        }
    }

    /// Whether this is an error frame
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.event == EventKind::Error
    }

    /// Render as a server-sent event, terminated by a blank line
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn to_sse(&self) -> serde_json::Result<String> {
        let data = serde_json::to_string(&self.data)?;
        Ok(format!(
            "id: {}\nevent: {}\ndata: {}\n\n",
            self.id,
            self.event.as_str(),
            data
        ))
    }
}
