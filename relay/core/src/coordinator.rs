//! Turn Coordinator
//!
//! Drives one chat turn from request to the last frame:
//!
//! ```text
//! validate ─▶ resolve conversation ─▶ persist user message ─▶ stream
//!                                                               │
//!                                    ┌──────── fan_out ─────────┤
//!                                    ▼                          ▼
//!                            Branch A: frames          Branch B: PersistenceSink
//! ```
//!
//! The returned stream yields the client's frames. It ends once the reply
//! has finished streaming and the persistence branch has completed. Dropping
//! it early detaches Branch A only; the reply is still saved.
//!
//! # Failure Modes
//!
//! | Failure                          | Client sees                         |
//! |----------------------------------|-------------------------------------|
//! | invalid input                    | `Err(Validation)`, no frames        |
//! | user message not stored          | `Err(Storage)`, no frames           |
//! | backend setup (`ResponseFailed`) | one error frame, normal end         |
//! | other setup failure              | one error frame, then `Err`         |
//! | mid-stream failure               | frames so far, then `Err(Upstream)` |
//! | reply not stored                 | nothing (recorded to metrics)       |

use std::sync::Arc;

use async_stream::try_stream;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{PoolConfig, TurnLimits};
use crate::error::RelayError;
use crate::messages::{MessageRole, WireFrame};
use crate::persistence::PersistenceSink;
use crate::pools::WorkerPools;
use crate::store::{Conversation, ConversationStore, StoreError};
use crate::streaming::fan_out;
use crate::transport::ModelTransport;

/// Frames for one turn; an `Err` item terminates the turn abnormally
pub type FrameStream = BoxStream<'static, Result<WireFrame, RelayError>>;

/// Characters of the query kept in a new conversation's title
pub const TITLE_MAX_CHARS: usize = 30;

/// Orchestrates chat turns
#[derive(Clone)]
pub struct TurnCoordinator {
    store: Arc<dyn ConversationStore>,
    transport: ModelTransport,
    sink: Arc<dyn PersistenceSink>,
    pools: Arc<WorkerPools>,
    limits: TurnLimits,
    branch_capacity: usize,
}

impl TurnCoordinator {
    /// Create a coordinator with default limits
    #[must_use]
    pub fn new(
        store: Arc<dyn ConversationStore>,
        transport: ModelTransport,
        sink: Arc<dyn PersistenceSink>,
        pools: Arc<WorkerPools>,
    ) -> Self {
        Self {
            store,
            transport,
            sink,
            pools,
            limits: TurnLimits::default(),
            branch_capacity: PoolConfig::default().branch_capacity,
        }
    }

    /// Set input limits
    #[must_use]
    pub fn with_limits(mut self, limits: TurnLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Set the per-branch buffer size
    #[must_use]
    pub fn with_branch_capacity(mut self, capacity: usize) -> Self {
        self.branch_capacity = capacity.max(1);
        self
    }

    /// Stream one chat turn
    ///
    /// `conversation_id` that is absent, blank, unparseable or owned by
    /// someone else starts a new conversation owned by `user_id`.
    pub fn stream_turn(
        &self,
        user_query: &str,
        conversation_id: Option<&str>,
        user_id: &str,
    ) -> FrameStream {
        let this = self.clone();
        let query = user_query.to_owned();
        let requested = parse_conversation_id(conversation_id);
        let user_id = user_id.to_owned();

        let frames = try_stream! {
            this.validate(&query, &user_id)?;

            let conversation = this.resolve_conversation(requested, &user_id, &query).await?;
            let conversation_id = conversation.id;
            info!(%conversation_id, user_id = %user_id, "Turn started");

            this.persist_user_message(conversation_id, &query).await?;

            let tokens = this.transport.create_filtered_stream(&query, conversation_id);
            let [mut client, persisted] = fan_out::<_, 2>(tokens, this.branch_capacity);

            let sink = Arc::clone(&this.sink);
            let persistence = tokio::spawn(async move {
                sink.save(persisted.boxed(), conversation_id, MessageRole::Assistant)
                    .await;
            });

            let mut sequence = 0u64;
            let mut failure = None;

            while let Some(item) = client.next().await {
                match item {
                    Ok(token) => {
                        sequence += 1;
                        yield WireFrame::message(sequence, conversation_id, token);
                    }
                    Err(err @ RelayError::ResponseFailed(_)) => {
                        warn!(%conversation_id, error = %err, "AI response failed");
                        yield WireFrame::error(conversation_id, &err);
                        break;
                    }
                    Err(err @ RelayError::Upstream(_)) => {
                        warn!(%conversation_id, frames = sequence, error = %err, "Reply failed mid-stream");
                        failure = Some(err);
                        break;
                    }
                    Err(err) => {
                        error!(%conversation_id, error = %err, "Turn failed");
                        yield WireFrame::error(conversation_id, &err);
                        failure = Some(err);
                        break;
                    }
                }
            }
            drop(client);

            if let Err(join_err) = persistence.await {
                error!(%conversation_id, error = %join_err, "Persistence task did not complete");
            }

            if let Some(err) = failure {
                Err::<(), RelayError>(err)?;
            }
            info!(%conversation_id, frames = sequence, "Turn completed");
        };

        frames.boxed()
    }

    fn validate(&self, query: &str, user_id: &str) -> Result<(), RelayError> {
        if query.trim().is_empty() {
            return Err(RelayError::Validation("query must not be empty".to_string()));
        }
        let max = self.limits.max_query_chars;
        if query.chars().count() > max {
            return Err(RelayError::Validation(format!(
                "query exceeds {max} characters"
            )));
        }
        if user_id.trim().is_empty() {
            return Err(RelayError::Validation("user id must not be empty".to_string()));
        }
        Ok(())
    }

    async fn resolve_conversation(
        &self,
        requested: Option<Uuid>,
        user_id: &str,
        query: &str,
    ) -> Result<Conversation, RelayError> {
        let store = Arc::clone(&self.store);
        let owner = user_id.to_owned();
        let title = conversation_title(query);

        let conversation = self
            .pools
            .storage()
            .spawn_blocking(move || store.find_or_create(requested, &owner, &title))
            .await
            .map_err(|e| RelayError::Internal(format!("conversation lookup failed: {e}")))??;

        if let Some(requested) = requested.filter(|id| *id != conversation.id) {
            debug!(%requested, conversation_id = %conversation.id, "Requested conversation unavailable, started a new one");
        }
        Ok(conversation)
    }

    async fn persist_user_message(&self, conversation_id: Uuid, query: &str) -> Result<(), RelayError> {
        let store = Arc::clone(&self.store);
        let content = query.to_owned();

        let written = self
            .pools
            .storage()
            .spawn_blocking(move || store.append_message(conversation_id, MessageRole::User, &content))
            .await
            .map_err(|e| RelayError::Internal(format!("user message write failed: {e}")))?;

        match written {
            Ok(_) => Ok(()),
            Err(StoreError::ConversationDeleted(_)) => {
                warn!(%conversation_id, "Conversation deleted before the user message was saved");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl std::fmt::Debug for TurnCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnCoordinator")
            .field("transport", &self.transport)
            .field("limits", &self.limits)
            .field("branch_capacity", &self.branch_capacity)
            .finish_non_exhaustive()
    }
}

/// Title for a conversation started by `query`
///
/// The first [`TITLE_MAX_CHARS`] characters, with `...` appended when the
/// query is longer.
#[must_use]
pub fn conversation_title(query: &str) -> String {
    let mut chars = query.chars();
    let head: String = chars.by_ref().take(TITLE_MAX_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

fn parse_conversation_id(raw: Option<&str>) -> Option<Uuid> {
    raw.map(str::trim)
        .filter(|id| !id.is_empty())
        .and_then(|id| Uuid::parse_str(id).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_short_query_kept() {
        assert_eq!(conversation_title("Hi"), "Hi");
        assert_eq!(conversation_title(&"a".repeat(30)), "a".repeat(30));
    }

    #[test]
    fn test_title_long_query_truncated() {
        let query = "b".repeat(31);
        assert_eq!(conversation_title(&query), format!("{}...", "b".repeat(30)));
    }

    #[test]
    fn test_title_counts_characters() {
        let query = "é".repeat(31);
        assert_eq!(conversation_title(&query), format!("{}...", "é".repeat(30)));
    }

    #[test]
    fn test_parse_conversation_id() {
        let id = Uuid::new_v4();
        assert_eq!(parse_conversation_id(Some(&id.to_string())), Some(id));
        assert_eq!(parse_conversation_id(Some(&format!("  {id} "))), Some(id));
        assert_eq!(parse_conversation_id(Some("")), None);
        assert_eq!(parse_conversation_id(Some("   ")), None);
        assert_eq!(parse_conversation_id(Some("not-a-uuid")), None);
        assert_eq!(parse_conversation_id(None), None);
    }
}
