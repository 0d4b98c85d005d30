//! Persistence Sink
//!
//! Saves the assistant's reply from the persistence branch of a turn.
//!
//! A sink never fails from the caller's point of view: every problem is
//! reported to the [`PersistenceMetrics`] collaborator and the save completes
//! normally, so the client stream is never affected by storage.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RelayError;
use crate::messages::MessageRole;
use crate::metrics::PersistenceMetrics;
use crate::pools::WorkerPools;
use crate::store::{ConversationStore, StoreError};
use crate::transport::FilteredTokens;

/// Strategy for saving a streamed message
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Consume `tokens` and persist them as a `role` message
    async fn save(&self, tokens: FilteredTokens, conversation_id: Uuid, role: MessageRole);
}

/// Buffers the whole reply and writes it once the stream completes
pub struct EndOfStreamSave {
    store: Arc<dyn ConversationStore>,
    metrics: Arc<dyn PersistenceMetrics>,
    pools: Arc<WorkerPools>,
}

impl EndOfStreamSave {
    /// Create the sink
    #[must_use]
    pub fn new(
        store: Arc<dyn ConversationStore>,
        metrics: Arc<dyn PersistenceMetrics>,
        pools: Arc<WorkerPools>,
    ) -> Self {
        Self {
            store,
            metrics,
            pools,
        }
    }
}

#[async_trait]
impl PersistenceSink for EndOfStreamSave {
    async fn save(&self, mut tokens: FilteredTokens, conversation_id: Uuid, role: MessageRole) {
        let mut reply = String::new();
        let mut token_count = 0usize;

        while let Some(item) = tokens.next().await {
            match item {
                Ok(token) => {
                    reply.push_str(&token);
                    token_count += 1;
                }
                Err(err) => {
                    warn!(%conversation_id, %role, token_count, error = %err, "Reply stream failed, nothing saved");
                    self.metrics
                        .record_persistence_failure(conversation_id, role, &err);
                    return;
                }
            }
        }
        drop(tokens);

        if token_count == 0 {
            debug!(%conversation_id, %role, "Empty reply, skipping save");
            return;
        }

        let store = Arc::clone(&self.store);
        let written = self
            .pools
            .storage()
            .spawn_blocking(move || store.append_message(conversation_id, role, &reply))
            .await;

        match written {
            Ok(Ok(message)) => {
                debug!(%conversation_id, %role, message_id = %message.id, token_count, "Reply saved");
            }
            Ok(Err(StoreError::ConversationDeleted(_))) => {
                debug!(%conversation_id, %role, "Conversation deleted before the reply was saved");
            }
            Ok(Err(err)) => {
                self.metrics
                    .record_persistence_failure(conversation_id, role, &RelayError::Storage(err));
            }
            Err(join_err) => {
                let err = RelayError::Internal(format!("save task failed: {join_err}"));
                self.metrics
                    .record_persistence_failure(conversation_id, role, &err);
            }
        }
    }
}
