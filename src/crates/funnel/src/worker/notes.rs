//! Internal note poster
//!
//! Notes are queued by the reconciler once a message is confirmed delivered.
//! The conversation is resolved at post time when the send did not know it.

use crate::broker::NoteJob;
use crate::channel::ChannelProvider;
use crate::db::repositories::ActivityRepository;
use crate::db::DatabasePool;
use crate::error::{FunnelError, Result};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct NotePoster {
    pool: DatabasePool,
    provider: Arc<dyn ChannelProvider>,
}

impl NotePoster {
    pub fn new(pool: DatabasePool, provider: Arc<dyn ChannelProvider>) -> Self {
        Self { pool, provider }
    }

    /// Post one note. Returns false when the recipient has no conversation.
    pub async fn post(&self, job: &NoteJob) -> Result<bool> {
        let binding = self.provider.resolve(&job.tenant_id).await?;

        let conversation_ref = match &job.conversation_ref {
            Some(conversation_ref) => Some(conversation_ref.clone()),
            None => {
                let cached = ActivityRepository::get(&self.pool, &job.tenant_id, &job.recipient_address)
                    .await?
                    .and_then(|activity| activity.conversation_ref);
                match cached {
                    Some(conversation_ref) => Some(conversation_ref),
                    None => binding
                        .client
                        .resolve_conversation(&job.recipient_address)
                        .await
                        .map_err(|e| FunnelError::Channel(e.to_string()))?,
                }
            }
        };

        let Some(conversation_ref) = conversation_ref else {
            warn!(
                execution_id = %job.execution_id,
                recipient = %job.recipient_address,
                "No conversation for internal note, dropping"
            );
            return Ok(false);
        };

        binding
            .client
            .post_internal_note(&conversation_ref, &job.note)
            .await
            .map_err(|e| FunnelError::Channel(e.to_string()))?;
        debug!(execution_id = %job.execution_id, conversation_ref = %conversation_ref, "Internal note posted");
        Ok(true)
    }
}
