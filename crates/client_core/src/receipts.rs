use std::sync::Arc;

use futures::future::join_all;
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::ClientRequest,
};
use tracing::{debug, info, warn};

use crate::{error::SyncError, history::HistoryApi, SyncClient, SyncEvent};

impl SyncClient {
    /// Acknowledges every unread message from the other participant.
    ///
    /// The unread set is recomputed from current state under the lock, so
    /// overlapping calls settle on zero instead of decrementing twice.
    /// Returns how many messages were acknowledged.
    pub async fn mark_as_read(&self, conversation_id: &ConversationId) -> Result<usize, SyncError> {
        let (message_ids, dispatched) = {
            let mut state = self.inner.lock().await;
            let conversation = state
                .directory
                .get_mut(conversation_id)
                .ok_or_else(|| SyncError::conversation_not_found(conversation_id))?;
            let message_ids = conversation
                .timeline
                .unread_from_others(&self.identity.user_id);
            if message_ids.is_empty() {
                return Ok(0);
            }

            let dispatched = self.connection.is_ready()
                && match self.connection.send(&ClientRequest::MarkAsRead {
                    conversation_id: conversation_id.clone(),
                    message_ids: message_ids.clone(),
                }) {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(conversation_id = %conversation_id, error = %err, "read receipt not dispatched");
                        false
                    }
                };

            conversation.timeline.apply_read_batch(&message_ids);
            conversation.set_remote_unread(0);
            (message_ids, dispatched)
        };

        debug!(
            conversation_id = %conversation_id,
            count = message_ids.len(),
            dispatched,
            "marked conversation read"
        );
        self.emit(SyncEvent::TimelineChanged(conversation_id.clone()));
        self.emit(SyncEvent::ConversationUpdated(conversation_id.clone()));

        if !dispatched {
            let history = Arc::clone(&self.history);
            let conversation_id = conversation_id.clone();
            let message_ids = message_ids.clone();
            tokio::spawn(async move {
                mark_read_over_http(history.as_ref(), &conversation_id, &message_ids).await;
            });
        }
        Ok(message_ids.len())
    }

    /// Applies a `messagesRead` batch reported by the server.
    ///
    /// A batch read by this user is our own receipt echoed back and is
    /// ignored. Returns how many messages changed state.
    pub async fn apply_remote_read(
        &self,
        conversation_id: Option<&ConversationId>,
        read_by: &UserId,
        message_ids: &[MessageId],
    ) -> usize {
        if read_by == &self.identity.user_id {
            debug!(count = message_ids.len(), "ignoring echo of own read receipt");
            return 0;
        }

        let (conversation_id, changed) = {
            let mut state = self.inner.lock().await;
            let conversation_id = match conversation_id {
                Some(id) => Some(id.clone()),
                None => state.directory.find_by_message(message_ids),
            };
            let Some(conversation_id) = conversation_id else {
                debug!(read_by = %read_by, "read receipt for messages not held");
                return 0;
            };
            let Some(conversation) = state.directory.get_mut(&conversation_id) else {
                debug!(conversation_id = %conversation_id, "read receipt for unknown conversation");
                return 0;
            };
            let changed = conversation.timeline.apply_read_batch(message_ids);
            (conversation_id, changed)
        };

        if changed > 0 {
            debug!(conversation_id = %conversation_id, read_by = %read_by, changed, "remote read applied");
            self.emit(SyncEvent::TimelineChanged(conversation_id));
        }
        changed
    }
}

async fn mark_read_over_http(
    history: &dyn HistoryApi,
    conversation_id: &ConversationId,
    message_ids: &[MessageId],
) {
    let results = join_all(
        message_ids
            .iter()
            .map(|message_id| history.mark_message_read(message_id)),
    )
    .await;
    let failed = results.iter().filter(|result| result.is_err()).count();
    for (message_id, result) in message_ids.iter().zip(&results) {
        if let Err(err) = result {
            warn!(
                conversation_id = %conversation_id,
                message_id = %message_id,
                error = %format!("{err:#}"),
                "failed to mark message read over http"
            );
        }
    }
    info!(
        conversation_id = %conversation_id,
        acknowledged = message_ids.len() - failed,
        failed,
        "read receipts sent over http"
    );
}
