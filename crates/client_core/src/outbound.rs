use std::sync::Arc;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, MessageType, TemporaryId},
    protocol::{ClientRequest, MessageMetadata, OutboundMessage},
};
use tracing::{debug, warn};

use crate::{error::SyncError, types::Message, SyncClient, SyncEvent};

/// A dispatched send still waiting for `messageDelivered` or `messageError`.
#[derive(Debug, Clone)]
pub(crate) struct PendingSend {
    pub(crate) temporary_id: TemporaryId,
    pub(crate) conversation_id: ConversationId,
    previous_preview: Option<String>,
    previous_at: Option<DateTime<Utc>>,
}

pub(crate) fn validate_content(content: &str, max_length: usize) -> Result<(), SyncError> {
    if content.trim().is_empty() {
        return Err(SyncError::Validation("message is empty".into()));
    }
    let length = content.chars().count();
    if length > max_length {
        return Err(SyncError::Validation(format!(
            "message is {length} characters, limit is {max_length}"
        )));
    }
    Ok(())
}

impl SyncClient {
    /// Sends `content` to the selected conversation.
    ///
    /// The pending entry is visible in the timeline before this returns; the
    /// returned temporary id identifies it until the server acknowledges.
    pub async fn send(&self, content: &str) -> Result<TemporaryId, SyncError> {
        validate_content(content, self.settings.max_message_length)?;
        let temporary_id = TemporaryId::generate();

        let (conversation_id, outbound) = {
            let mut state = self.inner.lock().await;
            let conversation_id = state
                .selected
                .clone()
                .ok_or_else(|| SyncError::NotFound("no conversation selected".into()))?;
            let conversation = state
                .directory
                .get_mut(&conversation_id)
                .ok_or_else(|| SyncError::conversation_not_found(&conversation_id))?;

            let previous_preview = conversation.last_message_preview.clone();
            let previous_at = conversation.last_message_at;
            conversation.timeline.append_pending(Message::pending(
                temporary_id.clone(),
                conversation_id.clone(),
                &self.identity,
                content,
                Utc::now(),
            ));
            if let Some(appended) = conversation.timeline.last().cloned() {
                conversation.note_message(&appended);
            }

            let outbound = OutboundMessage {
                conversation_id: conversation_id.clone(),
                sender_id: self.identity.user_id.clone(),
                content: content.to_string(),
                message_type: MessageType::Text,
                metadata: MessageMetadata {
                    temporary_id: Some(temporary_id.clone()),
                },
            };
            if let Err(err) = self
                .connection
                .send(&ClientRequest::SendMessage(outbound.clone()))
            {
                conversation.timeline.drop_pending(&temporary_id);
                conversation.last_message_preview = previous_preview;
                conversation.last_message_at = previous_at;
                warn!(conversation_id = %conversation_id, error = %err, "send failed before dispatch");
                return Err(err);
            }
            state.directory.move_to_front(&conversation_id);
            state.pending_sends.push_back(PendingSend {
                temporary_id: temporary_id.clone(),
                conversation_id: conversation_id.clone(),
                previous_preview,
                previous_at,
            });
            (conversation_id, outbound)
        };

        debug!(conversation_id = %conversation_id, temporary_id = %temporary_id, "message dispatched");
        self.emit(SyncEvent::TimelineChanged(conversation_id.clone()));
        self.emit(SyncEvent::ConversationUpdated(conversation_id));

        if self.settings.persist_sent_messages {
            let history = Arc::clone(&self.history);
            tokio::spawn(async move {
                if let Err(err) = history.persist_message(&outbound).await {
                    warn!(
                        conversation_id = %outbound.conversation_id,
                        error = %format!("{err:#}"),
                        "failed to persist sent message"
                    );
                }
            });
        }
        Ok(temporary_id)
    }

    pub(crate) async fn message_delivered(
        &self,
        temporary_id: &TemporaryId,
        message_id: MessageId,
        timestamp: Option<DateTime<Utc>>,
    ) -> bool {
        let conversation_id = {
            let mut state = self.inner.lock().await;
            let conversation_id = match take_pending_send(&mut state.pending_sends, temporary_id) {
                Some(pending) => Some(pending.conversation_id),
                None => state
                    .directory
                    .iter()
                    .find(|conversation| conversation.timeline.has_pending(temporary_id))
                    .map(|conversation| conversation.id.clone()),
            };
            let Some(conversation_id) = conversation_id else {
                debug!(temporary_id = %temporary_id, "delivery ack for unknown send");
                return false;
            };
            let Some(conversation) = state.directory.get_mut(&conversation_id) else {
                return false;
            };
            if !conversation
                .timeline
                .promote_pending(temporary_id, message_id.clone(), timestamp)
            {
                debug!(temporary_id = %temporary_id, "delivery ack already applied");
                return false;
            }
            conversation.refresh_preview_from_timeline();
            conversation_id
        };

        debug!(
            conversation_id = %conversation_id,
            temporary_id = %temporary_id,
            message_id = %message_id,
            "message delivered"
        );
        self.emit(SyncEvent::TimelineChanged(conversation_id));
        true
    }

    /// Rolls back a rejected send. Without a temporary id the oldest
    /// outstanding send is the one rejected.
    pub(crate) async fn message_rejected(
        &self,
        temporary_id: Option<&TemporaryId>,
        reason: String,
        code: Option<String>,
    ) {
        let rejected = {
            let mut state = self.inner.lock().await;
            let pending = match temporary_id {
                Some(temporary_id) => take_pending_send(&mut state.pending_sends, temporary_id),
                None => state.pending_sends.pop_front(),
            };
            let Some(pending) = pending else {
                warn!(error = %reason, "message rejected with no outstanding send");
                return;
            };
            if let Some(conversation) = state.directory.get_mut(&pending.conversation_id) {
                if let Some(dropped) = conversation.timeline.drop_pending(&pending.temporary_id) {
                    let was_latest = conversation.last_message_at == Some(dropped.created_at)
                        && conversation.last_message_preview.as_deref()
                            == Some(dropped.content.as_str());
                    if was_latest {
                        let timeline_is_newer = conversation.timeline.last().is_some_and(|last| {
                            pending.previous_at.map_or(true, |at| last.created_at >= at)
                        });
                        if timeline_is_newer {
                            conversation.refresh_preview_from_timeline();
                        } else {
                            conversation.last_message_preview = pending.previous_preview.clone();
                            conversation.last_message_at = pending.previous_at;
                        }
                    }
                }
            }
            state.directory.sort_by_recency();
            pending
        };

        warn!(
            conversation_id = %rejected.conversation_id,
            temporary_id = %rejected.temporary_id,
            error = %reason,
            "message rejected by server"
        );
        self.emit(SyncEvent::TimelineChanged(rejected.conversation_id.clone()));
        self.emit(SyncEvent::ConversationUpdated(rejected.conversation_id));
        self.emit(SyncEvent::Notice(SyncError::SendRejected {
            temporary_id: rejected.temporary_id,
            reason,
            code,
        }));
    }

    /// Sends still waiting for the server, oldest first.
    pub async fn outstanding_sends(&self) -> Vec<TemporaryId> {
        self.inner
            .lock()
            .await
            .pending_sends
            .iter()
            .map(|pending| pending.temporary_id.clone())
            .collect()
    }
}

fn take_pending_send(
    pending_sends: &mut std::collections::VecDeque<PendingSend>,
    temporary_id: &TemporaryId,
) -> Option<PendingSend> {
    let pos = pending_sends
        .iter()
        .position(|pending| &pending.temporary_id == temporary_id)?;
    pending_sends.remove(pos)
}
