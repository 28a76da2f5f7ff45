use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::MessagePayload,
};
use tracing::{debug, info, warn};

use crate::{
    error::SyncError,
    timeline::TimelineStore,
    types::{Conversation, Message, Participant},
    SyncClient, SyncEvent,
};

/// Conversations held by the client, most recent first.
#[derive(Debug, Default)]
pub(crate) struct ConversationDirectory {
    conversations: Vec<Conversation>,
}

impl ConversationDirectory {
    pub(crate) fn len(&self) -> usize {
        self.conversations.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Conversation> {
        self.conversations.iter()
    }

    pub(crate) fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|conversation| &conversation.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: &ConversationId) -> Option<&mut Conversation> {
        self.conversations
            .iter_mut()
            .find(|conversation| &conversation.id == id)
    }

    pub(crate) fn contains(&self, id: &ConversationId) -> bool {
        self.get(id).is_some()
    }

    pub(crate) fn insert_front(&mut self, conversation: Conversation) {
        self.conversations
            .retain(|existing| existing.id != conversation.id);
        self.conversations.insert(0, conversation);
    }

    pub(crate) fn move_to_front(&mut self, id: &ConversationId) {
        if let Some(pos) = self.conversations.iter().position(|c| &c.id == id) {
            let conversation = self.conversations.remove(pos);
            self.conversations.insert(0, conversation);
        }
    }

    /// Stable sort by last activity; conversations without messages go last.
    pub(crate) fn sort_by_recency(&mut self) {
        self.conversations
            .sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
    }

    pub(crate) fn find_by_message(&self, ids: &[MessageId]) -> Option<ConversationId> {
        self.conversations
            .iter()
            .find(|conversation| ids.iter().any(|id| conversation.timeline.contains_stable(id)))
            .map(|conversation| conversation.id.clone())
    }

    pub(crate) fn take_timeline(&mut self, id: &ConversationId) -> Option<TimelineStore> {
        self.get_mut(id)
            .map(|conversation| std::mem::take(&mut conversation.timeline))
    }

    /// Removes and returns entries missing from `listed` that `keep` accepts.
    pub(crate) fn drain_unlisted(
        &mut self,
        listed: &HashSet<ConversationId>,
        keep: impl Fn(&Conversation) -> bool,
    ) -> Vec<Conversation> {
        std::mem::take(&mut self.conversations)
            .into_iter()
            .filter(|conversation| !listed.contains(&conversation.id) && keep(conversation))
            .collect()
    }

    pub(crate) fn replace_all(&mut self, conversations: Vec<Conversation>) {
        self.conversations = conversations;
    }
}

/// Read-only view of one directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationOverview {
    pub id: ConversationId,
    pub participant_other: Participant,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: usize,
    pub history_loaded: bool,
}

impl From<&Conversation> for ConversationOverview {
    fn from(conversation: &Conversation) -> Self {
        Self {
            id: conversation.id.clone(),
            participant_other: conversation.participant_other.clone(),
            last_message_preview: conversation.last_message_preview.clone(),
            last_message_at: conversation.last_message_at,
            unread_count: conversation.unread_count(),
            history_loaded: conversation.timeline.is_loaded(),
        }
    }
}

impl SyncClient {
    /// Fetches the conversation list and the latest message of each entry.
    ///
    /// A failed preview fetch is logged and leaves that entry's preview as
    /// the list reported it. Timelines already held survive the reload, and
    /// so does an unlisted conversation that saw live traffic meanwhile. If
    /// the selected conversation is gone, the selection is cleared and its
    /// room left.
    pub async fn load_all(&self) -> Result<usize, SyncError> {
        let me = &self.identity.user_id;
        let marks: HashMap<ConversationId, u64> = self
            .inner
            .lock()
            .await
            .directory
            .iter()
            .map(|conversation| (conversation.id.clone(), conversation.timeline.live_mark()))
            .collect();
        let summaries = self
            .history
            .list_conversations(me)
            .await
            .map_err(SyncError::persistence)?;

        let previews = join_all(summaries.iter().map(|summary| async move {
            let latest = self.history.fetch_messages(&summary.id, 1, 1).await;
            (summary.id.clone(), latest)
        }))
        .await;

        let mut conversations: Vec<Conversation> = summaries
            .iter()
            .map(|summary| Conversation::from_summary(summary, &self.identity))
            .collect();
        for (conversation, (conversation_id, latest)) in conversations.iter_mut().zip(previews) {
            match latest {
                Ok(messages) => {
                    if let Some(latest) = messages.into_iter().max_by_key(|m| m.timestamp) {
                        conversation.last_message_preview = Some(latest.content);
                        conversation.last_message_at = Some(latest.timestamp);
                    }
                }
                Err(err) => warn!(
                    conversation_id = %conversation_id,
                    error = %format!("{err:#}"),
                    "failed to fetch conversation preview"
                ),
            }
        }

        let (count, cleared) = {
            let mut state = self.inner.lock().await;
            for conversation in &mut conversations {
                if let Some(timeline) = state.directory.take_timeline(&conversation.id) {
                    let badge = conversation.remote_unread;
                    conversation.timeline = timeline;
                    conversation.set_remote_unread(badge);
                    if conversation.timeline.last().is_some_and(|last| {
                        conversation
                            .last_message_at
                            .map_or(true, |at| last.created_at >= at)
                    }) {
                        conversation.refresh_preview_from_timeline();
                    }
                }
            }

            // Unlisted entries that saw live traffic during the reload stay.
            let listed: HashSet<ConversationId> =
                conversations.iter().map(|c| c.id.clone()).collect();
            let sending: HashSet<ConversationId> = state
                .pending_sends
                .iter()
                .map(|pending| pending.conversation_id.clone())
                .collect();
            let carried = state.directory.drain_unlisted(&listed, |conversation| {
                sending.contains(&conversation.id)
                    || marks
                        .get(&conversation.id)
                        .map_or(true, |mark| conversation.timeline.live_mark() > *mark)
            });
            for conversation in &carried {
                debug!(conversation_id = %conversation.id, "keeping conversation updated during reload");
            }
            conversations.extend(carried);

            state.directory.replace_all(conversations);
            state.directory.sort_by_recency();
            let cleared = match state.selected.clone() {
                Some(selected) if !state.directory.contains(&selected) => {
                    Some(state.change_selection(None).1)
                }
                _ => None,
            };
            (state.directory.len(), cleared)
        };

        if let Some(generation) = cleared {
            info!("selected conversation disappeared from the directory");
            self.rooms.focus(None, generation).await;
            self.emit(SyncEvent::SelectionChanged(None));
        }
        info!(count, "conversation directory loaded");
        self.emit(SyncEvent::DirectoryLoaded { count });
        Ok(count)
    }

    /// Makes `conversation_id` the open conversation.
    ///
    /// The selection pointer is updated before any await, so a later
    /// `select` always wins; the history fetch started here still lands in
    /// its own conversation but only marks it read if it is still open.
    pub async fn select(&self, conversation_id: &ConversationId) -> Result<(), SyncError> {
        let (changed, generation, live_mark, needs_history) = {
            let mut state = self.inner.lock().await;
            let Some(conversation) = state.directory.get(conversation_id) else {
                return Err(SyncError::conversation_not_found(conversation_id));
            };
            let needs_history = !conversation.timeline.is_loaded();
            let live_mark = conversation.timeline.live_mark();
            let (changed, generation) = state.change_selection(Some(conversation_id.clone()));
            (changed, generation, live_mark, needs_history)
        };
        self.rooms.focus(Some(conversation_id), generation).await;
        if changed {
            info!(conversation_id = %conversation_id, "conversation selected");
            self.emit(SyncEvent::SelectionChanged(Some(conversation_id.clone())));
        }

        if needs_history {
            self.fetch_history_page(conversation_id, 1, live_mark).await?;
        }

        if self.is_selected(conversation_id).await {
            self.mark_as_read(conversation_id).await?;
        } else {
            debug!(
                conversation_id = %conversation_id,
                "selection moved on before history arrived"
            );
        }
        Ok(())
    }

    pub async fn deselect(&self) {
        let (changed, generation) = self.inner.lock().await.change_selection(None);
        self.rooms.focus(None, generation).await;
        if changed {
            self.emit(SyncEvent::SelectionChanged(None));
        }
    }

    /// Opens (or finds) the one-to-one conversation with `participant_id`.
    pub async fn create_or_get(&self, participant_id: &UserId) -> Result<ConversationId, SyncError> {
        let summary = self
            .history
            .create_or_get_conversation(&self.identity.user_id, participant_id)
            .await
            .map_err(SyncError::persistence)?;
        let conversation_id = summary.id.clone();
        let inserted = {
            let mut state = self.inner.lock().await;
            if state.directory.contains(&conversation_id) {
                false
            } else {
                state
                    .directory
                    .insert_front(Conversation::from_summary(&summary, &self.identity));
                true
            }
        };
        if inserted {
            info!(conversation_id = %conversation_id, participant_id = %participant_id, "conversation opened");
            self.emit(SyncEvent::ConversationUpdated(conversation_id.clone()));
        }
        Ok(conversation_id)
    }

    /// Fetches the next page of older messages. Returns how many arrived;
    /// zero means the start of the conversation was reached.
    pub async fn load_older(&self, conversation_id: &ConversationId) -> Result<usize, SyncError> {
        let (page, live_mark) = {
            let state = self.inner.lock().await;
            let conversation = state
                .directory
                .get(conversation_id)
                .ok_or_else(|| SyncError::conversation_not_found(conversation_id))?;
            let timeline = &conversation.timeline;
            (timeline.pages_loaded() + 1, timeline.live_mark())
        };
        self.fetch_history_page(conversation_id, page, live_mark)
            .await
    }

    pub(crate) async fn fetch_history_page(
        &self,
        conversation_id: &ConversationId,
        page: u32,
        live_mark: u64,
    ) -> Result<usize, SyncError> {
        let messages = self
            .history
            .fetch_messages(conversation_id, page, self.settings.history_page_size)
            .await
            .map_err(SyncError::persistence)?;
        let fetched = messages.len();
        {
            let mut state = self.inner.lock().await;
            let Some(conversation) = state.directory.get_mut(conversation_id) else {
                debug!(conversation_id = %conversation_id, "conversation dropped before history arrived");
                return Ok(0);
            };
            conversation
                .timeline
                .apply_history_page(page, messages, live_mark);
            if page <= 1 {
                conversation.refresh_preview_from_timeline();
            }
            state.forget_settled_sends(conversation_id);
        }
        debug!(conversation_id = %conversation_id, page, fetched, "history page applied");
        self.emit(SyncEvent::TimelineChanged(conversation_id.clone()));
        self.emit(SyncEvent::ConversationUpdated(conversation_id.clone()));
        Ok(fetched)
    }

    /// Applies a `receiveMessage` push. Returns `false` for duplicates and
    /// echoes of our own pending sends.
    pub(crate) async fn receive_message(&self, payload: MessagePayload) -> bool {
        let conversation_id = payload.conversation_id.clone();
        let temporary_id = payload.metadata.temporary_id.clone();
        let message = Message::from(payload);
        let from_other = message.sender_id != self.identity.user_id;

        let auto_read = {
            let mut state = self.inner.lock().await;
            if !state.directory.contains(&conversation_id) {
                debug!(conversation_id = %conversation_id, "push for unseen conversation");
                state
                    .directory
                    .insert_front(Conversation::from_first_message(&message, &self.identity));
            }
            let Some(conversation) = state.directory.get_mut(&conversation_id) else {
                return false;
            };
            if conversation.timeline.is_echo_of_pending(temporary_id.as_ref()) {
                debug!(conversation_id = %conversation_id, "ignoring echo of pending send");
                return false;
            }
            let preview = message.clone();
            if !conversation.timeline.append_live(message) {
                debug!(conversation_id = %conversation_id, "ignoring duplicate push");
                return false;
            }
            conversation.note_message(&preview);
            state.directory.move_to_front(&conversation_id);
            from_other
                && self.settings.auto_mark_read
                && state.selected.as_ref() == Some(&conversation_id)
        };

        self.emit(SyncEvent::TimelineChanged(conversation_id.clone()));
        self.emit(SyncEvent::ConversationUpdated(conversation_id.clone()));
        if auto_read {
            if let Err(err) = self.mark_as_read(&conversation_id).await {
                warn!(conversation_id = %conversation_id, error = %err, "failed to mark pushed message read");
            }
        }
        true
    }

    /// Restores room membership and badges after the session resumes.
    pub(crate) async fn resync(&self, resumed: bool) {
        let rejoined = self.rooms.rejoin_all(resumed).await;
        if !resumed {
            return;
        }
        info!(rejoined, "resynchronizing after reconnect");

        match self.history.list_conversations(&self.identity.user_id).await {
            Ok(summaries) => {
                let mut state = self.inner.lock().await;
                for summary in &summaries {
                    match state.directory.get_mut(&summary.id) {
                        Some(conversation) => {
                            conversation.set_remote_unread(summary.unread_count as usize);
                            if let Some(at) = summary.last_message_at {
                                if conversation.last_message_at.map_or(true, |current| at > current) {
                                    conversation.last_message_preview = summary.last_message.clone();
                                    conversation.last_message_at = Some(at);
                                }
                            }
                        }
                        None => state
                            .directory
                            .insert_front(Conversation::from_summary(summary, &self.identity)),
                    }
                }
                state.directory.sort_by_recency();
                let count = state.directory.len();
                drop(state);
                self.emit(SyncEvent::DirectoryLoaded { count });
            }
            Err(err) => warn!(error = %format!("{err:#}"), "failed to refresh unread badges"),
        }

        let Some(selected) = self.selected().await else {
            return;
        };
        match self
            .history
            .fetch_messages(&selected, 1, self.settings.history_page_size)
            .await
        {
            Ok(messages) => {
                {
                    let mut state = self.inner.lock().await;
                    if let Some(conversation) = state.directory.get_mut(&selected) {
                        conversation.timeline.merge_history(messages);
                        conversation.refresh_preview_from_timeline();
                    }
                    state.forget_settled_sends(&selected);
                }
                self.emit(SyncEvent::TimelineChanged(selected.clone()));
            }
            Err(err) => warn!(
                conversation_id = %selected,
                error = %format!("{err:#}"),
                "failed to refresh selected conversation"
            ),
        }
        if self.is_selected(&selected).await {
            if let Err(err) = self.mark_as_read(&selected).await {
                warn!(conversation_id = %selected, error = %err, "failed to mark read after reconnect");
            }
        }
    }
}
