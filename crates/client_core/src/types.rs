use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, MessageType, Role, TemporaryId, UserId},
    protocol::{ConversationSummary, MessagePayload, ParticipantSummary},
};

use crate::timeline::TimelineStore;

/// Who this client acts as. Supplied by the authentication collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub role: Role,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Stable(MessageId),
    Temporary(TemporaryId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    Unread,
    Read,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub key: MessageKey,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub sender_role: Role,
    pub content: String,
    pub message_type: MessageType,
    pub created_at: DateTime<Utc>,
    pub delivery_state: DeliveryState,
    pub read_state: ReadState,
}

impl Message {
    pub fn pending(
        temporary_id: TemporaryId,
        conversation_id: ConversationId,
        sender: &Identity,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key: MessageKey::Temporary(temporary_id),
            conversation_id,
            sender_id: sender.user_id.clone(),
            sender_name: sender.name.clone(),
            sender_role: sender.role,
            content: content.into(),
            message_type: MessageType::Text,
            created_at,
            delivery_state: DeliveryState::Pending,
            read_state: ReadState::Unread,
        }
    }

    pub fn stable_id(&self) -> Option<&MessageId> {
        match &self.key {
            MessageKey::Stable(id) => Some(id),
            MessageKey::Temporary(_) => None,
        }
    }

    pub fn temporary_id(&self) -> Option<&TemporaryId> {
        match &self.key {
            MessageKey::Temporary(id) => Some(id),
            MessageKey::Stable(_) => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.delivery_state == DeliveryState::Pending
    }

    pub fn is_unread_for(&self, me: &UserId) -> bool {
        self.read_state == ReadState::Unread && &self.sender_id != me
    }
}

impl From<MessagePayload> for Message {
    fn from(payload: MessagePayload) -> Self {
        Self {
            key: MessageKey::Stable(payload.id),
            conversation_id: payload.conversation_id,
            sender_id: payload.sender_id,
            sender_name: payload.sender_name,
            sender_role: payload.sender_role,
            content: payload.content,
            message_type: payload.message_type,
            created_at: payload.timestamp,
            delivery_state: DeliveryState::Delivered,
            read_state: if payload.is_read {
                ReadState::Read
            } else {
                ReadState::Unread
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: UserId,
    pub name: String,
    pub role: Role,
}

impl From<&ParticipantSummary> for Participant {
    fn from(summary: &ParticipantSummary) -> Self {
        Self {
            id: summary.id.clone(),
            name: summary.name.clone(),
            role: summary.role,
        }
    }
}

impl From<&Identity> for Participant {
    fn from(identity: &Identity) -> Self {
        Self {
            id: identity.user_id.clone(),
            name: identity.name.clone(),
            role: identity.role,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: ConversationId,
    pub participant_self: Participant,
    pub participant_other: Participant,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    /// Server-reported badge; only meaningful until page 1 of history is loaded.
    pub remote_unread: usize,
    /// Live arrivals at or after this stamp are not covered by `remote_unread`.
    badge_mark: u64,
    pub timeline: TimelineStore,
}

impl Conversation {
    pub fn from_summary(summary: &ConversationSummary, me: &Identity) -> Self {
        let participant_self = summary
            .participants
            .iter()
            .find(|p| p.id == me.user_id)
            .map(Participant::from)
            .unwrap_or_else(|| Participant::from(me));
        let participant_other = summary
            .participants
            .iter()
            .find(|p| p.id != me.user_id)
            .map(Participant::from)
            .unwrap_or_else(|| Participant {
                id: UserId::new(""),
                name: String::new(),
                role: Role::Unknown,
            });
        Self {
            id: summary.id.clone(),
            participant_self,
            participant_other,
            last_message_preview: summary.last_message.clone(),
            last_message_at: summary.last_message_at,
            remote_unread: summary.unread_count as usize,
            badge_mark: 0,
            timeline: TimelineStore::new(),
        }
    }

    /// Placeholder for a conversation first seen through a live push.
    pub fn from_first_message(message: &Message, me: &Identity) -> Self {
        let participant_other = if message.sender_id != me.user_id {
            Participant {
                id: message.sender_id.clone(),
                name: message.sender_name.clone(),
                role: message.sender_role,
            }
        } else {
            Participant {
                id: UserId::new(""),
                name: String::new(),
                role: Role::Unknown,
            }
        };
        Self {
            id: message.conversation_id.clone(),
            participant_self: Participant::from(me),
            participant_other,
            last_message_preview: None,
            last_message_at: None,
            remote_unread: 0,
            badge_mark: 0,
            timeline: TimelineStore::new(),
        }
    }

    pub fn unread_count(&self) -> usize {
        let me = &self.participant_self.id;
        if self.timeline.is_loaded() {
            self.timeline.unread_count(me)
        } else {
            self.remote_unread + self.timeline.unread_count_since(me, self.badge_mark)
        }
    }

    /// Takes a fresh server badge; it already covers everything held so far.
    pub fn set_remote_unread(&mut self, count: usize) {
        self.remote_unread = count;
        self.badge_mark = self.timeline.live_mark();
    }

    /// Advances the preview when `message` is at least as recent as the current one.
    pub fn note_message(&mut self, message: &Message) {
        let newer = self
            .last_message_at
            .map_or(true, |current| message.created_at >= current);
        if newer {
            self.last_message_preview = Some(message.content.clone());
            self.last_message_at = Some(message.created_at);
        }
    }

    pub fn refresh_preview_from_timeline(&mut self) {
        if let Some(last) = self.timeline.last() {
            self.last_message_preview = Some(last.content.clone());
            self.last_message_at = Some(last.created_at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn me() -> Identity {
        Identity {
            user_id: UserId::from("me"),
            role: Role::Doctor,
            name: "Dr. Me".into(),
        }
    }

    #[test]
    fn summary_splits_participants_around_self() {
        let summary = ConversationSummary {
            id: ConversationId::from("c1"),
            participants: vec![
                ParticipantSummary {
                    id: UserId::from("p1"),
                    name: "Pat".into(),
                    role: Role::Patient,
                },
                ParticipantSummary {
                    id: UserId::from("me"),
                    name: "Dr. Me".into(),
                    role: Role::Doctor,
                },
            ],
            last_message: Some("hi".into()),
            last_message_at: None,
            unread_count: 3,
        };
        let conversation = Conversation::from_summary(&summary, &me());
        assert_eq!(conversation.participant_self.id, UserId::from("me"));
        assert_eq!(conversation.participant_other.id, UserId::from("p1"));
        assert_eq!(conversation.unread_count(), 3);
    }

    fn pushed(id: &str, minute: u32) -> Message {
        Message::from(MessagePayload {
            id: MessageId::from(id),
            conversation_id: ConversationId::from("c1"),
            sender_id: UserId::from("p1"),
            sender_name: "Pat".into(),
            sender_role: Role::Patient,
            content: "hi".into(),
            message_type: MessageType::Text,
            metadata: Default::default(),
            timestamp: chrono::TimeZone::with_ymd_and_hms(&Utc, 2024, 1, 1, 9, minute, 0)
                .single()
                .expect("timestamp"),
            is_read: false,
        })
    }

    #[test]
    fn refreshed_badge_is_not_double_counted_with_live_pushes() {
        let summary = ConversationSummary {
            id: ConversationId::from("c1"),
            participants: Vec::new(),
            last_message: None,
            last_message_at: None,
            unread_count: 1,
        };
        let mut conversation = Conversation::from_summary(&summary, &me());
        conversation.timeline.append_live(pushed("m1", 1));
        assert_eq!(conversation.unread_count(), 2);

        conversation.set_remote_unread(2);
        assert_eq!(conversation.unread_count(), 2);

        conversation.timeline.append_live(pushed("m2", 2));
        assert_eq!(conversation.unread_count(), 3);
    }
}
