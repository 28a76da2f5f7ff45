use std::collections::HashSet;

use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageId, TemporaryId, UserId},
    protocol::MessagePayload,
};

use crate::types::{DeliveryState, Message, MessageKey, ReadState};

/// Arrival stamp given to history entries; live entries count up from 1.
const HISTORY_ARRIVAL: u64 = 0;

#[derive(Debug, Clone)]
struct TimelineEntry {
    message: Message,
    arrival: u64,
}

/// Ordered, deduplicated messages of one conversation.
///
/// Entries are kept non-decreasing by `created_at`; equal timestamps keep
/// arrival order. Stable ids appear at most once, and a pending entry is
/// keyed by its temporary id until promoted in place.
#[derive(Debug, Clone)]
pub struct TimelineStore {
    entries: Vec<TimelineEntry>,
    next_arrival: u64,
    pages_loaded: u32,
}

impl Default for TimelineStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TimelineStore {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_arrival: HISTORY_ARRIVAL + 1,
            pages_loaded: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True once page 1 of history has been applied.
    pub fn is_loaded(&self) -> bool {
        self.pages_loaded > 0
    }

    pub fn pages_loaded(&self) -> u32 {
        self.pages_loaded
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().map(|entry| &entry.message)
    }

    pub fn messages(&self) -> Vec<Message> {
        self.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<&Message> {
        self.entries.last().map(|entry| &entry.message)
    }

    pub fn contains_stable(&self, id: &MessageId) -> bool {
        self.position_of_stable(id).is_some()
    }

    pub fn has_pending(&self, temporary_id: &TemporaryId) -> bool {
        self.position_of_pending(temporary_id).is_some()
    }

    /// Stamp to take before a history request; anything appended live after it
    /// survives a page-1 replace.
    pub fn live_mark(&self) -> u64 {
        self.next_arrival
    }

    /// Page 1 replaces the held history, later pages merge in by `created_at`.
    ///
    /// Pending entries and live arrivals newer than `live_mark` are carried
    /// across a replace unless the page already contains them. Messages read
    /// locally stay read.
    pub fn apply_history_page(&mut self, page: u32, messages: Vec<MessagePayload>, live_mark: u64) {
        if page <= 1 {
            self.replace_with_history(messages, live_mark);
            self.pages_loaded = self.pages_loaded.max(1);
        } else {
            self.merge_history(messages);
            self.pages_loaded = self.pages_loaded.max(page);
        }
    }

    /// Unions fetched messages into the timeline without dropping anything held.
    pub fn merge_history(&mut self, messages: Vec<MessagePayload>) {
        for fetched in sorted_unique(messages) {
            let id = fetched.id.clone();
            if let Some(pos) = self.position_of_stable(&id) {
                if fetched.message.read_state == ReadState::Read {
                    self.entries[pos].message.read_state = ReadState::Read;
                }
                continue;
            }
            if let Some(pos) = fetched
                .temporary_id
                .as_ref()
                .and_then(|hint| self.position_of_pending(hint))
            {
                let existing = &mut self.entries[pos].message;
                existing.key = MessageKey::Stable(id);
                existing.delivery_state = DeliveryState::Delivered;
                continue;
            }
            self.insert_ordered(TimelineEntry {
                message: fetched.message,
                arrival: HISTORY_ARRIVAL,
            });
        }
    }

    /// Appends a server push. Returns `false` when the message is already held.
    pub fn append_live(&mut self, message: Message) -> bool {
        match &message.key {
            MessageKey::Stable(id) => {
                if self.contains_stable(id) {
                    return false;
                }
            }
            MessageKey::Temporary(temporary_id) => {
                if self.has_pending(temporary_id) {
                    return false;
                }
            }
        }
        let arrival = self.bump_arrival();
        self.insert_ordered(TimelineEntry { message, arrival });
        true
    }

    /// Push echo of our own send: ignored while the pending entry is held.
    pub fn is_echo_of_pending(&self, temporary_id: Option<&TemporaryId>) -> bool {
        temporary_id.is_some_and(|id| self.has_pending(id))
    }

    /// Appends an optimistic entry; it always lands last.
    pub fn append_pending(&mut self, mut message: Message) {
        if let Some(last) = self.last() {
            if message.created_at < last.created_at {
                message.created_at = last.created_at;
            }
        }
        message.delivery_state = DeliveryState::Pending;
        let arrival = self.bump_arrival();
        self.entries.push(TimelineEntry { message, arrival });
    }

    /// Swaps the temporary key for the server id in place. No-op when nothing matches.
    pub fn promote_pending(
        &mut self,
        temporary_id: &TemporaryId,
        stable_id: MessageId,
        server_timestamp: Option<DateTime<Utc>>,
    ) -> bool {
        let Some(pos) = self.position_of_pending(temporary_id) else {
            return false;
        };
        if self.contains_stable(&stable_id) {
            // The push echo won the race; keep the stable copy only.
            self.entries.remove(pos);
            return true;
        }
        let lower = pos
            .checked_sub(1)
            .map(|prev| self.entries[prev].message.created_at);
        let upper = self
            .entries
            .get(pos + 1)
            .map(|next| next.message.created_at);
        let entry = &mut self.entries[pos].message;
        entry.key = MessageKey::Stable(stable_id);
        entry.delivery_state = DeliveryState::Delivered;
        if let Some(ts) = server_timestamp {
            entry.created_at = clamp_timestamp(ts, lower, upper);
        }
        true
    }

    /// Removes a rejected optimistic entry, returning it marked failed.
    pub fn drop_pending(&mut self, temporary_id: &TemporaryId) -> Option<Message> {
        let pos = self.position_of_pending(temporary_id)?;
        let mut message = self.entries.remove(pos).message;
        message.delivery_state = DeliveryState::Failed;
        Some(message)
    }

    /// Marks the listed messages read. Returns how many changed.
    pub fn apply_read_batch(&mut self, ids: &[MessageId]) -> usize {
        let wanted: HashSet<&MessageId> = ids.iter().collect();
        let mut changed = 0;
        for entry in &mut self.entries {
            let Some(id) = entry.message.stable_id() else {
                continue;
            };
            if wanted.contains(id) && entry.message.read_state == ReadState::Unread {
                entry.message.read_state = ReadState::Read;
                changed += 1;
            }
        }
        changed
    }

    pub fn unread_from_others(&self, me: &UserId) -> Vec<MessageId> {
        self.iter()
            .filter(|message| message.is_unread_for(me))
            .filter_map(|message| message.stable_id().cloned())
            .collect()
    }

    pub fn unread_count(&self, me: &UserId) -> usize {
        self.iter().filter(|message| message.is_unread_for(me)).count()
    }

    /// Unread count restricted to live arrivals stamped at or after `mark`.
    pub fn unread_count_since(&self, me: &UserId, mark: u64) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.arrival >= mark && entry.message.is_unread_for(me))
            .count()
    }

    pub fn pending_ids(&self) -> Vec<TemporaryId> {
        self.iter()
            .filter(|message| message.is_pending())
            .filter_map(|message| message.temporary_id().cloned())
            .collect()
    }

    fn replace_with_history(&mut self, messages: Vec<MessagePayload>, live_mark: u64) {
        let incoming = sorted_unique(messages);
        let incoming_ids: HashSet<MessageId> =
            incoming.iter().map(|fetched| fetched.id.clone()).collect();
        let reconciled: HashSet<TemporaryId> = incoming
            .iter()
            .filter_map(|fetched| fetched.temporary_id.clone())
            .collect();
        let locally_read: HashSet<MessageId> = self
            .iter()
            .filter(|message| message.read_state == ReadState::Read)
            .filter_map(|message| message.stable_id().cloned())
            .collect();

        let carried: Vec<TimelineEntry> = std::mem::take(&mut self.entries)
            .into_iter()
            .filter(|entry| match &entry.message.key {
                MessageKey::Temporary(id) => !reconciled.contains(id),
                MessageKey::Stable(id) => {
                    entry.arrival >= live_mark && !incoming_ids.contains(id)
                }
            })
            .collect();

        self.entries = incoming
            .into_iter()
            .map(|fetched| {
                let mut message = fetched.message;
                if locally_read.contains(&fetched.id) {
                    message.read_state = ReadState::Read;
                }
                TimelineEntry {
                    message,
                    arrival: HISTORY_ARRIVAL,
                }
            })
            .collect();
        for entry in carried {
            self.insert_ordered(entry);
        }
    }

    fn insert_ordered(&mut self, entry: TimelineEntry) {
        let created_at = entry.message.created_at;
        let pos = self
            .entries
            .partition_point(|existing| existing.message.created_at <= created_at);
        self.entries.insert(pos, entry);
    }

    fn bump_arrival(&mut self) -> u64 {
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        arrival
    }

    fn position_of_stable(&self, id: &MessageId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.message.stable_id() == Some(id))
    }

    fn position_of_pending(&self, temporary_id: &TemporaryId) -> Option<usize> {
        self.entries.iter().position(|entry| {
            entry.message.is_pending() && entry.message.temporary_id() == Some(temporary_id)
        })
    }
}

struct FetchedMessage {
    id: MessageId,
    temporary_id: Option<TemporaryId>,
    message: Message,
}

/// History pages may arrive in either direction; sort them and keep the first copy of each id.
fn sorted_unique(messages: Vec<MessagePayload>) -> Vec<FetchedMessage> {
    let mut seen = HashSet::new();
    let mut fetched: Vec<FetchedMessage> = messages
        .into_iter()
        .filter(|payload| seen.insert(payload.id.clone()))
        .map(|payload| FetchedMessage {
            id: payload.id.clone(),
            temporary_id: payload.metadata.temporary_id.clone(),
            message: Message::from(payload),
        })
        .collect();
    fetched.sort_by_key(|item| item.message.created_at);
    fetched
}

fn clamp_timestamp(
    ts: DateTime<Utc>,
    lower: Option<DateTime<Utc>>,
    upper: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    let ts = lower.map_or(ts, |lower| ts.max(lower));
    upper.map_or(ts, |upper| ts.min(upper))
}

#[cfg(test)]
#[path = "tests/timeline_tests.rs"]
mod tests;
