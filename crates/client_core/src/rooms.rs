use std::{collections::HashSet, sync::Arc};

use shared::{domain::ConversationId, protocol::ClientRequest};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::connection::ConnectionManager;

/// Tracks which conversation rooms this client wants to be part of.
///
/// `join`/`leave` only reach the server while the session is authenticated.
/// A room joined while offline stays tracked and is announced by
/// [`RoomMembership::rejoin_all`] once the session is ready.
pub struct RoomMembership {
    connection: Arc<ConnectionManager>,
    rooms: Mutex<RoomSet>,
}

#[derive(Default)]
struct RoomSet {
    tracked: HashSet<ConversationId>,
    /// Rooms the server was told about during the current session.
    announced: HashSet<ConversationId>,
    /// Selection generation of the last applied `focus`.
    focused: u64,
}

impl RoomMembership {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            rooms: Mutex::new(RoomSet::default()),
        }
    }

    pub async fn join(&self, conversation_id: &ConversationId) {
        let mut rooms = self.rooms.lock().await;
        rooms.tracked.insert(conversation_id.clone());
        self.announce_join(&mut rooms, conversation_id);
    }

    pub async fn leave(&self, conversation_id: &ConversationId) {
        let mut rooms = self.rooms.lock().await;
        if rooms.tracked.remove(conversation_id) {
            self.announce_leave(&mut rooms, conversation_id);
        }
    }

    /// Leaves every room except `target` and joins `target`, as one step.
    ///
    /// `generation` orders overlapping calls: a focus older than the last
    /// one applied is dropped. Returns whether it was applied.
    pub async fn focus(&self, target: Option<&ConversationId>, generation: u64) -> bool {
        let mut rooms = self.rooms.lock().await;
        if generation < rooms.focused {
            debug!(generation, latest = rooms.focused, "dropping superseded room focus");
            return false;
        }
        rooms.focused = generation;
        let stale: Vec<ConversationId> = rooms
            .tracked
            .iter()
            .filter(|room| Some(*room) != target)
            .cloned()
            .collect();
        for room in stale {
            rooms.tracked.remove(&room);
            self.announce_leave(&mut rooms, &room);
        }
        if let Some(target) = target {
            rooms.tracked.insert(target.clone());
            self.announce_join(&mut rooms, target);
        }
        true
    }

    /// Announces every tracked room the current session has not heard about.
    /// A resumed session starts with a server that remembers nothing.
    pub async fn rejoin_all(&self, resumed: bool) -> usize {
        let mut rooms = self.rooms.lock().await;
        if resumed {
            rooms.announced.clear();
        }
        let missing: Vec<ConversationId> = rooms
            .tracked
            .difference(&rooms.announced)
            .cloned()
            .collect();
        missing
            .iter()
            .filter(|room| self.announce_join(&mut rooms, room))
            .count()
    }

    pub async fn joined(&self) -> Vec<ConversationId> {
        let mut joined: Vec<ConversationId> =
            self.rooms.lock().await.tracked.iter().cloned().collect();
        joined.sort();
        joined
    }

    pub async fn is_joined(&self, conversation_id: &ConversationId) -> bool {
        self.rooms.lock().await.tracked.contains(conversation_id)
    }

    fn announce_join(&self, rooms: &mut RoomSet, conversation_id: &ConversationId) -> bool {
        if rooms.announced.contains(conversation_id) {
            return false;
        }
        if !self.connection.is_ready() {
            debug!(conversation_id = %conversation_id, "not connected; join deferred");
            return false;
        }
        let request = ClientRequest::JoinConversation {
            conversation_id: conversation_id.clone(),
        };
        match self.connection.send(&request) {
            Ok(()) => {
                rooms.announced.insert(conversation_id.clone());
                true
            }
            Err(err) => {
                warn!(conversation_id = %conversation_id, error = %err, "failed to join room");
                false
            }
        }
    }

    fn announce_leave(&self, rooms: &mut RoomSet, conversation_id: &ConversationId) {
        if !rooms.announced.remove(conversation_id) || !self.connection.is_ready() {
            return;
        }
        let request = ClientRequest::LeaveConversation {
            conversation_id: conversation_id.clone(),
        };
        if let Err(err) = self.connection.send(&request) {
            warn!(conversation_id = %conversation_id, error = %err, "failed to leave room");
        }
    }
}
