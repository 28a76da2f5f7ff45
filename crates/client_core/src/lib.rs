use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
};

use shared::{
    domain::{ConversationId, UserId},
    protocol::{PresencePayload, ServerEvent},
};
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        Mutex,
    },
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod config;
pub mod connection;
mod directory;
pub mod error;
pub mod history;
mod outbound;
mod receipts;
pub mod rooms;
pub mod timeline;
pub mod transport;
pub mod types;

pub use config::{load_settings, SyncSettings};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState, EventKind};
pub use directory::ConversationOverview;
pub use error::SyncError;
pub use history::{HistoryApi, HttpHistoryApi};
pub use transport::{Connector, WebSocketConnector};
pub use types::{DeliveryState, Identity, Message, MessageKey, ReadState};

use connection::ConnectionSettings;
use directory::ConversationDirectory;
use outbound::PendingSend;
use rooms::RoomMembership;

/// What the engine tells its UI after a state change.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    DirectoryLoaded { count: usize },
    ConversationUpdated(ConversationId),
    TimelineChanged(ConversationId),
    SelectionChanged(Option<ConversationId>),
    Presence {
        user_id: UserId,
        user_name: String,
        online: bool,
        conversation_id: Option<ConversationId>,
    },
    ConnectionStateChanged(ConnectionState),
    /// Transient, non-fatal problem worth showing once.
    Notice(SyncError),
}

pub struct SyncClient {
    identity: Identity,
    settings: SyncSettings,
    connection: Arc<ConnectionManager>,
    rooms: RoomMembership,
    history: Arc<dyn HistoryApi>,
    inner: Mutex<SyncState>,
    events: broadcast::Sender<SyncEvent>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct SyncState {
    directory: ConversationDirectory,
    selected: Option<ConversationId>,
    /// Bumped on every selection change; orders room focus calls.
    selection_generation: u64,
    pending_sends: VecDeque<PendingSend>,
}

impl SyncState {
    /// Points the selection at `target`. Returns whether it changed and the
    /// generation to hand to the room focus.
    fn change_selection(&mut self, target: Option<ConversationId>) -> (bool, u64) {
        let changed = self.selected != target;
        self.selected = target;
        self.selection_generation += 1;
        (changed, self.selection_generation)
    }

    /// Drops send records whose pending entry was settled by a history page.
    fn forget_settled_sends(&mut self, conversation_id: &ConversationId) {
        let directory = &self.directory;
        self.pending_sends.retain(|pending| {
            &pending.conversation_id != conversation_id
                || directory
                    .get(conversation_id)
                    .is_some_and(|c| c.timeline.has_pending(&pending.temporary_id))
        });
    }
}

impl SyncClient {
    pub fn new(
        identity: Identity,
        settings: SyncSettings,
        connector: Arc<dyn Connector>,
        history: Arc<dyn HistoryApi>,
    ) -> Result<Arc<Self>, SyncError> {
        let connection =
            ConnectionManager::new(connector, ConnectionSettings::from_sync_settings(&settings)?);
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        Ok(Arc::new(Self {
            identity,
            rooms: RoomMembership::new(Arc::clone(&connection)),
            connection,
            history,
            settings,
            inner: Mutex::new(SyncState::default()),
            events,
            dispatcher: Mutex::new(None),
        }))
    }

    /// WebSocket transport plus the HTTP history API at `settings.api_base_url()`.
    pub fn with_defaults(identity: Identity, settings: SyncSettings) -> Result<Arc<Self>, SyncError> {
        let history = Arc::new(HttpHistoryApi::new(settings.api_base_url()));
        Self::new(identity, settings, Arc::new(WebSocketConnector), history)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn rooms(&self) -> &RoomMembership {
        &self.rooms
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Current connectivity problem for a persistent banner, if any.
    pub fn connection_error(&self) -> Option<SyncError> {
        self.connection.last_error()
    }

    /// Starts event dispatch and connects. Connection events are subscribed
    /// to before the transport opens, so nothing from the handshake is missed.
    pub async fn start(self: &Arc<Self>) -> Result<(), SyncError> {
        self.ensure_dispatcher().await;
        info!(user_id = %self.identity.user_id, "starting sync engine");
        self.connection.connect(self.identity.clone()).await
    }

    pub async fn stop(&self) {
        self.connection.disconnect().await;
        if let Some(task) = self.dispatcher.lock().await.take() {
            task.abort();
        }
        info!("sync engine stopped");
    }

    pub async fn selected(&self) -> Option<ConversationId> {
        self.inner.lock().await.selected.clone()
    }

    pub async fn is_selected(&self, conversation_id: &ConversationId) -> bool {
        self.inner.lock().await.selected.as_ref() == Some(conversation_id)
    }

    pub async fn conversations(&self) -> Vec<ConversationOverview> {
        self.inner
            .lock()
            .await
            .directory
            .iter()
            .map(ConversationOverview::from)
            .collect()
    }

    pub async fn conversation(&self, conversation_id: &ConversationId) -> Option<ConversationOverview> {
        self.inner
            .lock()
            .await
            .directory
            .get(conversation_id)
            .map(ConversationOverview::from)
    }

    pub async fn timeline(&self, conversation_id: &ConversationId) -> Option<Vec<Message>> {
        self.inner
            .lock()
            .await
            .directory
            .get(conversation_id)
            .map(|conversation| conversation.timeline.messages())
    }

    /// Applies one server event to the store. The dispatcher calls this for
    /// every inbound frame; it is public for embedders that own the transport.
    pub async fn apply_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::Authenticated { user_id, .. } => {
                debug!(user_id = %user_id, "server confirmed identity");
            }
            ServerEvent::AuthenticationFailed { error } => {
                warn!(error = %error, "authentication failed");
            }
            ServerEvent::ReceiveMessage(payload) => {
                self.receive_message(payload).await;
            }
            ServerEvent::MessageDelivered {
                temporary_id,
                message_id,
                timestamp,
            } => {
                self.message_delivered(&temporary_id, message_id, timestamp)
                    .await;
            }
            ServerEvent::MessageError {
                error,
                code,
                temporary_id,
            } => {
                self.message_rejected(temporary_id.as_ref(), error, code)
                    .await;
            }
            ServerEvent::MessagesRead {
                read_by,
                message_ids,
                conversation_id,
                ..
            } => {
                self.apply_remote_read(conversation_id.as_ref(), &read_by, &message_ids)
                    .await;
            }
            ServerEvent::UserJoined(presence) => self.emit_presence(presence, true),
            ServerEvent::UserLeft(presence) => self.emit_presence(presence, false),
            ServerEvent::Error(err) => {
                warn!(
                    code = ?err.code,
                    transient = err.is_transient(),
                    error = %err.message,
                    "server reported an error"
                );
                self.emit(SyncEvent::Notice(SyncError::from_api(err)));
            }
        }
    }

    async fn handle_connection_event(self: &Arc<Self>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                self.emit(SyncEvent::ConnectionStateChanged(ConnectionState::Connected));
            }
            ConnectionEvent::Ready { resumed } => {
                self.emit(SyncEvent::ConnectionStateChanged(
                    ConnectionState::Authenticated,
                ));
                let client = Arc::clone(self);
                tokio::spawn(async move {
                    client.resync(resumed).await;
                });
            }
            ConnectionEvent::Disconnected { by_server } => {
                info!(by_server, "sync session disconnected");
                self.emit(SyncEvent::ConnectionStateChanged(
                    ConnectionState::Disconnected,
                ));
            }
            ConnectionEvent::ConnectError(err) => {
                debug!(error = %err, "connection attempt failed");
                self.emit(SyncEvent::ConnectionStateChanged(self.connection.state()));
            }
            ConnectionEvent::Server(event) => self.apply_server_event(event).await,
        }
    }

    async fn ensure_dispatcher(self: &Arc<Self>) {
        let mut dispatcher = self.dispatcher.lock().await;
        if dispatcher.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let mut events = self.connection.events();
        let client: Weak<Self> = Arc::downgrade(self);
        *dispatcher = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(client) = client.upgrade() else {
                            break;
                        };
                        client.handle_connection_event(event).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "sync dispatcher fell behind connection events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
    }

    fn emit_presence(&self, presence: PresencePayload, online: bool) {
        self.emit(SyncEvent::Presence {
            user_id: presence.user_id,
            user_name: presence.user_name,
            online,
            conversation_id: presence.conversation_id,
        });
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
