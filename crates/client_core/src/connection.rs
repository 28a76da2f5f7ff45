use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::Duration,
};

use shared::protocol::{ClientRequest, ServerEvent};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::SyncSettings,
    error::SyncError,
    transport::{Connector, TransportFrame},
    types::Identity,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Transport is up; the handshake has not finished yet.
    Connected,
    /// Handshake finished. `resumed` is set for every session after the first.
    Ready { resumed: bool },
    Disconnected { by_server: bool },
    ConnectError(SyncError),
    Server(ServerEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Ready,
    Disconnect,
    ConnectError,
    Authenticated,
    AuthenticationFailed,
    ReceiveMessage,
    MessageDelivered,
    MessageError,
    MessagesRead,
    UserJoined,
    UserLeft,
    Error,
}

impl ConnectionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected => EventKind::Connect,
            Self::Ready { .. } => EventKind::Ready,
            Self::Disconnected { .. } => EventKind::Disconnect,
            Self::ConnectError(_) => EventKind::ConnectError,
            Self::Server(event) => match event {
                ServerEvent::Authenticated { .. } => EventKind::Authenticated,
                ServerEvent::AuthenticationFailed { .. } => EventKind::AuthenticationFailed,
                ServerEvent::ReceiveMessage(_) => EventKind::ReceiveMessage,
                ServerEvent::MessageDelivered { .. } => EventKind::MessageDelivered,
                ServerEvent::MessageError { .. } => EventKind::MessageError,
                ServerEvent::MessagesRead { .. } => EventKind::MessagesRead,
                ServerEvent::UserJoined(_) => EventKind::UserJoined,
                ServerEvent::UserLeft(_) => EventKind::UserLeft,
                ServerEvent::Error(_) => EventKind::Error,
            },
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub url: String,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    pub event_buffer: usize,
}

impl ConnectionSettings {
    pub fn from_sync_settings(settings: &SyncSettings) -> Result<Self, SyncError> {
        Ok(Self {
            url: settings.websocket_url()?,
            reconnect_attempts: settings.reconnect_attempts,
            reconnect_delay: settings.reconnect_delay(),
            connect_timeout: settings.connect_timeout(),
            event_buffer: settings.event_buffer.max(1),
        })
    }
}

enum SessionEnd {
    Requested,
    Rejected(SyncError),
    ServerClosed(Option<String>),
    Failed(SyncError),
}

struct Supervisor {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

type ReadySignal = Option<oneshot::Sender<Result<(), SyncError>>>;

/// Owns the transport lifecycle: connect, authenticate, reconnect, fan out events.
///
/// Every handler registered for an [`EventKind`] is called; registering
/// another handler never replaces an earlier one. Events are also broadcast
/// to every receiver returned by [`ConnectionManager::events`].
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
    state: watch::Sender<ConnectionState>,
    last_error: watch::Sender<Option<SyncError>>,
    outbound: watch::Sender<Option<mpsc::UnboundedSender<String>>>,
    events: broadcast::Sender<ConnectionEvent>,
    handlers: RwLock<HashMap<EventKind, Vec<(SubscriptionId, EventHandler)>>>,
    next_subscription: AtomicU64,
    supervisor: Mutex<Option<Supervisor>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, settings: ConnectionSettings) -> Arc<Self> {
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (last_error, _) = watch::channel(None);
        let (outbound, _) = watch::channel(None);
        Arc::new(Self {
            connector,
            settings,
            state,
            last_error,
            outbound,
            events,
            handlers: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            supervisor: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Authenticated
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Persistent connectivity problem, if any. Cleared on the next successful handshake.
    pub fn last_error(&self) -> Option<SyncError> {
        self.last_error.borrow().clone()
    }

    pub fn watch_errors(&self) -> watch::Receiver<Option<SyncError>> {
        self.last_error.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|(existing, _)| *existing != id);
            removed |= list.len() != before;
        }
        removed
    }

    /// Opens the transport and resolves once the first handshake has finished
    /// or the retry budget is spent.
    pub async fn connect(self: &Arc<Self>, identity: Identity) -> Result<(), SyncError> {
        let mut supervisor = self.supervisor.lock().await;
        if let Some(existing) = supervisor.take() {
            if !existing.task.is_finished() && self.is_ready() {
                *supervisor = Some(existing);
                return Ok(());
            }
            existing.stop().await;
        }

        self.last_error.send_replace(None);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();
        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            manager.supervise(identity, shutdown_rx, ready_tx).await;
        });
        *supervisor = Some(Supervisor { shutdown, task });
        drop(supervisor);

        ready_rx
            .await
            .unwrap_or_else(|_| Err(SyncError::Connection("connection supervisor stopped".into())))
    }

    /// Caller-initiated close; no reconnection follows.
    pub async fn disconnect(&self) {
        let supervisor = self.supervisor.lock().await.take();
        let was_running = supervisor.is_some();
        if let Some(supervisor) = supervisor {
            supervisor.stop().await;
        }
        self.outbound.send_replace(None);
        self.set_state(ConnectionState::Disconnected);
        if was_running {
            info!("disconnected by caller");
            self.dispatch(ConnectionEvent::Disconnected { by_server: false });
        }
    }

    pub fn send(&self, request: &ClientRequest) -> Result<(), SyncError> {
        if !self.is_ready() {
            return Err(SyncError::Connection("not connected".into()));
        }
        let outbound = self
            .outbound
            .borrow()
            .clone()
            .ok_or_else(|| SyncError::Connection("not connected".into()))?;
        send_request(&outbound, request)
    }

    async fn supervise(
        self: Arc<Self>,
        identity: Identity,
        mut shutdown: watch::Receiver<bool>,
        ready: oneshot::Sender<Result<(), SyncError>>,
    ) {
        let mut ready = Some(ready);
        let mut failures: u32 = 0;
        let mut resumed = false;

        loop {
            self.set_state(ConnectionState::Connecting);
            let (end, authenticated) = self
                .run_session(&identity, &mut shutdown, resumed, &mut ready)
                .await;
            self.outbound.send_replace(None);
            self.set_state(ConnectionState::Disconnected);
            if authenticated {
                failures = 0;
                resumed = true;
            }

            match end {
                SessionEnd::Requested => break,
                SessionEnd::Rejected(err) => {
                    warn!(error = %err, "authentication rejected; not retrying");
                    self.fail(err, &mut ready);
                    break;
                }
                SessionEnd::ServerClosed(reason) => {
                    self.dispatch(ConnectionEvent::Disconnected { by_server: true });
                    failures += 1;
                    if failures > self.settings.reconnect_attempts {
                        self.fail(
                            SyncError::Connection(format!(
                                "server keeps closing the session after {failures} attempts"
                            )),
                            &mut ready,
                        );
                        break;
                    }
                    info!(
                        attempt = failures,
                        reason = reason.as_deref().unwrap_or(""),
                        "server closed the session; reconnecting immediately"
                    );
                }
                SessionEnd::Failed(err) => {
                    if authenticated {
                        self.dispatch(ConnectionEvent::Disconnected { by_server: false });
                    }
                    failures += 1;
                    if failures > self.settings.reconnect_attempts {
                        self.fail(
                            SyncError::Connection(format!(
                                "giving up after {failures} attempts: {err}"
                            )),
                            &mut ready,
                        );
                        break;
                    }
                    warn!(
                        attempt = failures,
                        max_attempts = self.settings.reconnect_attempts,
                        error = %err,
                        "connection lost; retrying"
                    );
                    self.last_error.send_replace(Some(err.clone()));
                    self.dispatch(ConnectionEvent::ConnectError(err));
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }

            if *shutdown.borrow() {
                break;
            }
        }

        self.set_state(ConnectionState::Disconnected);
    }

    async fn run_session(
        &self,
        identity: &Identity,
        shutdown: &mut watch::Receiver<bool>,
        resumed: bool,
        ready: &mut ReadySignal,
    ) -> (SessionEnd, bool) {
        let connect = tokio::time::timeout(
            self.settings.connect_timeout,
            self.connector.connect(&self.settings.url),
        );
        let mut link = tokio::select! {
            result = connect => match result {
                Ok(Ok(link)) => link,
                Ok(Err(err)) => {
                    return (SessionEnd::Failed(SyncError::Connection(format!("{err:#}"))), false)
                }
                Err(_) => {
                    return (
                        SessionEnd::Failed(SyncError::Connection("connection timed out".into())),
                        false,
                    )
                }
            },
            _ = shutdown.changed() => return (SessionEnd::Requested, false),
        };

        self.set_state(ConnectionState::Connected);
        self.dispatch(ConnectionEvent::Connected);

        let authenticate = ClientRequest::Authenticate {
            user_id: identity.user_id.clone(),
            role: identity.role,
            name: identity.name.clone(),
        };
        if let Err(err) = send_request(&link.outbound, &authenticate) {
            return (SessionEnd::Failed(err), false);
        }

        let deadline = tokio::time::sleep(self.settings.connect_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                frame = link.inbound.recv() => match frame {
                    Some(TransportFrame::Text(text)) => {
                        let Some(event) = parse_event(&text) else {
                            continue;
                        };
                        match event {
                            ServerEvent::Authenticated { .. } => {
                                self.dispatch(ConnectionEvent::Server(event));
                                break;
                            }
                            ServerEvent::AuthenticationFailed { error } => {
                                return (SessionEnd::Rejected(SyncError::Authentication(error)), false);
                            }
                            other => self.dispatch(ConnectionEvent::Server(other)),
                        }
                    }
                    Some(TransportFrame::Closed { reason }) => {
                        return (SessionEnd::ServerClosed(reason), false)
                    }
                    Some(TransportFrame::Failed(err)) => {
                        return (SessionEnd::Failed(SyncError::Connection(err)), false)
                    }
                    None => {
                        return (
                            SessionEnd::Failed(SyncError::Connection(
                                "transport closed during handshake".into(),
                            )),
                            false,
                        )
                    }
                },
                _ = &mut deadline => {
                    return (
                        SessionEnd::Failed(SyncError::Connection(
                            "authentication handshake timed out".into(),
                        )),
                        false,
                    )
                }
                _ = shutdown.changed() => return (SessionEnd::Requested, false),
            }
        }

        self.outbound.send_replace(Some(link.outbound.clone()));
        self.last_error.send_replace(None);
        self.set_state(ConnectionState::Authenticated);
        info!(user_id = %identity.user_id, resumed, "session authenticated");
        if let Some(ready) = ready.take() {
            let _ = ready.send(Ok(()));
        }
        self.dispatch(ConnectionEvent::Ready { resumed });

        loop {
            tokio::select! {
                frame = link.inbound.recv() => match frame {
                    Some(TransportFrame::Text(text)) => {
                        if let Some(event) = parse_event(&text) {
                            self.dispatch(ConnectionEvent::Server(event));
                        }
                    }
                    Some(TransportFrame::Closed { reason }) => {
                        return (SessionEnd::ServerClosed(reason), true)
                    }
                    Some(TransportFrame::Failed(err)) => {
                        return (SessionEnd::Failed(SyncError::Connection(err)), true)
                    }
                    None => {
                        return (
                            SessionEnd::Failed(SyncError::Connection("transport closed".into())),
                            true,
                        )
                    }
                },
                _ = shutdown.changed() => return (SessionEnd::Requested, true),
            }
        }
    }

    fn fail(&self, err: SyncError, ready: &mut ReadySignal) {
        self.last_error.send_replace(Some(err.clone()));
        self.dispatch(ConnectionEvent::ConnectError(err.clone()));
        if let Some(ready) = ready.take() {
            let _ = ready.send(Err(err));
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "connection state changed");
        }
    }

    fn dispatch(&self, event: ConnectionEvent) {
        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, handler)| Arc::clone(handler)).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(&event);
        }
        let _ = self.events.send(event);
    }
}

impl Supervisor {
    async fn stop(self) {
        self.shutdown.send_replace(true);
        let _ = self.task.await;
    }
}

fn send_request(
    outbound: &mpsc::UnboundedSender<String>,
    request: &ClientRequest,
) -> Result<(), SyncError> {
    let text = serde_json::to_string(request)
        .map_err(|err| SyncError::Connection(format!("failed to encode request: {err}")))?;
    outbound
        .send(text)
        .map_err(|_| SyncError::Connection("transport closed".into()))
}

fn parse_event(text: &str) -> Option<ServerEvent> {
    match serde_json::from_str::<ServerEvent>(text) {
        Ok(event) => Some(event),
        Err(err) => {
            warn!(error = %err, "invalid server event");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
