use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{ConversationId, MessageId, Role, UserId},
    protocol::{
        ClientRequest, ConversationSummary, MessageMetadata, MessagePayload, OutboundMessage,
        ParticipantSummary, ServerEvent,
    },
};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};

use crate::{
    config::SyncSettings,
    history::HistoryApi,
    transport::{Connector, TransportFrame, TransportLink},
    types::Identity,
    SyncClient, SyncEvent,
};

pub(crate) const WAIT: Duration = Duration::from_secs(3);

pub(crate) fn me() -> Identity {
    Identity {
        user_id: UserId::from("doc-1"),
        role: Role::Doctor,
        name: "Dr. Ada".into(),
    }
}

pub(crate) fn at(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0)
        .single()
        .expect("timestamp")
        + chrono::Duration::minutes(minute)
}

pub(crate) fn message(id: &str, conversation: &str, sender: &str, minute: i64) -> MessagePayload {
    MessagePayload {
        id: MessageId::from(id),
        conversation_id: ConversationId::from(conversation),
        sender_id: UserId::from(sender),
        sender_name: sender.to_string(),
        sender_role: if sender == "doc-1" {
            Role::Doctor
        } else {
            Role::Patient
        },
        content: format!("text of {id}"),
        message_type: Default::default(),
        metadata: MessageMetadata::default(),
        timestamp: at(minute),
        is_read: false,
    }
}

pub(crate) fn summary(id: &str, other: &str, unread: u32) -> ConversationSummary {
    ConversationSummary {
        id: ConversationId::from(id),
        participants: vec![
            ParticipantSummary {
                id: UserId::from("doc-1"),
                name: "Dr. Ada".into(),
                role: Role::Doctor,
            },
            ParticipantSummary {
                id: UserId::from(other),
                name: other.to_string(),
                role: Role::Patient,
            },
        ],
        last_message: None,
        last_message_at: None,
        unread_count: unread,
    }
}

pub(crate) fn settings() -> SyncSettings {
    SyncSettings {
        reconnect_attempts: 2,
        reconnect_delay_ms: 20,
        connect_timeout_ms: 2_000,
        ..SyncSettings::default()
    }
}

pub(crate) enum Script {
    Accept,
    Refuse(&'static str),
}

/// In-memory transport. Each accepted connect hands a [`ServerSide`] to the test.
pub(crate) struct ScriptedConnector {
    script: Mutex<VecDeque<Script>>,
    sessions: mpsc::UnboundedSender<ServerSide>,
    attempts: AtomicUsize,
}

impl ScriptedConnector {
    pub(crate) fn new(
        script: impl IntoIterator<Item = Script>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (sessions, sessions_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            sessions,
            attempts: AtomicUsize::new(0),
        });
        (connector, sessions_rx)
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _url: &str) -> anyhow::Result<TransportLink> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().await.pop_front() {
            Some(Script::Accept) => {
                let (outbound, from_client) = mpsc::unbounded_channel();
                let (to_client, inbound) = mpsc::unbounded_channel();
                let _ = self.sessions.send(ServerSide {
                    from_client,
                    to_client,
                });
                Ok(TransportLink { outbound, inbound })
            }
            Some(Script::Refuse(reason)) => Err(anyhow!(reason)),
            None => Err(anyhow!("connection refused")),
        }
    }
}

pub(crate) struct ServerSide {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<TransportFrame>,
}

impl ServerSide {
    pub(crate) async fn next_request(&mut self) -> ClientRequest {
        let text = tokio::time::timeout(WAIT, self.from_client.recv())
            .await
            .expect("client request in time")
            .expect("client side open");
        serde_json::from_str(&text).expect("valid client request")
    }

    pub(crate) fn assert_idle(&mut self) {
        assert!(
            self.from_client.try_recv().is_err(),
            "client sent an unexpected request"
        );
    }

    pub(crate) fn push(&self, event: ServerEvent) {
        let text = serde_json::to_string(&event).expect("encode server event");
        let _ = self.to_client.send(TransportFrame::Text(text));
    }

    pub(crate) fn close(&self) {
        let _ = self.to_client.send(TransportFrame::Closed {
            reason: Some("server restart".into()),
        });
    }

    pub(crate) fn fail(&self) {
        let _ = self
            .to_client
            .send(TransportFrame::Failed("connection reset".into()));
    }

    /// Expects the handshake frame and confirms it.
    pub(crate) async fn accept_login(&mut self) -> ClientRequest {
        let request = self.next_request().await;
        let ClientRequest::Authenticate { user_id, .. } = &request else {
            panic!("expected authenticate, got {request:?}");
        };
        self.push(ServerEvent::Authenticated {
            user_id: user_id.clone(),
            name: None,
        });
        request
    }
}

pub(crate) async fn next_session(sessions: &mut mpsc::UnboundedReceiver<ServerSide>) -> ServerSide {
    tokio::time::timeout(WAIT, sessions.recv())
        .await
        .expect("connect attempt in time")
        .expect("connector alive")
}

/// Paginated in-memory history. Page 1 holds the newest messages.
#[derive(Default)]
pub(crate) struct FakeHistory {
    conversations: Mutex<Vec<ConversationSummary>>,
    messages: Mutex<HashMap<ConversationId, Vec<MessagePayload>>>,
    failing_previews: Mutex<HashSet<ConversationId>>,
    gates: Mutex<HashMap<ConversationId, oneshot::Receiver<()>>>,
    preview_gates: Mutex<HashMap<ConversationId, oneshot::Receiver<()>>>,
    read_gate: Mutex<Option<watch::Receiver<bool>>>,
    pub(crate) fetches: Mutex<Vec<(ConversationId, u32, u32)>>,
    pub(crate) persisted: Mutex<Vec<OutboundMessage>>,
    pub(crate) read_marks: Mutex<Vec<MessageId>>,
}

impl FakeHistory {
    pub(crate) async fn with_conversation(
        self,
        summary: ConversationSummary,
        messages: Vec<MessagePayload>,
    ) -> Self {
        self.messages
            .lock()
            .await
            .insert(summary.id.clone(), messages);
        self.conversations.lock().await.push(summary);
        self
    }

    pub(crate) async fn set_unread(&self, conversation: &str, unread: u32) {
        for summary in self.conversations.lock().await.iter_mut() {
            if summary.id.as_str() == conversation {
                summary.unread_count = unread;
            }
        }
    }

    pub(crate) async fn fail_previews_for(&self, conversation: &str) {
        self.failing_previews
            .lock()
            .await
            .insert(ConversationId::from(conversation));
    }

    /// Holds the next full-page fetch for `conversation` until the sender fires.
    pub(crate) async fn gate(&self, conversation: &str) -> oneshot::Sender<()> {
        let (release, gate) = oneshot::channel();
        self.gates
            .lock()
            .await
            .insert(ConversationId::from(conversation), gate);
        release
    }

    /// Holds the next preview fetch for `conversation` until the sender fires.
    pub(crate) async fn gate_preview(&self, conversation: &str) -> oneshot::Sender<()> {
        let (release, gate) = oneshot::channel();
        self.preview_gates
            .lock()
            .await
            .insert(ConversationId::from(conversation), gate);
        release
    }

    /// Holds every `mark_message_read` call until `true` is sent.
    pub(crate) async fn hold_read_marks(&self) -> watch::Sender<bool> {
        let (release, gate) = watch::channel(false);
        *self.read_gate.lock().await = Some(gate);
        release
    }

    pub(crate) async fn fetch_count(&self, conversation: &str) -> usize {
        self.fetches
            .lock()
            .await
            .iter()
            .filter(|(id, _, limit)| id.as_str() == conversation && *limit > 1)
            .count()
    }
}

#[async_trait]
impl HistoryApi for FakeHistory {
    async fn list_conversations(&self, _user_id: &UserId) -> anyhow::Result<Vec<ConversationSummary>> {
        Ok(self.conversations.lock().await.clone())
    }

    async fn create_or_get_conversation(
        &self,
        _user_id: &UserId,
        participant_id: &UserId,
    ) -> anyhow::Result<ConversationSummary> {
        let mut conversations = self.conversations.lock().await;
        if let Some(existing) = conversations
            .iter()
            .find(|c| c.participants.iter().any(|p| &p.id == participant_id))
        {
            return Ok(existing.clone());
        }
        let created = summary(&format!("c-{participant_id}"), participant_id.as_str(), 0);
        conversations.push(created.clone());
        Ok(created)
    }

    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        page: u32,
        limit: u32,
    ) -> anyhow::Result<Vec<MessagePayload>> {
        self.fetches
            .lock()
            .await
            .push((conversation_id.clone(), page, limit));
        if limit <= 1 && self.failing_previews.lock().await.contains(conversation_id) {
            return Err(anyhow!("preview unavailable"));
        }
        let gate = if limit > 1 {
            self.gates.lock().await.remove(conversation_id)
        } else {
            self.preview_gates.lock().await.remove(conversation_id)
        };
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        let mut messages = self
            .messages
            .lock()
            .await
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown conversation {conversation_id}"))?;
        messages.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let start = (page.saturating_sub(1) * limit) as usize;
        Ok(messages
            .into_iter()
            .skip(start)
            .take(limit as usize)
            .collect())
    }

    async fn persist_message(&self, message: &OutboundMessage) -> anyhow::Result<MessagePayload> {
        self.persisted.lock().await.push(message.clone());
        let mut stored = message_from_outbound(message);
        stored.id = MessageId::from("persisted");
        Ok(stored)
    }

    async fn mark_message_read(&self, message_id: &MessageId) -> anyhow::Result<()> {
        let gate = self.read_gate.lock().await.clone();
        if let Some(mut gate) = gate {
            let _ = gate.wait_for(|open| *open).await;
        }
        self.read_marks.lock().await.push(message_id.clone());
        Ok(())
    }
}

fn message_from_outbound(message: &OutboundMessage) -> MessagePayload {
    MessagePayload {
        id: MessageId::from(""),
        conversation_id: message.conversation_id.clone(),
        sender_id: message.sender_id.clone(),
        sender_name: String::new(),
        sender_role: Role::Unknown,
        content: message.content.clone(),
        message_type: message.message_type,
        metadata: message.metadata.clone(),
        timestamp: Utc::now(),
        is_read: false,
    }
}

/// Two conversations: `c1` with Pat (two unread), `c2` with Sam (one unread).
pub(crate) async fn two_conversations() -> Arc<FakeHistory> {
    Arc::new(
        FakeHistory::default()
            .with_conversation(
                summary("c1", "pat", 2),
                vec![message("m1", "c1", "pat", 1), message("m2", "c1", "pat", 2)],
            )
            .await
            .with_conversation(summary("c2", "sam", 1), vec![message("m5", "c2", "sam", 5)])
            .await,
    )
}

/// Engine wired to the scripted transport but never started.
pub(crate) fn offline_client(history: Arc<FakeHistory>) -> Arc<SyncClient> {
    let (connector, _sessions) = ScriptedConnector::new([]);
    SyncClient::new(me(), settings(), connector, history).expect("client")
}

pub(crate) struct Harness {
    pub(crate) client: Arc<SyncClient>,
    pub(crate) server: ServerSide,
    pub(crate) sessions: mpsc::UnboundedReceiver<ServerSide>,
    pub(crate) connector: Arc<ScriptedConnector>,
}

/// Engine started against the scripted transport with its handshake done.
pub(crate) async fn connected_client(
    history: Arc<FakeHistory>,
    settings: SyncSettings,
    script: Vec<Script>,
) -> Harness {
    let (connector, mut sessions) = ScriptedConnector::new(script);
    let client = SyncClient::new(me(), settings, connector.clone(), history).expect("client");
    let starter = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.start().await })
    };
    let mut server = next_session(&mut sessions).await;
    server.accept_login().await;
    starter.await.expect("start task").expect("start");
    Harness {
        client,
        server,
        sessions,
        connector,
    }
}

pub(crate) async fn wait_for_event(
    events: &mut broadcast::Receiver<SyncEvent>,
    mut matches: impl FnMut(&SyncEvent) -> bool,
) -> SyncEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("event in time")
}

/// Polls `condition` until it holds or the wait budget runs out.
pub(crate) async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition in time");
}
