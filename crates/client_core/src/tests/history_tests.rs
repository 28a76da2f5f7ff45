use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{TimeZone, Utc};
use shared::{
    domain::{MessageType, Role},
    protocol::{MessageMetadata, ParticipantSummary},
};
use tokio::{net::TcpListener, sync::Mutex};

use super::*;

#[derive(Clone, Default)]
struct ServerState {
    seen_queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
    read_marks: Arc<Mutex<Vec<String>>>,
    created: Arc<Mutex<Vec<serde_json::Value>>>,
}

fn sample_message(id: &str) -> MessagePayload {
    MessagePayload {
        id: MessageId::from(id),
        conversation_id: ConversationId::from("c1"),
        sender_id: UserId::from("p1"),
        sender_name: "Pat".into(),
        sender_role: Role::Patient,
        content: "hello".into(),
        message_type: MessageType::Text,
        metadata: MessageMetadata::default(),
        timestamp: Utc
            .with_ymd_and_hms(2024, 3, 1, 8, 0, 0)
            .single()
            .expect("timestamp"),
        is_read: false,
    }
}

async fn list_conversations(
    State(state): State<ServerState>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Vec<ConversationSummary>> {
    state.seen_queries.lock().await.push(query);
    Json(vec![ConversationSummary {
        id: ConversationId::from("c1"),
        participants: vec![ParticipantSummary {
            id: UserId::from("p1"),
            name: "Pat".into(),
            role: Role::Patient,
        }],
        last_message: None,
        last_message_at: None,
        unread_count: 2,
    }])
}

async fn create_conversation(
    State(state): State<ServerState>,
    Json(body): Json<serde_json::Value>,
) -> Json<ConversationSummary> {
    state.created.lock().await.push(body);
    Json(ConversationSummary {
        id: ConversationId::from("c9"),
        participants: Vec::new(),
        last_message: None,
        last_message_at: None,
        unread_count: 0,
    })
}

async fn list_messages(
    State(state): State<ServerState>,
    Path(conversation_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Vec<MessagePayload>>, StatusCode> {
    if conversation_id == "missing" {
        return Err(StatusCode::NOT_FOUND);
    }
    state.seen_queries.lock().await.push(query);
    Ok(Json(vec![sample_message("m1")]))
}

async fn persist_message(Json(message): Json<OutboundMessage>) -> Json<MessagePayload> {
    let mut stored = sample_message("m-stored");
    stored.content = message.content;
    stored.metadata = message.metadata;
    Json(stored)
}

async fn mark_read(State(state): State<ServerState>, Path(message_id): Path<String>) {
    state.read_marks.lock().await.push(message_id);
}

async fn spawn_history_server() -> anyhow::Result<(String, ServerState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = ServerState::default();
    let app = Router::new()
        .route(
            "/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route("/conversations/:id/messages", get(list_messages))
        .route("/messages", post(persist_message))
        .route("/messages/:id/read", put(mark_read))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}/"), state))
}

#[tokio::test]
async fn lists_conversations_for_user() {
    let (base_url, state) = spawn_history_server().await.expect("spawn server");
    let api = HttpHistoryApi::new(base_url);

    let conversations = api
        .list_conversations(&UserId::from("doc-1"))
        .await
        .expect("list");

    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].unread_count, 2);
    let queries = state.seen_queries.lock().await;
    assert_eq!(queries[0].get("userId").map(String::as_str), Some("doc-1"));
}

#[tokio::test]
async fn fetches_a_page_with_page_and_limit() {
    let (base_url, state) = spawn_history_server().await.expect("spawn server");
    let api = HttpHistoryApi::new(base_url);

    let page = api
        .fetch_messages(&ConversationId::from("c1"), 2, 50)
        .await
        .expect("fetch");

    assert_eq!(page, vec![sample_message("m1")]);
    let queries = state.seen_queries.lock().await;
    assert_eq!(queries[0].get("page").map(String::as_str), Some("2"));
    assert_eq!(queries[0].get("limit").map(String::as_str), Some("50"));
}

#[tokio::test]
async fn status_errors_surface_as_failures() {
    let (base_url, _state) = spawn_history_server().await.expect("spawn server");
    let api = HttpHistoryApi::new(base_url);

    let err = api
        .fetch_messages(&ConversationId::from("missing"), 1, 50)
        .await
        .expect_err("404 must fail");
    assert!(format!("{err:#}").contains("404"));
}

#[tokio::test]
async fn create_or_get_posts_both_participants() {
    let (base_url, state) = spawn_history_server().await.expect("spawn server");
    let api = HttpHistoryApi::new(base_url);

    let summary = api
        .create_or_get_conversation(&UserId::from("doc-1"), &UserId::from("p7"))
        .await
        .expect("create");

    assert_eq!(summary.id, ConversationId::from("c9"));
    let created = state.created.lock().await;
    assert_eq!(created[0]["userId"], "doc-1");
    assert_eq!(created[0]["participantId"], "p7");
}

#[tokio::test]
async fn persists_messages_and_marks_reads() {
    let (base_url, state) = spawn_history_server().await.expect("spawn server");
    let api = HttpHistoryApi::new(base_url);

    let stored = api
        .persist_message(&OutboundMessage {
            conversation_id: ConversationId::from("c1"),
            sender_id: UserId::from("doc-1"),
            content: "hola".into(),
            message_type: MessageType::Text,
            metadata: MessageMetadata {
                temporary_id: Some("tmp-1".into()),
            },
        })
        .await
        .expect("persist");
    assert_eq!(stored.content, "hola");
    assert_eq!(stored.metadata.temporary_id, Some("tmp-1".into()));

    api.mark_message_read(&MessageId::from("m1"))
        .await
        .expect("mark read");
    assert_eq!(*state.read_marks.lock().await, vec!["m1".to_string()]);
}
