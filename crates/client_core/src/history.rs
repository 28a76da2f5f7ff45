use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{ConversationSummary, MessagePayload, OutboundMessage},
};

/// Request/response side of the backend: conversation list, paginated history
/// and the durable write paths.
#[async_trait]
pub trait HistoryApi: Send + Sync {
    async fn list_conversations(&self, user_id: &UserId) -> Result<Vec<ConversationSummary>>;
    async fn create_or_get_conversation(
        &self,
        user_id: &UserId,
        participant_id: &UserId,
    ) -> Result<ConversationSummary>;
    /// Page 1 holds the most recent messages.
    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        page: u32,
        limit: u32,
    ) -> Result<Vec<MessagePayload>>;
    async fn persist_message(&self, message: &OutboundMessage) -> Result<MessagePayload>;
    async fn mark_message_read(&self, message_id: &MessageId) -> Result<()>;
}

pub struct HttpHistoryApi {
    http: Client,
    base_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversationRequest<'a> {
    user_id: &'a UserId,
    participant_id: &'a UserId,
}

impl HttpHistoryApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl HistoryApi for HttpHistoryApi {
    async fn list_conversations(&self, user_id: &UserId) -> Result<Vec<ConversationSummary>> {
        self.http
            .get(format!("{}/conversations", self.base_url))
            .query(&[("userId", user_id.as_str())])
            .send()
            .await
            .context("failed to list conversations")?
            .error_for_status()?
            .json()
            .await
            .context("invalid conversation list")
    }

    async fn create_or_get_conversation(
        &self,
        user_id: &UserId,
        participant_id: &UserId,
    ) -> Result<ConversationSummary> {
        self.http
            .post(format!("{}/conversations", self.base_url))
            .json(&CreateConversationRequest {
                user_id,
                participant_id,
            })
            .send()
            .await
            .with_context(|| format!("failed to open conversation with {participant_id}"))?
            .error_for_status()?
            .json()
            .await
            .context("invalid conversation")
    }

    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        page: u32,
        limit: u32,
    ) -> Result<Vec<MessagePayload>> {
        self.http
            .get(format!(
                "{}/conversations/{}/messages",
                self.base_url, conversation_id
            ))
            .query(&[("page", page), ("limit", limit)])
            .send()
            .await
            .with_context(|| format!("failed to fetch messages for {conversation_id}"))?
            .error_for_status()?
            .json()
            .await
            .context("invalid message page")
    }

    async fn persist_message(&self, message: &OutboundMessage) -> Result<MessagePayload> {
        self.http
            .post(format!("{}/messages", self.base_url))
            .json(message)
            .send()
            .await
            .context("failed to persist message")?
            .error_for_status()?
            .json()
            .await
            .context("invalid persisted message")
    }

    async fn mark_message_read(&self, message_id: &MessageId) -> Result<()> {
        self.http
            .put(format!("{}/messages/{}/read", self.base_url, message_id))
            .send()
            .await
            .with_context(|| format!("failed to mark {message_id} read"))?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/history_tests.rs"]
mod tests;
