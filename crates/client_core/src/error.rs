use shared::{
    domain::{ConversationId, TemporaryId},
    error::{ApiError, ErrorCode},
};
use thiserror::Error;

/// Everything the sync engine reports to its caller.
///
/// Connection and authentication failures also land in the observable
/// error state of the connection manager so a UI can keep a banner up;
/// send rejections travel as transient notices.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("authentication rejected: {0}")]
    Authentication(String),
    #[error("invalid message: {0}")]
    Validation(String),
    #[error("message {temporary_id} rejected by server: {reason}")]
    SendRejected {
        temporary_id: TemporaryId,
        reason: String,
        code: Option<String>,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("history request failed: {0}")]
    Persistence(String),
    #[error("server error ({code:?}): {message}")]
    Server { code: ErrorCode, message: String },
}

impl SyncError {
    pub fn conversation_not_found(conversation_id: &ConversationId) -> Self {
        Self::NotFound(format!("conversation {conversation_id}"))
    }

    pub fn persistence(err: anyhow::Error) -> Self {
        Self::Persistence(format!("{err:#}"))
    }

    pub fn from_api(err: ApiError) -> Self {
        match err.code {
            ErrorCode::NotFound => Self::NotFound(err.message),
            ErrorCode::Validation => Self::Validation(err.message),
            code => Self::Server {
                code,
                message: err.message,
            },
        }
    }

    /// Connectivity and handshake failures are shown persistently; the rest are transient.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Authentication(_))
    }
}
