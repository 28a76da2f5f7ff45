use std::fmt;

use serde::{Deserialize, Serialize};

/// Machine-readable reason carried by an `error` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    Internal,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Unsolicited server-side failure that is not tied to a single send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The same request may succeed later without any change on our side.
    pub fn is_transient(&self) -> bool {
        matches!(self.code, ErrorCode::RateLimited | ErrorCode::Internal)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_codes_are_tolerated() {
        let err: ApiError =
            serde_json::from_str(r#"{"code":"conversation_locked","message":"locked"}"#)
                .expect("parse");
        assert_eq!(err.code, ErrorCode::Unknown);
        assert!(!err.is_transient());

        let err: ApiError = serde_json::from_str(r#"{"message":"slow down"}"#).expect("parse");
        assert_eq!(err.code, ErrorCode::Unknown);
    }

    #[test]
    fn rate_limits_are_transient() {
        let err = ApiError::new(ErrorCode::RateLimited, "slow down");
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "RateLimited: slow down");
    }
}
