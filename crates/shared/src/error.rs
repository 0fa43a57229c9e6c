use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    NotFound,
    Forbidden,
    Network,
    Transport,
}

/// Wire-serializable error shape carried by push-path error events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
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
}

/// Failure taxonomy for session operations and the persistence seam.
///
/// `Validation`, `NotFound` and `Forbidden` are rejected requests; any
/// optimistic state applied before the call is rolled back by the caller.
/// `Network` covers failed round-trips on the optimistic send path.
/// `Transport` covers subscribe/unsubscribe failures, which are logged and
/// swallowed rather than surfaced.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("network: {0}")]
    Network(String),
    #[error("transport: {0}")]
    Transport(String),
}

impl SyncError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::Validation,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::Network(_) => ErrorCode::Network,
            Self::Transport(_) => ErrorCode::Transport,
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(value: SyncError) -> Self {
        let message = value.to_string();
        Self {
            code: value.code(),
            message,
        }
    }
}
