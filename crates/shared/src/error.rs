use std::fmt;

use serde::{Deserialize, Serialize};

/// Caller-facing error vocabulary shared by the client core and its front ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    Validation,
    NotRetryable,
    AlreadySent,
    Conflict,
    Offline,
    RateLimited,
    Rejected,
    UnsupportedCriticalVersion,
    Internal,
}

impl ErrorCode {
    /// Codes a caller may resolve by trying the same operation again later.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorCode::Offline | ErrorCode::RateLimited | ErrorCode::Conflict
        )
    }
}

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

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}
