use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error classification shared by HTTP error bodies and mid-stream `error`
/// frames. Serialized in kebab-case on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    AuthRequired,
    ThreadBusy,
    ThreadNotFound,
    LlmUnavailable,
    LlmInvalidResponse,
    ToolFailed,
    SandboxUnavailable,
    PathEscape,
    Timeout,
    RecursionExceeded,
    StorageUnavailable,
    StaleParent,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthRequired => "auth-required",
            Self::ThreadBusy => "thread-busy",
            Self::ThreadNotFound => "thread-not-found",
            Self::LlmUnavailable => "llm-unavailable",
            Self::LlmInvalidResponse => "llm-invalid-response",
            Self::ToolFailed => "tool-failed",
            Self::SandboxUnavailable => "sandbox-unavailable",
            Self::PathEscape => "path-escape",
            Self::Timeout => "timeout",
            Self::RecursionExceeded => "recursion-exceeded",
            Self::StorageUnavailable => "storage-unavailable",
            Self::StaleParent => "stale-parent",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed error hierarchy for the server.
///
/// Use at module boundaries (sandbox operations, checkpoint store, provider
/// calls, the gateway). Internal/leaf functions can continue using
/// `anyhow::Result` — the `Internal` variant converts via the `?` operator.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("authentication required: {0}")]
    AuthRequired(String),

    #[error("a turn is already running on thread {0}")]
    ThreadBusy(String),

    #[error("thread not found: {0}")]
    ThreadNotFound(String),

    #[error("LLM provider unavailable: {0}")]
    LlmUnavailable(String),

    #[error("LLM produced an unusable response: {0}")]
    LlmInvalidResponse(String),

    #[error("tool failed: {0}")]
    ToolFailed(String),

    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    #[error("path escapes the workspace: {0}")]
    PathEscape(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("recursion bound of {limit} steps exceeded")]
    RecursionExceeded { limit: usize },

    #[error("checkpoint storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("stale parent sequence on thread {thread_id}: expected {expected:?}, got {got:?}")]
    StaleParent {
        thread_id: String,
        expected: Option<u64>,
        got: Option<u64>,
    },

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ServerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthRequired(_) => ErrorKind::AuthRequired,
            Self::ThreadBusy(_) => ErrorKind::ThreadBusy,
            Self::ThreadNotFound(_) => ErrorKind::ThreadNotFound,
            Self::LlmUnavailable(_) => ErrorKind::LlmUnavailable,
            Self::LlmInvalidResponse(_) => ErrorKind::LlmInvalidResponse,
            Self::ToolFailed(_) => ErrorKind::ToolFailed,
            Self::SandboxUnavailable(_) => ErrorKind::SandboxUnavailable,
            Self::PathEscape(_) => ErrorKind::PathEscape,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::RecursionExceeded { .. } => ErrorKind::RecursionExceeded,
            Self::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            Self::StaleParent { .. } => ErrorKind::StaleParent,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether this error is transient and the operation should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LlmUnavailable(_)
                | Self::SandboxUnavailable(_)
                | Self::Timeout(_)
                | Self::StaleParent { .. }
        )
    }
}

pub type ServerResult<T> = Result<T, ServerError>;

#[cfg(test)]
mod tests;
