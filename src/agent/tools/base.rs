use crate::utils::turns::CancelToken;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

impl std::fmt::Display for ToolResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.content)
    }
}

/// Request-scoped context injected into every tool execution. Carries the
/// authenticated tenant identity that pins sandbox operations to the user's
/// workspace, and the turn's cancellation token.
#[derive(Clone)]
pub struct SessionContext {
    pub user_id: String,
    pub thread_id: String,
    pub cancel: CancelToken,
}

impl SessionContext {
    pub fn new(user_id: impl Into<String>, thread_id: impl Into<String>, cancel: CancelToken) -> Self {
        Self {
            user_id: user_id.into(),
            thread_id: thread_id.into(),
            cancel,
        }
    }

    /// A context that can never be cancelled, for internal and test calls.
    pub fn detached(user_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self::new(user_id, thread_id, CancelToken::never())
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> Value; // JSON Schema

    async fn execute(&self, params: Value, ctx: &SessionContext) -> anyhow::Result<ToolResult>;

    /// Per-tool execution timeout enforced by the registry.
    fn execution_timeout(&self) -> Duration {
        Duration::from_secs(120)
    }
}
