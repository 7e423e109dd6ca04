use crate::errors::{ServerError, ServerResult};
use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use tracing::{debug, warn};

/// One tool invocation requested by the model, with finalized JSON arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Wire-format message for the provider edge. The core models messages as a
/// tagged enum; conversion to this role-string shape happens only here.
#[derive(Debug, Clone, Default)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Option<Vec<ToolCallRequest>>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
            tool_calls,
            ..Default::default()
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value, // JSON Schema
}

/// Parameters for one streaming chat request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Incremental output of a streaming chat call.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatStreamEvent {
    /// A chunk of assistant text.
    ContentDelta(String),
    /// The model opened a new tool call; arguments follow as deltas.
    ToolCallStart {
        index: usize,
        id: String,
        name: String,
    },
    /// A fragment of the JSON-encoded arguments for the call at `index`.
    ToolCallDelta { index: usize, arguments: String },
    /// The provider finished the message.
    Finished { reason: Option<String> },
}

pub type ChatStream = Pin<Box<dyn Stream<Item = ServerResult<ChatStreamEvent>> + Send>>;

/// Retry behavior for the connection phase of a streaming call. Mid-stream
/// failures are never retried (replaying deltas would duplicate output).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        // 200 ms → 800 ms across two retries.
        Self {
            max_retries: 2,
            initial_delay_ms: 200,
            backoff_multiplier: 4.0,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay for the given attempt, with up to 25% jitter.
    pub fn delay_ms(&self, attempt: usize) -> u64 {
        let base = (self.initial_delay_ms as f64
            * self.backoff_multiplier.powi(attempt as i32)) as u64;
        let jitter = (base as f64 * 0.25 * fastrand::f64()) as u64;
        base + jitter
    }
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Open a streaming chat call. Errors before the first event are
    /// connection-phase and may be retried by the caller.
    async fn stream_chat(&self, req: ChatRequest) -> ServerResult<ChatStream>;

    fn model(&self) -> &str;

    /// Open a stream with automatic retry on transient connection failures.
    async fn stream_chat_with_retry(
        &self,
        req: ChatRequest,
        policy: &RetryPolicy,
    ) -> ServerResult<ChatStream> {
        let mut last_error: Option<ServerError> = None;
        for attempt in 0..=policy.max_retries {
            if attempt > 0 {
                let delay = policy.delay_ms(attempt - 1);
                warn!(
                    "provider retry {}/{} after {}ms: {}",
                    attempt,
                    policy.max_retries,
                    delay,
                    last_error
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default()
                );
                tokio::time::sleep(tokio::time::Duration::from_millis(delay)).await;
            }
            debug!("opening chat stream (attempt {})", attempt);
            match self.stream_chat(req.clone()).await {
                Ok(stream) => return Ok(stream),
                Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error
            .unwrap_or_else(|| ServerError::LlmUnavailable("all retry attempts failed".into())))
    }
}
