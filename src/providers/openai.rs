//! OpenAI-compatible streaming chat provider.
//!
//! One provider instance is bound to a (model, api key, base url, token cap)
//! tuple at construction — the agent factory's memoization key — so a
//! compiled agent never mixes tenants' credentials.

use crate::errors::{ServerError, ServerResult};
use crate::providers::base::{
    ChatMessage, ChatProvider, ChatRequest, ChatStream, ChatStreamEvent,
};
use crate::providers::sse::SseBuffer;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const STREAM_CHANNEL_CAPACITY: usize = 64;

pub struct OpenAiCompatProvider {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
}

impl OpenAiCompatProvider {
    pub fn new(
        client: Client,
        model: impl Into<String>,
        api_key: Option<String>,
        base_url: Option<String>,
    ) -> Self {
        Self {
            client,
            api_key,
            base_url: base_url
                .filter(|u| !u.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: model.into(),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn build_payload(&self, req: &ChatRequest) -> Value {
        let messages: Vec<Value> = req
            .messages
            .iter()
            .map(|msg: &ChatMessage| {
                let mut m = json!({
                    "role": msg.role,
                    "content": msg.content,
                });
                if let Some(tool_calls) = &msg.tool_calls {
                    m["tool_calls"] = Value::Array(
                        tool_calls
                            .iter()
                            .map(|tc| {
                                json!({
                                    "id": tc.id,
                                    "type": "function",
                                    "function": {
                                        "name": tc.name,
                                        // OpenAI expects arguments as a JSON string
                                        "arguments": tc.arguments.to_string(),
                                    }
                                })
                            })
                            .collect(),
                    );
                }
                if let Some(tool_call_id) = &msg.tool_call_id {
                    m["tool_call_id"] = json!(tool_call_id);
                }
                m
            })
            .collect();

        let mut payload = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
            "stream": true,
        });
        if !req.tools.is_empty() {
            payload["tools"] = Value::Array(
                req.tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        payload
    }
}

/// Translate one streamed `chat.completion.chunk` into public stream events.
fn chunk_to_events(chunk: &Value, events: &mut Vec<ChatStreamEvent>) {
    let Some(choice) = chunk["choices"].as_array().and_then(|a| a.first()) else {
        return;
    };
    let delta = &choice["delta"];

    if let Some(text) = delta["content"].as_str()
        && !text.is_empty()
    {
        events.push(ChatStreamEvent::ContentDelta(text.to_string()));
    }

    if let Some(tool_calls) = delta["tool_calls"].as_array() {
        for tc in tool_calls {
            let index = tc["index"].as_u64().unwrap_or(0) as usize;
            if let Some(name) = tc["function"]["name"].as_str() {
                events.push(ChatStreamEvent::ToolCallStart {
                    index,
                    id: tc["id"].as_str().unwrap_or("").to_string(),
                    name: name.to_string(),
                });
            }
            if let Some(args) = tc["function"]["arguments"].as_str()
                && !args.is_empty()
            {
                events.push(ChatStreamEvent::ToolCallDelta {
                    index,
                    arguments: args.to_string(),
                });
            }
        }
    }

    if let Some(reason) = choice["finish_reason"].as_str() {
        events.push(ChatStreamEvent::Finished {
            reason: Some(reason.to_string()),
        });
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatProvider {
    async fn stream_chat(&self, req: ChatRequest) -> ServerResult<ChatStream> {
        let payload = self.build_payload(&req);

        let mut request = self
            .client
            .post(self.completions_url())
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let resp = request.json(&payload).send().await.map_err(|e| {
            ServerError::LlmUnavailable(format!("request failed: {}", e))
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_else(|_| "<no body>".to_string());
            // 5xx and rate limiting are transient; other 4xx are not.
            return if status.is_server_error() || status.as_u16() == 429 {
                Err(ServerError::LlmUnavailable(format!("{}: {}", status, body)))
            } else {
                Err(ServerError::LlmInvalidResponse(format!(
                    "{}: {}",
                    status, body
                )))
            };
        }

        let (tx, rx) = mpsc::channel::<ServerResult<ChatStreamEvent>>(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut bytes = resp.bytes_stream();
            let mut buffer = SseBuffer::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ServerError::LlmUnavailable(format!(
                                "stream read: {}",
                                e
                            ))))
                            .await;
                        return;
                    }
                };
                for event in buffer.push(&String::from_utf8_lossy(&chunk)) {
                    if event.done {
                        debug!("provider stream closed by [DONE]");
                        return;
                    }
                    let Some(data) = event.data else { continue };
                    if let Some(err) = data.get("error") {
                        warn!("provider mid-stream error: {}", err);
                        let _ = tx
                            .send(Err(ServerError::LlmInvalidResponse(err.to_string())))
                            .await;
                        return;
                    }
                    let mut events = Vec::new();
                    chunk_to_events(&data, &mut events);
                    for e in events {
                        if tx.send(Ok(e)).await.is_err() {
                            // Consumer gone (cancelled turn) — abort the read.
                            return;
                        }
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    fn model(&self) -> &str {
        &self.model
    }
}
