//! The agent execution loop: drives one compiled agent over one user turn,
//! translating internal streaming into the public event taxonomy.
//!
//! The returned stream is single-consumer and ordered, and terminates with
//! exactly one of `done`, `stopped`, `error`. Checkpoints are persisted at
//! every state transition so a later turn on the same thread resumes from
//! the prior context.

use crate::agent::events::{ContentNode, ToolCallStatus, TurnEvent};
use crate::agent::factory::{AgentFactory, AgentKey};
use crate::agent::message::{AgentState, ThreadMessage, ToolCallRecord};
use crate::agent::middleware::ModelDraft;
use crate::agent::tools::base::{SessionContext, ToolResult};
use crate::agent::tools::registry::ToolRegistry;
use crate::checkpoint::CheckpointStore;
use crate::errors::{ServerError, ServerResult};
use crate::providers::base::{
    ChatRequest, ChatStream, ChatStreamEvent, RetryPolicy, ToolCallRequest,
};
use crate::session::SessionConfigResolver;
use crate::utils::turns::{CancelToken, TurnGuard};
use futures_util::StreamExt;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 32;
const EMPTY_RESPONSE_RETRIES: usize = 2;
const EMPTY_RETRY_BASE_DELAY_MS: u64 = 200;
const MODEL_TEMPERATURE: f32 = 0.0;

/// Shared dependencies of every turn.
pub struct TurnDeps {
    pub resolver: Arc<SessionConfigResolver>,
    pub factory: Arc<AgentFactory>,
    pub checkpoints: Arc<dyn CheckpointStore>,
}

/// Per-invocation configuration. Every critical bound travels here
/// explicitly — nothing is inherited from agent compile time, so a compiled
/// agent can serve any tenant's turn.
struct TurnConfig {
    thread_id: String,
    user_id: String,
    recursion_limit: usize,
    #[allow(dead_code)]
    extra: Map<String, Value>,
}

/// Run one turn as a background task, returning its ordered event stream.
/// The `guard` (thread exclusivity + cancel token) is held until the
/// terminal event is emitted.
pub fn spawn_turn(
    deps: Arc<TurnDeps>,
    user_id: String,
    thread_id: String,
    message: String,
    guard: TurnGuard,
) -> ReceiverStream<TurnEvent> {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let cancel = guard.token();
        let emitter = Emitter { tx };
        let outcome = run_turn(&deps, &user_id, &thread_id, &message, &cancel, &emitter).await;
        let terminal = match outcome {
            Ok(messages) => TurnEvent::Done { messages },
            Err(ServerError::Cancelled) => TurnEvent::Stopped,
            Err(e) => {
                warn!("turn on {} failed: {}", thread_id, e);
                TurnEvent::Error {
                    kind: e.kind(),
                    detail: e.to_string(),
                }
            }
        };
        emitter.send_terminal(terminal).await;
        drop(guard);
    });
    ReceiverStream::new(rx)
}

struct Emitter {
    tx: mpsc::Sender<TurnEvent>,
}

impl Emitter {
    /// A failed send means the consumer is gone (client disconnect or
    /// transport write failure) — that is the cancel path.
    async fn send(&self, event: TurnEvent) -> ServerResult<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| ServerError::Cancelled)
    }

    async fn send_terminal(&self, event: TurnEvent) {
        let _ = self.tx.send(event).await;
    }
}

async fn run_turn(
    deps: &TurnDeps,
    user_id: &str,
    thread_id: &str,
    message: &str,
    cancel: &CancelToken,
    emitter: &Emitter,
) -> ServerResult<Vec<ThreadMessage>> {
    let config = deps.resolver.resolve(user_id, thread_id).await?;
    let agent = deps.factory.get_or_build(&AgentKey::from_config(&config));
    let turn = TurnConfig {
        thread_id: thread_id.to_string(),
        user_id: user_id.to_string(),
        recursion_limit: config.recursion_bound,
        extra: config.extra,
    };

    // Resume from the greatest checkpoint, if the thread has history.
    let mut last_sequence = None;
    let mut state = match deps.checkpoints.latest(thread_id).await? {
        Some(checkpoint) => {
            last_sequence = Some(checkpoint.sequence);
            AgentState::from_checkpoint_bytes(&checkpoint.payload)?
        }
        None => AgentState::new(),
    };
    let turn_start = state.messages.len();
    state.push_user(message);
    persist(&deps.checkpoints, thread_id, &state, &mut last_sequence).await?;

    let ctx = SessionContext::new(&turn.user_id, &turn.thread_id, cancel.clone());
    let definitions = agent.tools.definitions();
    let retry = RetryPolicy::default();

    let mut steps = 0usize;
    let mut empty_retries_left = EMPTY_RESPONSE_RETRIES;

    loop {
        if cancel.is_cancelled() {
            return Err(ServerError::Cancelled);
        }
        if steps >= turn.recursion_limit {
            info!(
                "turn on {} hit recursion bound of {}",
                turn.thread_id, turn.recursion_limit
            );
            return Err(ServerError::RecursionExceeded {
                limit: turn.recursion_limit,
            });
        }
        steps += 1;

        let mut wire = state.to_wire();
        for mw in agent.middleware.iter() {
            mw.before_model(&turn.thread_id, &mut wire);
        }
        let request = ChatRequest {
            messages: wire,
            tools: definitions.clone(),
            max_tokens: agent.max_output_tokens,
            temperature: MODEL_TEMPERATURE,
        };

        let stream = agent
            .provider
            .stream_chat_with_retry(request, &retry)
            .await?;
        let (mut draft, message_started) = consume_model_stream(stream, cancel, emitter).await?;
        for mw in agent.middleware.iter() {
            mw.after_model(&turn.thread_id, &mut draft);
        }

        if draft.tool_calls.is_empty() && draft.content.trim().is_empty() {
            if empty_retries_left > 0 {
                let attempt = EMPTY_RESPONSE_RETRIES - empty_retries_left;
                empty_retries_left -= 1;
                let delay = EMPTY_RETRY_BASE_DELAY_MS * 2u64.pow(attempt as u32);
                warn!(
                    "model returned empty output on step {} of {}; retrying in {}ms",
                    steps, turn.thread_id, delay
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
                continue;
            }
            return Err(ServerError::LlmInvalidResponse(
                "model returned empty output".to_string(),
            ));
        }

        // Inputs are final only after the repair pass.
        for call in &draft.tool_calls {
            emitter
                .send(TurnEvent::ToolInput {
                    tool_call_id: call.id.clone(),
                    input: call.arguments.clone(),
                })
                .await?;
        }
        if message_started {
            emitter.send(TurnEvent::MessageEnd).await?;
        }

        let records: Vec<ToolCallRecord> = draft
            .tool_calls
            .iter()
            .map(|call| ToolCallRecord {
                id: call.id.clone(),
                name: call.name.clone(),
                input: call.arguments.clone(),
                output: None,
                status: ToolCallStatus::Running,
            })
            .collect();
        state.push_assistant(draft.content.clone(), records);
        persist(&deps.checkpoints, thread_id, &state, &mut last_sequence).await?;

        if draft.tool_calls.is_empty() {
            let messages = state.reconcile_turn(turn_start);
            persist(&deps.checkpoints, thread_id, &state, &mut last_sequence).await?;
            debug!(
                "turn on {} finished in {} steps, {} messages",
                turn.thread_id,
                steps,
                messages.len()
            );
            return Ok(messages);
        }

        // Dispatch tools in parallel; their failures are inputs to the next
        // model step, never turn-level errors.
        let results = run_tools(&agent.tools, &draft.tool_calls, &ctx, cancel).await?;
        for (call, result) in draft.tool_calls.iter().zip(results) {
            let status = if result.is_error {
                ToolCallStatus::Failed
            } else {
                ToolCallStatus::Succeeded
            };
            let output = Value::String(result.content.clone());
            emitter
                .send(TurnEvent::ToolEnd {
                    tool_call_id: call.id.clone(),
                    output: output.clone(),
                    status,
                })
                .await?;
            emitter
                .send(TurnEvent::Content {
                    node: ContentNode::Tools,
                    delta: result.content.clone(),
                })
                .await?;
            state.complete_tool_call(&call.id, output, status);
            state.push_tool(&call.id, &call.name, result.content);
        }
        persist(&deps.checkpoints, thread_id, &state, &mut last_sequence).await?;
    }
}

/// Drain one model stream, emitting `message_start` lazily before the first
/// visible event, `content` for text deltas, and `tool_start` as calls open.
/// Returns the accumulated draft and whether a message bracket was opened.
async fn consume_model_stream(
    mut stream: ChatStream,
    cancel: &CancelToken,
    emitter: &Emitter,
) -> ServerResult<(ModelDraft, bool)> {
    struct RawSlot {
        id: String,
        name: String,
        arguments: String,
    }

    let mut content = String::new();
    let mut slots: Vec<Option<RawSlot>> = Vec::new();
    let mut started = false;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return Err(ServerError::Cancelled),
            item = stream.next() => match item {
                Some(Ok(ChatStreamEvent::ContentDelta(delta))) => {
                    if !started {
                        emitter.send(TurnEvent::MessageStart).await?;
                        started = true;
                    }
                    content.push_str(&delta);
                    emitter
                        .send(TurnEvent::Content {
                            node: ContentNode::Model,
                            delta,
                        })
                        .await?;
                }
                Some(Ok(ChatStreamEvent::ToolCallStart { index, id, name })) => {
                    if !started {
                        emitter.send(TurnEvent::MessageStart).await?;
                        started = true;
                    }
                    let id = if id.trim().is_empty() {
                        format!("call_{}", &Uuid::new_v4().simple().to_string()[..12])
                    } else {
                        id
                    };
                    while slots.len() <= index {
                        slots.push(None);
                    }
                    emitter
                        .send(TurnEvent::ToolStart {
                            tool_call_id: id.clone(),
                            tool_name: name.clone(),
                        })
                        .await?;
                    slots[index] = Some(RawSlot {
                        id,
                        name,
                        arguments: String::new(),
                    });
                }
                Some(Ok(ChatStreamEvent::ToolCallDelta { index, arguments })) => {
                    if let Some(Some(slot)) = slots.get_mut(index) {
                        slot.arguments.push_str(&arguments);
                    } else if let Some(slot) = slots.iter_mut().flatten().next_back() {
                        // Providers occasionally omit the index on
                        // continuation chunks; attach to the open call.
                        slot.arguments.push_str(&arguments);
                    }
                }
                Some(Ok(ChatStreamEvent::Finished { .. })) => break,
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }
    }

    let tool_calls = slots
        .into_iter()
        .flatten()
        .map(|slot| {
            let parsed = serde_json::from_str::<Value>(&slot.arguments).ok();
            ToolCallRequest {
                id: slot.id,
                name: slot.name,
                arguments: parsed.unwrap_or(Value::String(slot.arguments)),
            }
        })
        .collect();

    Ok((
        ModelDraft {
            content,
            tool_calls,
        },
        started,
    ))
}

/// Execute tool calls in parallel (spawn + join), racing the turn's cancel
/// token. Panics and join failures degrade to error results.
async fn run_tools(
    registry: &Arc<ToolRegistry>,
    calls: &[ToolCallRequest],
    ctx: &SessionContext,
    cancel: &CancelToken,
) -> ServerResult<Vec<ToolResult>> {
    let handles: Vec<_> = calls
        .iter()
        .map(|call| {
            let registry = registry.clone();
            let name = call.name.clone();
            let arguments = call.arguments.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { registry.execute(&name, arguments, &ctx).await })
        })
        .collect();

    tokio::select! {
        () = cancel.cancelled() => Err(ServerError::Cancelled),
        joined = futures_util::future::join_all(handles) => Ok(joined
            .into_iter()
            .map(|result| result.unwrap_or_else(|e| {
                ToolResult::error(format!("Tool crashed unexpectedly: {}", e))
            }))
            .collect()),
    }
}

/// Persist the full state as a new checkpoint, retrying once at the current
/// head when an external writer raced us.
async fn persist(
    checkpoints: &Arc<dyn CheckpointStore>,
    thread_id: &str,
    state: &AgentState,
    last_sequence: &mut Option<u64>,
) -> ServerResult<()> {
    let payload = state.to_checkpoint_bytes()?;
    match checkpoints.put(thread_id, *last_sequence, &payload).await {
        Ok(sequence) => {
            *last_sequence = Some(sequence);
            Ok(())
        }
        Err(raced @ ServerError::StaleParent { .. }) => {
            warn!("checkpoint write raced on {}: {}", thread_id, raced);
            let head = checkpoints
                .latest(thread_id)
                .await?
                .map(|c| c.sequence);
            let sequence = checkpoints.put(thread_id, head, &payload).await?;
            *last_sequence = Some(sequence);
            Ok(())
        }
        Err(e) => Err(e),
    }
}
