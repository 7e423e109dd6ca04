use crate::agent::message::ThreadMessage;
use crate::errors::ErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which graph node produced a `content` delta: the model itself or a
/// tool-side observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentNode {
    Model,
    Tools,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Public event taxonomy of one turn. Every event becomes exactly one
/// transport frame; a turn's stream ends with exactly one of `done`,
/// `stopped`, or `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// A new assistant message begins.
    MessageStart,
    /// A chunk of assistant text or a tool observation.
    Content { node: ContentNode, delta: String },
    /// The agent emitted a tool call; input not finalized yet.
    ToolStart {
        tool_call_id: String,
        tool_name: String,
    },
    /// Final input arguments for the call.
    ToolInput { tool_call_id: String, input: Value },
    /// The tool returned (or failed).
    ToolEnd {
        tool_call_id: String,
        output: Value,
        status: ToolCallStatus,
    },
    /// The current assistant message is complete.
    MessageEnd,
    /// Terminal success with the reconciled message list for this turn.
    Done { messages: Vec<ThreadMessage> },
    /// Terminal after client-initiated cancel.
    Stopped,
    /// Terminal failure.
    Error { kind: ErrorKind, detail: String },
}

impl TurnEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Stopped | Self::Error { .. })
    }
}
