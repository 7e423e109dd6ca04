//! Core message model and checkpointable agent state.
//!
//! Messages are a tagged variant with one canonical set of role tags;
//! role strings only appear at the edges (provider wire format,
//! serialized checkpoints).

use crate::agent::events::ToolCallStatus;
use crate::providers::base::{ChatMessage, ToolCallRequest};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A tool call emitted by an assistant message, tracked through its
/// start → input → end lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub status: ToolCallStatus,
}

/// One ordered item of a thread's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ThreadMessage {
    User {
        id: String,
        content: String,
        created_at: DateTime<Utc>,
        order_index: u64,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        metadata: Map<String, Value>,
    },
    Assistant {
        id: String,
        content: String,
        created_at: DateTime<Utc>,
        order_index: u64,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCallRecord>,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        metadata: Map<String, Value>,
    },
    Tool {
        id: String,
        tool_call_id: String,
        tool_name: String,
        content: String,
        created_at: DateTime<Utc>,
        order_index: u64,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        metadata: Map<String, Value>,
    },
}

impl ThreadMessage {
    pub fn order_index(&self) -> u64 {
        match self {
            Self::User { order_index, .. }
            | Self::Assistant { order_index, .. }
            | Self::Tool { order_index, .. } => *order_index,
        }
    }

    fn set_order_index(&mut self, value: u64) {
        match self {
            Self::User { order_index, .. }
            | Self::Assistant { order_index, .. }
            | Self::Tool { order_index, .. } => *order_index = value,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::User { content, .. }
            | Self::Assistant { content, .. }
            | Self::Tool { content, .. } => content,
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Self::User { .. })
    }

    /// An assistant message with no text and no tool calls is a transient
    /// artifact of tool-only turns and is pruned at reconciliation.
    fn is_empty_assistant(&self) -> bool {
        matches!(
            self,
            Self::Assistant {
                content,
                tool_calls,
                ..
            } if content.is_empty() && tool_calls.is_empty()
        )
    }
}

fn message_id() -> String {
    Uuid::new_v4().to_string()
}

/// The full recoverable conversation state of a thread. Serialized whole
/// into each checkpoint payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentState {
    pub messages: Vec<ThreadMessage>,
    next_order: u64,
}

impl AgentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_checkpoint_bytes(payload: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(payload).context("failed to decode checkpoint payload")
    }

    pub fn to_checkpoint_bytes(&self) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(self).context("failed to encode checkpoint payload")
    }

    fn next_index(&mut self) -> u64 {
        let index = self.next_order;
        self.next_order += 1;
        index
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        let order_index = self.next_index();
        self.messages.push(ThreadMessage::User {
            id: message_id(),
            content: content.into(),
            created_at: Utc::now(),
            order_index,
            metadata: Map::new(),
        });
    }

    pub fn push_assistant(
        &mut self,
        content: impl Into<String>,
        tool_calls: Vec<ToolCallRecord>,
    ) {
        let order_index = self.next_index();
        self.messages.push(ThreadMessage::Assistant {
            id: message_id(),
            content: content.into(),
            created_at: Utc::now(),
            order_index,
            tool_calls,
            metadata: Map::new(),
        });
    }

    pub fn push_tool(
        &mut self,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) {
        let order_index = self.next_index();
        self.messages.push(ThreadMessage::Tool {
            id: message_id(),
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            content: content.into(),
            created_at: Utc::now(),
            order_index,
            metadata: Map::new(),
        });
    }

    /// Record a completed tool call's output on the assistant message that
    /// emitted it.
    pub fn complete_tool_call(&mut self, call_id: &str, output: Value, status: ToolCallStatus) {
        for message in self.messages.iter_mut().rev() {
            if let ThreadMessage::Assistant { tool_calls, .. } = message
                && let Some(record) = tool_calls.iter_mut().find(|tc| tc.id == call_id)
            {
                record.output = Some(output);
                record.status = status;
                return;
            }
        }
    }

    /// Convert the history into the provider wire format. Role strings exist
    /// only past this edge.
    pub fn to_wire(&self) -> Vec<ChatMessage> {
        self.messages
            .iter()
            .map(|message| match message {
                ThreadMessage::User { content, .. } => ChatMessage::user(content.clone()),
                ThreadMessage::Assistant {
                    content,
                    tool_calls,
                    ..
                } => {
                    let calls = if tool_calls.is_empty() {
                        None
                    } else {
                        Some(
                            tool_calls
                                .iter()
                                .map(|tc| ToolCallRequest {
                                    id: tc.id.clone(),
                                    name: tc.name.clone(),
                                    arguments: tc.input.clone(),
                                })
                                .collect(),
                        )
                    };
                    ChatMessage::assistant(content.clone(), calls)
                }
                ThreadMessage::Tool {
                    tool_call_id,
                    content,
                    ..
                } => ChatMessage::tool_result(tool_call_id.clone(), content.clone()),
            })
            .collect()
    }

    /// Finalization reconciliation: drop empty assistant artifacts and
    /// re-assert strictly increasing order indexes, then return the
    /// messages of the current turn (from the given start index).
    pub fn reconcile_turn(&mut self, turn_start: usize) -> Vec<ThreadMessage> {
        self.messages.retain(|m| !m.is_empty_assistant());
        for (index, message) in self.messages.iter_mut().enumerate() {
            message.set_order_index(index as u64);
        }
        self.next_order = self.messages.len() as u64;
        let start = turn_start.min(self.messages.len());
        self.messages[start..].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn role_tags_serialize_canonically() {
        let mut state = AgentState::new();
        state.push_user("hi");
        state.push_assistant("hello", vec![]);
        state.push_tool("tc1", "shell_exec", "out");

        let values: Vec<Value> = state
            .messages
            .iter()
            .map(|m| serde_json::to_value(m).unwrap())
            .collect();
        assert_eq!(values[0]["role"], "user");
        assert_eq!(values[1]["role"], "assistant");
        assert_eq!(values[2]["role"], "tool");
        assert_eq!(values[2]["tool_call_id"], "tc1");
    }

    #[test]
    fn order_indexes_are_monotonic() {
        let mut state = AgentState::new();
        for i in 0..5 {
            state.push_user(format!("m{}", i));
        }
        let indexes: Vec<u64> = state.messages.iter().map(ThreadMessage::order_index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn checkpoint_round_trip_preserves_state() {
        let mut state = AgentState::new();
        state.push_user("question");
        state.push_assistant(
            "answer",
            vec![ToolCallRecord {
                id: "tc1".into(),
                name: "read_file".into(),
                input: json!({"path": "a.txt"}),
                output: Some(json!("contents")),
                status: ToolCallStatus::Succeeded,
            }],
        );

        let bytes = state.to_checkpoint_bytes().unwrap();
        let restored = AgentState::from_checkpoint_bytes(&bytes).unwrap();
        assert_eq!(restored.messages, state.messages);
        // Restored state keeps allocating fresh order indexes
        let mut restored = restored;
        restored.push_user("next");
        assert_eq!(restored.messages.last().unwrap().order_index(), 2);
    }

    #[test]
    fn reconcile_prunes_empty_assistants_and_reindexes() {
        let mut state = AgentState::new();
        state.push_user("q");
        state.push_assistant("", vec![]); // transient artifact
        state.push_assistant(
            "",
            vec![ToolCallRecord {
                id: "tc1".into(),
                name: "shell_exec".into(),
                input: json!({}),
                output: None,
                status: ToolCallStatus::Pending,
            }],
        ); // kept: has tool calls
        state.push_tool("tc1", "shell_exec", "out");

        let turn = state.reconcile_turn(0);
        assert_eq!(turn.len(), 3);
        let indexes: Vec<u64> = turn.iter().map(ThreadMessage::order_index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert!(turn.windows(2).all(|w| w[0].order_index() < w[1].order_index()));
    }

    #[test]
    fn complete_tool_call_updates_matching_record() {
        let mut state = AgentState::new();
        state.push_assistant(
            "",
            vec![ToolCallRecord {
                id: "tc9".into(),
                name: "shell_exec".into(),
                input: json!({"command": "ls"}),
                output: None,
                status: ToolCallStatus::Running,
            }],
        );
        state.complete_tool_call("tc9", json!("listing"), ToolCallStatus::Succeeded);
        let ThreadMessage::Assistant { tool_calls, .. } = &state.messages[0] else {
            panic!("expected assistant");
        };
        assert_eq!(tool_calls[0].output, Some(json!("listing")));
        assert_eq!(tool_calls[0].status, ToolCallStatus::Succeeded);
    }

    #[test]
    fn wire_conversion_maps_roles_and_calls() {
        let mut state = AgentState::new();
        state.push_user("q");
        state.push_assistant(
            "working",
            vec![ToolCallRecord {
                id: "tc1".into(),
                name: "shell_exec".into(),
                input: json!({"command": "ls"}),
                output: None,
                status: ToolCallStatus::Pending,
            }],
        );
        state.push_tool("tc1", "shell_exec", "files");

        let wire = state.to_wire();
        assert_eq!(wire[0].role, "user");
        assert_eq!(wire[1].role, "assistant");
        let calls = wire[1].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].name, "shell_exec");
        assert_eq!(wire[2].role, "tool");
        assert_eq!(wire[2].tool_call_id.as_deref(), Some("tc1"));
    }
}
