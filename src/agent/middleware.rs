//! Agent middleware: a linear stack of before-model / after-model hooks.
//!
//! Middleware never holds a reference to the agent that runs it; the loop
//! passes state through the stack in order on the way into the model and in
//! reverse order is unnecessary — hooks are independent.

use crate::agent::tools::Tool;
use crate::agent::tools::todo::{TodoBoard, TodoReadTool, TodoWriteTool};
use crate::providers::base::{ChatMessage, ToolCallRequest};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// The model's complete output for one step, after streaming finished and
/// before tool dispatch. `after_model` hooks normalize it in place.
#[derive(Debug, Default, Clone)]
pub struct ModelDraft {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
}

pub trait AgentMiddleware: Send + Sync {
    fn name(&self) -> &str;

    /// Adjust the wire messages about to be sent to the model.
    fn before_model(&self, _thread_id: &str, _messages: &mut Vec<ChatMessage>) {}

    /// Normalize the model's finished output before tool dispatch.
    fn after_model(&self, _thread_id: &str, _draft: &mut ModelDraft) {}

    /// Tools this middleware contributes to the agent's tool set.
    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// Todo middleware
// ---------------------------------------------------------------------------

/// Exposes task-tracking tools and reminds the model of its open items.
pub struct TodoMiddleware {
    board: Arc<TodoBoard>,
}

impl TodoMiddleware {
    pub fn new(board: Arc<TodoBoard>) -> Self {
        Self { board }
    }
}

impl AgentMiddleware for TodoMiddleware {
    fn name(&self) -> &str {
        "todo"
    }

    fn before_model(&self, thread_id: &str, messages: &mut Vec<ChatMessage>) {
        if let Some(rendered) = self.board.render(thread_id) {
            messages.push(ChatMessage::system(format!(
                "{}\nUpdate the list with todo_write as you make progress.",
                rendered
            )));
        }
    }

    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        vec![
            Arc::new(TodoWriteTool::new(self.board.clone())),
            Arc::new(TodoReadTool::new(self.board.clone())),
        ]
    }
}

// ---------------------------------------------------------------------------
// Summarization middleware
// ---------------------------------------------------------------------------

const CHARS_PER_TOKEN_ESTIMATE: usize = 4;
const DEFAULT_SUMMARIZE_THRESHOLD_TOKENS: usize = 24_000;
const DEFAULT_KEEP_RECENT_MESSAGES: usize = 6;
const SUMMARY_SNIPPET_CHARS: usize = 120;

/// When the estimated context size crosses the threshold, earlier messages
/// are rewritten into a single summary while the most recent K stay
/// verbatim. The digest is deterministic — no extra model call inside a
/// turn.
pub struct SummarizationMiddleware {
    threshold_tokens: usize,
    keep_recent: usize,
}

impl SummarizationMiddleware {
    pub fn new(threshold_tokens: usize, keep_recent: usize) -> Self {
        Self {
            threshold_tokens,
            keep_recent,
        }
    }
}

impl Default for SummarizationMiddleware {
    fn default() -> Self {
        Self::new(DEFAULT_SUMMARIZE_THRESHOLD_TOKENS, DEFAULT_KEEP_RECENT_MESSAGES)
    }
}

pub fn estimate_tokens(messages: &[ChatMessage]) -> usize {
    messages
        .iter()
        .map(|m| m.content.len() / CHARS_PER_TOKEN_ESTIMATE + 4)
        .sum()
}

fn snippet(text: &str) -> String {
    let trimmed = text.trim().replace('\n', " ");
    if trimmed.len() <= SUMMARY_SNIPPET_CHARS {
        return trimmed;
    }
    let mut end = SUMMARY_SNIPPET_CHARS;
    while end > 0 && !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &trimmed[..end])
}

impl AgentMiddleware for SummarizationMiddleware {
    fn name(&self) -> &str {
        "summarization"
    }

    fn before_model(&self, thread_id: &str, messages: &mut Vec<ChatMessage>) {
        if estimate_tokens(messages) <= self.threshold_tokens {
            return;
        }
        if messages.len() <= self.keep_recent + 1 {
            return;
        }

        // Keep any leading system prompt, digest the middle, keep the tail.
        let lead = usize::from(messages.first().is_some_and(|m| m.role == "system"));
        let tail_start = messages.len() - self.keep_recent;
        if tail_start <= lead {
            return;
        }

        let digested: Vec<String> = messages[lead..tail_start]
            .iter()
            .filter(|m| !m.content.is_empty())
            .map(|m| format!("- {}: {}", m.role, snippet(&m.content)))
            .collect();
        let summary = ChatMessage::system(format!(
            "Earlier conversation summary ({} messages):\n{}",
            tail_start - lead,
            digested.join("\n")
        ));

        let tail: Vec<ChatMessage> = messages.drain(tail_start..).collect();
        messages.truncate(lead);
        messages.push(summary);
        messages.extend(tail);
        debug!(
            "summarized context for thread {}: {} messages kept verbatim",
            thread_id, self.keep_recent
        );
    }
}

// ---------------------------------------------------------------------------
// Tool-call repair middleware
// ---------------------------------------------------------------------------

/// Normalizes malformed tool-call payloads from the model: string-encoded
/// JSON arguments, missing or duplicate call ids, and non-object inputs.
pub struct ToolCallRepairMiddleware;

impl AgentMiddleware for ToolCallRepairMiddleware {
    fn name(&self) -> &str {
        "tool-call-repair"
    }

    fn after_model(&self, thread_id: &str, draft: &mut ModelDraft) {
        let mut seen: HashSet<String> = HashSet::new();
        for call in &mut draft.tool_calls {
            call.arguments = repair_arguments(std::mem::take(&mut call.arguments));

            if call.id.trim().is_empty() {
                call.id = format!("call_{}", &Uuid::new_v4().simple().to_string()[..12]);
                warn!(
                    "repaired missing tool call id for '{}' on thread {}",
                    call.name, thread_id
                );
            }
            let mut candidate = call.id.clone();
            let mut suffix = 2;
            while !seen.insert(candidate.clone()) {
                candidate = format!("{}_{}", call.id, suffix);
                suffix += 1;
            }
            if candidate != call.id {
                warn!("repaired duplicate tool call id '{}' on thread {}", call.id, thread_id);
                call.id = candidate;
            }
        }
    }
}

/// Arguments must end up as a JSON object. String payloads are parsed (the
/// common streaming shape), other scalars wrapped, garbage preserved under
/// a `raw` key so the handler can still see it.
fn repair_arguments(arguments: Value) -> Value {
    match arguments {
        Value::Object(map) => Value::Object(map),
        Value::Null => Value::Object(Map::new()),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Value::Object(Map::new());
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(Value::Object(map)) => Value::Object(map),
                Ok(other) => wrap_value(other),
                Err(_) => {
                    let mut map = Map::new();
                    map.insert("raw".to_string(), Value::String(s));
                    Value::Object(map)
                }
            }
        }
        other => wrap_value(other),
    }
}

fn wrap_value(value: Value) -> Value {
    let mut map = Map::new();
    map.insert("value".to_string(), value);
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(id: &str, args: Value) -> ToolCallRequest {
        ToolCallRequest {
            id: id.to_string(),
            name: "shell_exec".to_string(),
            arguments: args,
        }
    }

    #[test]
    fn repair_parses_string_encoded_arguments() {
        let repaired = repair_arguments(json!("{\"command\": \"ls\"}"));
        assert_eq!(repaired, json!({"command": "ls"}));
    }

    #[test]
    fn repair_wraps_garbage_under_raw() {
        let repaired = repair_arguments(json!("{not json"));
        assert_eq!(repaired, json!({"raw": "{not json"}));
    }

    #[test]
    fn repair_empty_and_null_become_empty_object() {
        assert_eq!(repair_arguments(json!("")), json!({}));
        assert_eq!(repair_arguments(Value::Null), json!({}));
    }

    #[test]
    fn repair_wraps_non_object_scalars() {
        assert_eq!(repair_arguments(json!(42)), json!({"value": 42}));
        assert_eq!(repair_arguments(json!("\"ls\"")), json!({"value": "ls"}));
    }

    #[test]
    fn missing_and_duplicate_ids_are_fixed() {
        let mw = ToolCallRepairMiddleware;
        let mut draft = ModelDraft {
            content: String::new(),
            tool_calls: vec![
                call("", json!({})),
                call("tc1", json!({})),
                call("tc1", json!({})),
            ],
        };
        mw.after_model("t1", &mut draft);

        assert!(!draft.tool_calls[0].id.is_empty());
        let ids: HashSet<&str> = draft.tool_calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids.len(), 3, "ids must be unique after repair");
        assert_eq!(draft.tool_calls[1].id, "tc1");
        assert_eq!(draft.tool_calls[2].id, "tc1_2");
    }

    #[test]
    fn summarization_is_a_noop_below_threshold() {
        let mw = SummarizationMiddleware::new(1000, 2);
        let mut messages = vec![ChatMessage::user("short")];
        let before = messages.len();
        mw.before_model("t1", &mut messages);
        assert_eq!(messages.len(), before);
    }

    #[test]
    fn summarization_digests_older_messages() {
        // Threshold of 0 forces the rewrite
        let mw = SummarizationMiddleware::new(0, 2);
        let mut messages = vec![
            ChatMessage::system("sys prompt"),
            ChatMessage::user("first question"),
            ChatMessage::assistant("first answer", None),
            ChatMessage::user("second question"),
            ChatMessage::assistant("second answer", None),
        ];
        mw.before_model("t1", &mut messages);

        // lead system + summary + last 2 verbatim
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].content, "sys prompt");
        assert!(messages[1].content.contains("Earlier conversation summary"));
        assert!(messages[1].content.contains("first question"));
        assert_eq!(messages[2].content, "second question");
        assert_eq!(messages[3].content, "second answer");
    }

    #[test]
    fn summarization_is_deterministic() {
        let mw = SummarizationMiddleware::new(0, 1);
        let build = || {
            vec![
                ChatMessage::user("alpha"),
                ChatMessage::assistant("beta", None),
                ChatMessage::user("gamma"),
            ]
        };
        let mut a = build();
        let mut b = build();
        mw.before_model("t1", &mut a);
        mw.before_model("t1", &mut b);
        let render = |ms: &[ChatMessage]| {
            ms.iter()
                .map(|m| format!("{}:{}", m.role, m.content))
                .collect::<Vec<_>>()
                .join("|")
        };
        assert_eq!(render(&a), render(&b));
    }

    #[test]
    fn todo_middleware_injects_reminder() {
        let board = Arc::new(TodoBoard::new());
        board.replace(
            "t1",
            vec![crate::agent::tools::todo::TodoItem {
                text: "inspect data".into(),
                done: false,
            }],
        );
        let mw = TodoMiddleware::new(board);
        let mut messages = vec![ChatMessage::user("go on")];
        mw.before_model("t1", &mut messages);
        assert_eq!(messages.len(), 2);
        assert!(messages[1].content.contains("inspect data"));

        // Other threads see no reminder
        let mut other = vec![ChatMessage::user("hi")];
        mw.before_model("t2", &mut other);
        assert_eq!(other.len(), 1);
    }

    #[test]
    fn todo_middleware_contributes_tools() {
        let mw = TodoMiddleware::new(Arc::new(TodoBoard::new()));
        let names: Vec<String> = mw.tools().iter().map(|t| t.name().to_string()).collect();
        assert!(names.contains(&"todo_write".to_string()));
        assert!(names.contains(&"todo_read".to_string()));
    }
}
