//! Per-thread task tracking exposed to the model as tools.
//!
//! The todo middleware surfaces the current list back into the prompt so
//! long tool chains keep their plan in view.

use crate::agent::tools::base::{SessionContext, Tool, ToolResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoItem {
    pub text: String,
    #[serde(default)]
    pub done: bool,
}

/// Shared per-thread todo lists. Lives for the server's lifetime; lists are
/// transient working state, not persisted with checkpoints.
#[derive(Default)]
pub struct TodoBoard {
    lists: Mutex<HashMap<String, Vec<TodoItem>>>,
}

impl TodoBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, thread_id: &str, items: Vec<TodoItem>) {
        let mut lists = self.lists.lock().unwrap_or_else(PoisonError::into_inner);
        lists.insert(thread_id.to_string(), items);
    }

    pub fn get(&self, thread_id: &str) -> Vec<TodoItem> {
        let lists = self.lists.lock().unwrap_or_else(PoisonError::into_inner);
        lists.get(thread_id).cloned().unwrap_or_default()
    }

    /// Render for prompt injection and `todo_read`.
    pub fn render(&self, thread_id: &str) -> Option<String> {
        let items = self.get(thread_id);
        if items.is_empty() {
            return None;
        }
        let mut out = String::from("Task list:\n");
        for item in &items {
            out.push_str(if item.done { "- [x] " } else { "- [ ] " });
            out.push_str(&item.text);
            out.push('\n');
        }
        Some(out)
    }
}

pub struct TodoWriteTool {
    board: Arc<TodoBoard>,
}

impl TodoWriteTool {
    pub fn new(board: Arc<TodoBoard>) -> Self {
        Self { board }
    }
}

#[async_trait]
impl Tool for TodoWriteTool {
    fn name(&self) -> &str {
        "todo_write"
    }

    fn description(&self) -> &str {
        "Replace your task list for this conversation. Use it to plan \
         multi-step work and mark finished steps done."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "items": {
                    "type": "array",
                    "description": "The full task list, in order",
                    "items": {
                        "type": "object",
                        "properties": {
                            "text": {"type": "string"},
                            "done": {"type": "boolean"}
                        },
                        "required": ["text"]
                    }
                }
            },
            "required": ["items"]
        })
    }

    async fn execute(&self, params: Value, ctx: &SessionContext) -> anyhow::Result<ToolResult> {
        let items: Vec<TodoItem> = serde_json::from_value(params["items"].clone())
            .map_err(|e| anyhow::anyhow!("invalid items: {}", e))?;
        let count = items.len();
        self.board.replace(&ctx.thread_id, items);
        Ok(ToolResult::new(format!("Task list updated ({} items)", count)))
    }
}

pub struct TodoReadTool {
    board: Arc<TodoBoard>,
}

impl TodoReadTool {
    pub fn new(board: Arc<TodoBoard>) -> Self {
        Self { board }
    }
}

#[async_trait]
impl Tool for TodoReadTool {
    fn name(&self) -> &str {
        "todo_read"
    }

    fn description(&self) -> &str {
        "Read your current task list for this conversation."
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _params: Value, ctx: &SessionContext) -> anyhow::Result<ToolResult> {
        Ok(ToolResult::new(
            self.board
                .render(&ctx.thread_id)
                .unwrap_or_else(|| "Task list is empty".to_string()),
        ))
    }
}
