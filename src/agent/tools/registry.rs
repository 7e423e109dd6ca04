use crate::agent::tools::base::{SessionContext, Tool, ToolResult};
use crate::providers::base::ToolDefinition;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Display cap applied to every tool result before it re-enters the model.
const MAX_RESULT_CHARS: usize = 10_000;

pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            warn!("tool registry: overwriting duplicate tool '{}'", name);
        }
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Declarative catalog handed to the LLM, sorted for determinism.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool call end to end: unknown-tool handling, schema
    /// validation, spawned execution with timeout and panic isolation,
    /// then result truncation. Failures come back as error results — the
    /// turn continues and the model sees the diagnostic.
    pub async fn execute(&self, name: &str, params: Value, ctx: &SessionContext) -> ToolResult {
        let Some(tool) = self.get(name) else {
            warn!("model called unknown tool: {}", name);
            return ToolResult::error(format!(
                "Error: tool '{}' does not exist. Available tools: {}",
                name,
                self.names().join(", ")
            ));
        };

        if let Some(validation_error) = validate_tool_params(tool.as_ref(), &params) {
            warn!("tool '{}' param validation failed: {}", name, validation_error);
            return ToolResult::error(validation_error);
        }

        let started = Instant::now();
        let mut result = self.execute_with_guards(name, tool, params, ctx).await;
        result.content = truncate_result(&result.content, MAX_RESULT_CHARS);

        if result.is_error {
            warn!("tool '{}' returned error: {}", name, result.content);
        } else {
            info!(
                "tool '{}' completed in {:?} ({} chars)",
                name,
                started.elapsed(),
                result.content.len()
            );
        }
        result
    }

    /// Run the tool in a spawned task so a panicking handler cannot take the
    /// turn down, bounded by the tool's own timeout.
    async fn execute_with_guards(
        &self,
        name: &str,
        tool: Arc<dyn Tool>,
        params: Value,
        ctx: &SessionContext,
    ) -> ToolResult {
        let tool_name = name.to_string();
        let ctx = ctx.clone();
        let timeout = tool.execution_timeout();
        let timeout_secs = timeout.as_secs();

        let handle = tokio::task::spawn(async move {
            tokio::time::timeout(timeout, tool.execute(params, &ctx)).await
        });

        match handle.await {
            Ok(Ok(Ok(result))) => result,
            Ok(Ok(Err(e))) => {
                debug!("tool '{}' failed: {}", tool_name, e);
                ToolResult::error(format!("Tool execution failed: {}", e))
            }
            Ok(Err(_)) => {
                warn!("tool '{}' timed out after {}s", tool_name, timeout_secs);
                ToolResult::error(format!(
                    "Tool '{}' timed out after {}s",
                    tool_name, timeout_secs
                ))
            }
            Err(join_err) if join_err.is_panic() => {
                error!("tool '{}' panicked: {:?}", tool_name, join_err);
                ToolResult::error(format!("Tool '{}' crashed unexpectedly", tool_name))
            }
            Err(_) => ToolResult::error(format!("Tool '{}' was cancelled", tool_name)),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate tool arguments against the tool's JSON schema.
/// Checks: (1) required fields are present, (2) field types match schema.
/// Returns None if valid, `Some(error_message)` if invalid.
pub fn validate_tool_params(tool: &dyn Tool, params: &Value) -> Option<String> {
    let schema = tool.parameters();
    let mut errors = Vec::new();

    if let Some(required) = schema["required"].as_array() {
        for field in required {
            if let Some(field_name) = field.as_str()
                && (params.get(field_name).is_none() || params[field_name].is_null())
            {
                errors.push(format!("missing required parameter '{}'", field_name));
            }
        }
    }

    if let Some(properties) = schema["properties"].as_object() {
        for (field_name, field_schema) in properties {
            if let Some(value) = params.get(field_name)
                && !value.is_null()
                && let Some(expected_type) = field_schema["type"].as_str()
            {
                let type_ok = match expected_type {
                    "string" => value.is_string(),
                    "number" | "integer" => value.is_number(),
                    "boolean" => value.is_boolean(),
                    "array" => value.is_array(),
                    "object" => value.is_object(),
                    _ => true,
                };
                if !type_ok {
                    errors.push(format!(
                        "parameter '{}' should be {} but got {}",
                        field_name,
                        expected_type,
                        value_type_name(value)
                    ));
                }
            }
        }
    }

    if errors.is_empty() {
        None
    } else {
        Some(format!(
            "Invalid arguments for tool '{}': {}",
            tool.name(),
            errors.join("; ")
        ))
    }
}

fn value_type_name(v: &Value) -> &'static str {
    match v {
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Bool(_) => "boolean",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
        Value::Null => "null",
    }
}

/// Truncate at a character budget without splitting a UTF-8 boundary,
/// marking the cut.
fn truncate_result(content: &str, max_chars: usize) -> String {
    if content.len() <= max_chars {
        return content.to_string();
    }
    let mut end = max_chars;
    while end > 0 && !content.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}\n... [truncated, {} bytes total]",
        &content[..end],
        content.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echo back the message"
        }
        fn parameters(&self) -> Value {
            json!({
                "type": "object",
                "properties": {
                    "message": {"type": "string"},
                    "count": {"type": "integer"}
                },
                "required": ["message"]
            })
        }
        async fn execute(
            &self,
            params: Value,
            _ctx: &SessionContext,
        ) -> anyhow::Result<ToolResult> {
            Ok(ToolResult::new(
                params["message"].as_str().unwrap_or_default().to_string(),
            ))
        }
    }

    struct PanickingTool;

    #[async_trait]
    impl Tool for PanickingTool {
        fn name(&self) -> &str {
            "panics"
        }
        fn description(&self) -> &str {
            "always panics"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        async fn execute(
            &self,
            _params: Value,
            _ctx: &SessionContext,
        ) -> anyhow::Result<ToolResult> {
            panic!("handler bug")
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(PanickingTool));
        registry
    }

    #[tokio::test]
    async fn executes_registered_tool() {
        let ctx = SessionContext::detached("u1", "t1");
        let result = registry()
            .execute("echo", json!({"message": "hi"}), &ctx)
            .await;
        assert!(!result.is_error);
        assert_eq!(result.content, "hi");
    }

    #[tokio::test]
    async fn unknown_tool_lists_available() {
        let ctx = SessionContext::detached("u1", "t1");
        let result = registry().execute("nope", json!({}), &ctx).await;
        assert!(result.is_error);
        assert!(result.content.contains("does not exist"));
        assert!(result.content.contains("echo"));
    }

    #[tokio::test]
    async fn missing_required_param_is_rejected() {
        let ctx = SessionContext::detached("u1", "t1");
        let result = registry().execute("echo", json!({}), &ctx).await;
        assert!(result.is_error);
        assert!(result.content.contains("missing required parameter 'message'"));
    }

    #[tokio::test]
    async fn wrong_type_is_rejected() {
        let ctx = SessionContext::detached("u1", "t1");
        let result = registry()
            .execute("echo", json!({"message": "x", "count": "three"}), &ctx)
            .await;
        assert!(result.is_error);
        assert!(result.content.contains("should be integer"));
    }

    #[tokio::test]
    async fn panicking_handler_is_contained() {
        let ctx = SessionContext::detached("u1", "t1");
        let result = registry().execute("panics", json!({}), &ctx).await;
        assert!(result.is_error);
        assert!(result.content.contains("crashed"));
    }

    #[test]
    fn truncation_marks_the_cut() {
        let long = "x".repeat(20_000);
        let cut = truncate_result(&long, 100);
        assert!(cut.len() < 200);
        assert!(cut.contains("[truncated, 20000 bytes total]"));
        assert_eq!(truncate_result("short", 100), "short");
    }

    #[test]
    fn definitions_are_sorted() {
        let defs = registry().definitions();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].name, "echo");
        assert_eq!(defs[1].name, "panics");
    }
}
