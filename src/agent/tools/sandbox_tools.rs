//! Sandbox-backed tools: shell execution and workspace file access.
//!
//! Every operation is pinned to the calling user's workspace by the sandbox
//! itself; these handlers only shape inputs and outputs for the model.

use crate::agent::tools::base::{SessionContext, Tool, ToolResult};
use crate::config::SandboxSettings;
use crate::errors::{ErrorKind, ServerError};
use crate::sandbox::SandboxSurface;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Display cap for `read_file` output handed back to the model.
const READ_FILE_MAX_CHARS: usize = 4000;

fn tagged_error(e: &ServerError) -> ToolResult {
    ToolResult::error(format!("[{}] {}", e.kind().as_str(), e))
}

/// Run a sandbox operation with the single-retry contract for a sandbox
/// that went away mid-flight: re-ensure once, then surface the failure.
async fn with_sandbox_retry<T, F, Fut>(sandbox: &Arc<dyn SandboxSurface>, op: F) -> Result<T, ServerError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, ServerError>>,
{
    match op().await {
        Err(e) if e.kind() == ErrorKind::SandboxUnavailable => {
            warn!("sandbox unavailable, re-ensuring once: {}", e);
            sandbox.ensure().await?;
            op().await
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// shell_exec
// ---------------------------------------------------------------------------

pub struct ShellExecTool {
    sandbox: Arc<dyn SandboxSurface>,
    default_timeout_secs: u64,
    max_timeout_secs: u64,
}

impl ShellExecTool {
    pub fn new(sandbox: Arc<dyn SandboxSurface>, settings: &SandboxSettings) -> Self {
        Self {
            sandbox,
            default_timeout_secs: settings.exec_timeout_default_secs,
            max_timeout_secs: settings.exec_timeout_max_secs,
        }
    }
}

#[async_trait]
impl Tool for ShellExecTool {
    fn name(&self) -> &str {
        "shell_exec"
    }

    fn description(&self) -> &str {
        "Execute a bash command in your isolated workspace. Standard Linux \
         tools are available; paths are relative to the workspace root. \
         Output is captured up to a size cap."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The bash command to execute"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds (default 30)"
                }
            },
            "required": ["command"]
        })
    }

    fn execution_timeout(&self) -> Duration {
        // The sandbox watchdog owns the real bound; leave headroom above it.
        Duration::from_secs(self.max_timeout_secs + 30)
    }

    async fn execute(&self, params: Value, ctx: &SessionContext) -> anyhow::Result<ToolResult> {
        let command = params["command"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'command' parameter"))?
            .to_string();
        let timeout = params["timeout"]
            .as_u64()
            .unwrap_or(self.default_timeout_secs)
            .min(self.max_timeout_secs);

        let result = with_sandbox_retry(&self.sandbox, || {
            self.sandbox.exec(&ctx.user_id, &command, timeout, &ctx.cancel)
        })
        .await;

        match result {
            Ok(output) => {
                let rendered = output.render();
                if output.exit_code == 0 {
                    Ok(ToolResult::new(rendered))
                } else {
                    Ok(ToolResult::error(rendered))
                }
            }
            Err(ServerError::Cancelled) => Err(ServerError::Cancelled.into()),
            Err(e) => Ok(tagged_error(&e)),
        }
    }
}

// ---------------------------------------------------------------------------
// write_file
// ---------------------------------------------------------------------------

pub struct WriteFileTool {
    sandbox: Arc<dyn SandboxSurface>,
}

impl WriteFileTool {
    pub fn new(sandbox: Arc<dyn SandboxSurface>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write text content to a file in your workspace. Mode 'overwrite' \
         replaces the file, 'append' adds to the end."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Workspace-relative file path"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write"
                },
                "mode": {
                    "type": "string",
                    "enum": ["overwrite", "append"],
                    "description": "Write mode (default overwrite)"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, params: Value, ctx: &SessionContext) -> anyhow::Result<ToolResult> {
        let path = params["path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'path' parameter"))?
            .to_string();
        let content = params["content"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'content' parameter"))?
            .to_string();
        let append = params["mode"].as_str() == Some("append");

        let bytes = if append {
            // Read-modify-write; a missing file appends onto nothing.
            let existing = match self.sandbox.get_file(&ctx.user_id, &path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == ErrorKind::PathEscape => return Ok(tagged_error(&e)),
                Err(_) => Vec::new(),
            };
            let mut combined = existing;
            combined.extend_from_slice(content.as_bytes());
            combined
        } else {
            content.clone().into_bytes()
        };

        let result = with_sandbox_retry(&self.sandbox, || {
            self.sandbox.put_file(&ctx.user_id, &path, &bytes)
        })
        .await;

        match result {
            Ok(()) => Ok(ToolResult::new(format!(
                "Wrote {} bytes to {} ({})",
                bytes.len(),
                path,
                if append { "append" } else { "overwrite" }
            ))),
            Err(e) => Ok(tagged_error(&e)),
        }
    }
}

// ---------------------------------------------------------------------------
// read_file
// ---------------------------------------------------------------------------

pub struct ReadFileTool {
    sandbox: Arc<dyn SandboxSurface>,
    max_chars: usize,
}

impl ReadFileTool {
    pub fn new(sandbox: Arc<dyn SandboxSurface>) -> Self {
        Self {
            sandbox,
            max_chars: READ_FILE_MAX_CHARS,
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from your workspace. Long files are truncated; use \
         shell_exec with head/tail/grep for targeted reads."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Workspace-relative file path"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, params: Value, ctx: &SessionContext) -> anyhow::Result<ToolResult> {
        let path = params["path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'path' parameter"))?
            .to_string();

        let result = with_sandbox_retry(&self.sandbox, || {
            self.sandbox.get_file(&ctx.user_id, &path)
        })
        .await;

        match result {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                if text.len() > self.max_chars {
                    let mut end = self.max_chars;
                    while end > 0 && !text.is_char_boundary(end) {
                        end -= 1;
                    }
                    Ok(ToolResult::new(format!(
                        "{}\n... [truncated, file is {} bytes]",
                        &text[..end],
                        bytes.len()
                    )))
                } else {
                    Ok(ToolResult::new(text.into_owned()))
                }
            }
            Err(e) => Ok(tagged_error(&e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ServerError;

    #[test]
    fn errors_are_kind_tagged_for_the_model() {
        let result = tagged_error(&ServerError::PathEscape("../etc/hosts".into()));
        assert!(result.is_error);
        assert!(result.content.starts_with("[path-escape]"));

        let result = tagged_error(&ServerError::SandboxUnavailable("gone".into()));
        assert!(result.content.starts_with("[sandbox-unavailable]"));
    }
}
