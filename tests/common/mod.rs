//! Shared fixtures: a scripted chat provider, an in-process sandbox fake,
//! and a harness wiring the full turn stack over them.

use anemone::agent::factory::AgentFactory;
use anemone::agent::middleware::{
    AgentMiddleware, SummarizationMiddleware, TodoMiddleware, ToolCallRepairMiddleware,
};
use anemone::agent::tools::ToolRegistry;
use anemone::agent::tools::sandbox_tools::{ReadFileTool, ShellExecTool, WriteFileTool};
use anemone::agent::tools::todo::TodoBoard;
use anemone::agent::turn::TurnDeps;
use futures_util::StreamExt;
use anemone::checkpoint::MemoryCheckpointStore;
use anemone::config::Settings;
use anemone::errors::{ServerError, ServerResult};
use anemone::providers::base::{
    ChatProvider, ChatRequest, ChatStream, ChatStreamEvent, ToolCallRequest,
};
use anemone::sandbox::paths::{validate_relative, validate_user_id};
use anemone::sandbox::{ExecOutput, FileEntry, SandboxSurface};
use anemone::session::{MemorySettingsStore, SessionConfigResolver, UserSettings};
use anemone::utils::turns::{CancelToken, TurnRegistry};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Scripted provider
// ---------------------------------------------------------------------------

/// One scripted reply per model step.
pub enum Scripted {
    /// Stream these events, in order, then end the stream.
    Events(Vec<ChatStreamEvent>),
    /// Stream one content delta, then pend until the consumer goes away.
    /// Used to hold a turn open for cancellation tests.
    Hang,
    /// Fail the connection phase with a transient provider error.
    ConnectError(String),
}

pub struct MockChatProvider {
    script: Mutex<VecDeque<Scripted>>,
    pub requests: Arc<Mutex<Vec<ChatRequest>>>,
}

impl MockChatProvider {
    pub fn with_responses(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            requests: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

#[async_trait]
impl ChatProvider for MockChatProvider {
    async fn stream_chat(&self, req: ChatRequest) -> ServerResult<ChatStream> {
        self.requests.lock().unwrap().push(req);
        let item = self.script.lock().unwrap().pop_front();
        match item {
            Some(Scripted::Events(events)) => Ok(Box::pin(futures_util::stream::iter(
                events.into_iter().map(Ok),
            ))),
            Some(Scripted::Hang) => {
                let head = futures_util::stream::iter(vec![Ok(
                    ChatStreamEvent::ContentDelta("thinking".to_string()),
                )]);
                Ok(Box::pin(head.chain(futures_util::stream::pending())))
            }
            Some(Scripted::ConnectError(detail)) => Err(ServerError::LlmUnavailable(detail)),
            None => Err(ServerError::LlmInvalidResponse(
                "mock script exhausted".to_string(),
            )),
        }
    }

    fn model(&self) -> &str {
        "mock-model"
    }
}

/// A plain text reply streamed as two deltas.
pub fn text_response(text: &str) -> Scripted {
    let mid = text.len() / 2;
    let mid = (0..=mid)
        .rev()
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(0);
    let (a, b) = text.split_at(mid);
    let mut events = Vec::new();
    if !a.is_empty() {
        events.push(ChatStreamEvent::ContentDelta(a.to_string()));
    }
    if !b.is_empty() {
        events.push(ChatStreamEvent::ContentDelta(b.to_string()));
    }
    events.push(ChatStreamEvent::Finished {
        reason: Some("stop".to_string()),
    });
    Scripted::Events(events)
}

/// A reply that opens one tool call, streaming its arguments in two chunks.
pub fn tool_response(id: &str, name: &str, arguments: &Value) -> Scripted {
    let encoded = arguments.to_string();
    let mid = (0..=encoded.len() / 2)
        .rev()
        .find(|&i| encoded.is_char_boundary(i))
        .unwrap_or(0);
    let (a, b) = encoded.split_at(mid);
    Scripted::Events(vec![
        ChatStreamEvent::ToolCallStart {
            index: 0,
            id: id.to_string(),
            name: name.to_string(),
        },
        ChatStreamEvent::ToolCallDelta {
            index: 0,
            arguments: a.to_string(),
        },
        ChatStreamEvent::ToolCallDelta {
            index: 0,
            arguments: b.to_string(),
        },
        ChatStreamEvent::Finished {
            reason: Some("tool_calls".to_string()),
        },
    ])
}

#[allow(dead_code)]
pub fn tool_call(id: &str, name: &str, arguments: Value) -> ToolCallRequest {
    ToolCallRequest {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    }
}

// ---------------------------------------------------------------------------
// In-process sandbox fake
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemorySandbox {
    files: Mutex<HashMap<(String, String), Vec<u8>>>,
    pub exec_log: Mutex<Vec<String>>,
    /// Number of upcoming execs to fail with `sandbox-unavailable`.
    pub fail_next_execs: AtomicUsize,
    /// Number of execs currently running (for cancellation assertions).
    pub running_execs: Arc<AtomicUsize>,
}

impl MemorySandbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SandboxSurface for MemorySandbox {
    async fn ensure(&self) -> ServerResult<()> {
        Ok(())
    }

    async fn exec(
        &self,
        user_id: &str,
        command: &str,
        timeout_secs: u64,
        cancel: &CancelToken,
    ) -> ServerResult<ExecOutput> {
        validate_user_id(user_id)?;
        if self.fail_next_execs.load(Ordering::SeqCst) > 0 {
            self.fail_next_execs.fetch_sub(1, Ordering::SeqCst);
            return Err(ServerError::SandboxUnavailable(
                "container is gone".to_string(),
            ));
        }
        self.exec_log.lock().unwrap().push(command.to_string());

        // `block` holds until cancelled, mimicking a long-running command
        // bounded by the watchdog.
        if command.starts_with("block") {
            self.running_execs.fetch_add(1, Ordering::SeqCst);
            let outcome = tokio::select! {
                () = cancel.cancelled() => Err(ServerError::Cancelled),
                () = tokio::time::sleep(std::time::Duration::from_secs(timeout_secs)) => {
                    Ok(ExecOutput {
                        exit_code: anemone::sandbox::TIMEOUT_EXIT_CODE,
                        timed_out: true,
                        ..Default::default()
                    })
                }
            };
            self.running_execs.fetch_sub(1, Ordering::SeqCst);
            return outcome;
        }

        Ok(ExecOutput {
            stdout: format!("ran: {}", command),
            exit_code: 0,
            ..Default::default()
        })
    }

    async fn put_file(
        &self,
        user_id: &str,
        relative_path: &str,
        bytes: &[u8],
    ) -> ServerResult<()> {
        validate_user_id(user_id)?;
        let relative = validate_relative(relative_path)?;
        self.files
            .lock()
            .unwrap()
            .insert((user_id.to_string(), relative), bytes.to_vec());
        Ok(())
    }

    async fn get_file(&self, user_id: &str, relative_path: &str) -> ServerResult<Vec<u8>> {
        validate_user_id(user_id)?;
        let relative = validate_relative(relative_path)?;
        self.files
            .lock()
            .unwrap()
            .get(&(user_id.to_string(), relative))
            .cloned()
            .ok_or_else(|| ServerError::ToolFailed(format!("no such file: {}", relative_path)))
    }

    async fn list(&self, user_id: &str, relative_dir: &str) -> ServerResult<Vec<FileEntry>> {
        validate_user_id(user_id)?;
        let prefix = validate_relative(relative_dir)?;
        let files = self.files.lock().unwrap();
        let mut entries: Vec<FileEntry> = files
            .iter()
            .filter(|((user, path), _)| {
                user == user_id && (prefix.is_empty() || path.starts_with(&format!("{}/", prefix)))
            })
            .map(|((_, path), bytes)| FileEntry {
                name: path.clone(),
                size: bytes.len() as u64,
                is_dir: false,
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn delete(&self, user_id: &str, relative_path: &str) -> ServerResult<()> {
        validate_user_id(user_id)?;
        let relative = validate_relative(relative_path)?;
        self.files
            .lock()
            .unwrap()
            .remove(&(user_id.to_string(), relative));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub deps: Arc<TurnDeps>,
    pub checkpoints: Arc<MemoryCheckpointStore>,
    pub sandbox: Arc<MemorySandbox>,
    pub turns: TurnRegistry,
    #[allow(dead_code)]
    pub settings_store: Arc<MemorySettingsStore>,
}

/// Wire the turn stack the same way the gateway does, but over the scripted
/// provider and the in-process sandbox.
pub async fn harness_with(
    provider: Arc<MockChatProvider>,
    user_settings: Option<(&str, UserSettings)>,
) -> Harness {
    let settings = Settings::default();
    let sandbox = MemorySandbox::new();
    let checkpoints = Arc::new(MemoryCheckpointStore::new());

    let settings_store = Arc::new(MemorySettingsStore::new());
    if let Some((user_id, overrides)) = user_settings {
        settings_store.set(user_id, overrides).await;
    }
    let resolver = Arc::new(SessionConfigResolver::new(
        settings_store.clone(),
        settings.clone(),
    ));

    let board = Arc::new(TodoBoard::new());
    let middleware: Vec<Arc<dyn AgentMiddleware>> = vec![
        Arc::new(TodoMiddleware::new(board)),
        Arc::new(SummarizationMiddleware::default()),
        Arc::new(ToolCallRepairMiddleware),
    ];

    let mut registry = ToolRegistry::new();
    let sandbox_dyn: Arc<dyn SandboxSurface> = sandbox.clone();
    registry.register(Arc::new(ShellExecTool::new(
        sandbox_dyn.clone(),
        &settings.sandbox,
    )));
    registry.register(Arc::new(WriteFileTool::new(sandbox_dyn.clone())));
    registry.register(Arc::new(ReadFileTool::new(sandbox_dyn)));
    for mw in &middleware {
        for tool in mw.tools() {
            registry.register(tool);
        }
    }

    let provider_dyn: Arc<dyn ChatProvider> = provider;
    let factory = Arc::new(AgentFactory::with_provider_builder(
        reqwest::Client::new(),
        Arc::new(registry),
        Arc::new(middleware),
        Box::new(move |_key, _http| provider_dyn.clone()),
    ));

    Harness {
        deps: Arc::new(TurnDeps {
            resolver,
            factory,
            checkpoints: checkpoints.clone(),
        }),
        checkpoints,
        sandbox,
        turns: TurnRegistry::new(),
        settings_store,
    }
}

pub async fn harness(provider: Arc<MockChatProvider>) -> Harness {
    harness_with(provider, None).await
}
