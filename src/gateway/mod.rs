//! HTTP gateway: the turn endpoints, the SSE streaming transport, and the
//! seams to the delegated collaborators (token verification, settings).

use crate::agent::events::TurnEvent;
use crate::agent::factory::AgentFactory;
use crate::agent::message::ThreadMessage;
use crate::agent::middleware::{
    AgentMiddleware, SummarizationMiddleware, TodoMiddleware, ToolCallRepairMiddleware,
};
use crate::agent::tools::ToolRegistry;
use crate::agent::tools::sandbox_tools::{ReadFileTool, ShellExecTool, WriteFileTool};
use crate::agent::tools::todo::TodoBoard;
use crate::agent::turn::{TurnDeps, spawn_turn};
use crate::checkpoint::store_from_url;
use crate::config::Settings;
use crate::errors::{ErrorKind, ServerError, ServerResult};
use crate::providers::build_http_client;
use crate::sandbox::SandboxSurface;
use crate::sandbox::docker::SharedSandbox;
use crate::session::{FileSettingsStore, SessionConfigResolver};
use crate::utils::turns::TurnRegistry;
use async_trait::async_trait;
use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Auth seam
// ---------------------------------------------------------------------------

/// Token verification is delegated: the core only needs a verified user id.
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> ServerResult<String>;
}

/// Development verifier mapping configured bearer tokens to user ids
/// (`AUTH_TOKENS=token:user,...`).
pub struct StaticTokenVerifier {
    tokens: HashMap<String, String>,
}

impl StaticTokenVerifier {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl AuthVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> ServerResult<String> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| ServerError::AuthRequired("unknown bearer token".to_string()))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> ServerResult<String> {
    let token = bearer_token(headers)
        .ok_or_else(|| ServerError::AuthRequired("missing bearer token".to_string()))?;
    state.verifier.verify(token).await
}

// ---------------------------------------------------------------------------
// Thread ownership
// ---------------------------------------------------------------------------

/// Tracks which user owns which thread. Unknown threads are adopted by the
/// first caller so checkpoint-backed threads keep working across restarts;
/// foreign threads read as not-found rather than revealing their existence.
#[derive(Default)]
pub struct ThreadIndex {
    owners: Mutex<HashMap<String, String>>,
}

impl ThreadIndex {
    pub fn claim(&self, thread_id: &str, user_id: &str) -> ServerResult<()> {
        let mut owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
        match owners.get(thread_id) {
            Some(owner) if owner == user_id => Ok(()),
            Some(_) => Err(ServerError::ThreadNotFound(thread_id.to_string())),
            None => {
                owners.insert(thread_id.to_string(), user_id.to_string());
                Ok(())
            }
        }
    }

    pub fn owned_by(&self, thread_id: &str, user_id: &str) -> bool {
        let owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
        owners.get(thread_id).is_some_and(|owner| owner == user_id)
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Turn-level fatal errors (before any stream frame) become non-2xx JSON
/// bodies carrying the taxonomy kind.
#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl From<ServerError> for ApiError {
    fn from(e: ServerError) -> Self {
        Self {
            kind: e.kind(),
            detail: e.to_string(),
        }
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::AuthRequired => StatusCode::UNAUTHORIZED,
        ErrorKind::ThreadBusy => StatusCode::CONFLICT,
        ErrorKind::ThreadNotFound => StatusCode::NOT_FOUND,
        ErrorKind::PathEscape => StatusCode::BAD_REQUEST,
        ErrorKind::LlmUnavailable | ErrorKind::SandboxUnavailable => StatusCode::BAD_GATEWAY,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({"kind": self.kind, "detail": self.detail}));
        (status_for(self.kind), body).into_response()
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ChatRequestBody {
    pub message: String,
    /// Omitted or null: the server assigns a fresh thread and reports it in
    /// the first stream frame.
    #[serde(default)]
    pub thread_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponseBody {
    pub thread_id: String,
    pub response: String,
    pub duration_ms: u64,
    pub messages: Vec<ThreadMessage>,
}

#[derive(Debug, Deserialize)]
pub struct StopRequestBody {
    pub thread_id: String,
}

#[derive(Debug, Serialize)]
pub struct StopResponseBody {
    pub status: &'static str,
    pub thread_id: String,
}

// ---------------------------------------------------------------------------
// App state and wiring
// ---------------------------------------------------------------------------

pub struct AppState {
    pub deps: Arc<TurnDeps>,
    pub turns: TurnRegistry,
    pub threads: ThreadIndex,
    pub verifier: Arc<dyn AuthVerifier>,
}

impl AppState {
    /// Wire the full stack around a sandbox surface. Split out from
    /// [`serve`] so tests can assemble the same state over fakes.
    pub fn build(
        settings: &Settings,
        sandbox: Arc<dyn SandboxSurface>,
        verifier: Arc<dyn AuthVerifier>,
    ) -> ServerResult<Arc<Self>> {
        let checkpoints = store_from_url(&settings.checkpoint_store_url)?;
        let resolver = Arc::new(SessionConfigResolver::new(
            Arc::new(FileSettingsStore::new(settings.settings_dir.clone())),
            settings.clone(),
        ));

        let board = Arc::new(TodoBoard::new());
        let middleware: Vec<Arc<dyn AgentMiddleware>> = vec![
            Arc::new(TodoMiddleware::new(board.clone())),
            Arc::new(SummarizationMiddleware::default()),
            Arc::new(ToolCallRepairMiddleware),
        ];

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(ShellExecTool::new(
            sandbox.clone(),
            &settings.sandbox,
        )));
        registry.register(Arc::new(WriteFileTool::new(sandbox.clone())));
        registry.register(Arc::new(ReadFileTool::new(sandbox.clone())));
        for mw in &middleware {
            for tool in mw.tools() {
                registry.register(tool);
            }
        }

        let factory = Arc::new(AgentFactory::new(
            build_http_client(),
            Arc::new(registry),
            Arc::new(middleware),
        ));

        Ok(Arc::new(Self {
            deps: Arc::new(TurnDeps {
                resolver,
                factory,
                checkpoints,
            }),
            turns: TurnRegistry::new(),
            threads: ThreadIndex::default(),
            verifier,
        }))
    }
}

pub fn router(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/api/chat/stream", post(chat_stream_handler))
        .route("/api/chat", post(chat_handler))
        .route("/api/chat/stop", post(stop_handler))
        .route("/api/health", get(health_handler))
        .with_state(state)
}

/// Entry point used by `main`: bring up the Docker sandbox surface and serve.
pub async fn serve(settings: Settings) -> anyhow::Result<()> {
    let sandbox: Arc<dyn SandboxSurface> =
        Arc::new(SharedSandbox::connect(settings.sandbox.clone())?);
    if let Err(e) = sandbox.ensure().await {
        // Tool calls re-ensure on use; starting degraded is survivable.
        warn!("sandbox not ready at startup: {}", e);
    }

    let verifier: Arc<dyn AuthVerifier> =
        Arc::new(StaticTokenVerifier::new(settings.auth_tokens.clone()));
    let state = AppState::build(&settings, sandbox, verifier)?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    info!("listening on {}", settings.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_handler() -> impl IntoResponse {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

/// Encode one event as the JSON payload of its SSE frame, injecting the
/// thread id when this is the stream's first frame. Serialization escapes
/// newlines, so one event is always exactly one `data:` line.
pub fn encode_frame(event: &TurnEvent, thread_id: Option<&str>) -> String {
    let mut value = serde_json::to_value(event).unwrap_or_else(|e| {
        json!({"type": "error", "kind": ErrorKind::Internal, "detail": e.to_string()})
    });
    if let Some(thread_id) = thread_id {
        value["thread_id"] = json!(thread_id);
    }
    value.to_string()
}

/// Serialize turn events as SSE frames: one `data: <json>` frame per event,
/// the thread id injected into the first frame, and the `[DONE]` sentinel
/// after the terminal event.
pub fn frame_events(
    thread_id: String,
    events: impl Stream<Item = TurnEvent> + Send + 'static,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let mut first = Some(thread_id);
    events
        .map(move |event| {
            let payload = encode_frame(&event, first.take().as_deref());
            Ok(Event::default().data(payload))
        })
        .chain(futures_util::stream::once(async {
            Ok(Event::default().data("[DONE]"))
        }))
}

async fn chat_stream_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ChatRequestBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let user_id = authenticate(&state, &headers).await?;
    let thread_id = body
        .thread_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    state.threads.claim(&thread_id, &user_id)?;

    // thread-busy fails fast, before the stream opens.
    let guard = state.turns.begin(&thread_id, &user_id)?;
    let events = spawn_turn(
        state.deps.clone(),
        user_id,
        thread_id.clone(),
        body.message,
        guard,
    );
    Ok(Sse::new(frame_events(thread_id, events)))
}

/// Non-streaming variant: drives the same turn to completion and returns
/// the reconciled result in one response body.
async fn chat_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ChatRequestBody>,
) -> Result<Json<ChatResponseBody>, ApiError> {
    let user_id = authenticate(&state, &headers).await?;
    let thread_id = body
        .thread_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    state.threads.claim(&thread_id, &user_id)?;

    let guard = state.turns.begin(&thread_id, &user_id)?;
    let started = Instant::now();
    let mut events = spawn_turn(
        state.deps.clone(),
        user_id,
        thread_id.clone(),
        body.message,
        guard,
    );

    let mut messages: Vec<ThreadMessage> = Vec::new();
    while let Some(event) = events.next().await {
        match event {
            TurnEvent::Done {
                messages: reconciled,
            } => messages = reconciled,
            TurnEvent::Stopped => {
                return Err(ApiError {
                    kind: ErrorKind::Cancelled,
                    detail: "turn was stopped".to_string(),
                });
            }
            TurnEvent::Error { kind, detail } => return Err(ApiError { kind, detail }),
            _ => {}
        }
    }

    let response = messages
        .iter()
        .rev()
        .find_map(|m| match m {
            ThreadMessage::Assistant { content, .. } if !content.is_empty() => {
                Some(content.clone())
            }
            _ => None,
        })
        .unwrap_or_default();

    Ok(Json(ChatResponseBody {
        thread_id,
        response,
        duration_ms: started.elapsed().as_millis() as u64,
        messages,
    }))
}

async fn stop_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<StopRequestBody>,
) -> Result<Json<StopResponseBody>, ApiError> {
    let user_id = authenticate(&state, &headers).await?;
    if !state.threads.owned_by(&body.thread_id, &user_id) {
        return Err(ServerError::ThreadNotFound(body.thread_id).into());
    }
    let stopped = state.turns.cancel(&body.thread_id, &user_id);
    info!(
        "stop requested for {} by {}: {}",
        body.thread_id,
        user_id,
        if stopped { "stopped" } else { "not running" }
    );
    Ok(Json(StopResponseBody {
        status: if stopped { "stopped" } else { "not_running" },
        thread_id: body.thread_id,
    }))
}
