//! Per-turn session configuration.
//!
//! Resolution order for every field: per-user settings store → process
//! environment defaults → hard-coded defaults. The recursion bound may be
//! lowered per user but never exceeds the server-side maximum.

use crate::config::Settings;
use crate::errors::{ServerError, ServerResult};
use crate::utils::safe_filename;
use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Runtime configuration for one turn. Ephemeral — rebuilt per request,
/// never persisted.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub thread_id: String,
    pub user_id: String,
    pub llm_model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub max_output_tokens: u32,
    pub recursion_bound: usize,
    /// Opaque request-scoped context bag.
    pub extra: Map<String, Value>,
}

/// Per-user overrides as stored by the (external) settings surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserSettings {
    #[serde(default)]
    pub llm_model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub recursion_bound: Option<usize>,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

#[async_trait]
pub trait UserSettingsStore: Send + Sync {
    async fn get(&self, user_id: &str) -> anyhow::Result<Option<UserSettings>>;
}

/// JSON file per user under the settings directory. Reads take a shared
/// lock so a concurrent writer (the external settings surface) never hands
/// us a half-written file.
pub struct FileSettingsStore {
    dir: PathBuf,
}

impl FileSettingsStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, user_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", safe_filename(user_id)))
    }
}

#[async_trait]
impl UserSettingsStore for FileSettingsStore {
    async fn get(&self, user_id: &str) -> anyhow::Result<Option<UserSettings>> {
        let path = self.path_for(user_id);
        tokio::task::spawn_blocking(move || -> anyhow::Result<Option<UserSettings>> {
            if !path.exists() {
                return Ok(None);
            }
            let file = std::fs::File::open(&path)?;
            file.lock_shared()?;
            let content = std::fs::read_to_string(&path)?;
            // lock released when `file` drops
            Ok(Some(serde_json::from_str(&content)?))
        })
        .await?
    }
}

/// In-process settings store for tests and single-tenant development.
#[derive(Default)]
pub struct MemorySettingsStore {
    settings: Mutex<HashMap<String, UserSettings>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, user_id: &str, settings: UserSettings) {
        self.settings
            .lock()
            .await
            .insert(user_id.to_string(), settings);
    }
}

#[async_trait]
impl UserSettingsStore for MemorySettingsStore {
    async fn get(&self, user_id: &str) -> anyhow::Result<Option<UserSettings>> {
        Ok(self.settings.lock().await.get(user_id).cloned())
    }
}

pub struct SessionConfigResolver {
    store: Arc<dyn UserSettingsStore>,
    settings: Settings,
}

impl SessionConfigResolver {
    pub fn new(store: Arc<dyn UserSettingsStore>, settings: Settings) -> Self {
        Self { store, settings }
    }

    pub async fn resolve(&self, user_id: &str, thread_id: &str) -> ServerResult<SessionConfig> {
        let user = self
            .store
            .get(user_id)
            .await
            .map_err(|e| ServerError::StorageUnavailable(format!("user settings: {}", e)))?
            .unwrap_or_default();

        let llm_model = user
            .llm_model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.settings.default_model.clone());
        let api_key = user
            .api_key
            .filter(|k| !k.trim().is_empty())
            .or_else(|| self.settings.api_key.clone());
        let base_url = user
            .base_url
            .filter(|u| !u.trim().is_empty())
            .or_else(|| self.settings.api_base.clone());
        let max_output_tokens = user
            .max_output_tokens
            .filter(|&t| t > 0)
            .unwrap_or(self.settings.max_output_tokens);
        // Clients may lower the bound but never exceed the server maximum.
        let recursion_bound = user
            .recursion_bound
            .filter(|&r| r > 0)
            .unwrap_or(self.settings.recursion_limit)
            .min(self.settings.recursion_limit);

        debug!(
            "session config resolved: user={} thread={} model={}",
            user_id, thread_id, llm_model
        );
        Ok(SessionConfig {
            thread_id: thread_id.to_string(),
            user_id: user_id.to_string(),
            llm_model,
            api_key,
            base_url,
            max_output_tokens,
            recursion_bound,
            extra: user.extra,
        })
    }
}
