//! Memoized construction of compiled agents.
//!
//! Agents are cached by their provider binding — model, credentials, base
//! URL, output cap — so users with identical settings share one instance.
//! The cache holds plain `Arc`s: eviction drops the cache reference only,
//! and a turn that is still driving an evicted agent keeps it alive.

use crate::agent::middleware::AgentMiddleware;
use crate::agent::tools::ToolRegistry;
use crate::providers::base::ChatProvider;
use crate::providers::openai::OpenAiCompatProvider;
use crate::session::SessionConfig;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

const AGENT_CACHE_CAPACITY: usize = 32;

/// The memoization key. Two turns with equal keys are served by the same
/// compiled agent, regardless of which user issued them.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AgentKey {
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub max_output_tokens: u32,
}

impl AgentKey {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            model: config.llm_model.clone(),
            api_key: config.api_key.clone(),
            base_url: config.base_url.clone(),
            max_output_tokens: config.max_output_tokens,
        }
    }
}

// Credentials must never land in logs.
impl std::fmt::Debug for AgentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentKey")
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("max_output_tokens", &self.max_output_tokens)
            .finish()
    }
}

/// An LLM client bound to one provider configuration plus the shared tool
/// set and middleware stack. Safe for concurrent turns: per-turn identity
/// travels in the per-call configuration, never in the agent.
pub struct CompiledAgent {
    pub provider: Arc<dyn ChatProvider>,
    pub tools: Arc<ToolRegistry>,
    pub middleware: Arc<Vec<Arc<dyn AgentMiddleware>>>,
    pub max_output_tokens: u32,
}

/// Builds the provider for a cache miss. Swappable so tests can compile
/// agents around a scripted provider.
pub type ProviderBuilder =
    dyn Fn(&AgentKey, &reqwest::Client) -> Arc<dyn ChatProvider> + Send + Sync;

pub struct AgentFactory {
    http: reqwest::Client,
    tools: Arc<ToolRegistry>,
    middleware: Arc<Vec<Arc<dyn AgentMiddleware>>>,
    build_provider: Box<ProviderBuilder>,
    cache: Mutex<LruCache<AgentKey, Arc<CompiledAgent>>>,
}

impl AgentFactory {
    pub fn new(
        http: reqwest::Client,
        tools: Arc<ToolRegistry>,
        middleware: Arc<Vec<Arc<dyn AgentMiddleware>>>,
    ) -> Self {
        Self::with_provider_builder(
            http,
            tools,
            middleware,
            Box::new(|key, http| {
                Arc::new(OpenAiCompatProvider::new(
                    http.clone(),
                    key.model.clone(),
                    key.api_key.clone(),
                    key.base_url.clone(),
                ))
            }),
        )
    }

    pub fn with_provider_builder(
        http: reqwest::Client,
        tools: Arc<ToolRegistry>,
        middleware: Arc<Vec<Arc<dyn AgentMiddleware>>>,
        build_provider: Box<ProviderBuilder>,
    ) -> Self {
        Self {
            http,
            tools,
            middleware,
            build_provider,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(AGENT_CACHE_CAPACITY).expect("cache capacity must be > 0"),
            )),
        }
    }

    /// Fetch the compiled agent for a key, building and caching it on miss.
    /// The shared tool set and middleware survive evictions.
    pub fn get_or_build(&self, key: &AgentKey) -> Arc<CompiledAgent> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(agent) = cache.get(key) {
            debug!("agent cache hit: {:?}", key);
            return agent.clone();
        }
        debug!("agent cache miss, compiling: {:?}", key);
        let provider = (self.build_provider)(key, &self.http);
        let agent = Arc::new(CompiledAgent {
            provider,
            tools: self.tools.clone(),
            middleware: self.middleware.clone(),
            max_output_tokens: key.max_output_tokens,
        });
        cache.put(key.clone(), agent.clone());
        agent
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> AgentFactory {
        AgentFactory::new(
            reqwest::Client::new(),
            Arc::new(ToolRegistry::new()),
            Arc::new(Vec::new()),
        )
    }

    fn key(model: &str, tokens: u32) -> AgentKey {
        AgentKey {
            model: model.to_string(),
            api_key: Some("sk-secret".to_string()),
            base_url: None,
            max_output_tokens: tokens,
        }
    }

    #[test]
    fn equal_keys_share_one_instance() {
        let factory = factory();
        let a = factory.get_or_build(&key("m1", 1024));
        let b = factory.get_or_build(&key("m1", 1024));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.cache_len(), 1);
    }

    #[test]
    fn distinct_keys_get_distinct_instances() {
        let factory = factory();
        let a = factory.get_or_build(&key("m1", 1024));
        let b = factory.get_or_build(&key("m1", 2048));
        let c = factory.get_or_build(&key("m2", 1024));
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(factory.cache_len(), 3);
    }

    #[test]
    fn eviction_keeps_live_references_alive() {
        let factory = factory();
        let first = factory.get_or_build(&key("m0", 1));
        // Fill the cache past capacity to evict m0
        for i in 1..=AGENT_CACHE_CAPACITY {
            factory.get_or_build(&key(&format!("m{}", i), 1));
        }
        assert_eq!(factory.cache_len(), AGENT_CACHE_CAPACITY);
        // The evicted agent is still usable through the held Arc
        assert_eq!(first.max_output_tokens, 1);
        // A rebuild after eviction yields a fresh instance
        let rebuilt = factory.get_or_build(&key("m0", 1));
        assert!(!Arc::ptr_eq(&first, &rebuilt));
    }

    #[test]
    fn debug_redacts_credentials() {
        let rendered = format!("{:?}", key("m1", 1024));
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
