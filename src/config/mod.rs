use anyhow::{Context, Result, bail};
use std::collections::HashMap;
use std::path::PathBuf;

pub const DEFAULT_RECURSION_LIMIT: usize = 1000;
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 4096;
pub const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 30;
pub const MAX_EXEC_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_EXEC_OUTPUT_CAP: usize = 128 * 1024;

/// Server configuration resolved from the process environment with
/// hard-coded fallbacks. Per-user overrides layer on top via the
/// session config resolver.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub default_model: String,
    pub api_key: Option<String>,
    pub api_base: Option<String>,
    /// Server-wide maximum and default recursion bound for agent turns.
    pub recursion_limit: usize,
    pub max_output_tokens: u32,
    /// `file://<dir>` or `memory://`.
    pub checkpoint_store_url: String,
    /// Directory holding per-user settings JSON files.
    pub settings_dir: PathBuf,
    /// `token:user_id` pairs for the development bearer-token verifier.
    pub auth_tokens: HashMap<String, String>,
    pub sandbox: SandboxSettings,
}

/// Resource policy for the shared tool container.
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub image: String,
    pub container_name: String,
    pub volume_name: String,
    /// Mount point of the persistent volume inside the container.
    pub workspace_root: String,
    /// Unprivileged identity commands run as.
    pub exec_user: String,
    pub cpu_limit: f64,
    pub memory_limit_bytes: i64,
    /// Docker network mode; `none` disables network access.
    pub network_mode: String,
    pub exec_timeout_default_secs: u64,
    pub exec_timeout_max_secs: u64,
    /// Grace between SIGTERM and SIGKILL for the exec watchdog.
    pub kill_grace_secs: u64,
    pub output_cap_bytes: usize,
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_str(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse a Docker-style memory limit (`512m`, `1g`, `262144k`, plain bytes)
/// into bytes.
pub fn parse_memory_limit(raw: &str) -> Result<i64> {
    let raw = raw.trim().to_ascii_lowercase();
    if raw.is_empty() {
        bail!("empty memory limit");
    }
    let (number, multiplier) = match raw.as_bytes()[raw.len() - 1] {
        b'k' => (&raw[..raw.len() - 1], 1024i64),
        b'm' => (&raw[..raw.len() - 1], 1024 * 1024),
        b'g' => (&raw[..raw.len() - 1], 1024 * 1024 * 1024),
        b'0'..=b'9' => (raw.as_str(), 1),
        other => bail!("unsupported memory suffix '{}'", other as char),
    };
    let value: i64 = number
        .parse()
        .with_context(|| format!("invalid memory limit '{}'", raw))?;
    Ok(value * multiplier)
}

/// Parse `AUTH_TOKENS` of the form `token1:alice,token2:bob`.
fn parse_auth_tokens(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (token, user) = pair.trim().split_once(':')?;
            if token.is_empty() || user.is_empty() {
                return None;
            }
            Some((token.to_string(), user.to_string()))
        })
        .collect()
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let memory_limit = env_str("SANDBOX_MEMORY_LIMIT").unwrap_or_else(|| "512m".to_string());
        let sandbox = SandboxSettings {
            image: env_str("SANDBOX_IMAGE").unwrap_or_else(|| "anemone-tools:latest".to_string()),
            container_name: env_str("SANDBOX_CONTAINER_NAME")
                .unwrap_or_else(|| "anemone-shared-tools".to_string()),
            volume_name: env_str("SANDBOX_VOLUME_NAME")
                .unwrap_or_else(|| "anemone-workspace".to_string()),
            workspace_root: "/workspace".to_string(),
            exec_user: env_str("SANDBOX_EXEC_USER").unwrap_or_else(|| "tooluser".to_string()),
            cpu_limit: env_parse("SANDBOX_CPU_LIMIT", 1.0),
            memory_limit_bytes: parse_memory_limit(&memory_limit)
                .context("SANDBOX_MEMORY_LIMIT")?,
            network_mode: env_str("SANDBOX_NETWORK").unwrap_or_else(|| "none".to_string()),
            exec_timeout_default_secs: env_parse(
                "SANDBOX_TIMEOUT_DEFAULT",
                DEFAULT_EXEC_TIMEOUT_SECS,
            ),
            exec_timeout_max_secs: env_parse("SANDBOX_TIMEOUT_MAX", MAX_EXEC_TIMEOUT_SECS),
            kill_grace_secs: 5,
            output_cap_bytes: env_parse("SANDBOX_OUTPUT_CAP", DEFAULT_EXEC_OUTPUT_CAP),
        };

        Ok(Self {
            bind_addr: env_str("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            default_model: env_str("LLM_DEFAULT_MODEL").unwrap_or_else(|| "qwen-plus".to_string()),
            api_key: env_str("LLM_API_KEY"),
            api_base: env_str("LLM_API_BASE"),
            recursion_limit: env_parse("RECURSION_LIMIT", DEFAULT_RECURSION_LIMIT),
            max_output_tokens: env_parse("LLM_MAX_OUTPUT_TOKENS", DEFAULT_MAX_OUTPUT_TOKENS),
            checkpoint_store_url: env_str("CHECKPOINT_STORE_URL")
                .unwrap_or_else(|| "file://./checkpoints".to_string()),
            settings_dir: env_str("SETTINGS_DIR")
                .map_or_else(|| PathBuf::from("./user_settings"), PathBuf::from),
            auth_tokens: env_str("AUTH_TOKENS")
                .map(|raw| parse_auth_tokens(&raw))
                .unwrap_or_default(),
            sandbox,
        })
    }
}

impl Default for Settings {
    fn default() -> Self {
        // Defaults only; never reads the environment. Tests rely on this
        // being deterministic.
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            default_model: "qwen-plus".to_string(),
            api_key: None,
            api_base: None,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            checkpoint_store_url: "memory://".to_string(),
            settings_dir: PathBuf::from("./user_settings"),
            auth_tokens: HashMap::new(),
            sandbox: SandboxSettings::default(),
        }
    }
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            image: "anemone-tools:latest".to_string(),
            container_name: "anemone-shared-tools".to_string(),
            volume_name: "anemone-workspace".to_string(),
            workspace_root: "/workspace".to_string(),
            exec_user: "tooluser".to_string(),
            cpu_limit: 1.0,
            memory_limit_bytes: 512 * 1024 * 1024,
            network_mode: "none".to_string(),
            exec_timeout_default_secs: DEFAULT_EXEC_TIMEOUT_SECS,
            exec_timeout_max_secs: MAX_EXEC_TIMEOUT_SECS,
            kill_grace_secs: 5,
            output_cap_bytes: DEFAULT_EXEC_OUTPUT_CAP,
        }
    }
}
