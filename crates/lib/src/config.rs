//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.newbot/config.json`) and environment.
//! Secrets (model and memory API keys) may be supplied through env instead of the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Agent runtime settings (model endpoint, session key, workspace).
    #[serde(default)]
    pub agents: AgentsConfig,

    /// Long-term memory service.
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Audio transcription and speaker enrollment.
    #[serde(default)]
    pub audio: AudioConfig,
}

/// Gateway bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP and WebSocket (default 8000).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// The gateway has no auth layer; binding to a non-loopback address must be opted into.
    #[serde(default)]
    pub allow_remote: bool,
}

fn default_gateway_port() -> u16 {
    8000
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            allow_remote: false,
        }
    }
}

/// How inbound messages map to agent sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionMode {
    /// Every client shares one conversation under `agents.sessionKey`.
    #[default]
    Shared,
    /// Each client id gets its own conversation.
    PerClient,
}

/// Agent runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentsConfig {
    /// OpenAI-compatible base URL (the part before `/chat/completions`).
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    /// API key for the model endpoint. Overridden by NEWBOT_LLM_API_KEY env.
    pub api_key: Option<String>,
    /// Model id passed as-is to the endpoint.
    pub model: Option<String>,
    #[serde(default)]
    pub session_mode: SessionMode,
    /// Key of the shared conversation (used when session mode is shared).
    #[serde(default = "default_session_key")]
    pub session_key: String,
    /// Workspace root (default ~/.newbot/workspace). AGENTS.md there becomes system context.
    pub workspace: Option<PathBuf>,
    /// Where session history is persisted (default ~/.newbot/sessions.json).
    pub state_file: Option<PathBuf>,
    /// Most recent history messages sent to the model per turn.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

fn default_llm_base_url() -> String {
    "http://127.0.0.1:1234/v1".to_string()
}

fn default_session_key() -> String {
    "1".to_string()
}

fn default_max_history() -> usize {
    40
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key: None,
            model: None,
            session_mode: SessionMode::default(),
            session_key: default_session_key(),
            workspace: None,
            state_file: None,
            max_history: default_max_history(),
        }
    }
}

/// Memory service (mem0 REST API).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryConfig {
    /// Overridden by MEM0_API_KEY env. Memory search is disabled when no key resolves.
    pub api_key: Option<String>,
    #[serde(default = "default_memory_base_url")]
    pub base_url: String,
    /// Memory owner; defaults to the shared session key.
    pub user_id: Option<String>,
}

fn default_memory_base_url() -> String {
    "https://api.mem0.ai".to_string()
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_memory_base_url(),
            user_id: None,
        }
    }
}

/// Audio transcription settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioConfig {
    /// OpenAI-compatible base URL serving `/audio/diarizations`. Unset disables transcription.
    pub transcribe_url: Option<String>,
    pub api_key: Option<String>,
    /// When set, every decoded audio clip is written here before transcription.
    pub save_dir: Option<PathBuf>,
    /// Minimum accumulated speech (ms) before an unknown speaker is sent for identification.
    #[serde(default = "default_min_enroll_ms")]
    pub min_enroll_ms: u64,
    /// Voiceprint service base URL. Unset leaves unknown speakers unlabeled.
    pub voiceprint_url: Option<String>,
    /// Enrolled voiceprints (default ~/.newbot/voiceprints.json).
    pub voiceprint_store: Option<PathBuf>,
}

fn default_min_enroll_ms() -> u64 {
    10_000
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            transcribe_url: None,
            api_key: None,
            save_dir: None,
            min_enroll_ms: default_min_enroll_ms(),
            voiceprint_url: None,
            voiceprint_store: None,
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Resolve the model API key: env NEWBOT_LLM_API_KEY overrides config.
pub fn resolve_llm_api_key(config: &Config) -> Option<String> {
    non_empty_env("NEWBOT_LLM_API_KEY").or_else(|| non_empty(config.agents.api_key.as_ref()))
}

/// Resolve the memory API key: env MEM0_API_KEY overrides config.
pub fn resolve_memory_api_key(config: &Config) -> Option<String> {
    non_empty_env("MEM0_API_KEY").or_else(|| non_empty(config.memory.api_key.as_ref()))
}

/// Memory owner id: `memory.userId`, else the shared session key.
pub fn resolve_memory_user_id(config: &Config) -> String {
    non_empty(config.memory.user_id.as_ref()).unwrap_or_else(|| config.agents.session_key.clone())
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

fn home_dir_path(file: &str) -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".newbot").join(file))
        .unwrap_or_else(|| PathBuf::from(file))
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("NEWBOT_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir_path("config.json"))
}

/// Resolve workspace directory for agent context (AGENTS.md).
pub fn resolve_workspace_dir(config: &Config) -> Option<PathBuf> {
    config
        .agents
        .workspace
        .clone()
        .or_else(|| dirs::home_dir().map(|h| h.join(".newbot").join("workspace")))
}

/// Resolve the session history file.
pub fn resolve_state_file(config: &Config) -> PathBuf {
    config
        .agents
        .state_file
        .clone()
        .unwrap_or_else(|| home_dir_path("sessions.json"))
}

pub fn resolve_voiceprint_store(config: &Config) -> PathBuf {
    config
        .audio
        .voiceprint_store
        .clone()
        .unwrap_or_else(|| home_dir_path("voiceprints.json"))
}

/// Load config from the given path, else NEWBOT_CONFIG_PATH, else the default. Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
