use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Session protocol constants
pub const DEFAULT_PORT: u16 = 18920;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const MAX_PAYLOAD_BYTES: usize = 128 * 1024; // 128 KB hard cap per frame
pub const TURN_QUEUE_DEPTH: usize = 1; // pending user turns beyond the in-flight one

/// Top-level config (convoai.toml + CONVOAI_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvoConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    pub auth: AuthConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

/// Token verification settings.
///
/// Every component that validates tokens consumes this single key; an empty
/// key is a fatal misconfiguration checked at startup, not at verify time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub verification_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub api_key: String,
    #[serde(default = "default_model_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Deadline for a single model call, independent of session liveness.
    #[serde(default = "default_model_timeout_secs")]
    pub call_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Conversation-family store: conversations, messages, tool servers.
    #[serde(default = "default_conversation_db_path")]
    pub conversation_path: String,
    /// Analytics-family store: activities, api_calls, metrics, rollups.
    /// Kept separate so conversation deletes never touch audit data.
    #[serde(default = "default_analytics_db_path")]
    pub analytics_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            conversation_path: default_conversation_db_path(),
            analytics_path: default_analytics_db_path(),
        }
    }
}

/// Tool-server dispatch knobs. Defaults match the protocol contract:
/// discovery is cheap and racy (2s), invocation is allowed to work (10s).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    #[serde(default = "default_invoke_timeout_ms")]
    pub invoke_timeout_ms: u64,
    /// Concurrent discovery requests in flight at once.
    #[serde(default = "default_discovery_fanout")]
    pub discovery_fanout: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            discovery_timeout_ms: default_discovery_timeout_ms(),
            invoke_timeout_ms: default_invoke_timeout_ms(),
            discovery_fanout: default_discovery_fanout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnalyticsConfig {
    /// Base URL the emitter POSTs events to. `None` disables emission
    /// entirely (events are dropped without logging).
    pub ingest_base_url: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_model() -> String {
    "gpt-4o".to_string()
}
fn default_model_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_model_timeout_secs() -> u64 {
    60
}
fn default_discovery_timeout_ms() -> u64 {
    2_000
}
fn default_invoke_timeout_ms() -> u64 {
    10_000
}
fn default_discovery_fanout() -> usize {
    4
}
fn default_conversation_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.convoai/conversations.db", home)
}
fn default_analytics_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.convoai/analytics.db", home)
}

impl ConvoConfig {
    /// Load config from a TOML file with CONVOAI_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.convoai/convoai.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: ConvoConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CONVOAI_").split("_"))
            .extract()
            .map_err(|e| crate::error::ConvoError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.convoai/convoai.toml", home)
}
