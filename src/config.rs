//! TOML configuration.
//!
//! Every section has serde defaults, so an empty file (or
//! [`Config::default`]) is a valid configuration. [`load_config`] parses
//! and validates a file on disk.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub web_search: WebSearchConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl StorageConfig {
    /// Directory holding one subdirectory of cached chunks per resource.
    pub fn resources_dir(&self) -> PathBuf {
        self.data_dir.join("resources")
    }

    /// Directory backing the key-value store.
    pub fn kv_dir(&self) -> PathBuf {
        self.data_dir.join("kv")
    }
}

// ============ Model server ============

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Model-serving executable (llama.cpp `llama-server` or compatible).
    #[serde(default = "default_server_binary")]
    pub binary: PathBuf,
    /// Supervise the model server with `localmind-watchdog`.
    #[serde(default = "default_watchdog")]
    pub watchdog: bool,
    /// Watchdog executable. Unset means `localmind-watchdog` next to the
    /// running executable.
    #[serde(default)]
    pub watchdog_binary: Option<PathBuf>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
    /// Health score at which the server is considered ready to serve.
    #[serde(default = "default_ready_threshold")]
    pub ready_threshold: f32,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Watchdog timeout as a multiple of the heartbeat interval.
    #[serde(default = "default_heartbeat_timeout_multiple")]
    pub heartbeat_timeout_multiple: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            binary: default_server_binary(),
            watchdog: default_watchdog(),
            watchdog_binary: None,
            host: default_host(),
            port: default_port(),
            health_interval_ms: default_health_interval_ms(),
            ready_threshold: default_ready_threshold(),
            startup_timeout_secs: default_startup_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_multiple: default_heartbeat_timeout_multiple(),
        }
    }
}

fn default_server_binary() -> PathBuf {
    PathBuf::from("llama-server")
}
fn default_watchdog() -> bool {
    true
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8690
}
fn default_health_interval_ms() -> u64 {
    500
}
fn default_ready_threshold() -> f32 {
    0.25
}
fn default_startup_timeout_secs() -> u64 {
    60
}
fn default_heartbeat_interval_secs() -> u64 {
    15
}
fn default_heartbeat_timeout_multiple() -> u32 {
    4
}

impl ServerConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Resolved watchdog executable, or `None` when supervision is off.
    pub fn watchdog_path(&self) -> Option<PathBuf> {
        if !self.watchdog {
            return None;
        }
        if let Some(explicit) = &self.watchdog_binary {
            return Some(explicit.clone());
        }
        let name = format!("localmind-watchdog{}", std::env::consts::EXE_SUFFIX);
        let sibling = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(&name)))
            .filter(|path| path.is_file());
        Some(sibling.unwrap_or_else(|| PathBuf::from(name)))
    }
}

// ============ Model ============

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Model identifier sent in the request body.
    #[serde(default = "default_model_name")]
    pub name: String,
    #[serde(default = "default_context_length")]
    pub context_length: u32,
    #[serde(default = "default_use_acceleration")]
    pub use_acceleration: bool,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Maximum silence between two stream events before giving up.
    #[serde(default = "default_stream_idle_timeout_secs")]
    pub stream_idle_timeout_secs: u64,
    /// Time allowed for the server to accept the request and send headers.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: None,
            name: default_model_name(),
            context_length: default_context_length(),
            use_acceleration: default_use_acceleration(),
            temperature: default_temperature(),
            stream_idle_timeout_secs: default_stream_idle_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            system_prompt: default_system_prompt(),
        }
    }
}

fn default_model_name() -> String {
    "local".to_string()
}
fn default_context_length() -> u32 {
    8192
}
fn default_use_acceleration() -> bool {
    true
}
fn default_temperature() -> f32 {
    0.7
}
fn default_stream_idle_timeout_secs() -> u64 {
    60
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_system_prompt() -> String {
    "You are a helpful assistant running locally on the user's computer.".to_string()
}

// ============ Embedding ============

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// One of `disabled`, `openai`, `ollama`, `llama`, `local`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

// ============ Chunking / retrieval ============

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_search_results_multiplier")]
    pub search_results_multiplier: usize,
    /// When set, hits are expanded with their neighbouring chunks, so
    /// half as many candidates are requested.
    #[serde(default = "default_use_context")]
    pub use_context: bool,
    #[serde(default = "default_web_results")]
    pub web_results: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            search_results_multiplier: default_search_results_multiplier(),
            use_context: default_use_context(),
            web_results: default_web_results(),
        }
    }
}

fn default_search_results_multiplier() -> usize {
    3
}
fn default_use_context() -> bool {
    true
}
fn default_web_results() -> usize {
    6
}

// ============ Web search ============

#[derive(Debug, Deserialize, Clone)]
pub struct WebSearchConfig {
    #[serde(default = "default_web_endpoint")]
    pub endpoint: String,
    /// Environment variable holding the primary API key.
    #[serde(default = "default_primary_key_env")]
    pub primary_key_env: String,
    /// Environment variable holding the backup API key.
    #[serde(default = "default_backup_key_env")]
    pub backup_key_env: String,
    #[serde(default = "default_web_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            endpoint: default_web_endpoint(),
            primary_key_env: default_primary_key_env(),
            backup_key_env: default_backup_key_env(),
            timeout_secs: default_web_timeout_secs(),
        }
    }
}

fn default_web_endpoint() -> String {
    "https://api.search.brave.com/res/v1/web/search".to_string()
}
fn default_primary_key_env() -> String {
    "LOCALMIND_SEARCH_KEY".to_string()
}
fn default_backup_key_env() -> String {
    "LOCALMIND_SEARCH_BACKUP_KEY".to_string()
}
fn default_web_timeout_secs() -> u64 {
    10
}

// ============ Indexing / tools ============

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    /// Attempts per resource before it is reported as failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_max_attempts() -> u32 {
    2
}
fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.md".to_string(),
        "**/*.txt".to_string(),
        "**/*.pdf".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ToolsConfig {
    /// How many correction round trips a model gets for malformed tool calls.
    #[serde(default = "default_max_correction_rounds")]
    pub max_correction_rounds: u32,
    /// Upper bound on tool round trips in a single turn.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_correction_rounds: default_max_correction_rounds(),
            max_tool_rounds: default_max_tool_rounds(),
        }
    }
}

fn default_max_correction_rounds() -> u32 {
    1
}
fn default_max_tool_rounds() -> u32 {
    8
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Range checks shared by [`load_config`] and callers building configs in code.
pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }

    let threshold = config.server.ready_threshold;
    if !(threshold > 0.0 && threshold <= 1.0) {
        anyhow::bail!("server.ready_threshold must be in (0.0, 1.0]");
    }

    if config.server.heartbeat_timeout_multiple < 2 {
        anyhow::bail!("server.heartbeat_timeout_multiple must be >= 2");
    }

    if config.retrieval.search_results_multiplier == 0 {
        anyhow::bail!("retrieval.search_results_multiplier must be >= 1");
    }

    if config.indexing.max_attempts == 0 {
        anyhow::bail!("indexing.max_attempts must be >= 1");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "llama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, llama, or local.",
            other
        ),
    }

    if matches!(config.embedding.provider.as_str(), "openai" | "ollama")
        && config.embedding.model.is_none()
    {
        anyhow::bail!(
            "embedding.model must be specified when provider is '{}'",
            config.embedding.provider
        );
    }

    Ok(())
}
