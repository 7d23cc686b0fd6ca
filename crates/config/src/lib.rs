//! Configuration loading, validation, and management for AgentForge.
//!
//! Loads configuration from a TOML file with environment variable
//! overrides. Validates all settings at startup. Secrets never appear in
//! Debug output.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
#[derive(Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Primary/fallback LLM provider endpoints.
    #[serde(default)]
    pub llm: LlmConfig,

    /// System-default embedding endpoint.
    #[serde(default)]
    pub embedding: EmbeddingEndpointConfig,

    /// Vector database connection.
    #[serde(default)]
    pub milvus: MilvusConfig,

    /// Agent loop tuning knobs.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Relational store (sessions, keys, tools).
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("llm", &self.llm)
            .field("embedding", &self.embedding)
            .field("milvus", &self.milvus)
            .field("agent", &self.agent)
            .field("database", &self.database)
            .finish()
    }
}

/// Primary + fallback provider endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_primary")]
    pub primary: LlmProviderConfig,

    #[serde(default = "default_fallback")]
    pub fallback: LlmProviderConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            primary: default_primary(),
            fallback: default_fallback(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct LlmProviderConfig {
    pub name: String,
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub model: String,
    #[serde(default = "default_llm_timeout")]
    pub timeout_seconds: u64,
}

impl std::fmt::Debug for LlmProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmProviderConfig")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

fn default_primary() -> LlmProviderConfig {
    LlmProviderConfig {
        name: "openai".into(),
        base_url: "https://api.openai.com/v1".into(),
        api_key: None,
        model: "gpt-4o".into(),
        timeout_seconds: default_llm_timeout(),
    }
}

fn default_fallback() -> LlmProviderConfig {
    LlmProviderConfig {
        name: "deepseek".into(),
        base_url: "https://api.deepseek.com/v1".into(),
        api_key: None,
        model: "deepseek-chat".into(),
        timeout_seconds: default_llm_timeout(),
    }
}

fn default_llm_timeout() -> u64 {
    120
}

impl Default for LlmProviderConfig {
    fn default() -> Self {
        default_primary()
    }
}

/// System-default embedding endpoint.
///
/// Dimension reference:
///   text-embedding-3-small → 1536
///   text-embedding-3-large → 3072
///   nomic-embed-text       → 768
#[derive(Clone, Serialize, Deserialize)]
pub struct EmbeddingEndpointConfig {
    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default = "default_embedding_dimensions")]
    pub dimensions: usize,

    #[serde(default = "default_embedding_timeout")]
    pub timeout_seconds: u64,
}

impl std::fmt::Debug for EmbeddingEndpointConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingEndpointConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .field("dimensions", &self.dimensions)
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

fn default_embedding_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn default_embedding_dimensions() -> usize {
    1536
}
fn default_embedding_timeout() -> u64 {
    30
}

impl Default for EmbeddingEndpointConfig {
    fn default() -> Self {
        Self {
            base_url: default_embedding_base_url(),
            api_key: None,
            model: default_embedding_model(),
            dimensions: default_embedding_dimensions(),
            timeout_seconds: default_embedding_timeout(),
        }
    }
}

/// Vector database connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilvusConfig {
    #[serde(default = "default_milvus_host")]
    pub host: String,

    #[serde(default = "default_milvus_port")]
    pub port: u16,

    /// System-default memory collection (used when a user has no embedding
    /// config of their own).
    #[serde(default = "default_milvus_collection")]
    pub collection_name: String,

    #[serde(default = "default_embedding_dimensions")]
    pub vector_dimensions: usize,

    /// Disable to run without a vector database; memory degrades to no-ops.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_milvus_host() -> String {
    "localhost".into()
}
fn default_milvus_port() -> u16 {
    19530
}
fn default_milvus_collection() -> String {
    "agent_memories".into()
}
fn default_true() -> bool {
    true
}

impl MilvusConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl Default for MilvusConfig {
    fn default() -> Self {
        Self {
            host: default_milvus_host(),
            port: default_milvus_port(),
            collection_name: default_milvus_collection(),
            vector_dimensions: default_embedding_dimensions(),
            enabled: true,
        }
    }
}

/// Agent loop tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Sliding-window ceiling for the context message list.
    #[serde(default = "default_max_context_messages")]
    pub max_context_messages: usize,

    /// Safety breaker for the inner loop.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: i32,

    /// Max tools passed to the LLM, retrieved by semantic relevance.
    #[serde(default = "default_top_k_tools")]
    pub top_k_tools: usize,

    /// Prefix length for same-topic store_memory deduplication.
    #[serde(default = "default_store_memory_prefix_len")]
    pub store_memory_prefix_len: usize,

    /// Poll interval while a session sits in PAUSED.
    #[serde(default = "default_resume_poll_ms")]
    pub resume_poll_ms: u64,

    /// Minimum similarity for recall() hits. 0 returns all ranked hits.
    #[serde(default)]
    pub min_recall_score: f64,
}

fn default_max_context_messages() -> usize {
    50
}
fn default_max_iterations() -> i32 {
    30
}
fn default_top_k_tools() -> usize {
    12
}
fn default_store_memory_prefix_len() -> usize {
    15
}
fn default_resume_poll_ms() -> u64 {
    2000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_context_messages: default_max_context_messages(),
            max_iterations: default_max_iterations(),
            top_k_tools: default_top_k_tools(),
            store_memory_prefix_len: default_store_memory_prefix_len(),
            resume_poll_ms: default_resume_poll_ms(),
            min_recall_score: 0.0,
        }
    }
}

/// Relational store connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection string, e.g. `sqlite://agentforge.db`.
    #[serde(default = "default_database_url")]
    pub url: String,
}

fn default_database_url() -> String {
    "sqlite://agentforge.db".into()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a file path, then apply environment
    /// variable overrides:
    /// - `AGENTFORGE_PRIMARY_API_KEY` / `AGENTFORGE_FALLBACK_API_KEY`
    /// - `AGENTFORGE_EMBEDDING_API_KEY`
    /// - `AGENTFORGE_DATABASE_URL`
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
            toml::from_str(&content).map_err(|e| ConfigError::ParseError {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        } else {
            tracing::info!("No config file found at {}, using defaults", path.display());
            Self::default()
        };

        if let Ok(key) = std::env::var("AGENTFORGE_PRIMARY_API_KEY") {
            config.llm.primary.api_key = Some(key);
        }
        if let Ok(key) = std::env::var("AGENTFORGE_FALLBACK_API_KEY") {
            config.llm.fallback.api_key = Some(key);
        }
        if let Ok(key) = std::env::var("AGENTFORGE_EMBEDDING_API_KEY") {
            config.embedding.api_key = Some(key);
        }
        if let Ok(url) = std::env::var("AGENTFORGE_DATABASE_URL") {
            config.database.url = url;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_context_messages < 2 {
            return Err(ConfigError::ValidationError(
                "agent.max_context_messages must be at least 2".into(),
            ));
        }
        if self.agent.max_iterations < 1 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be at least 1".into(),
            ));
        }
        if self.embedding.dimensions == 0 || self.milvus.vector_dimensions == 0 {
            return Err(ConfigError::ValidationError(
                "embedding dimensions must be non-zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.agent.min_recall_score) {
            return Err(ConfigError::ValidationError(
                "agent.min_recall_score must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
