//! User credential domain — provider keys, embedding model configs, and the
//! store traits the resolvers consume.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::memory::EmbeddingModelConfig;

/// What a stored key is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyPurpose {
    Llm,
    Embedding,
}

impl KeyPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Llm => "LLM",
            Self::Embedding => "EMBEDDING",
        }
    }
}

impl std::str::FromStr for KeyPurpose {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "LLM" => Ok(Self::Llm),
            "EMBEDDING" => Ok(Self::Embedding),
            other => Err(format!("unknown key purpose: {other}")),
        }
    }
}

/// One user-stored provider credential.
///
/// Invariant: at most one active key per (user, provider, purpose) slot
/// carries `is_default = true`. Enforced by the store's `set_default`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserApiKey {
    pub id: i64,
    pub user_id: i64,
    pub provider: String,
    pub purpose: KeyPurpose,
    pub key_value: String,
    /// Override; falls back to the per-provider default when absent.
    pub base_url: Option<String>,
    /// Override; falls back to the per-provider default when absent.
    pub model: Option<String>,
    pub is_default: bool,
    pub is_active: bool,
}

/// Connection parameters for one LLM provider endpoint.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Label used in logs and for provider-quirk detection.
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    /// Default model substituted when a request leaves the field empty.
    pub model: String,
    pub timeout_seconds: u64,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

/// Connection parameters for an OpenAI-compatible embedding endpoint.
#[derive(Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    /// Declared output dimension; the returned vector length must match.
    pub dimensions: usize,
    pub timeout_seconds: u64,
}

impl std::fmt::Debug for EmbeddingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("dimensions", &self.dimensions)
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

/// Fields for creating a new user API key.
#[derive(Debug, Clone)]
pub struct NewUserApiKey {
    pub user_id: i64,
    pub provider: String,
    pub purpose: KeyPurpose,
    pub key_value: String,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub is_default: bool,
}

/// Fields for creating a new user embedding model config.
#[derive(Debug, Clone)]
pub struct NewEmbeddingModel {
    pub user_id: i64,
    pub name: String,
    pub provider: String,
    pub model_name: String,
    pub api_key: Option<String>,
    pub base_url: String,
    pub dimension: usize,
    pub max_tokens: u32,
    pub is_default: bool,
}

/// Persistence boundary for user API keys.
#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn insert(&self, key: NewUserApiKey) -> std::result::Result<UserApiKey, StoreError>;

    /// All active keys for a user, defaults first.
    async fn active_keys(&self, user_id: i64) -> std::result::Result<Vec<UserApiKey>, StoreError>;

    /// Mark a key as the default for its (provider, purpose) slot, clearing
    /// the previous default in the same slot. Idempotent.
    async fn set_default(&self, user_id: i64, key_id: i64) -> std::result::Result<(), StoreError>;
}

/// Persistence boundary for user embedding model configs.
#[async_trait]
pub trait EmbeddingModelStore: Send + Sync {
    async fn insert(
        &self,
        model: NewEmbeddingModel,
    ) -> std::result::Result<EmbeddingModelConfig, StoreError>;

    /// The user's active default embedding model, if any.
    async fn find_default(
        &self,
        user_id: i64,
    ) -> std::result::Result<Option<EmbeddingModelConfig>, StoreError>;

    /// Mark a model as the user's default, clearing the previous one.
    /// Idempotent.
    async fn set_default(&self, user_id: i64, model_id: i64) -> std::result::Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_purpose_roundtrip() {
        assert_eq!("LLM".parse::<KeyPurpose>().unwrap(), KeyPurpose::Llm);
        assert_eq!("EMBEDDING".parse::<KeyPurpose>().unwrap(), KeyPurpose::Embedding);
        assert!("OTHER".parse::<KeyPurpose>().is_err());
    }

    #[test]
    fn provider_config_debug_redacts_key() {
        let cfg = ProviderConfig {
            name: "openai".into(),
            base_url: "https://api.openai.com/v1".into(),
            api_key: "sk-secret".into(),
            model: "gpt-4o".into(),
            timeout_seconds: 120,
        };
        let debug = format!("{cfg:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn embedding_config_debug_redacts_key() {
        let cfg = EmbeddingConfig {
            base_url: "http://localhost:11434".into(),
            api_key: "ollama".into(),
            model: "nomic-embed-text".into(),
            dimensions: 768,
            timeout_seconds: 30,
        };
        let debug = format!("{cfg:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(debug.contains("768"));
    }
}
