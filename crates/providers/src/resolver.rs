//! Resolvers that materialize a user's stored credentials into usable
//! provider configs.
//!
//! Resolution order for a given (user, purpose):
//!   1. The key marked default (preferred)
//!   2. Any active key of that purpose (first found)
//!   3. None — caller falls back to system-level config

use std::sync::Arc;

use tracing::debug;

use agentforge_core::error::StoreError;
use agentforge_core::keys::{
    ApiKeyStore, EmbeddingConfig, EmbeddingModelStore, KeyPurpose, ProviderConfig, UserApiKey,
};

/// Resolves user LLM keys into [`ProviderConfig`]s.
pub struct KeyResolver {
    keys: Arc<dyn ApiKeyStore>,
}

impl KeyResolver {
    pub fn new(keys: Arc<dyn ApiKeyStore>) -> Self {
        Self { keys }
    }

    /// Find the user's default LLM key across all providers.
    pub async fn resolve_default_llm(
        &self,
        user_id: Option<i64>,
    ) -> Result<Option<ProviderConfig>, StoreError> {
        let Some(user_id) = user_id else {
            return Ok(None);
        };

        let mut keys = self.keys.active_keys(user_id).await?;
        keys.retain(|k| k.purpose == KeyPurpose::Llm);
        keys.sort_by_key(|k| std::cmp::Reverse(k.is_default));

        Ok(keys.into_iter().next().map(to_provider_config))
    }
}

fn to_provider_config(key: UserApiKey) -> ProviderConfig {
    let base_url = key
        .base_url
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| default_base_url(&key.provider));
    let model = key
        .model
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| default_model(&key.provider));

    debug!(user_id = key.user_id, provider = %key.provider, model = %model, "resolved user LLM key");

    ProviderConfig {
        name: key.provider,
        base_url,
        api_key: key.key_value,
        model,
        timeout_seconds: 120,
    }
}

/// Default base URLs for well-known providers.
fn default_base_url(provider: &str) -> String {
    match provider.to_lowercase().as_str() {
        "openai" => "https://api.openai.com/v1".into(),
        "deepseek" => "https://api.deepseek.com/v1".into(),
        "anthropic" => "https://api.anthropic.com/v1".into(),
        "moonshot" => "https://api.moonshot.cn/v1".into(),
        "zhipu" => "https://open.bigmodel.cn/api/paas/v4".into(),
        "qwen" => "https://dashscope.aliyuncs.com/compatible-mode/v1".into(),
        _ => "https://api.openai.com/v1".into(),
    }
}

/// Default model names for well-known providers.
fn default_model(provider: &str) -> String {
    match provider.to_lowercase().as_str() {
        "openai" => "gpt-4o".into(),
        "deepseek" => "deepseek-chat".into(),
        "anthropic" => "claude-3-5-sonnet-20241022".into(),
        "moonshot" => "moonshot-v1-8k".into(),
        "zhipu" => "glm-4".into(),
        "qwen" => "qwen-plus".into(),
        _ => "gpt-4o".into(),
    }
}

/// A user's embedding model resolved into a client config plus the vector
/// collection routing it implies.
#[derive(Debug, Clone)]
pub struct ResolvedEmbedding {
    pub config: EmbeddingConfig,
    pub collection_name: String,
    pub dimension: usize,
}

/// Resolves user embedding configs; None → caller uses the system default.
pub struct EmbeddingResolver {
    models: Arc<dyn EmbeddingModelStore>,
}

impl EmbeddingResolver {
    pub fn new(models: Arc<dyn EmbeddingModelStore>) -> Self {
        Self { models }
    }

    pub async fn resolve_default(
        &self,
        user_id: Option<i64>,
    ) -> Result<Option<ResolvedEmbedding>, StoreError> {
        let Some(user_id) = user_id else {
            return Ok(None);
        };

        let Some(model) = self.models.find_default(user_id).await? else {
            return Ok(None);
        };

        debug!(
            user_id,
            model = %model.model_name,
            dim = model.dimension,
            collection = %model.collection_name,
            "resolved user embedding model"
        );

        // Local deployments often need no key; the wire still wants a token.
        let api_key = model
            .api_key
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| "ollama".into());

        Ok(Some(ResolvedEmbedding {
            config: EmbeddingConfig {
                base_url: model.base_url,
                api_key,
                model: model.model_name,
                dimensions: model.dimension,
                timeout_seconds: 30,
            },
            collection_name: model.collection_name,
            dimension: model.dimension,
        }))
    }
}
