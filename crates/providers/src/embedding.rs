//! Embedding client — text in, float vector out.
//!
//! Calls an OpenAI-compatible `/embeddings` endpoint. Same status mapping
//! as the chat client. Runs on the caller's task; blocking on I/O there is
//! the intended concurrency model.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use agentforge_core::caller::Embedder;
use agentforge_core::error::ProviderError;
use agentforge_core::keys::EmbeddingConfig;

/// Trim inputs to a safe length before hitting model token limits.
const MAX_EMBED_INPUT_CHARS: usize = 8000;

pub struct EmbeddingClient {
    config: EmbeddingConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct EmbeddingApiResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl EmbeddingClient {
    pub fn new(config: EmbeddingConfig) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .expect("Failed to create HTTP client");
        Self { config, client }
    }

    /// Declared output dimension of the configured model.
    pub fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Embed a piece of text and return the float vector.
    ///
    /// The returned vector has `dimensions()` elements; the vector store
    /// enforces that against the target collection.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        if text.trim().is_empty() {
            return Err(ProviderError::Validation("cannot embed blank text".into()));
        }

        let input = truncate_chars(text, MAX_EMBED_INPUT_CHARS);

        let body = serde_json::json!({
            "model": self.config.model,
            "input": [input],
            "dimensions": self.config.dimensions,
        });

        debug!(model = %self.config.model, input_len = input.len(), "sending embedding request");

        let url = format!("{}/embeddings", self.config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(self.config.timeout_seconds))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(format!("embedding API: {e}"))
                } else {
                    ProviderError::Network(format!("embedding API: {e}"))
                }
            })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Network(format!("reading embedding body: {e}")))?;

        if status == 429 {
            return Err(ProviderError::RateLimited { retry_after_secs: 5 });
        }
        if !(200..300).contains(&status) {
            let mut message = body;
            message.truncate(500);
            return Err(ProviderError::Api { status, message });
        }

        let parsed: EmbeddingApiResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Protocol(format!("embedding response: {e}")))?;

        let vector = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| ProviderError::Protocol("embedding response had no data".into()))?;

        debug!(dim = vector.len(), "embedding received");
        Ok(vector)
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        EmbeddingClient::embed(self, text).await
    }
}

/// Truncate to at most `max` characters, respecting char boundaries.
fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
