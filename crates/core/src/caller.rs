//! Provider seams — the traits the rest of the system calls LLM and
//! embedding backends through.
//!
//! Both the single-provider client and the primary/fallback router
//! implement `ChatCaller`, so the agent loop neither knows nor cares
//! whether it is talking through a user's own key or the system routing
//! stack. Tests implement these with scripted mocks.

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::message::{ChatRequest, ChatResponse};

/// Callback invoked synchronously for every non-empty content token of a
/// streaming completion.
pub type TokenSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

#[async_trait]
pub trait ChatCaller: Send + Sync {
    /// Full-completion call.
    async fn chat(&self, request: ChatRequest) -> std::result::Result<ChatResponse, ProviderError>;

    /// Streaming call. `on_token` fires per content delta, in arrival
    /// order; the assembled response is returned once the stream ends and
    /// is shaped identically to a non-streaming response.
    async fn stream_chat(
        &self,
        request: ChatRequest,
        on_token: TokenSink<'_>,
    ) -> std::result::Result<ChatResponse, ProviderError>;
}

/// Text → fixed-dimension float vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Declared output dimension; returned vectors have this length.
    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, ProviderError>;
}
