//! High-availability LLM request router.
//!
//! Call graph (both `chat` and `stream_chat`):
//!
//! ```text
//!   chat(request) / stream_chat(request, on_token)
//!     └─ primary breaker + retry
//!           └─ primary client
//!                 ↓ (on circuit-open or any error)
//!     └─ fallback breaker + retry
//!           └─ fallback client
//! ```
//!
//! As long as at least one provider is reachable the agent loop continues
//! without human intervention.
//!
//! Streaming note: breakers trip on the whole guarded call. If the primary
//! opens the stream but drops mid-way, that counts as a failed call and
//! the request re-runs on the fallback — `on_token` may already have fired
//! for partial content, which the loop treats as a restarted thought.

use std::time::Instant;

use async_trait::async_trait;
use tracing::warn;

use agentforge_core::caller::{ChatCaller, TokenSink};
use agentforge_core::error::ProviderError;
use agentforge_core::keys::ProviderConfig;
use agentforge_core::message::{ChatRequest, ChatResponse};

use crate::breaker::{BreakerSettings, CircuitBreaker};
use crate::client::LlmClient;
use crate::retry::RetryPolicy;

pub struct LlmRouter {
    primary: LlmClient,
    fallback: LlmClient,
    primary_breaker: CircuitBreaker,
    fallback_breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl LlmRouter {
    pub fn new(primary: ProviderConfig, fallback: ProviderConfig) -> Self {
        Self::with_policies(primary, fallback, BreakerSettings::default(), RetryPolicy::default())
    }

    pub fn with_policies(
        primary: ProviderConfig,
        fallback: ProviderConfig,
        breaker_settings: BreakerSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            primary_breaker: CircuitBreaker::new("primaryLlm", breaker_settings.clone()),
            fallback_breaker: CircuitBreaker::new("fallbackLlm", breaker_settings),
            primary: LlmClient::new(primary),
            fallback: LlmClient::new(fallback),
            retry,
        }
    }

    /// Execute a call under a breaker + retry. The breaker sees one
    /// composite outcome per guarded call (retries included), and slow
    /// calls are measured across the whole composite.
    async fn guarded<T, F, Fut>(
        &self,
        breaker: &CircuitBreaker,
        label: &str,
        mut op: F,
    ) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        breaker.try_acquire()?;
        let started = Instant::now();
        let result = self.retry.run(label, &mut op).await;
        match &result {
            Ok(_) => breaker.record(started.elapsed(), false),
            Err(e) if e.counts_as_failure() => breaker.record(started.elapsed(), true),
            Err(_) => {}
        }
        result
    }
}

#[async_trait]
impl ChatCaller for LlmRouter {
    /// Route a chat request through primary → fallback with full
    /// resilience. The request's model field is overridden by each
    /// provider's own configured model, so callers only pass messages.
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let primary_request = request.with_model(self.primary.model_name());
        match self
            .guarded(&self.primary_breaker, "primary", || {
                self.primary.chat(primary_request.clone())
            })
            .await
        {
            Ok(response) => Ok(response),
            Err(primary_error) => {
                warn!(error = %primary_error, "primary provider failed, engaging fallback");
                let fallback_request = request.with_model(self.fallback.model_name());
                self.guarded(&self.fallback_breaker, "fallback", || {
                    self.fallback.chat(fallback_request.clone())
                })
                .await
                .map_err(|e| {
                    warn!(error = %e, "fallback provider failed as well");
                    e
                })
            }
        }
    }

    async fn stream_chat(
        &self,
        request: ChatRequest,
        on_token: TokenSink<'_>,
    ) -> Result<ChatResponse, ProviderError> {
        let primary_request = request.with_model(self.primary.model_name());
        match self
            .guarded(&self.primary_breaker, "primary", || {
                self.primary.stream_chat(primary_request.clone(), on_token)
            })
            .await
        {
            Ok(response) => Ok(response),
            Err(primary_error) => {
                warn!(error = %primary_error, "primary stream failed, engaging fallback");
                let fallback_request = request.with_model(self.fallback.model_name());
                self.guarded(&self.fallback_breaker, "fallback", || {
                    self.fallback.stream_chat(fallback_request.clone(), on_token)
                })
                .await
                .map_err(|e| {
                    warn!(error = %e, "fallback stream failed as well");
                    e
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentforge_core::message::ChatMessage;
    use std::time::Duration;

    fn config(name: &str, model: &str) -> ProviderConfig {
        ProviderConfig {
            name: name.into(),
            // .invalid never resolves, so live calls fail fast as Network
            base_url: format!("https://{name}.invalid/v1"),
            api_key: "sk-test".into(),
            model: model.into(),
            timeout_seconds: 1,
        }
    }

    fn quick_router() -> LlmRouter {
        LlmRouter::with_policies(
            config("primary", "model-a"),
            config("fallback", "model-b"),
            // Default 30s open keeps tripped breakers tripped for the
            // duration of a test.
            BreakerSettings::default(),
            RetryPolicy {
                max_attempts: 1,
                base_delay: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn both_providers_failing_surfaces_error() {
        let router = quick_router();
        let request = ChatRequest::simple("", vec![ChatMessage::user("hi")]);
        let result = router.chat(request).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn guarded_records_breaker_failures() {
        let router = quick_router();
        let request = ChatRequest::simple("", vec![ChatMessage::user("hi")]);

        // Enough failing calls trip both breakers; subsequent calls are
        // rejected without hitting the network.
        for _ in 0..10 {
            let _ = router.chat(request.clone()).await;
        }
        assert!(router.primary_breaker.is_open());
        assert!(router.fallback_breaker.is_open());

        let err = router.chat(request).await.unwrap_err();
        assert!(matches!(err, ProviderError::CircuitOpen(_)));
    }

    #[tokio::test]
    async fn validation_errors_do_not_trip_breaker() {
        let router = quick_router();
        for _ in 0..20 {
            let _ = router
                .guarded(&router.primary_breaker, "primary", || async {
                    Err::<(), _>(ProviderError::Validation("bad".into()))
                })
                .await;
        }
        assert!(!router.primary_breaker.is_open());
    }
}
