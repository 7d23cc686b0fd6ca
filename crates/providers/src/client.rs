//! OpenAI-compatible LLM client.
//!
//! Stateless: one instance per provider config, shared freely across tasks.
//! Two modes of operation:
//!
//!  `chat()`        — blocking, waits for the full response. Used for
//!                    planner/structured-output calls.
//!
//!  `stream_chat()` — streaming SSE, fires the token callback per content
//!                    delta and returns the fully assembled response when
//!                    the stream ends, shaped identically to `chat()`, so
//!                    the agent loop can act on tool calls either way.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, warn};

use agentforge_core::caller::{ChatCaller, TokenSink};
use agentforge_core::error::ProviderError;
use agentforge_core::keys::ProviderConfig;
use agentforge_core::message::{
    ChatMessage, ChatRequest, ChatResponse, Choice, FunctionCall, Role, StreamingChunk, ToolCall,
};

const SSE_DATA_PREFIX: &str = "data: ";
const SSE_DONE: &str = "[DONE]";

/// An OpenAI-compatible LLM provider client.
///
/// Handles the vast majority of providers since most expose a compatible
/// `/v1/chat/completions` endpoint.
pub struct LlmClient {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: ProviderConfig) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .expect("Failed to create HTTP client");
        Self { config, client }
    }

    /// The model name configured for this provider (e.g. "gpt-4o").
    pub fn model_name(&self) -> &str {
        &self.config.model
    }

    pub fn provider_name(&self) -> &str {
        &self.config.name
    }

    /// Providers that validate tool-call history strictly will 4xx when a
    /// role=tool message survives a context trim without its matching
    /// assistant tool_calls message. For those, drop tool messages before
    /// transmission.
    fn strict_tool_history(&self) -> bool {
        let name = self.config.name.to_lowercase();
        name.contains("zhipu") || name.contains("glm")
    }

    /// Normalize a request for this provider: substitute the configured
    /// model when the request leaves it empty, apply provider quirks.
    fn normalize(&self, mut request: ChatRequest) -> ChatRequest {
        if request.model.is_empty() {
            request.model = self.config.model.clone();
        }
        if self.strict_tool_history() {
            request.messages.retain(|m| m.role != Role::Tool);
        }
        request
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn map_send_error(&self, e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout(format!("provider [{}]: {e}", self.config.name))
        } else {
            ProviderError::Network(format!("provider [{}]: {e}", self.config.name))
        }
    }

    /// Shared non-2xx handling for both modes.
    fn check_status(&self, status: u16, body_snippet: &str) -> Result<(), ProviderError> {
        if status == 429 {
            return Err(ProviderError::RateLimited { retry_after_secs: 5 });
        }
        if !(200..300).contains(&status) {
            warn!(provider = %self.config.name, status, "provider returned error");
            let mut message = body_snippet.to_string();
            message.truncate(500);
            return Err(ProviderError::Api { status, message });
        }
        Ok(())
    }
}

#[async_trait]
impl ChatCaller for LlmClient {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let request = self.normalize(request);
        debug!(provider = %self.config.name, model = %request.model, "sending completion request");

        let response = self
            .client
            .post(self.completions_url())
            .timeout(Duration::from_secs(self.config.timeout_seconds))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Network(format!("reading body: {e}")))?;
        self.check_status(status, &body)?;

        serde_json::from_str(&body).map_err(|e| {
            ProviderError::Protocol(format!(
                "provider [{}] response: {e}",
                self.config.name
            ))
        })
    }

    async fn stream_chat(
        &self,
        request: ChatRequest,
        on_token: TokenSink<'_>,
    ) -> Result<ChatResponse, ProviderError> {
        let request = self.normalize(request);
        debug!(provider = %self.config.name, model = %request.model, "sending streaming request");

        // Inject the stream flag without widening the request type.
        let mut body = serde_json::to_value(&request)
            .map_err(|e| ProviderError::Protocol(format!("serializing request: {e}")))?;
        body["stream"] = serde_json::Value::Bool(true);

        let response = self
            .client
            .post(self.completions_url())
            // Streams can legitimately run long; give them double headroom.
            .timeout(Duration::from_secs(self.config.timeout_seconds * 2))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            self.check_status(status, &body)?;
            unreachable!("check_status rejects every non-2xx status");
        }

        let mut byte_stream = response.bytes_stream();
        let mut assembler = StreamAssembler::new();
        let mut buffer = String::new();

        while let Some(chunk) = byte_stream.next().await {
            let bytes = chunk.map_err(|e| {
                ProviderError::StreamInterrupted(format!("provider [{}]: {e}", self.config.name))
            })?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            // Process complete lines; keep any partial line in the buffer.
            while let Some(line_end) = buffer.find('\n') {
                let line = buffer[..line_end].trim_end_matches('\r').to_string();
                buffer.drain(..=line_end);

                if assembler.feed_line(&line, on_token) {
                    return Ok(assembler.finish());
                }
            }
        }

        // Stream ended without [DONE]; return what was assembled.
        Ok(assembler.finish())
    }
}

/// Accumulates incremental tool-call deltas into a complete call.
#[derive(Default)]
struct ToolCallAccumulator {
    id: String,
    kind: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn to_tool_call(&self) -> ToolCall {
        ToolCall {
            id: self.id.clone(),
            kind: if self.kind.is_empty() {
                "function".into()
            } else {
                self.kind.clone()
            },
            function: FunctionCall {
                name: self.name.clone(),
                arguments: self.arguments.clone(),
            },
        }
    }
}

/// Assembles an SSE line stream into a non-streaming-shaped `ChatResponse`.
///
/// Tool-call assembly: the model streams fragments across many chunks; we
/// accumulate id/type/name/arguments per tool-call index and build complete
/// calls at the end, in ascending index order.
struct StreamAssembler {
    content: String,
    // index → accumulator; BTreeMap keeps ascending index order for free
    tool_calls: BTreeMap<u32, ToolCallAccumulator>,
    response_id: Option<String>,
    response_model: Option<String>,
    finish_reason: Option<String>,
}

impl StreamAssembler {
    fn new() -> Self {
        Self {
            content: String::new(),
            tool_calls: BTreeMap::new(),
            response_id: None,
            response_model: None,
            finish_reason: None,
        }
    }

    /// Consume one SSE line. Returns true when the stream is done.
    fn feed_line(&mut self, line: &str, on_token: TokenSink<'_>) -> bool {
        if line.is_empty() || !line.starts_with(SSE_DATA_PREFIX) {
            return false;
        }
        let data = line[SSE_DATA_PREFIX.len()..].trim();
        if data == SSE_DONE {
            return true;
        }

        let chunk: StreamingChunk = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to parse SSE chunk, skipping");
                return false;
            }
        };

        if self.response_id.is_none() {
            self.response_id = chunk.id;
        }
        if self.response_model.is_none() {
            self.response_model = chunk.model;
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return false;
        };
        if choice.finish_reason.is_some() {
            self.finish_reason = choice.finish_reason;
        }
        let Some(delta) = choice.delta else {
            return false;
        };

        // ── Content token ──
        if let Some(content) = delta.content {
            if !content.is_empty() {
                self.content.push_str(&content);
                on_token(&content);
            }
        }

        // ── Tool-call deltas ──
        if let Some(deltas) = delta.tool_calls {
            for tc in deltas {
                let idx = tc.index.unwrap_or(0);
                let acc = self.tool_calls.entry(idx).or_default();
                if let Some(id) = tc.id {
                    acc.id = id;
                }
                if let Some(kind) = tc.kind {
                    acc.kind = kind;
                }
                if let Some(function) = tc.function {
                    if let Some(name) = function.name {
                        acc.name = name;
                    }
                    if let Some(arguments) = function.arguments {
                        acc.arguments.push_str(&arguments);
                    }
                }
            }
        }

        false
    }

    fn finish(self) -> ChatResponse {
        let message = if self.tool_calls.is_empty() {
            ChatMessage {
                role: Role::Assistant,
                content: if self.content.is_empty() {
                    None
                } else {
                    Some(self.content)
                },
                tool_calls: None,
                tool_call_id: None,
            }
        } else {
            let calls = self.tool_calls.values().map(ToolCallAccumulator::to_tool_call).collect();
            ChatMessage {
                role: Role::Assistant,
                content: if self.content.is_empty() {
                    None
                } else {
                    Some(self.content)
                },
                tool_calls: Some(calls),
                tool_call_id: None,
            }
        };

        ChatResponse {
            id: self.response_id,
            object: Some("chat.completion".into()),
            created: None,
            model: self.response_model,
            choices: vec![Choice {
                index: 0,
                message,
                finish_reason: self.finish_reason,
            }],
            usage: None,
        }
    }
}
