//! Chat wire types — messages, requests, responses, and streaming chunks.
//!
//! These serialize directly to the OpenAI-compatible `/chat/completions`
//! schema, so a deserialized context window can be re-sent to a provider
//! without any mapping layer in between.

use serde::{Deserialize, Serialize};

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions (persona, rules)
    System,
    /// The end user
    User,
    /// The model's reply; may carry tool calls instead of content
    Assistant,
    /// Tool execution result
    Tool,
}

/// A single entry in the LLM conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,

    /// Text content. None for assistant messages that only carry tool_calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Present only in assistant messages when the model wants to call one
    /// or more tools. Maps to the `tool_calls` array in the wire format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,

    /// Present only in tool-result messages. Must match the id from the
    /// corresponding ToolCall.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: None,
            tool_calls: Some(tool_calls),
            tool_call_id: None,
        }
    }

    /// Create a tool result message answering the given call id.
    pub fn tool_result(tool_call_id: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(result.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|tc| !tc.is_empty())
    }
}

/// A single tool invocation request produced by the model.
///
/// `arguments` is a raw JSON string (not a parsed object) — the executor
/// forwards it verbatim and parses only what it needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,

    #[serde(rename = "type")]
    pub kind: String,

    pub function: FunctionCall,
}

/// The `function` sub-object inside a ToolCall.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

/// The request body sent to an OpenAI-compatible `/chat/completions` endpoint.
///
/// `tool_choice` accepts:
///   "none"     — model will not call any tool
///   "auto"     — model decides (default)
///   "required" — model MUST call at least one tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<crate::tool::ToolDefinition>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn simple(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: None,
            tool_choice: None,
            temperature: Some(0.7),
            max_tokens: Some(4096),
        }
    }

    pub fn with_tools(
        model: impl Into<String>,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<crate::tool::ToolDefinition>>,
    ) -> Self {
        let has_tools = tools.is_some();
        Self {
            model: model.into(),
            messages,
            tools,
            tool_choice: has_tools.then(|| "auto".to_string()),
            temperature: Some(0.7),
            max_tokens: Some(4096),
        }
    }

    /// Copy of this request with the model name substituted.
    pub fn with_model(&self, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..self.clone()
        }
    }
}

/// Top-level response from `/chat/completions`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default)]
    pub choices: Vec<Choice>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatResponse {
    /// First choice message (always present for well-formed responses).
    pub fn first_message(&self) -> Option<&ChatMessage> {
        self.choices.first().map(|c| &c.message)
    }

    /// True if the model wants to call one or more tools.
    pub fn has_tool_calls(&self) -> bool {
        self.first_message().is_some_and(ChatMessage::has_tool_calls)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    pub message: ChatMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

// --- Streaming SSE types ---

/// One SSE `data: {...}` frame from a streaming `/chat/completions` response.
///
/// Parsing contract (see `LlmClient::stream_chat`):
///   1. Skip empty lines and lines not starting with `data: `
///   2. `data: [DONE]` → stream ended
///   3. Otherwise strip the prefix and deserialize as `StreamingChunk`
///   4. `delta.content` may be absent (role-only first frame)
///   5. `delta.tool_calls` fragments must be accumulated per index
#[derive(Debug, Clone, Deserialize)]
pub struct StreamingChunk {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: Option<DeltaMessage>,

    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Sparse message delta — only the fields that changed in this chunk are
/// present. The first chunk usually carries `{"role":"assistant"}`,
/// subsequent chunks carry `{"content":"token"}` or `{"tool_calls":[...]}`.
#[derive(Debug, Clone, Deserialize)]
pub struct DeltaMessage {
    #[serde(default)]
    pub role: Option<String>,

    #[serde(default)]
    pub content: Option<String>,

    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

/// Incremental tool-call fragment. The model streams the call id/name in the
/// first chunk for an index and spreads the arguments JSON across many.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: Option<u32>,

    #[serde(default)]
    pub id: Option<String>,

    #[serde(default, rename = "type")]
    pub kind: Option<String>,

    #[serde(default)]
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionDelta {
    #[serde(default)]
    pub name: Option<String>,

    /// Partial JSON string; accumulate until the stream finishes.
    #[serde(default)]
    pub arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_roundtrip_matches_wire_schema() {
        let msg = ChatMessage::user("hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "hello");
        // Optional fields are absent, not null
        assert!(json.get("tool_calls").is_none());
        assert!(json.get("tool_call_id").is_none());
    }

    #[test]
    fn assistant_tool_call_serialization() {
        let msg = ChatMessage::assistant_tool_calls(vec![ToolCall {
            id: "call_1".into(),
            kind: "function".into(),
            function: FunctionCall {
                name: "recall_memory".into(),
                arguments: r#"{"query":"user name"}"#.into(),
            },
        }]);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["tool_calls"][0]["type"], "function");
        assert_eq!(json["tool_calls"][0]["function"]["name"], "recall_memory");
        assert!(json.get("content").is_none());
    }

    #[test]
    fn tool_result_carries_call_id() {
        let msg = ChatMessage::tool_result("call_9", "42");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_9"));
        assert_eq!(msg.content.as_deref(), Some("42"));
    }

    #[test]
    fn request_with_tools_sets_auto_choice() {
        let req = ChatRequest::with_tools("gpt-4o", vec![ChatMessage::user("hi")], Some(vec![]));
        assert_eq!(req.tool_choice.as_deref(), Some("auto"));
        assert_eq!(req.temperature, Some(0.7));
        assert_eq!(req.max_tokens, Some(4096));

        let bare = ChatRequest::with_tools("gpt-4o", vec![], None);
        assert!(bare.tool_choice.is_none());
    }

    #[test]
    fn model_override_preserves_rest() {
        let req = ChatRequest::simple("a", vec![ChatMessage::user("x")]);
        let swapped = req.with_model("b");
        assert_eq!(swapped.model, "b");
        assert_eq!(swapped.messages.len(), 1);
        assert_eq!(swapped.temperature, Some(0.7));
    }

    #[test]
    fn parse_stream_content_delta() {
        let data = r#"{"choices":[{"delta":{"content":"Hello"},"finish_reason":null}]}"#;
        let chunk: StreamingChunk = serde_json::from_str(data).unwrap();
        let delta = chunk.choices[0].delta.as_ref().unwrap();
        assert_eq!(delta.content.as_deref(), Some("Hello"));
        assert!(chunk.choices[0].finish_reason.is_none());
    }

    #[test]
    fn parse_stream_tool_call_delta() {
        let data = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","type":"function","function":{"name":"store_memory"}}]},"finish_reason":null}]}"#;
        let chunk: StreamingChunk = serde_json::from_str(data).unwrap();
        let tc = &chunk.choices[0].delta.as_ref().unwrap().tool_calls.as_ref().unwrap()[0];
        assert_eq!(tc.index, Some(0));
        assert_eq!(tc.id.as_deref(), Some("c1"));
        assert_eq!(tc.function.as_ref().unwrap().name.as_deref(), Some("store_memory"));
    }

    #[test]
    fn parse_stream_arguments_fragment() {
        // Arguments arrive incrementally; id is only present in the first delta
        let data = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"cont"}}]},"finish_reason":null}]}"#;
        let chunk: StreamingChunk = serde_json::from_str(data).unwrap();
        let tc = &chunk.choices[0].delta.as_ref().unwrap().tool_calls.as_ref().unwrap()[0];
        assert!(tc.id.is_none());
        assert_eq!(tc.function.as_ref().unwrap().arguments.as_deref(), Some("{\"cont"));
    }

    #[test]
    fn response_tool_call_detection() {
        let resp: ChatResponse = serde_json::from_str(
            r#"{"id":"x","choices":[{"index":0,"message":{"role":"assistant","tool_calls":[{"id":"c1","type":"function","function":{"name":"f","arguments":"{}"}}]},"finish_reason":"tool_calls"}]}"#,
        )
        .unwrap();
        assert!(resp.has_tool_calls());
    }

    #[test]
    fn context_window_roundtrip() {
        // The persisted context blob must re-serialize identically
        let messages = vec![
            ChatMessage::system("You are an agent"),
            ChatMessage::user("hi"),
            ChatMessage::assistant_text("hello"),
        ];
        let blob = serde_json::to_string(&messages).unwrap();
        let back: Vec<ChatMessage> = serde_json::from_str(&blob).unwrap();
        assert_eq!(back.len(), 3);
        assert_eq!(back[0].role, Role::System);
        assert_eq!(back[2].content.as_deref(), Some("hello"));
    }
}
