//! Memory compression — merge duplicate/similar memories via the user's
//! LLM, then replace them after human confirmation.
//!
//! Two-phase by design: `prepare_compression` only proposes; the caller
//! shows current vs proposed to the user and then invokes
//! `execute_compression` with the confirmed ids. Execution is not atomic
//! across delete and insert — partial progress is user-recoverable.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use agentforge_core::caller::ChatCaller;
use agentforge_core::keys::ProviderConfig;
use agentforge_core::memory::{MemoryItem, MemoryType};
use agentforge_core::message::{ChatMessage, ChatRequest};
use agentforge_providers::{KeyResolver, LlmClient};

use crate::service::MemoryService;

const MAX_MEMORIES_FOR_COMPRESS: usize = 200;
/// Synthetic session id carried by compressed memories.
const COMPRESS_SESSION_ID: &str = "compressed";

const PROMPT_TEMPLATE: &str = "You are a memory compression assistant. Below is a list of long-term memory entries (content, type, importance).\n\
Merge duplicates and semantically similar items into a smaller set. Keep important facts; drop redundant or low-value entries.\n\
Preserve memory_type (SEMANTIC, EPISODIC, PROCEDURAL) and set importance 0.0-1.0.\n\
Reply with ONLY a JSON array, no markdown, no explanation. Example:\n\
[{\"content\":\"用户是Java开发人员\",\"memory_type\":\"SEMANTIC\",\"importance\":0.85},{\"content\":\"...\",\"memory_type\":\"EPISODIC\",\"importance\":0.7}]\n\n\
Memories to compress:\n";

/// One proposed post-compression memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedMemory {
    pub content: String,
    #[serde(default)]
    pub memory_type: Option<String>,
    #[serde(default)]
    pub importance: Option<f64>,
}

/// Current memories + the LLM's proposed merge, for side-by-side review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressPrepareResult {
    pub current: Vec<MemoryItem>,
    pub proposed: Vec<CompressedMemory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CompressPrepareResult {
    fn error(current: Vec<MemoryItem>, message: impl Into<String>) -> Self {
        Self {
            current,
            proposed: Vec::new(),
            error: Some(message.into()),
        }
    }
}

/// Builds a chat caller for a user's LLM config. Swappable for tests.
pub type CallerFactory = Arc<dyn Fn(ProviderConfig) -> Arc<dyn ChatCaller> + Send + Sync>;

pub fn default_caller_factory() -> CallerFactory {
    Arc::new(|config| Arc::new(LlmClient::new(config)))
}

pub struct MemoryCompressService {
    memory: Arc<MemoryService>,
    key_resolver: Arc<KeyResolver>,
    caller_factory: CallerFactory,
}

impl MemoryCompressService {
    pub fn new(memory: Arc<MemoryService>, key_resolver: Arc<KeyResolver>) -> Self {
        Self {
            memory,
            key_resolver,
            caller_factory: default_caller_factory(),
        }
    }

    pub fn with_caller_factory(mut self, factory: CallerFactory) -> Self {
        self.caller_factory = factory;
        self
    }

    /// Fetch current memories and ask the user's LLM for a compressed set.
    /// Returns both lists for UI comparison; never throws.
    pub async fn prepare_compression(&self, user_id: Option<i64>) -> CompressPrepareResult {
        let Some(user_id) = user_id else {
            return CompressPrepareResult::error(Vec::new(), "未登录");
        };

        let current = self
            .memory
            .list_memories(None, None, None, 0, MAX_MEMORIES_FOR_COMPRESS, Some(user_id))
            .await;
        if current.is_empty() {
            return CompressPrepareResult {
                current,
                proposed: Vec::new(),
                error: None,
            };
        }

        let config = match self.key_resolver.resolve_default_llm(Some(user_id)).await {
            Ok(Some(config)) => config,
            Ok(None) => return CompressPrepareResult::error(current, "请先配置默认 LLM 密钥"),
            Err(e) => return CompressPrepareResult::error(current, format!("密钥解析失败: {e}")),
        };

        let mut listing = String::new();
        for m in &current {
            let content = if m.content.chars().count() > 200 {
                let cut: String = m.content.chars().take(200).collect();
                format!("{cut}...")
            } else {
                m.content.clone()
            };
            listing.push_str(&format!(
                "- [{}] importance={}: {}\n",
                m.memory_type, m.importance, content
            ));
        }

        let model = config.model.clone();
        let caller = (self.caller_factory)(config);
        let request = ChatRequest::simple(
            model,
            vec![
                ChatMessage::system("You output only valid JSON arrays. No markdown, no code fence."),
                ChatMessage::user(format!("{PROMPT_TEMPLATE}{listing}")),
            ],
        );

        let response = match caller.chat(request).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "compression proposal call failed");
                return CompressPrepareResult::error(current, format!("压缩建议生成失败: {e}"));
            }
        };

        let raw = response
            .first_message()
            .and_then(|m| m.content.clone())
            .unwrap_or_default();
        if raw.trim().is_empty() {
            return CompressPrepareResult::error(current, "LLM 返回为空");
        }

        match serde_json::from_str::<Vec<CompressedMemory>>(strip_markdown_json(&raw)) {
            Ok(proposed) => CompressPrepareResult {
                current,
                proposed,
                error: None,
            },
            Err(e) => {
                warn!(error = %e, "compression proposal was not valid JSON");
                CompressPrepareResult::error(current, format!("压缩建议生成失败: {e}"))
            }
        }
    }

    /// Delete the confirmed ids and insert the new compressed memories.
    /// Each delete failure is tolerated individually.
    pub async fn execute_compression(
        &self,
        user_id: Option<i64>,
        delete_ids: &[i64],
        new_memories: &[CompressedMemory],
    ) {
        let Some(user_id) = user_id else { return };

        for &id in delete_ids {
            if let Err(e) = self.memory.delete_by_id(id, Some(user_id)).await {
                warn!(id, error = %e, "failed to delete memory during compression");
            }
        }

        for dto in new_memories {
            if dto.content.trim().is_empty() {
                continue;
            }
            let memory_type = dto
                .memory_type
                .as_deref()
                .map(MemoryType::parse_or_semantic)
                .unwrap_or(MemoryType::Semantic);
            let importance = dto.importance.unwrap_or(0.8) as f32;
            self.memory
                .remember(COMPRESS_SESSION_ID, &dto.content, memory_type, importance, Some(user_id))
                .await;
        }

        info!(
            user_id,
            deleted = delete_ids.len(),
            inserted = new_memories.len(),
            "memory compression executed"
        );
    }
}

/// Strip a Markdown code fence (```json ... ```) if the model added one
/// despite instructions.
fn strip_markdown_json(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed;
    };
    let after_fence = &trimmed[start + 3..];
    // Skip an optional language tag on the fence line
    let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_fence[body_start..];
    match body.find("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memdb::InMemoryVectorStore;
    use crate::service::tests::test_service;
    use crate::store::VectorStore;
    use agentforge_core::caller::TokenSink;
    use agentforge_core::error::{ProviderError, StoreError};
    use agentforge_core::keys::{ApiKeyStore, KeyPurpose, NewUserApiKey, UserApiKey};
    use agentforge_core::message::{ChatResponse, Choice};
    use async_trait::async_trait;

    #[test]
    fn fence_stripping() {
        assert_eq!(strip_markdown_json("[1,2]"), "[1,2]");
        assert_eq!(strip_markdown_json("```json\n[1,2]\n```"), "[1,2]");
        assert_eq!(strip_markdown_json("```\n[1,2]\n```"), "[1,2]");
        assert_eq!(strip_markdown_json("  [1,2]  "), "[1,2]");
    }

    #[test]
    fn proposal_parsing_tolerates_missing_fields() {
        let parsed: Vec<CompressedMemory> =
            serde_json::from_str(r#"[{"content":"用户是Java开发人员","memory_type":"SEMANTIC","importance":0.85},{"content":"bare"}]"#)
                .unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parsed[1].memory_type.is_none());
        assert!(parsed[1].importance.is_none());
    }

    struct OneKey;

    #[async_trait]
    impl ApiKeyStore for OneKey {
        async fn insert(&self, _key: NewUserApiKey) -> Result<UserApiKey, StoreError> {
            unimplemented!()
        }
        async fn active_keys(&self, user_id: i64) -> Result<Vec<UserApiKey>, StoreError> {
            Ok(vec![UserApiKey {
                id: 1,
                user_id,
                provider: "openai".into(),
                purpose: KeyPurpose::Llm,
                key_value: "sk-user".into(),
                base_url: None,
                model: None,
                is_default: true,
                is_active: true,
            }])
        }
        async fn set_default(&self, _u: i64, _k: i64) -> Result<(), StoreError> {
            unimplemented!()
        }
    }

    struct NoKeys;

    #[async_trait]
    impl ApiKeyStore for NoKeys {
        async fn insert(&self, _key: NewUserApiKey) -> Result<UserApiKey, StoreError> {
            unimplemented!()
        }
        async fn active_keys(&self, _user_id: i64) -> Result<Vec<UserApiKey>, StoreError> {
            Ok(vec![])
        }
        async fn set_default(&self, _u: i64, _k: i64) -> Result<(), StoreError> {
            unimplemented!()
        }
    }

    struct FixedCaller {
        reply: String,
    }

    #[async_trait]
    impl ChatCaller for FixedCaller {
        async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, ProviderError> {
            Ok(ChatResponse {
                choices: vec![Choice {
                    index: 0,
                    message: ChatMessage::assistant_text(&self.reply),
                    finish_reason: Some("stop".into()),
                }],
                ..ChatResponse::default()
            })
        }

        async fn stream_chat(
            &self,
            request: ChatRequest,
            _on_token: TokenSink<'_>,
        ) -> Result<ChatResponse, ProviderError> {
            self.chat(request).await
        }
    }

    fn compress_service(
        store: std::sync::Arc<dyn VectorStore>,
        keys: Arc<dyn ApiKeyStore>,
        reply: &str,
    ) -> (Arc<MemoryService>, MemoryCompressService) {
        let memory = Arc::new(test_service(Some(store)));
        let reply = reply.to_string();
        let service = MemoryCompressService::new(memory.clone(), Arc::new(KeyResolver::new(keys)))
            .with_caller_factory(Arc::new(move |_| {
                Arc::new(FixedCaller { reply: reply.clone() })
            }));
        (memory, service)
    }

    #[tokio::test]
    async fn anonymous_user_gets_error() {
        let store: std::sync::Arc<dyn VectorStore> = std::sync::Arc::new(InMemoryVectorStore::new());
        let (_, service) = compress_service(store, Arc::new(OneKey), "[]");
        let result = service.prepare_compression(None).await;
        assert_eq!(result.error.as_deref(), Some("未登录"));
    }

    #[tokio::test]
    async fn empty_memory_set_proposes_nothing() {
        let store: std::sync::Arc<dyn VectorStore> = std::sync::Arc::new(InMemoryVectorStore::new());
        let (_, service) = compress_service(store, Arc::new(OneKey), "[]");
        let result = service.prepare_compression(Some(7)).await;
        assert!(result.current.is_empty());
        assert!(result.proposed.is_empty());
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn missing_llm_key_is_reported() {
        let store: std::sync::Arc<dyn VectorStore> = std::sync::Arc::new(InMemoryVectorStore::new());
        let (memory, service) = compress_service(store, Arc::new(NoKeys), "[]");
        memory
            .remember("s", "something", MemoryType::Semantic, 0.5, Some(7))
            .await;

        let result = service.prepare_compression(Some(7)).await;
        assert_eq!(result.current.len(), 1);
        assert!(result.error.as_deref().unwrap().contains("LLM"));
    }

    #[tokio::test]
    async fn proposal_with_fenced_json_is_parsed() {
        let store: std::sync::Arc<dyn VectorStore> = std::sync::Arc::new(InMemoryVectorStore::new());
        let reply = "```json\n[{\"content\":\"用户是Java开发人员\",\"memory_type\":\"SEMANTIC\",\"importance\":0.85}]\n```";
        let (memory, service) = compress_service(store, Arc::new(OneKey), reply);
        memory.remember("s", "用户写Java", MemoryType::Semantic, 0.5, Some(7)).await;
        memory.remember("s", "用户是Java开发", MemoryType::Semantic, 0.5, Some(7)).await;

        let result = service.prepare_compression(Some(7)).await;
        assert!(result.error.is_none());
        assert_eq!(result.current.len(), 2);
        assert_eq!(result.proposed.len(), 1);
        assert_eq!(result.proposed[0].content, "用户是Java开发人员");
    }

    #[tokio::test]
    async fn execute_replaces_and_tags_compressed_session() {
        let store: std::sync::Arc<dyn VectorStore> = std::sync::Arc::new(InMemoryVectorStore::new());
        let (memory, service) = compress_service(store, Arc::new(OneKey), "[]");
        memory.remember("s", "dup one", MemoryType::Semantic, 0.5, Some(7)).await;
        memory.remember("s", "dup two", MemoryType::Semantic, 0.5, Some(7)).await;

        let items = memory.list_memories(None, None, None, 0, 10, Some(7)).await;
        let ids: Vec<i64> = items.iter().map(|i| i.id).collect();

        service
            .execute_compression(
                Some(7),
                &ids,
                &[CompressedMemory {
                    content: "merged fact".into(),
                    memory_type: Some("SEMANTIC".into()),
                    importance: Some(0.9),
                }],
            )
            .await;

        let after = memory.list_memories(None, None, None, 0, 10, Some(7)).await;
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].content, "merged fact");
        assert_eq!(after[0].session_id, "compressed");
    }
}
