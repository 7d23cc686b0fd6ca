//! Long-term memory service — the agent's persistent knowledge store.
//!
//! Three operation groups:
//!
//!   remember()  — embed + store (used by the agent loop automatically)
//!   recall()    — ANN search (used by the recall_memory built-in)
//!   browse      — query by filter, search, delete, count (management API)
//!
//! Every call that accepts a user id resolves the user's default embedding
//! config; absent, it falls back to the system default. The resolved
//! (client, collection) pair determines routing — vectors from different
//! models never mix.
//!
//! Vector-store unavailability degrades instead of failing: recall/search
//! return empty, remember is a warn-and-skip no-op. The loop proceeds
//! without memories rather than dying.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use agentforge_core::caller::Embedder;
use agentforge_core::error::MemoryError;
use agentforge_core::keys::EmbeddingConfig;
use agentforge_core::memory::{MemoryItem, MemoryRecord, MemoryType};
use agentforge_providers::{EmbeddingClient, EmbeddingResolver};

use crate::store::{conjunction, eq_clause, like_clause, SearchHit, VectorRow, VectorStore};

/// Stored content is capped below the collection's varchar limit.
const MAX_STORED_CONTENT_CHARS: usize = 4000;
/// Browse fetch ceiling before in-memory time sorting.
const MAX_LIST_FETCH: usize = 1000;
/// Browse page ceiling.
const MAX_LIST_PAGE: usize = 100;

const ALL_FIELDS: &[&str] = &[
    "session_id",
    "content",
    "memory_type",
    "importance",
    "create_time_ms",
];
const RECALL_FIELDS: &[&str] = &["content", "memory_type", "session_id", "importance"];

/// Builds an embedding client for a config. Swappable so tests can run
/// with a deterministic embedder instead of a live endpoint.
pub type EmbedderFactory = Arc<dyn Fn(EmbeddingConfig) -> Arc<dyn Embedder> + Send + Sync>;

pub fn default_embedder_factory() -> EmbedderFactory {
    Arc::new(|config| Arc::new(EmbeddingClient::new(config)))
}

/// The effective embedder + collection for one call.
struct EmbeddingContext {
    embedder: Arc<dyn Embedder>,
    collection_name: String,
}

pub struct MemoryService {
    /// None when the vector database is disabled or unreachable at boot.
    store: Option<Arc<dyn VectorStore>>,
    resolver: Arc<EmbeddingResolver>,
    system_embedding: EmbeddingConfig,
    system_collection: String,
    min_recall_score: f64,
    embedder_factory: EmbedderFactory,
}

impl MemoryService {
    pub fn new(
        store: Option<Arc<dyn VectorStore>>,
        resolver: Arc<EmbeddingResolver>,
        system_embedding: EmbeddingConfig,
        system_collection: impl Into<String>,
    ) -> Self {
        let service = Self {
            store,
            resolver,
            system_embedding,
            system_collection: system_collection.into(),
            min_recall_score: 0.0,
            embedder_factory: default_embedder_factory(),
        };
        if service.store.is_none() {
            warn!("vector store not available — long-term memory features disabled");
        }
        service
    }

    /// Minimum similarity for recall() hits; 0 returns all ranked hits.
    pub fn with_min_recall_score(mut self, min_score: f64) -> Self {
        self.min_recall_score = min_score;
        self
    }

    pub fn with_embedder_factory(mut self, factory: EmbedderFactory) -> Self {
        self.embedder_factory = factory;
        self
    }

    fn store(&self) -> Option<&Arc<dyn VectorStore>> {
        if self.store.is_none() {
            debug!("memory operation skipped — vector store not connected");
        }
        self.store.as_ref()
    }

    /// Resolve the effective embedder + collection for a user. Falls back
    /// to the system client + default collection when the user has no
    /// config of their own.
    async fn resolve_context(
        &self,
        store: &Arc<dyn VectorStore>,
        user_id: Option<i64>,
    ) -> Result<EmbeddingContext, MemoryError> {
        if user_id.is_some() {
            let resolved = self
                .resolver
                .resolve_default(user_id)
                .await
                .map_err(|e| MemoryError::QueryFailed(format!("embedding resolution: {e}")))?;
            if let Some(r) = resolved {
                store.ensure_collection(&r.collection_name, r.dimension).await?;
                return Ok(EmbeddingContext {
                    embedder: (self.embedder_factory)(r.config),
                    collection_name: r.collection_name,
                });
            }
        }
        store
            .ensure_collection(&self.system_collection, self.system_embedding.dimensions)
            .await?;
        Ok(EmbeddingContext {
            embedder: (self.embedder_factory)(self.system_embedding.clone()),
            collection_name: self.system_collection.clone(),
        })
    }

    /// The collection a user's memories live in (no embedding call).
    async fn resolve_collection(
        &self,
        store: &Arc<dyn VectorStore>,
        user_id: Option<i64>,
    ) -> Result<String, MemoryError> {
        Ok(self.resolve_context(store, user_id).await?.collection_name)
    }

    // ── Store ───────────────────────────────────────────────────────────────

    /// Embed and store one memory. Failures are logged and swallowed — a
    /// memory miss must never abort the loop.
    pub async fn remember(
        &self,
        session_id: &str,
        content: &str,
        memory_type: MemoryType,
        importance: f32,
        user_id: Option<i64>,
    ) {
        let Some(store) = self.store() else { return };
        if let Err(e) = self
            .try_remember(store, session_id, content, memory_type, importance, user_id)
            .await
        {
            warn!(session_id, error = %e, "failed to store memory");
        }
    }

    async fn try_remember(
        &self,
        store: &Arc<dyn VectorStore>,
        session_id: &str,
        content: &str,
        memory_type: MemoryType,
        importance: f32,
        user_id: Option<i64>,
    ) -> Result<(), MemoryError> {
        let ctx = self.resolve_context(store, user_id).await?;
        let vector = ctx
            .embedder
            .embed(content)
            .await
            .map_err(|e| MemoryError::EmbeddingFailed(e.to_string()))?;

        let mut fields = Map::new();
        fields.insert("session_id".into(), json!(session_id));
        fields.insert(
            "content".into(),
            json!(truncate_chars(content, MAX_STORED_CONTENT_CHARS)),
        );
        fields.insert("memory_type".into(), json!(memory_type.as_str()));
        fields.insert("importance".into(), json!(importance));
        fields.insert("create_time_ms".into(), json!(Utc::now().timestamp_millis()));

        store.insert(&ctx.collection_name, VectorRow::new(fields, vector)).await?;

        debug!(
            session_id,
            memory_type = %memory_type,
            importance,
            collection = %ctx.collection_name,
            "memory stored"
        );
        Ok(())
    }

    // ── Recall (ANN search) ─────────────────────────────────────────────────

    /// Recall across all memories in the user's collection.
    pub async fn recall(&self, query: &str, top_k: usize, user_id: Option<i64>) -> Vec<MemoryRecord> {
        let Some(store) = self.store() else { return Vec::new() };
        match self.search_records(store, query, top_k, None, user_id).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "recall failed");
                Vec::new()
            }
        }
    }

    /// Recall restricted to one session's memories.
    pub async fn recall_from_session(
        &self,
        query: &str,
        session_id: &str,
        top_k: usize,
        user_id: Option<i64>,
    ) -> Vec<MemoryRecord> {
        let Some(store) = self.store() else { return Vec::new() };
        let filter = eq_clause("session_id", session_id);
        match self
            .search_records(store, query, top_k, Some(filter), user_id)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "session recall failed");
                Vec::new()
            }
        }
    }

    /// Recall high-level SEMANTIC memories for a user, independent of
    /// session. Used to build user-level profile context.
    pub async fn recall_user_semantic(
        &self,
        query: &str,
        top_k: usize,
        user_id: Option<i64>,
    ) -> Vec<MemoryRecord> {
        let Some(store) = self.store() else { return Vec::new() };
        if user_id.is_none() {
            return Vec::new();
        }
        let filter = eq_clause("memory_type", MemoryType::Semantic.as_str());
        match self
            .search_records(store, query, top_k, Some(filter), user_id)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "user semantic recall failed");
                Vec::new()
            }
        }
    }

    async fn search_records(
        &self,
        store: &Arc<dyn VectorStore>,
        query: &str,
        top_k: usize,
        filter: Option<String>,
        user_id: Option<i64>,
    ) -> Result<Vec<MemoryRecord>, MemoryError> {
        let ctx = self.resolve_context(store, user_id).await?;
        let vector = ctx
            .embedder
            .embed(query)
            .await
            .map_err(|e| MemoryError::EmbeddingFailed(e.to_string()))?;

        let hits = store
            .search(
                &ctx.collection_name,
                &vector,
                top_k,
                filter.as_deref(),
                RECALL_FIELDS,
            )
            .await?;

        Ok(hits
            .into_iter()
            .filter(|hit| hit.score >= self.min_recall_score)
            .map(hit_to_record)
            .collect())
    }

    /// Render records as a prompt block. None when there is nothing to say.
    pub fn format_for_prompt(&self, memories: &[MemoryRecord]) -> Option<String> {
        if memories.is_empty() {
            return None;
        }
        let mut block = String::from("## Relevant memories from past experience:\n");
        for m in memories {
            block.push_str(&format!(
                "- [{}] {} (relevance: {:.2})\n",
                m.memory_type, m.content, m.score
            ));
        }
        Some(block)
    }

    // ── Browse (scalar filter, no vectors) ──────────────────────────────────

    /// List memories with optional filters and pagination.
    ///
    /// The vector store does not order scalar queries, so we fetch up to
    /// `offset + page` rows (capped at 1000), sort by `create_time_ms`
    /// descending in memory, then slice the page.
    pub async fn list_memories(
        &self,
        memory_type: Option<MemoryType>,
        session_id: Option<&str>,
        keyword: Option<&str>,
        offset: usize,
        limit: usize,
        user_id: Option<i64>,
    ) -> Vec<MemoryItem> {
        let Some(store) = self.store() else { return Vec::new() };
        match self
            .try_list(store, memory_type, session_id, keyword, offset, limit, user_id)
            .await
        {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "list memories failed");
                Vec::new()
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_list(
        &self,
        store: &Arc<dyn VectorStore>,
        memory_type: Option<MemoryType>,
        session_id: Option<&str>,
        keyword: Option<&str>,
        offset: usize,
        limit: usize,
        user_id: Option<i64>,
    ) -> Result<Vec<MemoryItem>, MemoryError> {
        let collection = self.resolve_collection(store, user_id).await?;
        let filter = build_filter(memory_type, session_id, keyword);

        let page_size = limit.min(MAX_LIST_PAGE);
        let fetch_limit = (offset + page_size).min(MAX_LIST_FETCH);

        let rows = store
            .query(&collection, filter.as_deref(), ALL_FIELDS, 0, fetch_limit)
            .await?;

        let mut items: Vec<(i64, MemoryItem)> = rows
            .into_iter()
            .map(|row| {
                let created = row
                    .get("create_time_ms")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                (created, row_to_item(row, None))
            })
            .collect();

        // Newest first
        items.sort_by(|a, b| b.0.cmp(&a.0));

        items
            .into_iter()
            .skip(offset)
            .take(page_size)
            .map(|(_, item)| Ok(item))
            .collect()
    }

    /// Count memories matching the optional filters.
    pub async fn count_memories(
        &self,
        memory_type: Option<MemoryType>,
        session_id: Option<&str>,
        user_id: Option<i64>,
    ) -> u64 {
        let Some(store) = self.store() else { return 0 };
        let filter = build_filter(memory_type, session_id, None);
        let collection = match self.resolve_collection(store, user_id).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "count memories failed");
                return 0;
            }
        };
        match store.count(&collection, filter.as_deref()).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "count memories failed");
                0
            }
        }
    }

    /// Semantic search in the browse item shape. No threshold is applied —
    /// the user sees every ranked hit.
    pub async fn search_memories(
        &self,
        query: &str,
        top_k: usize,
        user_id: Option<i64>,
    ) -> Vec<MemoryItem> {
        let Some(store) = self.store() else { return Vec::new() };
        match self.try_search_items(store, query, top_k, user_id).await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "search memories failed");
                Vec::new()
            }
        }
    }

    async fn try_search_items(
        &self,
        store: &Arc<dyn VectorStore>,
        query: &str,
        top_k: usize,
        user_id: Option<i64>,
    ) -> Result<Vec<MemoryItem>, MemoryError> {
        let ctx = self.resolve_context(store, user_id).await?;
        let vector = ctx
            .embedder
            .embed(query)
            .await
            .map_err(|e| MemoryError::EmbeddingFailed(e.to_string()))?;

        let hits = store
            .search(&ctx.collection_name, &vector, top_k, None, ALL_FIELDS)
            .await?;

        Ok(hits
            .into_iter()
            .map(|hit| {
                let score = hit.score;
                row_to_item(hit.entity, Some(score))
            })
            .collect())
    }

    // ── Delete ──────────────────────────────────────────────────────────────

    /// Delete a single memory by its store-generated id.
    pub async fn delete_by_id(&self, id: i64, user_id: Option<i64>) -> Result<(), MemoryError> {
        let Some(store) = self.store() else { return Ok(()) };
        let collection = self.resolve_collection(store, user_id).await?;
        store.delete_by_ids(&collection, &[json!(id)]).await?;
        debug!(id, "memory deleted");
        Ok(())
    }

    /// Delete all memories created by one session.
    pub async fn delete_by_session(
        &self,
        session_id: &str,
        user_id: Option<i64>,
    ) -> Result<(), MemoryError> {
        let Some(store) = self.store() else { return Ok(()) };
        let collection = self.resolve_collection(store, user_id).await?;
        store
            .delete_by_filter(&collection, &eq_clause("session_id", session_id))
            .await?;
        debug!(session_id, "session memories deleted");
        Ok(())
    }

    /// Delete all memories of a given type.
    pub async fn delete_by_type(
        &self,
        memory_type: MemoryType,
        user_id: Option<i64>,
    ) -> Result<(), MemoryError> {
        let Some(store) = self.store() else { return Ok(()) };
        let collection = self.resolve_collection(store, user_id).await?;
        store
            .delete_by_filter(&collection, &eq_clause("memory_type", memory_type.as_str()))
            .await?;
        debug!(memory_type = %memory_type, "typed memories deleted");
        Ok(())
    }
}

// ── Private helpers ─────────────────────────────────────────────────────────

/// Combine the optional browse filters with AND.
fn build_filter(
    memory_type: Option<MemoryType>,
    session_id: Option<&str>,
    keyword: Option<&str>,
) -> Option<String> {
    let mut clauses = Vec::new();
    if let Some(t) = memory_type {
        clauses.push(eq_clause("memory_type", t.as_str()));
    }
    if let Some(s) = session_id.filter(|s| !s.is_empty()) {
        clauses.push(eq_clause("session_id", s));
    }
    if let Some(k) = keyword.filter(|k| !k.is_empty()) {
        clauses.push(like_clause("content", k));
    }
    conjunction(clauses)
}

fn hit_to_record(hit: SearchHit) -> MemoryRecord {
    let e = &hit.entity;
    MemoryRecord {
        content: str_field(e, "content"),
        memory_type: MemoryType::parse_or_episodic(&str_field(e, "memory_type")),
        session_id: str_field(e, "session_id"),
        importance: num_field(e, "importance"),
        score: hit.score,
    }
}

fn row_to_item(row: Map<String, Value>, score: Option<f64>) -> MemoryItem {
    let create_time_ms = row.get("create_time_ms").and_then(Value::as_i64).unwrap_or(0);
    let create_time = if create_time_ms > 0 {
        Utc.timestamp_millis_opt(create_time_ms)
            .single()
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".into())
    } else {
        "-".into()
    };

    MemoryItem {
        id: row.get("id").and_then(Value::as_i64).unwrap_or(0),
        session_id: str_field(&row, "session_id"),
        content: str_field(&row, "content"),
        memory_type: MemoryType::parse_or_episodic(&str_field(&row, "memory_type")),
        importance: num_field(&row, "importance"),
        create_time,
        score,
    }
}

fn str_field(map: &Map<String, Value>, key: &str) -> String {
    map.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn num_field(map: &Map<String, Value>, key: &str) -> f32 {
    map.get(key).and_then(Value::as_f64).unwrap_or(0.0) as f32
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::memdb::InMemoryVectorStore;
    use agentforge_core::error::StoreError;
    use agentforge_core::keys::{EmbeddingModelStore, NewEmbeddingModel};
    use agentforge_core::memory::EmbeddingModelConfig;
    use async_trait::async_trait;

    /// Deterministic embedder: hashes words into a small vector so related
    /// strings land near each other only when they share words.
    pub(crate) struct HashEmbedder {
        dim: usize,
    }

    #[async_trait]
    impl Embedder for HashEmbedder {
        fn dimensions(&self) -> usize {
            self.dim
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, agentforge_core::ProviderError> {
            let mut v = vec![0.0f32; self.dim];
            for word in text.split_whitespace() {
                let mut h: u64 = 1469598103934665603;
                for b in word.bytes() {
                    h ^= b as u64;
                    h = h.wrapping_mul(1099511628211);
                }
                v[(h as usize) % self.dim] += 1.0;
            }
            let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
            Ok(v.iter().map(|x| x / norm).collect())
        }
    }

    struct NoUserModels;

    #[async_trait]
    impl EmbeddingModelStore for NoUserModels {
        async fn insert(&self, _m: NewEmbeddingModel) -> Result<EmbeddingModelConfig, StoreError> {
            unimplemented!()
        }
        async fn find_default(&self, _u: i64) -> Result<Option<EmbeddingModelConfig>, StoreError> {
            Ok(None)
        }
        async fn set_default(&self, _u: i64, _m: i64) -> Result<(), StoreError> {
            unimplemented!()
        }
    }

    const DIM: usize = 16;

    fn system_config() -> EmbeddingConfig {
        EmbeddingConfig {
            base_url: "http://unused".into(),
            api_key: "unused".into(),
            model: "hash".into(),
            dimensions: DIM,
            timeout_seconds: 30,
        }
    }

    pub(crate) fn test_service(store: Option<Arc<dyn VectorStore>>) -> MemoryService {
        MemoryService::new(
            store,
            Arc::new(EmbeddingResolver::new(Arc::new(NoUserModels))),
            system_config(),
            "agent_memories",
        )
        .with_embedder_factory(Arc::new(|_| Arc::new(HashEmbedder { dim: DIM })))
    }

    #[tokio::test]
    async fn remember_and_recall_roundtrip() {
        let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
        let service = test_service(Some(store));

        service
            .remember("s1", "the user name is Zed", MemoryType::Semantic, 0.9, None)
            .await;
        service
            .remember("s1", "weather lookup returned sunny", MemoryType::Episodic, 0.4, None)
            .await;

        let records = service.recall("user name Zed", 5, None).await;
        assert!(!records.is_empty());
        assert_eq!(records[0].content, "the user name is Zed");
        assert_eq!(records[0].memory_type, MemoryType::Semantic);
        assert!(records[0].score >= records.last().unwrap().score);
    }

    #[tokio::test]
    async fn user_semantic_recall_is_type_scoped() {
        let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
        let service = test_service(Some(store));

        service.remember("s", "user prefers rust", MemoryType::Semantic, 0.9, Some(7)).await;
        service.remember("s", "ran a search once", MemoryType::Episodic, 0.4, Some(7)).await;

        let records = service.recall_user_semantic("preferences", 10, Some(7)).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].memory_type, MemoryType::Semantic);

        // anonymous callers get nothing from the profile path
        assert!(service.recall_user_semantic("preferences", 10, None).await.is_empty());
    }

    #[tokio::test]
    async fn recall_from_session_filters() {
        let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
        let service = test_service(Some(store));

        service.remember("a", "fact alpha", MemoryType::Semantic, 0.5, None).await;
        service.remember("b", "fact beta", MemoryType::Semantic, 0.5, None).await;

        let records = service.recall_from_session("fact", "a", 10, None).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].session_id, "a");
    }

    #[tokio::test]
    async fn unavailable_store_degrades_gracefully() {
        let service = test_service(None);
        // No panics, no errors — everything is a quiet no-op
        service.remember("s", "content", MemoryType::Semantic, 0.5, None).await;
        assert!(service.recall("anything", 5, None).await.is_empty());
        assert!(service.search_memories("anything", 5, None).await.is_empty());
        assert!(service.list_memories(None, None, None, 0, 10, None).await.is_empty());
        assert_eq!(service.count_memories(None, None, None).await, 0);
        assert!(service.delete_by_id(1, None).await.is_ok());
    }

    #[tokio::test]
    async fn stored_content_is_truncated() {
        let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
        let service = test_service(Some(store.clone()));

        let long = "x".repeat(5000);
        service.remember("s", &long, MemoryType::Semantic, 0.5, None).await;

        let rows = store
            .query("agent_memories", None, &["content"], 0, 10)
            .await
            .unwrap();
        let stored = rows[0]["content"].as_str().unwrap();
        assert_eq!(stored.chars().count(), 4000);
    }

    #[tokio::test]
    async fn list_sorts_newest_first_and_paginates() {
        let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
        let service = test_service(Some(store.clone()));

        for i in 0..5 {
            service
                .remember("s", &format!("memory {i}"), MemoryType::Semantic, 0.5, None)
                .await;
            // Distinct timestamps so the sort is observable
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let items = service.list_memories(None, None, None, 0, 2, None).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].content, "memory 4");
        assert_eq!(items[1].content, "memory 3");
        assert!(items[0].score.is_none());

        let next_page = service.list_memories(None, None, None, 2, 2, None).await;
        assert_eq!(next_page[0].content, "memory 2");
    }

    #[tokio::test]
    async fn list_filters_by_type_and_keyword() {
        let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
        let service = test_service(Some(store));

        service.remember("s", "likes rust", MemoryType::Semantic, 0.5, None).await;
        service.remember("s", "ran the tests", MemoryType::Episodic, 0.5, None).await;

        let semantic = service
            .list_memories(Some(MemoryType::Semantic), None, None, 0, 10, None)
            .await;
        assert_eq!(semantic.len(), 1);
        assert_eq!(semantic[0].content, "likes rust");

        let keyword = service
            .list_memories(None, None, Some("tests"), 0, 10, None)
            .await;
        assert_eq!(keyword.len(), 1);
        assert_eq!(keyword[0].memory_type, MemoryType::Episodic);
    }

    #[tokio::test]
    async fn count_and_delete_flows() {
        let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
        let service = test_service(Some(store));

        service.remember("a", "one", MemoryType::Semantic, 0.5, None).await;
        service.remember("a", "two", MemoryType::Episodic, 0.5, None).await;
        service.remember("b", "three", MemoryType::Episodic, 0.5, None).await;

        assert_eq!(service.count_memories(None, None, None).await, 3);
        assert_eq!(service.count_memories(Some(MemoryType::Episodic), None, None).await, 2);
        assert_eq!(service.count_memories(None, Some("a"), None).await, 2);

        service.delete_by_session("a", None).await.unwrap();
        assert_eq!(service.count_memories(None, None, None).await, 1);

        service.delete_by_type(MemoryType::Episodic, None).await.unwrap();
        assert_eq!(service.count_memories(None, None, None).await, 0);
    }

    #[tokio::test]
    async fn search_returns_items_with_scores_and_no_threshold() {
        let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
        // A recall threshold high enough to suppress every hit
        let service = test_service(Some(store)).with_min_recall_score(0.99);

        service.remember("s", "completely unrelated words", MemoryType::Semantic, 0.5, None).await;

        // recall applies the threshold...
        assert!(service.recall("different query entirely", 5, None).await.is_empty());
        // ...the browse search does not
        let items = service.search_memories("different query entirely", 5, None).await;
        assert_eq!(items.len(), 1);
        assert!(items[0].score.is_some());
    }

    #[test]
    fn prompt_formatting() {
        let service = test_service(None);
        assert!(service.format_for_prompt(&[]).is_none());

        let block = service
            .format_for_prompt(&[MemoryRecord {
                content: "用户的名字是 Zed".into(),
                memory_type: MemoryType::Semantic,
                session_id: "s".into(),
                importance: 0.9,
                score: 0.87,
            }])
            .unwrap();
        assert!(block.starts_with("## Relevant memories from past experience:"));
        assert!(block.contains("[SEMANTIC] 用户的名字是 Zed (relevance: 0.87)"));
    }

    #[test]
    fn filter_builder_combinations() {
        assert!(build_filter(None, None, None).is_none());
        assert_eq!(
            build_filter(Some(MemoryType::Semantic), None, None).unwrap(),
            r#"memory_type == "SEMANTIC""#
        );
        assert_eq!(
            build_filter(Some(MemoryType::Semantic), Some("s1"), Some("kw")).unwrap(),
            r#"memory_type == "SEMANTIC" and session_id == "s1" and content like "%kw%""#
        );
        // blank values are skipped
        assert!(build_filter(None, Some(""), Some("")).is_none());
    }
}
