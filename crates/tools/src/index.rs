//! Vector index over tool descriptors — semantic tool retrieval by user
//! intent.
//!
//! One tool index collection per embedding dimension (e.g.
//! `agent_tools_index_1024` for bge-m3). The index for a dimension is
//! lazily populated on its first search in this process; the populated
//! set is a soft cache and rebuilding after a restart is idempotent
//! (delete-then-insert per tool id).
//!
//! Embedding resolution follows memories: the user's own model when
//! configured, otherwise the system default — but only when the system
//! default is actually usable, so a deployment without a system key never
//! burns it on behalf of unconfigured users.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Map};
use tracing::{debug, warn};

use agentforge_core::caller::Embedder;
use agentforge_core::keys::EmbeddingConfig;
use agentforge_memory::service::{default_embedder_factory, EmbedderFactory};
use agentforge_memory::store::{eq_clause, tool_index_collection_name, VectorRow, VectorStore};
use agentforge_providers::EmbeddingResolver;

use crate::registry::{ToolRegistry, BUILTIN_RECALL_MEMORY, BUILTIN_STORE_MEMORY};

const MAX_TOOL_TEXT_LEN: usize = 3500;
const MAX_DESCRIPTION_LEN: usize = 2040;
const MAX_SCHEMA_TEXT_LEN: usize = 2000;
const MAX_SEARCH_K: usize = 50;

pub struct ToolIndex {
    store: Option<Arc<dyn VectorStore>>,
    resolver: Arc<EmbeddingResolver>,
    registry: Arc<ToolRegistry>,
    /// System embedding config, present only when usable (has a key).
    system_embedding: Option<EmbeddingConfig>,
    embedder_factory: EmbedderFactory,
    /// Dimensions already indexed in this process lifetime.
    populated_dimensions: Mutex<HashSet<usize>>,
}

impl ToolIndex {
    pub fn new(
        store: Option<Arc<dyn VectorStore>>,
        resolver: Arc<EmbeddingResolver>,
        registry: Arc<ToolRegistry>,
        system_embedding: Option<EmbeddingConfig>,
    ) -> Self {
        Self {
            store,
            resolver,
            registry,
            system_embedding,
            embedder_factory: default_embedder_factory(),
            populated_dimensions: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_embedder_factory(mut self, factory: EmbedderFactory) -> Self {
        self.embedder_factory = factory;
        self
    }

    /// Returns tool ids most relevant to the query, best first. Empty on
    /// any failure or when no embedding client can be resolved — the
    /// caller then falls back to serving all tools.
    pub async fn search_relevant_tools(
        &self,
        query: &str,
        top_k: usize,
        user_id: Option<i64>,
    ) -> Vec<String> {
        let Some(store) = &self.store else {
            return Vec::new();
        };
        if query.trim().is_empty() {
            return Vec::new();
        }

        match self.try_search(store, query, top_k, user_id).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "tool index search failed");
                Vec::new()
            }
        }
    }

    async fn try_search(
        &self,
        store: &Arc<dyn VectorStore>,
        query: &str,
        top_k: usize,
        user_id: Option<i64>,
    ) -> Result<Vec<String>, agentforge_core::MemoryError> {
        let Some((embedder, dimension)) = self.resolve_embedder(user_id).await else {
            return Ok(Vec::new());
        };

        let collection = tool_index_collection_name(dimension);
        if !store.ensure_tool_index_collection(dimension).await? {
            return Ok(Vec::new());
        }

        if !self.populated_dimensions.lock().contains(&dimension) {
            self.index_all_tools(store, &embedder, &collection).await;
            self.populated_dimensions.lock().insert(dimension);
        }

        let vector = embedder
            .embed(query)
            .await
            .map_err(|e| agentforge_core::MemoryError::EmbeddingFailed(e.to_string()))?;

        let hits = store
            .search(&collection, &vector, top_k.min(MAX_SEARCH_K), None, &["tool_id"])
            .await?;

        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                hit.entity
                    .get("tool_id")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .map(String::from)
            })
            .collect())
    }

    /// The embedder to search with: the user's own model, else the usable
    /// system default, else nothing.
    async fn resolve_embedder(&self, user_id: Option<i64>) -> Option<(Arc<dyn Embedder>, usize)> {
        match self.resolver.resolve_default(user_id).await {
            Ok(Some(resolved)) => {
                let dim = resolved.dimension;
                return Some(((self.embedder_factory)(resolved.config), dim));
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "embedding resolution failed for tool index");
                return None;
            }
        }
        self.system_embedding
            .as_ref()
            .map(|config| ((self.embedder_factory)(config.clone()), config.dimensions))
    }

    /// Index the built-ins plus every active catalogued tool into the
    /// collection for this dimension. Per-tool failures are logged and
    /// skipped so one bad tool cannot empty the index.
    async fn index_all_tools(
        &self,
        store: &Arc<dyn VectorStore>,
        embedder: &Arc<dyn Embedder>,
        collection: &str,
    ) {
        let recall = ToolRegistry::recall_memory_definition();
        self.index_tool(
            store,
            embedder,
            collection,
            BUILTIN_RECALL_MEMORY,
            &recall.function.description,
            "query: string (required). top_k: optional integer, default 10.",
        )
        .await;

        let store_def = ToolRegistry::store_memory_definition();
        self.index_tool(
            store,
            embedder,
            collection,
            BUILTIN_STORE_MEMORY,
            &store_def.function.description,
            "content: string (required). memory_type: EPISODIC | SEMANTIC | PROCEDURAL. importance: 0-1.",
        )
        .await;

        let tools = match self.registry.list_active().await {
            Ok(tools) => tools,
            Err(e) => {
                warn!(error = %e, "failed to list tools for indexing");
                return;
            }
        };
        for tool in tools {
            let schema_text = truncate_with_ellipsis(
                &tool.input_schema.to_string(),
                MAX_SCHEMA_TEXT_LEN,
            );
            self.index_tool(
                store,
                embedder,
                collection,
                &tool.tool_name,
                &tool.tool_description,
                &schema_text,
            )
            .await;
        }
    }

    async fn index_tool(
        &self,
        store: &Arc<dyn VectorStore>,
        embedder: &Arc<dyn Embedder>,
        collection: &str,
        tool_id: &str,
        description: &str,
        schema_text: &str,
    ) {
        let text = truncate_chars(
            &format!("{tool_id}\n{description}\n{schema_text}"),
            MAX_TOOL_TEXT_LEN,
        );
        let vector = match embedder.embed(&text).await {
            Ok(v) => v,
            Err(e) => {
                warn!(tool = tool_id, error = %e, "failed to embed tool");
                return;
            }
        };

        // Upsert: delete any previous row for this id, then insert.
        if let Err(e) = store
            .delete_by_filter(collection, &eq_clause("tool_id", tool_id))
            .await
        {
            warn!(tool = tool_id, error = %e, "failed to clear old tool index row");
        }

        let mut fields = Map::new();
        fields.insert("tool_id".into(), json!(tool_id));
        fields.insert("tool_name".into(), json!(tool_id));
        fields.insert(
            "description".into(),
            json!(truncate_chars(description, MAX_DESCRIPTION_LEN)),
        );
        fields.insert("schema_text".into(), json!(schema_text));

        if let Err(e) = store.insert(collection, VectorRow::new(fields, vector)).await {
            warn!(tool = tool_id, error = %e, "failed to index tool");
        } else {
            debug!(tool = tool_id, collection, "tool indexed");
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

fn truncate_with_ellipsis(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
