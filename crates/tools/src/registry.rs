//! Tool catalog over the persistent store, with the two built-in memory
//! tools injected on every load.
//!
//! `recall_memory` and `store_memory` are part of the agent itself — they
//! are never stored in the catalog and always reach the model.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use tracing::warn;

use agentforge_core::error::StoreError;
use agentforge_core::tool::{ToolDefinition, ToolDescriptor, ToolStore};

pub const BUILTIN_RECALL_MEMORY: &str = "recall_memory";
pub const BUILTIN_STORE_MEMORY: &str = "store_memory";

pub struct ToolRegistry {
    store: Arc<dyn ToolStore>,
}

impl ToolRegistry {
    pub fn new(store: Arc<dyn ToolStore>) -> Self {
        Self { store }
    }

    pub fn is_builtin(name: &str) -> bool {
        name == BUILTIN_RECALL_MEMORY || name == BUILTIN_STORE_MEMORY
    }

    /// The built-in recall tool definition sent to the model.
    pub fn recall_memory_definition() -> ToolDefinition {
        ToolDefinition::function(
            BUILTIN_RECALL_MEMORY,
            "Search long-term memory by natural language query. Returns relevant past \
             information (e.g. user profile, name, preferences). Use when you need to look up \
             something that may have been stored before.",
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "top_k": { "type": "integer", "minimum": 1, "maximum": 20 }
                },
                "required": ["query"]
            }),
        )
    }

    /// The built-in store tool definition sent to the model.
    pub fn store_memory_definition() -> ToolDefinition {
        ToolDefinition::function(
            BUILTIN_STORE_MEMORY,
            "Store an IMPORTANT, long-term piece of information into memory for future \
             sessions. Use sparingly. Only call this for facts that will matter across many \
             tasks, not for one-off details.",
            json!({
                "type": "object",
                "properties": {
                    "content": { "type": "string" },
                    "memory_type": { "type": "string", "enum": ["EPISODIC", "SEMANTIC", "PROCEDURAL"] },
                    "importance": { "type": "number", "minimum": 0, "maximum": 1 }
                },
                "required": ["content"]
            }),
        )
    }

    /// Look up one catalogued tool by name. Built-ins are not catalogued.
    pub async fn find(&self, tool_name: &str) -> Result<Option<ToolDescriptor>, StoreError> {
        self.store.find_by_name(tool_name).await
    }

    /// All active catalogued tools.
    pub async fn list_active(&self) -> Result<Vec<ToolDescriptor>, StoreError> {
        self.store.list_active().await
    }

    /// Built-ins plus every active catalogued tool — the fallback set when
    /// semantic retrieval has nothing to say.
    pub async fn all_definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions = vec![
            Self::recall_memory_definition(),
            Self::store_memory_definition(),
        ];
        match self.store.list_active().await {
            Ok(tools) => definitions.extend(tools.iter().map(ToolDescriptor::to_definition)),
            Err(e) => warn!(error = %e, "failed to load catalogued tools, serving built-ins only"),
        }
        definitions
    }

    /// Resolve an ordered id list (from the tool index) into definitions,
    /// deduplicating while preserving order. Unknown ids are skipped.
    pub async fn definitions_for_ids(&self, ids: &[String]) -> Vec<ToolDefinition> {
        let mut seen = HashSet::new();
        let mut definitions = Vec::new();
        for id in ids {
            if id.is_empty() || !seen.insert(id.clone()) {
                continue;
            }
            match id.as_str() {
                BUILTIN_RECALL_MEMORY => definitions.push(Self::recall_memory_definition()),
                BUILTIN_STORE_MEMORY => definitions.push(Self::store_memory_definition()),
                name => match self.store.find_by_name(name).await {
                    Ok(Some(descriptor)) => definitions.push(descriptor.to_definition()),
                    Ok(None) => {}
                    Err(e) => warn!(tool = name, error = %e, "tool lookup failed"),
                },
            }
        }
        definitions
    }
}
