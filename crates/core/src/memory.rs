//! Long-term memory domain types.

use serde::{Deserialize, Serialize};

/// Classifies the nature of a long-term memory entry.
///
/// EPISODIC   — "what happened": specific events, actions taken, results
///              observed.
/// SEMANTIC   — "what I know": facts, rules, knowledge extracted from
///              experience.
/// PROCEDURAL — "how to do it": reusable strategies and workflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryType {
    Episodic,
    Semantic,
    Procedural,
}

impl MemoryType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Episodic => "EPISODIC",
            Self::Semantic => "SEMANTIC",
            Self::Procedural => "PROCEDURAL",
        }
    }

    /// Lenient parse used on values coming back from the vector store or
    /// the model; unknown strings default to EPISODIC.
    pub fn parse_or_episodic(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "SEMANTIC" => Self::Semantic,
            "PROCEDURAL" => Self::Procedural,
            _ => Self::Episodic,
        }
    }

    /// Parse used for model-supplied `memory_type` arguments; unknown
    /// strings default to SEMANTIC (the safest bucket for stored facts).
    pub fn parse_or_semantic(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "EPISODIC" => Self::Episodic,
            "PROCEDURAL" => Self::Procedural,
            _ => Self::Semantic,
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single long-term memory entry returned from a recall query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// The stored memory text.
    pub content: String,

    pub memory_type: MemoryType,

    /// The session that originally created this memory (may be synthetic,
    /// e.g. "manual" or "compressed").
    pub session_id: String,

    /// 0.0 – 1.0; higher = more important.
    pub importance: f32,

    /// Inner-product similarity score from the vector search.
    pub score: f64,
}

/// Full memory entry returned by the browsing/management operations.
///
/// Includes the store-generated `id` so callers can delete specific records.
/// `score` is present only in search results, None in list results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryItem {
    pub id: i64,
    pub session_id: String,
    pub content: String,
    pub memory_type: MemoryType,
    pub importance: f32,
    /// Human-readable creation time (yyyy-MM-dd HH:mm:ss).
    pub create_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// User-configured embedding model.
///
/// DESIGN RULE: every (provider, model) combination lives in its own vector
/// collection (`collection_name`). Vectors from different models are never
/// mixed — their spaces are incompatible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingModelConfig {
    pub id: i64,
    pub user_id: i64,

    /// Human-friendly label set by the user.
    pub name: String,

    /// openai | ollama | azure | custom
    pub provider: String,

    /// e.g. text-embedding-3-small, nomic-embed-text, bge-m3
    pub model_name: String,

    /// None for local deployments that need no key.
    pub api_key: Option<String>,

    pub base_url: String,

    /// Vector dimension — determines which collection is used.
    pub dimension: usize,

    /// Auto-derived collection name: memories_{model_sanitized}_{dim}.
    pub collection_name: String,

    /// Max input tokens the model accepts.
    pub max_tokens: u32,

    pub is_default: bool,
    pub is_active: bool,
}

/// Derive the memory collection name from model + dimension.
///
/// Sanitization: lower-case, runs of non-alphanumerics collapse to `_`,
/// leading/trailing `_` trimmed.
///   text-embedding-3-small/1536 → memories_text_embedding_3_small_1536
///   nomic-embed-text/768        → memories_nomic_embed_text_768
pub fn derive_collection_name(model_name: &str, dimension: usize) -> String {
    let mut sanitized = String::with_capacity(model_name.len());
    let mut last_was_sep = false;
    for c in model_name.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            sanitized.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            sanitized.push('_');
            last_was_sep = true;
        }
    }
    let sanitized = sanitized.trim_matches('_');
    format!("memories_{sanitized}_{dimension}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_name_derivation() {
        assert_eq!(
            derive_collection_name("text-embedding-3-small", 1536),
            "memories_text_embedding_3_small_1536"
        );
        assert_eq!(
            derive_collection_name("nomic-embed-text", 768),
            "memories_nomic_embed_text_768"
        );
        // runs of separators collapse, edges are trimmed
        assert_eq!(
            derive_collection_name("--BGE//m3__", 1024),
            "memories_bge_m3_1024"
        );
    }

    #[test]
    fn memory_type_wire_format() {
        assert_eq!(serde_json::to_string(&MemoryType::Semantic).unwrap(), "\"SEMANTIC\"");
        let t: MemoryType = serde_json::from_str("\"PROCEDURAL\"").unwrap();
        assert_eq!(t, MemoryType::Procedural);
    }

    #[test]
    fn lenient_parses() {
        assert_eq!(MemoryType::parse_or_episodic("garbage"), MemoryType::Episodic);
        assert_eq!(MemoryType::parse_or_semantic("garbage"), MemoryType::Semantic);
        assert_eq!(MemoryType::parse_or_semantic("episodic"), MemoryType::Episodic);
    }

    #[test]
    fn memory_item_hides_absent_score() {
        let item = MemoryItem {
            id: 1,
            session_id: "s".into(),
            content: "c".into(),
            memory_type: MemoryType::Episodic,
            importance: 0.5,
            create_time: "2025-01-01 00:00:00".into(),
            score: None,
        };
        let json = serde_json::to_value(&item).unwrap();
        assert!(json.get("score").is_none());
        assert_eq!(json["sessionId"], "s");
    }
}
