//! The vector store abstraction and its filter expression grammar.
//!
//! Collections come in two shapes:
//! - memory collections: int64 auto-id primary key + session_id/content/
//!   memory_type/importance/create_time_ms scalars + an embedding vector
//! - the tool index: varchar `tool_id` primary key + tool metadata +
//!   an embedding vector
//!
//! Filter grammar (the subset the services use):
//!   `field == "literal"`, `field like "%sub%"`, joined with ` and `.

use async_trait::async_trait;
use serde_json::{Map, Value};

use agentforge_core::error::MemoryError;

/// Prefix for tool index collections; suffix is the dimension
/// (e.g. `agent_tools_index_1536`).
pub const TOOL_INDEX_COLLECTION_PREFIX: &str = "agent_tools_index_";

pub fn tool_index_collection_name(dimension: usize) -> String {
    format!("{TOOL_INDEX_COLLECTION_PREFIX}{dimension}")
}

/// One row to insert: scalar fields plus the dense vector.
#[derive(Debug, Clone)]
pub struct VectorRow {
    pub fields: Map<String, Value>,
    pub vector: Vec<f32>,
}

impl VectorRow {
    pub fn new(fields: Map<String, Value>, vector: Vec<f32>) -> Self {
        Self { fields, vector }
    }
}

/// One ANN search hit.
#[derive(Debug, Clone)]
pub struct SearchHit {
    /// Primary key — int64 for memory collections, string for the tool index.
    pub id: Value,
    /// Inner-product similarity; higher is closer.
    pub score: f64,
    /// Requested output fields.
    pub entity: Map<String, Value>,
}

/// Abstracts an ANN-capable vector database with scalar filtering.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Idempotently create a memory collection with the standard schema.
    /// Returns true when the collection is ready to use.
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<bool, MemoryError>;

    /// Idempotently create the tool index collection for a dimension.
    async fn ensure_tool_index_collection(&self, dim: usize) -> Result<bool, MemoryError>;

    /// Insert one row. Rejects vectors whose length differs from the
    /// collection dimension.
    async fn insert(&self, collection: &str, row: VectorRow) -> Result<(), MemoryError>;

    /// ANN search, scored by inner product, optionally filtered.
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        top_k: usize,
        filter: Option<&str>,
        output_fields: &[&str],
    ) -> Result<Vec<SearchHit>, MemoryError>;

    /// Scalar query without vectors. Each returned map carries the
    /// requested output fields plus `id`.
    async fn query(
        &self,
        collection: &str,
        filter: Option<&str>,
        output_fields: &[&str],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Map<String, Value>>, MemoryError>;

    /// Count rows matching the filter.
    async fn count(&self, collection: &str, filter: Option<&str>) -> Result<u64, MemoryError>;

    async fn delete_by_ids(&self, collection: &str, ids: &[Value]) -> Result<(), MemoryError>;

    async fn delete_by_filter(&self, collection: &str, filter: &str) -> Result<(), MemoryError>;
}

// ── Filter expressions ──────────────────────────────────────────────────────

/// Build an equality clause: `field == "literal"`.
pub fn eq_clause(field: &str, literal: &str) -> String {
    format!("{field} == \"{}\"", literal.replace('"', "\\\""))
}

/// Build a substring clause: `field like "%sub%"`.
pub fn like_clause(field: &str, substring: &str) -> String {
    format!("{field} like \"%{}%\"", substring.replace('"', "\\\""))
}

/// Join clauses with ` and `; None when there are no clauses.
pub fn conjunction(clauses: Vec<String>) -> Option<String> {
    if clauses.is_empty() {
        None
    } else {
        Some(clauses.join(" and "))
    }
}

/// Evaluate a filter expression against a row's scalar fields.
///
/// Used by the in-memory backend; Milvus evaluates the same grammar
/// server-side.
pub fn matches_filter(fields: &Map<String, Value>, filter: &str) -> bool {
    filter
        .split(" and ")
        .all(|clause| matches_clause(fields, clause.trim()))
}

fn matches_clause(fields: &Map<String, Value>, clause: &str) -> bool {
    if let Some((field, literal)) = split_operator(clause, " == ") {
        return field_as_string(fields, &field).is_some_and(|v| v == literal);
    }
    if let Some((field, pattern)) = split_operator(clause, " like ") {
        let Some(value) = field_as_string(fields, &field) else {
            return false;
        };
        return match (pattern.starts_with('%'), pattern.ends_with('%')) {
            (true, true) => value.contains(pattern.trim_matches('%')),
            (true, false) => value.ends_with(pattern.trim_start_matches('%')),
            (false, true) => value.starts_with(pattern.trim_end_matches('%')),
            (false, false) => value == pattern,
        };
    }
    // Unknown clause shapes match nothing rather than everything.
    false
}

/// Split `field <op> "literal"` into (field, unquoted literal).
fn split_operator(clause: &str, op: &str) -> Option<(String, String)> {
    let (field, quoted) = clause.split_once(op)?;
    let quoted = quoted.trim();
    let literal = quoted.strip_prefix('"')?.strip_suffix('"')?;
    Some((field.trim().to_string(), literal.replace("\\\"", "\"")))
}

fn field_as_string(fields: &Map<String, Value>, field: &str) -> Option<String> {
    match fields.get(field)? {
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row() -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("session_id".into(), json!("abc-123"));
        m.insert("memory_type".into(), json!("SEMANTIC"));
        m.insert("content".into(), json!("用户的名字是 Zed"));
        m
    }

    #[test]
    fn clause_builders() {
        assert_eq!(eq_clause("session_id", "s1"), r#"session_id == "s1""#);
        assert_eq!(like_clause("content", "Zed"), r#"content like "%Zed%""#);
        assert_eq!(
            conjunction(vec![eq_clause("a", "1"), eq_clause("b", "2")]).unwrap(),
            r#"a == "1" and b == "2""#
        );
        assert!(conjunction(vec![]).is_none());
    }

    #[test]
    fn equality_matching() {
        assert!(matches_filter(&row(), r#"session_id == "abc-123""#));
        assert!(!matches_filter(&row(), r#"session_id == "other""#));
        assert!(!matches_filter(&row(), r#"missing == "x""#));
    }

    #[test]
    fn like_matching() {
        assert!(matches_filter(&row(), r#"content like "%Zed%""#));
        assert!(matches_filter(&row(), r#"content like "%名字%""#));
        assert!(!matches_filter(&row(), r#"content like "%Alice%""#));
    }

    #[test]
    fn conjunction_matching() {
        assert!(matches_filter(
            &row(),
            r#"memory_type == "SEMANTIC" and content like "%Zed%""#
        ));
        assert!(!matches_filter(
            &row(),
            r#"memory_type == "EPISODIC" and content like "%Zed%""#
        ));
    }

    #[test]
    fn quotes_in_literals_are_escaped() {
        let clause = eq_clause("tool_id", "we\"ird");
        let mut fields = Map::new();
        fields.insert("tool_id".into(), json!("we\"ird"));
        assert!(matches_filter(&fields, &clause));
    }

    #[test]
    fn tool_index_naming() {
        assert_eq!(tool_index_collection_name(1536), "agent_tools_index_1536");
    }
}
