//! Tool catalog persistence.
//!
//! The `input_schema` column stores a JSON Schema object that travels
//! verbatim into the model's `tools` array.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use agentforge_core::error::StoreError;
use agentforge_core::tool::{ToolDescriptor, ToolKind, ToolStore};

pub struct SqliteToolStore {
    pool: SqlitePool,
}

impl SqliteToolStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register a tool in the catalog. `Conflict` when the name is taken.
    pub async fn create(
        &self,
        tool_name: &str,
        tool_description: &str,
        input_schema: &serde_json::Value,
        kind: ToolKind,
        script_content: Option<&str>,
        entry_point: Option<&str>,
    ) -> Result<ToolDescriptor, StoreError> {
        let schema_text = input_schema.to_string();
        let result = sqlx::query(
            r#"
            INSERT INTO agent_tools (tool_name, tool_description, input_schema, tool_kind, script_content, entry_point, is_active)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)
            "#,
        )
        .bind(tool_name)
        .bind(tool_description)
        .bind(&schema_text)
        .bind(kind.as_str())
        .bind(script_content)
        .bind(entry_point)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if e.to_string().contains("UNIQUE") {
                StoreError::Conflict(format!("tool already exists: {tool_name}"))
            } else {
                StoreError::Query(format!("insert tool: {e}"))
            }
        })?;

        let row = sqlx::query("SELECT * FROM agent_tools WHERE id = ?1")
            .bind(result.last_insert_rowid())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Query(format!("reload tool: {e}")))?;
        row_to_descriptor(&row)
    }

    /// Flip a tool's active flag.
    pub async fn set_active(&self, tool_name: &str, active: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE agent_tools SET is_active = ?1 WHERE tool_name = ?2")
            .bind(active as i64)
            .bind(tool_name)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(format!("set active: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("tool {tool_name}")));
        }
        Ok(())
    }
}

fn row_to_descriptor(row: &SqliteRow) -> Result<ToolDescriptor, StoreError> {
    let kind_str: String = row
        .try_get("tool_kind")
        .map_err(|e| StoreError::Query(e.to_string()))?;
    let kind: ToolKind = kind_str.parse().map_err(StoreError::Query)?;

    let schema_text: String = row
        .try_get("input_schema")
        .map_err(|e| StoreError::Query(e.to_string()))?;
    let input_schema = serde_json::from_str(&schema_text)
        .map_err(|e| StoreError::Query(format!("tool schema: {e}")))?;

    Ok(ToolDescriptor {
        id: row.try_get("id").map_err(|e| StoreError::Query(e.to_string()))?,
        tool_name: row.try_get("tool_name").map_err(|e| StoreError::Query(e.to_string()))?,
        tool_description: row
            .try_get("tool_description")
            .map_err(|e| StoreError::Query(e.to_string()))?,
        input_schema,
        kind,
        script_content: row
            .try_get("script_content")
            .map_err(|e| StoreError::Query(e.to_string()))?,
        entry_point: row.try_get("entry_point").map_err(|e| StoreError::Query(e.to_string()))?,
        is_active: row.try_get::<i64, _>("is_active").map_err(|e| StoreError::Query(e.to_string()))? != 0,
    })
}

#[async_trait]
impl ToolStore for SqliteToolStore {
    async fn find_by_name(&self, tool_name: &str) -> Result<Option<ToolDescriptor>, StoreError> {
        let row = sqlx::query("SELECT * FROM agent_tools WHERE tool_name = ?1")
            .bind(tool_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Query(format!("find tool: {e}")))?;
        row.map(|r| row_to_descriptor(&r)).transpose()
    }

    async fn list_active(&self) -> Result<Vec<ToolDescriptor>, StoreError> {
        let rows = sqlx::query("SELECT * FROM agent_tools WHERE is_active = 1 ORDER BY tool_name")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Query(format!("list tools: {e}")))?;
        rows.iter().map(row_to_descriptor).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store() -> SqliteToolStore {
        SqliteToolStore::new(crate::open("sqlite::memory:").await.unwrap())
    }

    #[tokio::test]
    async fn create_and_find() {
        let store = store().await;
        let schema = json!({"type":"object","properties":{"query":{"type":"string"}},"required":["query"]});
        let tool = store
            .create("web_search", "Search the web", &schema, ToolKind::Python, Some("print()"), Some("search.py"))
            .await
            .unwrap();
        assert_eq!(tool.kind, ToolKind::Python);
        assert!(tool.is_active);

        let found = store.find_by_name("web_search").await.unwrap().unwrap();
        // the schema round-trips verbatim
        assert_eq!(found.input_schema, schema);
        assert_eq!(found.script_content.as_deref(), Some("print()"));

        assert!(store.find_by_name("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_names_conflict() {
        let store = store().await;
        let schema = json!({"type":"object"});
        store
            .create("t", "d", &schema, ToolKind::Native, None, Some("h"))
            .await
            .unwrap();
        let err = store
            .create("t", "d2", &schema, ToolKind::Native, None, Some("h2"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn list_active_excludes_deactivated() {
        let store = store().await;
        let schema = json!({"type":"object"});
        store.create("a", "d", &schema, ToolKind::Native, None, None).await.unwrap();
        store.create("b", "d", &schema, ToolKind::Shell, Some("ls"), None).await.unwrap();
        store.set_active("a", false).await.unwrap();

        let active = store.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].tool_name, "b");

        assert!(matches!(
            store.set_active("missing", true).await.unwrap_err(),
            StoreError::NotFound(_)
        ));
    }
}
