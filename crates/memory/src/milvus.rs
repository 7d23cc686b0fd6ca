//! Milvus vector store backend over the HTTP v2 API.
//!
//! Collection lifecycle is managed at runtime: the default system
//! collection plus one collection per user-configured embedding model
//! (different dimensions), created on demand. Ensured names are cached to
//! avoid a round-trip on every remember()/recall() call.

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use agentforge_core::error::MemoryError;

use crate::store::{tool_index_collection_name, SearchHit, VectorRow, VectorStore};

pub struct MilvusRestStore {
    base_url: String,
    client: reqwest::Client,
    /// Collection names we know already exist.
    existing: Mutex<HashSet<String>>,
}

impl MilvusRestStore {
    /// `base_url` e.g. `http://localhost:19530`.
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .expect("Failed to create HTTP client");
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            existing: Mutex::new(HashSet::new()),
        }
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, MemoryError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| MemoryError::Unavailable(format!("milvus {path}: {e}")))?;

        let status = response.status().as_u16();
        let body: Value = response
            .json()
            .await
            .map_err(|e| MemoryError::QueryFailed(format!("milvus {path} response: {e}")))?;

        if !(200..300).contains(&status) {
            return Err(MemoryError::QueryFailed(format!("milvus {path} HTTP {status}: {body}")));
        }
        // v2 API wraps results as {"code": 0, "data": ...}
        let code = body.get("code").and_then(Value::as_i64).unwrap_or(0);
        if code != 0 {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(MemoryError::QueryFailed(format!("milvus {path} code {code}: {message}")));
        }
        Ok(body.get("data").cloned().unwrap_or(Value::Null))
    }

    async fn has_collection(&self, name: &str) -> Result<bool, MemoryError> {
        let data = self
            .post("/v2/vectordb/collections/has", json!({ "collectionName": name }))
            .await?;
        Ok(data.get("has").and_then(Value::as_bool).unwrap_or(false))
    }

    async fn create_memory_collection(&self, name: &str, dim: usize) -> Result<(), MemoryError> {
        info!(collection = name, dim, "creating memory collection");
        let body = json!({
            "collectionName": name,
            "schema": {
                "autoId": true,
                "fields": [
                    { "fieldName": "id", "dataType": "Int64", "isPrimary": true },
                    { "fieldName": "session_id", "dataType": "VarChar", "elementTypeParams": { "max_length": 64 } },
                    { "fieldName": "content", "dataType": "VarChar", "elementTypeParams": { "max_length": 4096 } },
                    { "fieldName": "memory_type", "dataType": "VarChar", "elementTypeParams": { "max_length": 32 } },
                    { "fieldName": "importance", "dataType": "Float" },
                    { "fieldName": "create_time_ms", "dataType": "Int64" },
                    { "fieldName": "embedding", "dataType": "FloatVector", "elementTypeParams": { "dim": dim } }
                ]
            },
            "indexParams": [
                {
                    "fieldName": "embedding",
                    "indexName": "embedding_hnsw",
                    "metricType": "IP",
                    "indexType": "HNSW",
                    "params": { "M": 16, "efConstruction": 256 }
                },
                {
                    "fieldName": "session_id",
                    "indexName": "session_id_trie",
                    "indexType": "Trie"
                }
            ]
        });
        self.post("/v2/vectordb/collections/create", body).await?;
        info!(collection = name, "memory collection created");
        Ok(())
    }

    async fn create_tool_index_collection(&self, name: &str, dim: usize) -> Result<(), MemoryError> {
        info!(collection = name, dim, "creating tool index collection");
        let body = json!({
            "collectionName": name,
            "schema": {
                "autoId": false,
                "fields": [
                    { "fieldName": "tool_id", "dataType": "VarChar", "isPrimary": true, "elementTypeParams": { "max_length": 128 } },
                    { "fieldName": "tool_name", "dataType": "VarChar", "elementTypeParams": { "max_length": 256 } },
                    { "fieldName": "description", "dataType": "VarChar", "elementTypeParams": { "max_length": 2048 } },
                    { "fieldName": "schema_text", "dataType": "VarChar", "elementTypeParams": { "max_length": 4096 } },
                    { "fieldName": "embedding", "dataType": "FloatVector", "elementTypeParams": { "dim": dim } }
                ]
            },
            "indexParams": [
                {
                    "fieldName": "embedding",
                    "indexName": "embedding_hnsw",
                    "metricType": "IP",
                    "indexType": "HNSW",
                    "params": { "M": 16, "efConstruction": 256 }
                }
            ]
        });
        self.post("/v2/vectordb/collections/create", body).await?;
        Ok(())
    }

    async fn ensure(&self, name: &str, dim: usize, tool_index: bool) -> Result<bool, MemoryError> {
        if self.existing.lock().contains(name) {
            return Ok(true);
        }
        if self.has_collection(name).await? {
            self.existing.lock().insert(name.to_string());
            debug!(collection = name, "collection confirmed existing");
            return Ok(true);
        }
        if tool_index {
            self.create_tool_index_collection(name, dim).await?;
        } else {
            self.create_memory_collection(name, dim).await?;
        }
        self.existing.lock().insert(name.to_string());
        Ok(true)
    }
}

#[async_trait]
impl VectorStore for MilvusRestStore {
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<bool, MemoryError> {
        self.ensure(name, dim, false).await
    }

    async fn ensure_tool_index_collection(&self, dim: usize) -> Result<bool, MemoryError> {
        let name = tool_index_collection_name(dim);
        self.ensure(&name, dim, true).await
    }

    async fn insert(&self, collection: &str, row: VectorRow) -> Result<(), MemoryError> {
        let mut data = row.fields;
        data.insert("embedding".into(), json!(row.vector));
        self.post(
            "/v2/vectordb/entities/insert",
            json!({ "collectionName": collection, "data": [data] }),
        )
        .await?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        top_k: usize,
        filter: Option<&str>,
        output_fields: &[&str],
    ) -> Result<Vec<SearchHit>, MemoryError> {
        let mut body = json!({
            "collectionName": collection,
            "data": [vector],
            "annsField": "embedding",
            "limit": top_k,
            "outputFields": output_fields,
        });
        if let Some(filter) = filter {
            body["filter"] = json!(filter);
        }

        let data = self.post("/v2/vectordb/entities/search", body).await?;
        let rows = data.as_array().cloned().unwrap_or_default();

        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            let Value::Object(mut entity) = row else { continue };
            let score = entity
                .remove("distance")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            let id = entity.remove("id").unwrap_or(Value::Null);
            let mut kept = Map::new();
            kept.insert("id".into(), id.clone());
            for field in output_fields {
                if let Some(value) = entity.remove(*field) {
                    kept.insert((*field).to_string(), value);
                }
            }
            hits.push(SearchHit { id, score, entity: kept });
        }
        Ok(hits)
    }

    async fn query(
        &self,
        collection: &str,
        filter: Option<&str>,
        output_fields: &[&str],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Map<String, Value>>, MemoryError> {
        let mut body = json!({
            "collectionName": collection,
            "outputFields": output_fields,
            "offset": offset,
            "limit": limit,
        });
        // The v2 query endpoint requires a filter; an always-true one
        // stands in for "no filter".
        body["filter"] = json!(filter.unwrap_or("id >= 0"));

        let data = self.post("/v2/vectordb/entities/query", body).await?;
        Ok(data
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|row| match row {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect())
    }

    async fn count(&self, collection: &str, filter: Option<&str>) -> Result<u64, MemoryError> {
        let mut body = json!({
            "collectionName": collection,
            "outputFields": ["count(*)"],
        });
        body["filter"] = json!(filter.unwrap_or("id >= 0"));

        let data = self.post("/v2/vectordb/entities/query", body).await?;
        let count = data
            .as_array()
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("count(*)"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        Ok(count)
    }

    async fn delete_by_ids(&self, collection: &str, ids: &[Value]) -> Result<(), MemoryError> {
        let id_list = ids
            .iter()
            .map(|id| match id {
                Value::String(s) => format!("\"{s}\""),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(", ");
        self.post(
            "/v2/vectordb/entities/delete",
            json!({ "collectionName": collection, "filter": format!("id in [{id_list}]") }),
        )
        .await?;
        Ok(())
    }

    async fn delete_by_filter(&self, collection: &str, filter: &str) -> Result<(), MemoryError> {
        self.post(
            "/v2/vectordb/entities/delete",
            json!({ "collectionName": collection, "filter": filter }),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_trimmed() {
        let store = MilvusRestStore::new("http://localhost:19530/");
        assert_eq!(store.base_url, "http://localhost:19530");
    }

    #[tokio::test]
    async fn unreachable_host_degrades_to_unavailable() {
        let store = MilvusRestStore::new("http://milvus.invalid:19530");
        let err = store.ensure_collection("m", 4).await.unwrap_err();
        assert!(matches!(err, MemoryError::Unavailable(_)));
    }

    #[test]
    fn delete_id_list_formats_both_key_kinds() {
        // int64 memory ids and varchar tool ids serialize differently
        let ids = [json!(7), json!("web_search")];
        let rendered = ids
            .iter()
            .map(|id| match id {
                Value::String(s) => format!("\"{s}\""),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(", ");
        assert_eq!(rendered, "7, \"web_search\"");
    }
}
