//! Weaviate adapter
//!
//! Collections map to Weaviate classes (names are capitalized to satisfy
//! the class naming rule). Objects carry their vectors explicitly
//! (`vectorizer: none`); the HNSW index is configured at class creation
//! with maxConnections=8 and efConstruction=64. Queries go through the
//! GraphQL `Get` endpoint with `nearVector`.
//!
//! Score convention: Weaviate reports `certainty = (1 + cosine) / 2`,
//! mapped back to the raw cosine value (`2 * certainty - 1`).

use super::{
    chunk_from_fields, chunk_to_fields, ensure_k, DistanceMetric, FilterOperator, MetadataFilter,
    QueryResult, VectorStore,
};
use crate::config::VectorStoreConfig;
use crate::error::{RagError, Result};
use crate::types::DocumentChunk;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct WeaviateStore {
    client: reqwest::Client,
    base_url: String,
}

impl WeaviateStore {
    pub fn new(config: &VectorStoreConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(config.timeout));
        if let Some(api_key) = &config.api_key {
            let mut headers = reqwest::header::HeaderMap::new();
            headers.insert(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {api_key}")
                    .parse()
                    .map_err(|_| RagError::Config("invalid Weaviate API key".to_string()))?,
            );
            builder = builder.default_headers(headers);
        }
        let client = builder.build().map_err(RagError::Http)?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path)
    }

    /// Weaviate class names must start with an uppercase letter and stay
    /// alphanumeric.
    fn class_name(collection: &str) -> String {
        let cleaned: String = collection
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '_' })
            .collect();
        let mut chars = cleaned.chars();
        match chars.next() {
            Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
            None => "Collection".to_string(),
        }
    }

    async fn class_exists(&self, class: &str) -> Result<bool> {
        let response = self
            .client
            .get(self.endpoint(&format!("schema/{class}")))
            .send()
            .await
            .map_err(|e| RagError::Collection(format!("Weaviate request failed: {e}")))?;
        Ok(response.status().is_success())
    }

    /// Translate the shared filter into a GraphQL `where` argument
    fn filter_clause(filter: &MetadataFilter) -> String {
        let (operator, value_key, rendered) = match (&filter.operator, &filter.value) {
            (FilterOperator::Eq, Value::String(s)) => {
                ("Equal", "valueText", format!("\"{s}\""))
            }
            (FilterOperator::Eq, v) => ("Equal", "valueNumber", v.to_string()),
            (FilterOperator::Gte, v) => ("GreaterThanEqual", "valueNumber", v.to_string()),
            (FilterOperator::Lte, v) => ("LessThanEqual", "valueNumber", v.to_string()),
            (FilterOperator::In, v) => {
                let rendered = v
                    .as_array()
                    .map(|arr| {
                        let items: Vec<String> = arr
                            .iter()
                            .map(|item| match item {
                                Value::String(s) => format!("\"{s}\""),
                                other => other.to_string(),
                            })
                            .collect();
                        format!("[{}]", items.join(", "))
                    })
                    .unwrap_or_else(|| v.to_string());
                ("ContainsAny", "valueText", rendered)
            }
        };
        format!(
            "where: {{ path: [\"{}\"], operator: {}, {}: {} }}",
            filter.field, operator, value_key, rendered
        )
    }
}

#[async_trait]
impl VectorStore for WeaviateStore {
    fn backend(&self) -> &'static str {
        "weaviate"
    }

    async fn create_collection(
        &self,
        name: &str,
        _dimension: usize,
        metric: DistanceMetric,
        _extra_metadata: Option<Value>,
    ) -> Result<()> {
        let class = Self::class_name(name);
        if self.class_exists(&class).await? {
            debug!("Weaviate class '{}' already exists", class);
            return Ok(());
        }

        let distance = match metric {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::InnerProduct => "dot",
            DistanceMetric::L2 => "l2-squared",
        };

        let text_properties = [
            "chunk_id",
            "document_id",
            "text",
            "source_id",
            "source",
            "url",
            "created_at",
            "author",
        ];
        let int_properties = ["page_number", "chunk_number", "table_index", "image_index"];
        let mut properties: Vec<Value> = text_properties
            .iter()
            .map(|p| json!({ "name": p, "dataType": ["text"] }))
            .collect();
        properties.extend(
            int_properties
                .iter()
                .map(|p| json!({ "name": p, "dataType": ["int"] })),
        );

        let response = self
            .client
            .post(self.endpoint("schema"))
            .json(&json!({
                "class": class,
                "vectorizer": "none",
                "vectorIndexType": "hnsw",
                "vectorIndexConfig": {
                    "distance": distance,
                    "maxConnections": 8,
                    "efConstruction": 64,
                },
                "properties": properties,
            }))
            .send()
            .await
            .map_err(|e| RagError::Collection(format!("Weaviate request failed: {e}")))?;

        if response.status().is_success() {
            info!("Created Weaviate class '{}'", class);
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        if text.contains("already exists") {
            return Ok(());
        }
        Err(RagError::Collection(format!(
            "Weaviate class creation failed: {text}"
        )))
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        let class = Self::class_name(name);
        let response = self
            .client
            .delete(self.endpoint(&format!("schema/{class}")))
            .send()
            .await
            .map_err(|e| RagError::Collection(format!("Weaviate request failed: {e}")))?;

        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(RagError::Collection(format!(
            "Weaviate class deletion failed with status {}",
            response.status()
        )))
    }

    async fn add_chunks(&self, name: &str, chunks: &[DocumentChunk]) -> Result<Vec<String>> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        let class = Self::class_name(name);

        let objects: Vec<Value> = chunks
            .iter()
            .map(|chunk| {
                json!({
                    "class": class,
                    // Chunk ids are UUIDs, which is what Weaviate requires.
                    "id": chunk.chunk_id,
                    "properties": Value::Object(chunk_to_fields(chunk)),
                    "vector": chunk.embedding,
                })
            })
            .collect();

        let response = self
            .client
            .post(self.endpoint("batch/objects"))
            .json(&json!({ "objects": objects }))
            .send()
            .await
            .map_err(|e| RagError::Collection(format!("Weaviate batch failed: {e}")))?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RagError::Document {
                message: format!("Weaviate batch failed: {text}"),
                failed_chunk_ids: chunks.iter().map(|c| c.chunk_id.clone()).collect(),
            });
        }

        // The batch endpoint returns per-object results; collect failures.
        let body: Value = response
            .json()
            .await
            .map_err(|e| RagError::Collection(format!("invalid batch response: {e}")))?;
        let failed: Vec<String> = body
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter(|item| {
                        item.pointer("/result/errors").is_some_and(|e| !e.is_null())
                    })
                    .filter_map(|item| item.get("id"))
                    .filter_map(|id| id.as_str())
                    .map(|id| id.to_string())
                    .collect()
            })
            .unwrap_or_default();

        if !failed.is_empty() {
            return Err(RagError::Document {
                message: format!("Weaviate rejected {} objects", failed.len()),
                failed_chunk_ids: failed,
            });
        }

        debug!("Upserted {} objects into Weaviate '{}'", chunks.len(), class);
        Ok(chunks.iter().map(|c| c.chunk_id.clone()).collect())
    }

    async fn query(
        &self,
        name: &str,
        query_vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<QueryResult>> {
        ensure_k(k)?;
        let class = Self::class_name(name);

        if !self.class_exists(&class).await? {
            return Err(RagError::Collection(format!(
                "collection '{name}' does not exist"
            )));
        }

        let vector = serde_json::to_string(query_vector)?;
        let filter_clause = filter.map(Self::filter_clause).unwrap_or_default();
        let query = format!(
            "{{ Get {{ {class}(limit: {k}, nearVector: {{ vector: {vector} }} {filter_sep} {filter_clause}) \
             {{ chunk_id document_id text source_id source url created_at author \
                page_number chunk_number table_index image_index \
                _additional {{ certainty }} }} }} }}",
            filter_sep = if filter_clause.is_empty() { "" } else { "," },
        );

        let response = self
            .client
            .post(self.endpoint("graphql"))
            .json(&json!({ "query": query }))
            .send()
            .await
            .map_err(|e| RagError::Collection(format!("Weaviate query failed: {e}")))?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| RagError::Collection(format!("invalid query response: {e}")))?;

        if let Some(errors) = body.get("errors").filter(|e| !e.is_null()) {
            return Err(RagError::Collection(format!(
                "Weaviate query returned errors: {errors}"
            )));
        }

        let hits = body
            .pointer(&format!("/data/Get/{class}"))
            .and_then(|h| h.as_array())
            .cloned()
            .unwrap_or_default();

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            let fields: Map<String, Value> = hit.as_object().cloned().unwrap_or_default();
            let certainty = hit
                .pointer("/_additional/certainty")
                .and_then(|c| c.as_f64())
                .unwrap_or(0.5);
            let chunk = chunk_from_fields(&fields, Vec::new());
            results.push(QueryResult {
                chunk_id: chunk.chunk_id.clone(),
                // certainty = (1 + cos) / 2 → raw cosine.
                score: (2.0 * certainty - 1.0) as f32,
                chunk,
            });
        }

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(results)
    }

    async fn delete_chunks(&self, name: &str, chunk_ids: &[String]) -> Result<usize> {
        let class = Self::class_name(name);
        let mut deleted = 0usize;

        for chunk_id in chunk_ids {
            let response = self
                .client
                .delete(self.endpoint(&format!("objects/{class}/{chunk_id}")))
                .send()
                .await
                .map_err(|e| RagError::Collection(format!("Weaviate delete failed: {e}")))?;
            if response.status().is_success() {
                deleted += 1;
            } else if response.status() != reqwest::StatusCode::NOT_FOUND {
                warn!(
                    "Weaviate delete of {} returned status {}",
                    chunk_id,
                    response.status()
                );
            }
        }

        Ok(deleted)
    }

    async fn ping(&self) -> Result<()> {
        let response = self
            .client
            .get(self.endpoint(".well-known/ready"))
            .send()
            .await
            .map_err(|e| RagError::Collection(format!("Weaviate unreachable: {e}")))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(RagError::Collection(format!(
                "Weaviate readiness check failed with status {}",
                response.status()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_name_sanitization() {
        assert_eq!(WeaviateStore::class_name("my-docs"), "My_docs");
        assert_eq!(WeaviateStore::class_name("reports"), "Reports");
        assert_eq!(WeaviateStore::class_name(""), "Collection");
    }

    #[test]
    fn test_filter_clause_text_equality() {
        let filter = MetadataFilter {
            field: "source".to_string(),
            operator: FilterOperator::Eq,
            value: json!("pdf"),
        };
        let clause = WeaviateStore::filter_clause(&filter);
        assert!(clause.contains("operator: Equal"));
        assert!(clause.contains("valueText: \"pdf\""));
    }

    #[test]
    fn test_filter_clause_numeric_range() {
        let filter = MetadataFilter {
            field: "page_number".to_string(),
            operator: FilterOperator::Gte,
            value: json!(2),
        };
        let clause = WeaviateStore::filter_clause(&filter);
        assert!(clause.contains("operator: GreaterThanEqual"));
        assert!(clause.contains("valueNumber: 2"));
    }

    #[test]
    fn test_filter_clause_in() {
        let filter = MetadataFilter {
            field: "document_id".to_string(),
            operator: FilterOperator::In,
            value: json!(["a", "b"]),
        };
        let clause = WeaviateStore::filter_clause(&filter);
        assert!(clause.contains("ContainsAny"));
        assert!(clause.contains("[\"a\", \"b\"]"));
    }
}
