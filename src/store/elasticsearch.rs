//! Elasticsearch adapter
//!
//! Collections map to indices with a `dense_vector` mapping. Writes go
//! through the `_bulk` API in batches; queries use the `knn` search
//! clause with the shared filter translated to term/range/terms queries.
//!
//! Score convention: for cosine similarity Elasticsearch reports
//! `(1 + cosine) / 2`, so scores are mapped back to the raw cosine value
//! (`2 * score - 1`) to keep "higher is better" comparable across
//! back-ends.

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
use tracing::{debug, info};

pub struct ElasticsearchStore {
    client: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    upsert_batch_size: usize,
}

impl ElasticsearchStore {
    pub fn new(config: &VectorStoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .map_err(RagError::Http)?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            upsert_batch_size: config.upsert_batch_size.max(1),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}/{}", self.base_url, path));
        if let Some(username) = &self.username {
            builder = builder.basic_auth(username, self.password.as_deref());
        }
        builder
    }

    fn similarity_name(metric: DistanceMetric) -> &'static str {
        match metric {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::InnerProduct => "dot_product",
            DistanceMetric::L2 => "l2_norm",
        }
    }

    /// Translate the shared filter into an Elasticsearch query clause
    fn filter_query(filter: &MetadataFilter) -> Value {
        match filter.operator {
            FilterOperator::Eq => json!({ "term": { filter.field.clone(): filter.value.clone() } }),
            FilterOperator::Gte => {
                json!({ "range": { filter.field.clone(): { "gte": filter.value.clone() } } })
            }
            FilterOperator::Lte => {
                json!({ "range": { filter.field.clone(): { "lte": filter.value.clone() } } })
            }
            FilterOperator::In => {
                json!({ "terms": { filter.field.clone(): filter.value.clone() } })
            }
        }
    }

    async fn index_exists(&self, name: &str) -> Result<bool> {
        let response = self
            .request(reqwest::Method::HEAD, name)
            .send()
            .await
            .map_err(|e| RagError::Collection(format!("Elasticsearch request failed: {e}")))?;
        Ok(response.status().is_success())
    }
}

#[async_trait]
impl VectorStore for ElasticsearchStore {
    fn backend(&self) -> &'static str {
        "elasticsearch"
    }

    async fn create_collection(
        &self,
        name: &str,
        dimension: usize,
        metric: DistanceMetric,
        _extra_metadata: Option<Value>,
    ) -> Result<()> {
        let body = json!({
            "mappings": {
                "properties": {
                    "embedding": {
                        "type": "dense_vector",
                        "dims": dimension,
                        "index": true,
                        "similarity": Self::similarity_name(metric),
                        "index_options": { "type": "hnsw", "m": 8, "ef_construction": 64 },
                    },
                    "chunk_id": { "type": "keyword" },
                    "document_id": { "type": "keyword" },
                    "text": { "type": "text" },
                    "source_id": { "type": "keyword" },
                    "source": { "type": "keyword" },
                    "url": { "type": "keyword" },
                    "created_at": { "type": "date" },
                    "author": { "type": "keyword" },
                    "page_number": { "type": "integer" },
                    "chunk_number": { "type": "integer" },
                    "table_index": { "type": "integer" },
                    "image_index": { "type": "integer" },
                }
            }
        });

        let response = self
            .request(reqwest::Method::PUT, name)
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::Collection(format!("Elasticsearch request failed: {e}")))?;

        if response.status().is_success() {
            info!("Created Elasticsearch index '{}' (dim {})", name, dimension);
            return Ok(());
        }

        let error_body: Value = response.json().await.unwrap_or_default();
        let error_type = error_body
            .pointer("/error/type")
            .and_then(|t| t.as_str())
            .unwrap_or("");
        if error_type == "resource_already_exists_exception" {
            debug!("Elasticsearch index '{}' already exists", name);
            return Ok(());
        }

        Err(RagError::Collection(format!(
            "Elasticsearch index creation failed: {error_body}"
        )))
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::DELETE, name)
            .send()
            .await
            .map_err(|e| RagError::Collection(format!("Elasticsearch request failed: {e}")))?;

        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }

        Err(RagError::Collection(format!(
            "Elasticsearch index deletion failed with status {}",
            response.status()
        )))
    }

    async fn add_chunks(&self, name: &str, chunks: &[DocumentChunk]) -> Result<Vec<String>> {
        let mut written = Vec::with_capacity(chunks.len());

        for batch in chunks.chunks(self.upsert_batch_size) {
            let mut ndjson = String::new();
            for chunk in batch {
                let action = json!({ "index": { "_index": name, "_id": chunk.chunk_id } });
                let mut fields = chunk_to_fields(chunk);
                fields.insert("embedding".into(), json!(chunk.embedding));
                ndjson.push_str(&action.to_string());
                ndjson.push('\n');
                ndjson.push_str(&Value::Object(fields).to_string());
                ndjson.push('\n');
            }

            let response = self
                .request(reqwest::Method::POST, "_bulk")
                .header("content-type", "application/x-ndjson")
                .body(ndjson)
                .send()
                .await
                .map_err(|e| RagError::Collection(format!("Elasticsearch bulk failed: {e}")))?;

            let body: Value = response
                .json()
                .await
                .map_err(|e| RagError::Collection(format!("invalid bulk response: {e}")))?;

            if body.get("errors").and_then(|e| e.as_bool()).unwrap_or(false) {
                let failed: Vec<String> = body
                    .get("items")
                    .and_then(|items| items.as_array())
                    .map(|items| {
                        items
                            .iter()
                            .filter(|item| item.pointer("/index/error").is_some())
                            .filter_map(|item| item.pointer("/index/_id"))
                            .filter_map(|id| id.as_str())
                            .map(|id| id.to_string())
                            .collect()
                    })
                    .unwrap_or_default();
                return Err(RagError::Document {
                    message: "Elasticsearch rejected part of the bulk write".to_string(),
                    failed_chunk_ids: failed,
                });
            }

            written.extend(batch.iter().map(|c| c.chunk_id.clone()));
        }

        debug!(
            "Indexed {} chunks into Elasticsearch '{}'",
            written.len(),
            name
        );
        Ok(written)
    }

    async fn query(
        &self,
        name: &str,
        query_vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<QueryResult>> {
        ensure_k(k)?;

        let mut knn = json!({
            "field": "embedding",
            "query_vector": query_vector,
            "k": k,
            "num_candidates": (k * 10).max(100),
        });
        if let Some(filter) = filter {
            knn["filter"] = Self::filter_query(filter);
        }

        let response = self
            .request(reqwest::Method::POST, &format!("{name}/_search"))
            .json(&json!({ "knn": knn, "_source": { "excludes": ["embedding"] } }))
            .send()
            .await
            .map_err(|e| RagError::Collection(format!("Elasticsearch search failed: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(RagError::Collection(format!(
                "collection '{name}' does not exist"
            )));
        }
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RagError::Collection(format!(
                "Elasticsearch search failed: {text}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| RagError::Collection(format!("invalid search response: {e}")))?;

        let hits = body
            .pointer("/hits/hits")
            .and_then(|h| h.as_array())
            .cloned()
            .unwrap_or_default();

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            let score = hit.get("_score").and_then(|s| s.as_f64()).unwrap_or(0.0) as f32;
            let fields: Map<String, Value> = hit
                .get("_source")
                .and_then(|s| s.as_object())
                .cloned()
                .unwrap_or_default();
            let chunk = chunk_from_fields(&fields, Vec::new());
            results.push(QueryResult {
                chunk_id: chunk.chunk_id.clone(),
                // Map (1 + cos) / 2 back to the raw cosine value.
                score: 2.0 * score - 1.0,
                chunk,
            });
        }

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(results)
    }

    async fn delete_chunks(&self, name: &str, chunk_ids: &[String]) -> Result<usize> {
        if chunk_ids.is_empty() {
            return Ok(0);
        }

        let response = self
            .request(reqwest::Method::POST, &format!("{name}/_delete_by_query"))
            .json(&json!({ "query": { "terms": { "chunk_id": chunk_ids } } }))
            .send()
            .await
            .map_err(|e| RagError::Collection(format!("Elasticsearch delete failed: {e}")))?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| RagError::Collection(format!("invalid delete response: {e}")))?;

        Ok(body.get("deleted").and_then(|d| d.as_u64()).unwrap_or(0) as usize)
    }

    async fn ping(&self) -> Result<()> {
        let response = self
            .request(reqwest::Method::GET, "_cluster/health")
            .send()
            .await
            .map_err(|e| RagError::Collection(format!("Elasticsearch unreachable: {e}")))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(RagError::Collection(format!(
                "Elasticsearch health check failed with status {}",
                response.status()
            )))
        }
    }
}
