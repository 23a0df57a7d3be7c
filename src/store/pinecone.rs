//! Pinecone adapter
//!
//! The configured URL is the data-plane host of one serverless index;
//! collections map to namespaces within it. Pinecone provisions and
//! tunes its own ANN index, so `create_collection` only verifies that
//! the index dimension matches and the namespace is addressable.
//! Bulk upserts use the vectors/upsert endpoint in batches.
//!
//! Score convention: with the cosine metric Pinecone returns similarity
//! directly, so scores pass through unchanged.

use super::{
    chunk_from_fields, chunk_to_fields, ensure_k, filter_to_mongo, DistanceMetric, MetadataFilter,
    QueryResult, VectorStore,
};
use crate::config::VectorStoreConfig;
use crate::error::{RagError, Result};
use crate::types::DocumentChunk;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info};

pub struct PineconeStore {
    client: reqwest::Client,
    base_url: String,
    upsert_batch_size: usize,
}

impl PineconeStore {
    pub fn new(config: &VectorStoreConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| RagError::Config("Pinecone requires an API key".to_string()))?;

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "Api-Key",
            api_key
                .parse()
                .map_err(|_| RagError::Config("invalid Pinecone API key".to_string()))?,
        );

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .default_headers(headers)
            .build()
            .map_err(RagError::Http)?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            upsert_batch_size: config.upsert_batch_size.max(1),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Fetch index stats; carries the dimension and per-namespace counts
    async fn index_stats(&self) -> Result<Value> {
        let response = self
            .client
            .post(self.endpoint("describe_index_stats"))
            .json(&json!({}))
            .send()
            .await
            .map_err(|e| RagError::Collection(format!("Pinecone request failed: {e}")))?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RagError::Collection(format!(
                "Pinecone describe_index_stats failed: {text}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| RagError::Collection(format!("invalid stats response: {e}")))
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        let stats = self.index_stats().await?;
        Ok(stats
            .pointer(&format!("/namespaces/{name}"))
            .is_some_and(|ns| !ns.is_null()))
    }
}

#[async_trait]
impl VectorStore for PineconeStore {
    fn backend(&self) -> &'static str {
        "pinecone"
    }

    async fn create_collection(
        &self,
        name: &str,
        dimension: usize,
        metric: DistanceMetric,
        _extra_metadata: Option<Value>,
    ) -> Result<()> {
        if metric == DistanceMetric::L2 {
            return Err(RagError::Collection(
                "the configured Pinecone index uses cosine; L2 collections are not supported"
                    .to_string(),
            ));
        }

        let stats = self.index_stats().await?;
        let index_dimension = stats
            .get("dimension")
            .and_then(|d| d.as_u64())
            .unwrap_or(0) as usize;

        if index_dimension != 0 && index_dimension != dimension {
            return Err(RagError::Collection(format!(
                "Pinecone index dimension {index_dimension} does not match requested {dimension}"
            )));
        }

        // Namespaces materialize on first write; nothing else to create.
        info!(
            "Pinecone namespace '{}' ready (index dim {})",
            name, index_dimension
        );
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint("vectors/delete"))
            .json(&json!({ "deleteAll": true, "namespace": name }))
            .send()
            .await
            .map_err(|e| RagError::Collection(format!("Pinecone request failed: {e}")))?;

        // Deleting an unknown namespace is a no-op on the server too.
        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(RagError::Collection(format!(
            "Pinecone namespace deletion failed: {text}"
        )))
    }

    async fn add_chunks(&self, name: &str, chunks: &[DocumentChunk]) -> Result<Vec<String>> {
        let mut written = Vec::with_capacity(chunks.len());

        for batch in chunks.chunks(self.upsert_batch_size) {
            let vectors: Vec<Value> = batch
                .iter()
                .map(|chunk| {
                    json!({
                        "id": chunk.chunk_id,
                        "values": chunk.embedding,
                        "metadata": Value::Object(chunk_to_fields(chunk)),
                    })
                })
                .collect();

            let response = self
                .client
                .post(self.endpoint("vectors/upsert"))
                .json(&json!({ "vectors": vectors, "namespace": name }))
                .send()
                .await
                .map_err(|e| RagError::Collection(format!("Pinecone upsert failed: {e}")))?;

            if !response.status().is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(RagError::Document {
                    message: format!("Pinecone upsert failed: {text}"),
                    failed_chunk_ids: batch.iter().map(|c| c.chunk_id.clone()).collect(),
                });
            }

            written.extend(batch.iter().map(|c| c.chunk_id.clone()));
        }

        debug!(
            "Upserted {} vectors into Pinecone namespace '{}'",
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

        if !self.namespace_exists(name).await? {
            return Err(RagError::Collection(format!(
                "collection '{name}' does not exist"
            )));
        }

        let mut body = json!({
            "vector": query_vector,
            "topK": k,
            "namespace": name,
            "includeMetadata": true,
        });
        if let Some(filter) = filter {
            body["filter"] = filter_to_mongo(filter);
        }

        let response = self
            .client
            .post(self.endpoint("query"))
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::Collection(format!("Pinecone query failed: {e}")))?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RagError::Collection(format!("Pinecone query failed: {text}")));
        }

        let result: Value = response
            .json()
            .await
            .map_err(|e| RagError::Collection(format!("invalid query response: {e}")))?;

        let matches = result
            .get("matches")
            .and_then(|m| m.as_array())
            .cloned()
            .unwrap_or_default();

        let mut results = Vec::with_capacity(matches.len());
        for hit in matches {
            let chunk_id = hit
                .get("id")
                .and_then(|id| id.as_str())
                .unwrap_or_default()
                .to_string();
            let score = hit.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0) as f32;
            let fields: Map<String, Value> = hit
                .get("metadata")
                .and_then(|m| m.as_object())
                .cloned()
                .unwrap_or_default();
            results.push(QueryResult {
                chunk_id,
                score,
                chunk: chunk_from_fields(&fields, Vec::new()),
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
            .client
            .post(self.endpoint("vectors/delete"))
            .json(&json!({ "ids": chunk_ids, "namespace": name }))
            .send()
            .await
            .map_err(|e| RagError::Collection(format!("Pinecone delete failed: {e}")))?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RagError::Collection(format!("Pinecone delete failed: {text}")));
        }

        Ok(chunk_ids.len())
    }

    async fn ping(&self) -> Result<()> {
        self.index_stats().await.map(|_| ())
    }
}
