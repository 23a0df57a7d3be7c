//! Milvus adapter (REST v2)
//!
//! Collections are created through the quick-create endpoint with a
//! varchar primary key named `chunk_id` and a vector field named
//! `embedding`. An HNSW index (M=8, efConstruction=64) is requested after
//! creation; if the server rejects it, Milvus falls back to AUTOINDEX.
//!
//! Score convention: with the COSINE metric Milvus reports similarity
//! directly, so scores pass through unchanged (higher is better).

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

pub struct MilvusStore {
    client: reqwest::Client,
    base_url: String,
    upsert_batch_size: usize,
}

impl MilvusStore {
    pub fn new(config: &VectorStoreConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(config.timeout));
        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            let token = format!("{user}:{password}");
            let mut headers = reqwest::header::HeaderMap::new();
            let value = format!("Bearer {token}");
            headers.insert(
                reqwest::header::AUTHORIZATION,
                value
                    .parse()
                    .map_err(|_| RagError::Config("invalid Milvus credentials".to_string()))?,
            );
            builder = builder.default_headers(headers);
        }
        let client = builder.build().map_err(RagError::Http)?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            upsert_batch_size: config.upsert_batch_size.max(1),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/v2/vectordb/{}", self.base_url, path)
    }

    /// POST a request and decode the standard {code, message, data} envelope
    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        let response = self
            .client
            .post(self.endpoint(path))
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::Collection(format!("Milvus request failed: {e}")))?;

        let envelope: Value = response
            .json()
            .await
            .map_err(|e| RagError::Collection(format!("Milvus returned invalid JSON: {e}")))?;

        let code = envelope.get("code").and_then(|c| c.as_i64()).unwrap_or(-1);
        if code != 0 {
            let message = envelope
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error")
                .to_string();
            return Err(RagError::Collection(format!(
                "Milvus error {code}: {message}"
            )));
        }

        Ok(envelope.get("data").cloned().unwrap_or(Value::Null))
    }

    async fn has_collection(&self, name: &str) -> Result<bool> {
        let data = self
            .post("collections/has", json!({ "collectionName": name }))
            .await?;
        Ok(data.get("has").and_then(|h| h.as_bool()).unwrap_or(false))
    }

    fn metric_name(metric: DistanceMetric) -> &'static str {
        match metric {
            DistanceMetric::Cosine => "COSINE",
            DistanceMetric::InnerProduct => "IP",
            DistanceMetric::L2 => "L2",
        }
    }

    /// Render the shared filter as a Milvus boolean expression
    fn filter_expr(filter: &MetadataFilter) -> String {
        let literal = |value: &Value| -> String {
            match value {
                Value::String(s) => format!("\"{}\"", s.replace('"', "\\\"")),
                other => other.to_string(),
            }
        };
        match filter.operator {
            FilterOperator::Eq => format!("{} == {}", filter.field, literal(&filter.value)),
            FilterOperator::Gte => format!("{} >= {}", filter.field, literal(&filter.value)),
            FilterOperator::Lte => format!("{} <= {}", filter.field, literal(&filter.value)),
            FilterOperator::In => {
                let items = filter
                    .value
                    .as_array()
                    .map(|arr| arr.iter().map(literal).collect::<Vec<_>>().join(", "))
                    .unwrap_or_else(|| literal(&filter.value));
                format!("{} in [{}]", filter.field, items)
            }
        }
    }
}

#[async_trait]
impl VectorStore for MilvusStore {
    fn backend(&self) -> &'static str {
        "milvus"
    }

    async fn create_collection(
        &self,
        name: &str,
        dimension: usize,
        metric: DistanceMetric,
        _extra_metadata: Option<Value>,
    ) -> Result<()> {
        if self.has_collection(name).await? {
            debug!("Milvus collection '{}' already exists", name);
            return Ok(());
        }

        self.post(
            "collections/create",
            json!({
                "collectionName": name,
                "dimension": dimension,
                "metricType": Self::metric_name(metric),
                "idType": "VarChar",
                "primaryFieldName": "chunk_id",
                "vectorFieldName": "embedding",
                "params": { "max_length": 256 },
            }),
        )
        .await
        .or_else(|e| {
            // Concurrent creation races surface as "already exist".
            if e.to_string().contains("already exist") {
                Ok(Value::Null)
            } else {
                Err(e)
            }
        })?;

        let index_result = self
            .post(
                "indexes/create",
                json!({
                    "collectionName": name,
                    "indexParams": [{
                        "fieldName": "embedding",
                        "indexName": "embedding_hnsw",
                        "metricType": Self::metric_name(metric),
                        "params": { "index_type": "HNSW", "M": 8, "efConstruction": 64 },
                    }],
                }),
            )
            .await;

        if let Err(e) = index_result {
            warn!(
                "HNSW index creation failed for '{}' ({}); relying on AUTOINDEX",
                name, e
            );
        }

        info!("Created Milvus collection '{}' (dim {})", name, dimension);
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        match self
            .post("collections/drop", json!({ "collectionName": name }))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("not found") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn add_chunks(&self, name: &str, chunks: &[DocumentChunk]) -> Result<Vec<String>> {
        let mut written = Vec::with_capacity(chunks.len());

        for batch in chunks.chunks(self.upsert_batch_size) {
            let data: Vec<Value> = batch
                .iter()
                .map(|chunk| {
                    let mut fields = chunk_to_fields(chunk);
                    fields.insert("embedding".into(), json!(chunk.embedding));
                    Value::Object(fields)
                })
                .collect();

            self.post(
                "entities/upsert",
                json!({ "collectionName": name, "data": data }),
            )
            .await
            .map_err(|e| RagError::Document {
                message: format!("Milvus upsert failed: {e}"),
                failed_chunk_ids: batch.iter().map(|c| c.chunk_id.clone()).collect(),
            })?;

            written.extend(batch.iter().map(|c| c.chunk_id.clone()));
        }

        debug!("Upserted {} chunks into Milvus '{}'", written.len(), name);
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

        if !self.has_collection(name).await? {
            return Err(RagError::Collection(format!(
                "collection '{name}' does not exist"
            )));
        }

        let mut body = json!({
            "collectionName": name,
            "data": [query_vector],
            "annsField": "embedding",
            "limit": k,
            "outputFields": [
                "chunk_id", "document_id", "text", "source_id", "source", "url",
                "created_at", "author", "page_number", "chunk_number",
                "table_index", "image_index"
            ],
        });
        if let Some(filter) = filter {
            body["filter"] = Value::String(Self::filter_expr(filter));
        }

        let data = self.post("entities/search", body).await?;
        let hits = data.as_array().cloned().unwrap_or_default();

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            let fields: Map<String, Value> = hit.as_object().cloned().unwrap_or_default();
            // COSINE distance from Milvus is already a similarity.
            let score = fields
                .get("distance")
                .and_then(|d| d.as_f64())
                .unwrap_or(0.0) as f32;
            let chunk = chunk_from_fields(&fields, Vec::new());
            results.push(QueryResult {
                chunk_id: chunk.chunk_id.clone(),
                score,
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
        let quoted: Vec<String> = chunk_ids.iter().map(|id| format!("\"{id}\"")).collect();
        self.post(
            "entities/delete",
            json!({
                "collectionName": name,
                "filter": format!("chunk_id in [{}]", quoted.join(", ")),
            }),
        )
        .await?;
        Ok(chunk_ids.len())
    }

    async fn ping(&self) -> Result<()> {
        self.post("collections/list", json!({})).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VectorStoreKind;

    fn test_store() -> MilvusStore {
        MilvusStore::new(&VectorStoreConfig {
            kind: VectorStoreKind::Milvus,
            url: "http://localhost:19530/".to_string(),
            api_key: None,
            username: None,
            password: None,
            upsert_batch_size: 100,
            timeout: 30,
        })
        .unwrap()
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let store = test_store();
        assert_eq!(
            store.endpoint("collections/create"),
            "http://localhost:19530/v2/vectordb/collections/create"
        );
    }

    #[test]
    fn test_filter_expressions() {
        let eq = MetadataFilter {
            field: "source".to_string(),
            operator: FilterOperator::Eq,
            value: json!("pdf"),
        };
        assert_eq!(MilvusStore::filter_expr(&eq), "source == \"pdf\"");

        let gte = MetadataFilter {
            field: "page_number".to_string(),
            operator: FilterOperator::Gte,
            value: json!(3),
        };
        assert_eq!(MilvusStore::filter_expr(&gte), "page_number >= 3");

        let contains = MetadataFilter {
            field: "document_id".to_string(),
            operator: FilterOperator::In,
            value: json!(["a", "b"]),
        };
        assert_eq!(
            MilvusStore::filter_expr(&contains),
            "document_id in [\"a\", \"b\"]"
        );
    }

    #[test]
    fn test_metric_names() {
        assert_eq!(MilvusStore::metric_name(DistanceMetric::Cosine), "COSINE");
        assert_eq!(MilvusStore::metric_name(DistanceMetric::InnerProduct), "IP");
        assert_eq!(MilvusStore::metric_name(DistanceMetric::L2), "L2");
    }
}
