//! Chroma adapter (REST v1)
//!
//! Collections are addressed by name on creation and by server-assigned
//! id afterwards, so every operation resolves the name first. Chroma
//! manages its own index; the cosine space is requested through the
//! `hnsw:space` metadata key and no explicit index call exists. Writes
//! use the single-shot upsert endpoint (Chroma has no bulk batching API).
//!
//! Score convention: Chroma returns cosine *distance* (lower is better),
//! mapped to `1 - distance` so higher is better.

use super::{
    ensure_k, filter_to_mongo, DistanceMetric, MetadataFilter, QueryResult, VectorStore,
};
use crate::config::VectorStoreConfig;
use crate::error::{RagError, Result};
use crate::types::{ChunkMetadata, DocumentChunk, SourceKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info};

pub struct ChromaStore {
    client: reqwest::Client,
    base_url: String,
}

impl ChromaStore {
    pub fn new(config: &VectorStoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .map_err(RagError::Http)?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, path)
    }

    /// Resolve a collection name to its server-side id
    async fn collection_id(&self, name: &str) -> Result<String> {
        let response = self
            .client
            .get(self.endpoint(&format!("collections/{name}")))
            .send()
            .await
            .map_err(|e| RagError::Collection(format!("Chroma request failed: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND
            || response.status().is_client_error()
        {
            return Err(RagError::Collection(format!(
                "collection '{name}' does not exist"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| RagError::Collection(format!("Chroma returned invalid JSON: {e}")))?;

        body.get("id")
            .and_then(|id| id.as_str())
            .map(|id| id.to_string())
            .ok_or_else(|| RagError::Collection(format!("collection '{name}' does not exist")))
    }

    /// Flatten chunk metadata into Chroma's flat metadata map
    fn chunk_metadata(chunk: &DocumentChunk) -> Value {
        let mut map = Map::new();
        map.insert("document_id".into(), chunk.document_id.clone().into());
        map.insert(
            "source".into(),
            chunk
                .metadata
                .source
                .map(|s| s.to_string())
                .unwrap_or_else(|| SourceKind::Other.to_string())
                .into(),
        );
        map.insert("created_at".into(), chunk.created_at.to_rfc3339().into());
        if let Some(source_id) = &chunk.metadata.source_id {
            map.insert("source_id".into(), source_id.clone().into());
        }
        if let Some(url) = &chunk.metadata.url {
            map.insert("url".into(), url.clone().into());
        }
        if let Some(author) = &chunk.metadata.author {
            map.insert("author".into(), author.clone().into());
        }
        if let Some(page) = chunk.metadata.page_number {
            map.insert("page_number".into(), page.into());
        }
        if let Some(number) = chunk.metadata.chunk_number {
            map.insert("chunk_number".into(), number.into());
        }
        if let Some(table) = chunk.metadata.table_index {
            map.insert("table_index".into(), table.into());
        }
        if let Some(image) = chunk.metadata.image_index {
            map.insert("image_index".into(), image.into());
        }
        Value::Object(map)
    }

    fn chunk_from_parts(id: &str, document: &str, metadata: &Map<String, Value>) -> DocumentChunk {
        let str_field = |key: &str| -> Option<String> {
            metadata
                .get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };
        let u32_field = |key: &str| -> Option<u32> {
            metadata.get(key).and_then(|v| v.as_u64()).map(|v| v as u32)
        };

        let source = str_field("source").map(|s| match s.as_str() {
            "pdf" => SourceKind::Pdf,
            "docx" => SourceKind::Docx,
            "xlsx" => SourceKind::Xlsx,
            "txt" => SourceKind::Txt,
            "web" => SourceKind::Web,
            _ => SourceKind::Other,
        });

        DocumentChunk {
            chunk_id: id.to_string(),
            document_id: str_field("document_id").unwrap_or_default(),
            text: document.to_string(),
            embedding: Vec::new(),
            metadata: ChunkMetadata {
                source,
                source_id: str_field("source_id"),
                page_number: u32_field("page_number"),
                chunk_number: u32_field("chunk_number"),
                table_index: u32_field("table_index"),
                image_index: u32_field("image_index"),
                url: str_field("url"),
                author: str_field("author"),
                start_index: None,
                end_index: None,
            },
            created_at: str_field("created_at")
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
        }
    }
}

#[async_trait]
impl VectorStore for ChromaStore {
    fn backend(&self) -> &'static str {
        "chroma"
    }

    async fn create_collection(
        &self,
        name: &str,
        _dimension: usize,
        metric: DistanceMetric,
        extra_metadata: Option<Value>,
    ) -> Result<()> {
        let space = match metric {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::InnerProduct => "ip",
            DistanceMetric::L2 => "l2",
        };
        let mut metadata = json!({ "hnsw:space": space });
        if let Some(Value::Object(extra)) = extra_metadata {
            for (key, value) in extra {
                metadata[key] = value;
            }
        }

        let response = self
            .client
            .post(self.endpoint("collections"))
            .json(&json!({ "name": name, "metadata": metadata, "get_or_create": true }))
            .send()
            .await
            .map_err(|e| RagError::Collection(format!("Chroma request failed: {e}")))?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RagError::Collection(format!(
                "Chroma collection creation failed: {text}"
            )));
        }

        info!("Created Chroma collection '{}'", name);
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.endpoint(&format!("collections/{name}")))
            .send()
            .await
            .map_err(|e| RagError::Collection(format!("Chroma request failed: {e}")))?;

        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        // Chroma reports unknown names as a 500 with a ValueError payload.
        let text = response.text().await.unwrap_or_default();
        if text.contains("does not exist") {
            return Ok(());
        }
        Err(RagError::Collection(format!(
            "Chroma collection deletion failed: {text}"
        )))
    }

    async fn add_chunks(&self, name: &str, chunks: &[DocumentChunk]) -> Result<Vec<String>> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        let id = self.collection_id(name).await?;

        let ids: Vec<&str> = chunks.iter().map(|c| c.chunk_id.as_str()).collect();
        let embeddings: Vec<&Vec<f32>> = chunks.iter().map(|c| &c.embedding).collect();
        let documents: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let metadatas: Vec<Value> = chunks.iter().map(Self::chunk_metadata).collect();

        let response = self
            .client
            .post(self.endpoint(&format!("collections/{id}/upsert")))
            .json(&json!({
                "ids": ids,
                "embeddings": embeddings,
                "documents": documents,
                "metadatas": metadatas,
            }))
            .send()
            .await
            .map_err(|e| RagError::Collection(format!("Chroma upsert failed: {e}")))?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RagError::Document {
                message: format!("Chroma upsert failed: {text}"),
                failed_chunk_ids: chunks.iter().map(|c| c.chunk_id.clone()).collect(),
            });
        }

        debug!("Upserted {} chunks into Chroma '{}'", chunks.len(), name);
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
        let id = self.collection_id(name).await?;

        let mut body = json!({
            "query_embeddings": [query_vector],
            "n_results": k,
            "include": ["metadatas", "documents", "distances"],
        });
        if let Some(filter) = filter {
            body["where"] = filter_to_mongo(filter);
        }

        let response = self
            .client
            .post(self.endpoint(&format!("collections/{id}/query")))
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::Collection(format!("Chroma query failed: {e}")))?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RagError::Collection(format!("Chroma query failed: {text}")));
        }

        let result: Value = response
            .json()
            .await
            .map_err(|e| RagError::Collection(format!("invalid query response: {e}")))?;

        let empty = Vec::new();
        let ids = result
            .pointer("/ids/0")
            .and_then(|v| v.as_array())
            .unwrap_or(&empty);
        let documents = result
            .pointer("/documents/0")
            .and_then(|v| v.as_array())
            .unwrap_or(&empty);
        let metadatas = result
            .pointer("/metadatas/0")
            .and_then(|v| v.as_array())
            .unwrap_or(&empty);
        let distances = result
            .pointer("/distances/0")
            .and_then(|v| v.as_array())
            .unwrap_or(&empty);

        let mut results = Vec::with_capacity(ids.len());
        for i in 0..ids.len() {
            let chunk_id = ids[i].as_str().unwrap_or_default();
            let document = documents.get(i).and_then(|d| d.as_str()).unwrap_or_default();
            let metadata = metadatas
                .get(i)
                .and_then(|m| m.as_object())
                .cloned()
                .unwrap_or_default();
            let distance = distances.get(i).and_then(|d| d.as_f64()).unwrap_or(1.0);

            results.push(QueryResult {
                chunk_id: chunk_id.to_string(),
                // Cosine distance → similarity.
                score: (1.0 - distance) as f32,
                chunk: Self::chunk_from_parts(chunk_id, document, &metadata),
            });
        }

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(results)
    }

    async fn delete_chunks(&self, name: &str, chunk_ids: &[String]) -> Result<usize> {
        if chunk_ids.is_empty() {
            return Ok(0);
        }
        let id = self.collection_id(name).await?;

        let response = self
            .client
            .post(self.endpoint(&format!("collections/{id}/delete")))
            .json(&json!({ "ids": chunk_ids }))
            .send()
            .await
            .map_err(|e| RagError::Collection(format!("Chroma delete failed: {e}")))?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RagError::Collection(format!("Chroma delete failed: {text}")));
        }

        Ok(chunk_ids.len())
    }

    async fn ping(&self) -> Result<()> {
        let response = self
            .client
            .get(self.endpoint("heartbeat"))
            .send()
            .await
            .map_err(|e| RagError::Collection(format!("Chroma unreachable: {e}")))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(RagError::Collection(format!(
                "Chroma heartbeat failed with status {}",
                response.status()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_metadata_flattening() {
        let chunk = DocumentChunk::new("doc-9", "table row")
            .with_metadata(ChunkMetadata {
                source: Some(SourceKind::Xlsx),
                page_number: Some(1),
                table_index: Some(0),
                ..Default::default()
            })
            .with_embedding(vec![0.0; 3]);

        let metadata = ChromaStore::chunk_metadata(&chunk);
        assert_eq!(metadata["document_id"], "doc-9");
        assert_eq!(metadata["source"], "xlsx");
        assert_eq!(metadata["table_index"], 0);
        assert!(metadata.get("url").is_none());
    }

    #[test]
    fn test_chunk_from_parts() {
        let mut metadata = Map::new();
        metadata.insert("document_id".into(), json!("doc-1"));
        metadata.insert("source".into(), json!("pdf"));
        metadata.insert("page_number".into(), json!(4));

        let chunk = ChromaStore::chunk_from_parts("c-1", "body text", &metadata);
        assert_eq!(chunk.chunk_id, "c-1");
        assert_eq!(chunk.text, "body text");
        assert_eq!(chunk.metadata.source, Some(SourceKind::Pdf));
        assert_eq!(chunk.metadata.page_number, Some(4));
    }
}
