//! Vector store abstraction
//!
//! One contract over five back-ends. Every adapter translates the shared
//! chunk record, filter schema and score convention ("higher is better")
//! to its engine's native shapes. Adapters are selected by the factory
//! from the static settings.
//!
//! Invariants all adapters uphold:
//! - last write wins for the same (collection, chunk id)
//! - deleting a collection deletes its chunks
//! - querying a missing collection fails with a collection error rather
//!   than returning empty results

pub mod chroma;
pub mod elasticsearch;
pub mod milvus;
pub mod pinecone;
pub mod weaviate;

pub use chroma::ChromaStore;
pub use elasticsearch::ElasticsearchStore;
pub use milvus::MilvusStore;
pub use pinecone::PineconeStore;
pub use weaviate::WeaviateStore;

use crate::config::{VectorStoreConfig, VectorStoreKind};
use crate::embedding::EmbeddingClient;
use crate::error::{RagError, Result};
use crate::types::{ChunkMetadata, DocumentChunk, SourceKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use utoipa::ToSchema;

/// Distance metric for a collection's vector index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    Cosine,
    InnerProduct,
    L2,
}

impl Default for DistanceMetric {
    fn default() -> Self {
        Self::Cosine
    }
}

/// Filter operators shared across back-ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    Eq,
    Gte,
    Lte,
    In,
}

/// A metadata filter in the shared schema, translated per back-end
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MetadataFilter {
    pub field: String,
    pub operator: FilterOperator,
    pub value: Value,
}

/// One scored hit from a vector query
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct QueryResult {
    pub chunk_id: String,
    /// Normalized score: higher is always better
    pub score: f32,
    pub chunk: DocumentChunk,
}

/// Back-end-agnostic vector store contract
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Back-end name, for logging and health reporting
    fn backend(&self) -> &'static str;

    /// Create a collection; idempotent given the same name and dimension
    async fn create_collection(
        &self,
        name: &str,
        dimension: usize,
        metric: DistanceMetric,
        extra_metadata: Option<Value>,
    ) -> Result<()>;

    /// Delete a collection; "not found" counts as success
    async fn delete_collection(&self, name: &str) -> Result<()>;

    /// Upsert chunk records, returning the written chunk ids
    async fn add_chunks(&self, name: &str, chunks: &[DocumentChunk]) -> Result<Vec<String>>;

    /// Query by vector; results ordered by decreasing similarity
    async fn query(
        &self,
        name: &str,
        query_vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<QueryResult>>;

    /// Delete chunks by id, returning the deleted count
    async fn delete_chunks(&self, name: &str, chunk_ids: &[String]) -> Result<usize>;

    /// Convenience: embed a text query, then run `query`
    async fn retrieve(
        &self,
        embedder: &EmbeddingClient,
        name: &str,
        text_query: &str,
        k: usize,
    ) -> Result<Vec<QueryResult>> {
        let vector = embedder.embed_one(text_query).await?;
        self.query(name, &vector, k, None).await
    }

    /// Cheap liveness probe for the health endpoint
    async fn ping(&self) -> Result<()>;
}

/// Build the adapter selected by the settings
pub fn create_vector_store(config: &VectorStoreConfig) -> Result<Arc<dyn VectorStore>> {
    let store: Arc<dyn VectorStore> = match config.kind {
        VectorStoreKind::Milvus => Arc::new(MilvusStore::new(config)?),
        VectorStoreKind::Chroma => Arc::new(ChromaStore::new(config)?),
        VectorStoreKind::Weaviate => Arc::new(WeaviateStore::new(config)?),
        VectorStoreKind::Pinecone => Arc::new(PineconeStore::new(config)?),
        VectorStoreKind::Elasticsearch => Arc::new(ElasticsearchStore::new(config)?),
    };
    Ok(store)
}

/// Reject k = 0 before it reaches a back-end
pub(crate) fn ensure_k(k: usize) -> Result<()> {
    if k == 0 {
        return Err(RagError::Validation("k must be at least 1".to_string()));
    }
    Ok(())
}

/// Flatten a chunk into the shared wire record
pub(crate) fn chunk_to_fields(chunk: &DocumentChunk) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("chunk_id".into(), chunk.chunk_id.clone().into());
    fields.insert("document_id".into(), chunk.document_id.clone().into());
    fields.insert("text".into(), chunk.text.clone().into());
    fields.insert(
        "source_id".into(),
        chunk.metadata.source_id.clone().unwrap_or_default().into(),
    );
    fields.insert(
        "source".into(),
        chunk
            .metadata
            .source
            .map(|s| s.to_string())
            .unwrap_or_else(|| SourceKind::Other.to_string())
            .into(),
    );
    fields.insert(
        "url".into(),
        chunk.metadata.url.clone().unwrap_or_default().into(),
    );
    fields.insert("created_at".into(), chunk.created_at.to_rfc3339().into());
    fields.insert(
        "author".into(),
        chunk.metadata.author.clone().unwrap_or_default().into(),
    );
    if let Some(page) = chunk.metadata.page_number {
        fields.insert("page_number".into(), page.into());
    }
    if let Some(number) = chunk.metadata.chunk_number {
        fields.insert("chunk_number".into(), number.into());
    }
    if let Some(table) = chunk.metadata.table_index {
        fields.insert("table_index".into(), table.into());
    }
    if let Some(image) = chunk.metadata.image_index {
        fields.insert("image_index".into(), image.into());
    }
    fields
}

/// Rebuild a chunk from the shared wire record
pub(crate) fn chunk_from_fields(fields: &Map<String, Value>, embedding: Vec<f32>) -> DocumentChunk {
    let str_field = |key: &str| -> Option<String> {
        fields
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    };
    let u32_field = |key: &str| -> Option<u32> {
        fields.get(key).and_then(|v| v.as_u64()).map(|v| v as u32)
    };

    let source = str_field("source").and_then(|s| match s.as_str() {
        "pdf" => Some(SourceKind::Pdf),
        "docx" => Some(SourceKind::Docx),
        "xlsx" => Some(SourceKind::Xlsx),
        "txt" => Some(SourceKind::Txt),
        "web" => Some(SourceKind::Web),
        _ => Some(SourceKind::Other),
    });

    let created_at = str_field("created_at")
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    DocumentChunk {
        chunk_id: str_field("chunk_id").unwrap_or_default(),
        document_id: str_field("document_id").unwrap_or_default(),
        text: str_field("text").unwrap_or_default(),
        embedding,
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
        created_at,
    }
}

/// Build a one-field metadata filter
pub fn filter_eq(field: impl Into<String>, value: impl Into<Value>) -> MetadataFilter {
    MetadataFilter {
        field: field.into(),
        operator: FilterOperator::Eq,
        value: value.into(),
    }
}

/// Render a filter as a JSON object in the Mongo-ish dialect shared by
/// Chroma and Pinecone.
pub(crate) fn filter_to_mongo(filter: &MetadataFilter) -> Value {
    let op = match filter.operator {
        FilterOperator::Eq => "$eq",
        FilterOperator::Gte => "$gte",
        FilterOperator::Lte => "$lte",
        FilterOperator::In => "$in",
    };
    json!({ filter.field.clone(): { op: filter.value.clone() } })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChunkMetadata;

    fn sample_chunk() -> DocumentChunk {
        DocumentChunk::new("doc-1", "hello world")
            .with_metadata(ChunkMetadata {
                source: Some(SourceKind::Pdf),
                source_id: Some("report.pdf".to_string()),
                page_number: Some(2),
                chunk_number: Some(7),
                author: Some("Ada".to_string()),
                ..Default::default()
            })
            .with_embedding(vec![0.1, 0.2])
    }

    #[test]
    fn test_chunk_field_roundtrip() {
        let chunk = sample_chunk();
        let fields = chunk_to_fields(&chunk);
        assert_eq!(fields["source"], "pdf");
        assert_eq!(fields["page_number"], 2);

        let rebuilt = chunk_from_fields(&fields, chunk.embedding.clone());
        assert_eq!(rebuilt.chunk_id, chunk.chunk_id);
        assert_eq!(rebuilt.text, "hello world");
        assert_eq!(rebuilt.metadata.page_number, Some(2));
        assert_eq!(rebuilt.metadata.chunk_number, Some(7));
        assert_eq!(rebuilt.metadata.source, Some(SourceKind::Pdf));
        assert_eq!(rebuilt.metadata.author.as_deref(), Some("Ada"));
    }

    #[test]
    fn test_optional_fields_omitted() {
        let chunk = DocumentChunk::new("doc-1", "plain").with_embedding(vec![0.0]);
        let fields = chunk_to_fields(&chunk);
        assert!(!fields.contains_key("page_number"));
        assert!(!fields.contains_key("table_index"));
    }

    #[test]
    fn test_filter_to_mongo() {
        let filter = MetadataFilter {
            field: "page_number".to_string(),
            operator: FilterOperator::Gte,
            value: json!(3),
        };
        assert_eq!(filter_to_mongo(&filter), json!({"page_number": {"$gte": 3}}));

        let filter = filter_eq("source", "pdf");
        assert_eq!(filter_to_mongo(&filter), json!({"source": {"$eq": "pdf"}}));
    }

    #[test]
    fn test_ensure_k() {
        assert!(ensure_k(0).is_err());
        assert!(ensure_k(1).is_ok());
    }
}
