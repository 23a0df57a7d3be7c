//! Test helpers and utilities for the ragmill test suite

#![allow(dead_code)]

use async_trait::async_trait;
use ragmill::embedding::cosine_similarity;
use ragmill::error::{RagError, Result};
use ragmill::llm::{GenerationParams, GenerationResponse, LlmProvider, Message};
use ragmill::store::{DistanceMetric, MetadataFilter, QueryResult, VectorStore};
use ragmill::types::DocumentChunk;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

// Placeholder so this helper file compiles standalone as a test crate.
#[test]
fn helpers_compile() {}

/// Deterministic stub LLM provider
pub struct StubProvider {
    pub dimension: usize,
    pub answer: String,
    pub fail_generation: bool,
    pub fail_hyde: bool,
}

impl StubProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            answer: "Python was created by Guido van Rossum.".to_string(),
            fail_generation: false,
            fail_hyde: false,
        }
    }
}

/// Deterministic pseudo-embedding: same text, same vector
pub fn stub_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let mut seed: u64 = 1469598103934665603;
    for byte in text.bytes() {
        seed ^= u64::from(byte);
        seed = seed.wrapping_mul(1099511628211);
    }
    (0..dimension)
        .map(|i| {
            let value = seed.rotate_left((i % 61) as u32) & 0xFFFF;
            (value as f32) / 65535.0
        })
        .collect()
}

#[async_trait]
impl LlmProvider for StubProvider {
    fn name(&self) -> &str {
        "stub"
    }

    async fn generate(
        &self,
        messages: &[Message],
        _params: &GenerationParams,
    ) -> Result<GenerationResponse> {
        let prompt = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        if self.fail_hyde && prompt.contains("hypothetical document") {
            return Err(RagError::LlmProvider {
                provider: "stub".to_string(),
                stage: "generate".to_string(),
                message: "hyde stubbed to fail".to_string(),
            });
        }
        if self.fail_generation {
            return Err(RagError::LlmProvider {
                provider: "stub".to_string(),
                stage: "generate".to_string(),
                message: "generation stubbed to fail".to_string(),
            });
        }

        Ok(GenerationResponse {
            text: self.answer.clone(),
            tokens_used: Some(12),
            model: "stub-model".to_string(),
            finish_reason: Some("stop".to_string()),
        })
    }

    async fn embed(&self, texts: &[String], _model: &str) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| stub_embedding(t, self.dimension))
            .collect())
    }
}

/// In-memory vector store honoring the shared contract
#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, HashMap<String, DocumentChunk>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(filter: &MetadataFilter, chunk: &DocumentChunk) -> bool {
        let actual: Option<Value> = match filter.field.as_str() {
            "document_id" => Some(Value::String(chunk.document_id.clone())),
            "source" => chunk
                .metadata
                .source
                .map(|s| Value::String(s.to_string())),
            "page_number" => chunk.metadata.page_number.map(|p| Value::from(p)),
            "chunk_number" => chunk.metadata.chunk_number.map(|c| Value::from(c)),
            _ => None,
        };
        let Some(actual) = actual else { return false };

        use ragmill::store::FilterOperator;
        match filter.operator {
            FilterOperator::Eq => actual == filter.value,
            FilterOperator::Gte => match (actual.as_f64(), filter.value.as_f64()) {
                (Some(a), Some(b)) => a >= b,
                _ => false,
            },
            FilterOperator::Lte => match (actual.as_f64(), filter.value.as_f64()) {
                (Some(a), Some(b)) => a <= b,
                _ => false,
            },
            FilterOperator::In => filter
                .value
                .as_array()
                .map(|arr| arr.contains(&actual))
                .unwrap_or(false),
        }
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn backend(&self) -> &'static str {
        "inmemory"
    }

    async fn create_collection(
        &self,
        name: &str,
        _dimension: usize,
        _metric: DistanceMetric,
        _extra_metadata: Option<Value>,
    ) -> Result<()> {
        self.collections
            .write()
            .await
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        self.collections.write().await.remove(name);
        Ok(())
    }

    async fn add_chunks(&self, name: &str, chunks: &[DocumentChunk]) -> Result<Vec<String>> {
        let mut collections = self.collections.write().await;
        let collection = collections
            .get_mut(name)
            .ok_or_else(|| RagError::Collection(format!("collection '{name}' does not exist")))?;
        let mut written = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            collection.insert(chunk.chunk_id.clone(), chunk.clone());
            written.push(chunk.chunk_id.clone());
        }
        Ok(written)
    }

    async fn query(
        &self,
        name: &str,
        query_vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<QueryResult>> {
        if k == 0 {
            return Err(RagError::Validation("k must be at least 1".to_string()));
        }
        let collections = self.collections.read().await;
        let collection = collections
            .get(name)
            .ok_or_else(|| RagError::Collection(format!("collection '{name}' does not exist")))?;

        let mut results: Vec<QueryResult> = collection
            .values()
            .filter(|chunk| filter.map_or(true, |f| Self::matches(f, chunk)))
            .map(|chunk| QueryResult {
                chunk_id: chunk.chunk_id.clone(),
                score: cosine_similarity(query_vector, &chunk.embedding),
                chunk: chunk.clone(),
            })
            .collect();
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(k);
        Ok(results)
    }

    async fn delete_chunks(&self, name: &str, chunk_ids: &[String]) -> Result<usize> {
        let mut collections = self.collections.write().await;
        let collection = collections
            .get_mut(name)
            .ok_or_else(|| RagError::Collection(format!("collection '{name}' does not exist")))?;
        let mut deleted = 0;
        for id in chunk_ids {
            if collection.remove(id).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
