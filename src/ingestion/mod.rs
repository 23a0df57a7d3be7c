//! Document ingestion pipeline
//!
//! Dispatches each file to its format processor, embeds the resulting
//! chunks in sub-batches and upserts them to the vector store, under
//! at-least-once semantics: chunk ids are UUIDs fixed at processing
//! time, so a retried batch overwrites instead of duplicating. Files of
//! one collection are processed concurrently; per-file failures land in
//! the report without stopping siblings.

pub mod processors;

use crate::catalog::CollectionCatalog;
use crate::chunking::Chunker;
use crate::config::{ChunkingConfig, ChunkingStrategy, Settings};
use crate::embedding::EmbeddingClient;
use crate::error::{RagError, Result};
use crate::runtime_config::{ConfigCategory, EffectiveConfig, RuntimeConfigService};
use crate::store::{DistanceMetric, VectorStore};
use crate::types::{CollectionStatus, Document};
use futures::stream::{self, StreamExt};
use processors::{processor_for, ProcessorContext, SUPPORTED_EXTENSIONS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

/// Files of one collection processed concurrently
const FILE_CONCURRENCY: usize = 4;

/// One failed file in the report
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FileFailure {
    pub file: String,
    pub stage: String,
    pub cause: String,
}

/// Aggregate outcome of one ingestion run
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct IngestionReport {
    pub files_succeeded: usize,
    pub files_failed: Vec<FileFailure>,
    pub documents_written: usize,
    pub chunks_written: usize,
}

/// The ingestion pipeline
#[derive(Clone)]
pub struct IngestionPipeline {
    store: Arc<dyn VectorStore>,
    embedder: EmbeddingClient,
    runtime_config: RuntimeConfigService,
    catalog: CollectionCatalog,
    settings: Arc<Settings>,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: EmbeddingClient,
        runtime_config: RuntimeConfigService,
        catalog: CollectionCatalog,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            store,
            embedder,
            runtime_config,
            catalog,
            settings,
        }
    }

    /// Ingest a set of files into a collection
    pub async fn ingest(&self, collection_id: Uuid, files: &[PathBuf]) -> Result<IngestionReport> {
        let collection = self.catalog.get(collection_id).await?;
        info!(
            "Ingesting {} files into collection '{}'",
            files.len(),
            collection.name
        );

        let chunking_effective = self
            .runtime_config
            .effective(ConfigCategory::Chunking, collection.user_id, Some(collection_id))
            .await?;
        let chunking = chunking_from_effective(&self.settings.chunking, &chunking_effective);
        let chunker = Chunker::new(chunking);

        self.store
            .create_collection(
                &collection.name,
                collection.dimension,
                DistanceMetric::Cosine,
                None,
            )
            .await?;

        self.catalog
            .set_status(collection_id, CollectionStatus::Processing)
            .await?;

        let ctx = Arc::new(ProcessorContext::new(
            chunker,
            Some(self.embedder.clone()),
        ));

        let collection_name = collection.name.clone();
        let outcomes: Vec<std::result::Result<(usize, usize), FileFailure>> =
            stream::iter(files.iter().cloned())
                .map(|file| {
                    let ctx = Arc::clone(&ctx);
                    let name = collection_name.clone();
                    async move { self.ingest_file(&name, collection_id, &file, &ctx).await }
                })
                .buffer_unordered(FILE_CONCURRENCY.min(files.len().max(1)))
                .collect()
                .await;

        let mut report = IngestionReport::default();
        for outcome in outcomes {
            match outcome {
                Ok((documents, chunks)) => {
                    report.files_succeeded += 1;
                    report.documents_written += documents;
                    report.chunks_written += chunks;
                }
                Err(failure) => {
                    warn!(
                        "File '{}' failed at {}: {}",
                        failure.file, failure.stage, failure.cause
                    );
                    report.files_failed.push(failure);
                }
            }
        }

        // Unsupported files are skipped, not fatal; anything else failing
        // marks the collection as errored.
        let fatal = report
            .files_failed
            .iter()
            .any(|failure| failure.stage != "dispatch");
        let status = if fatal {
            CollectionStatus::Error
        } else {
            CollectionStatus::Completed
        };
        self.catalog.set_status(collection_id, status).await?;

        info!(
            "Ingestion finished for '{}': {} ok, {} failed, {} chunks",
            collection.name,
            report.files_succeeded,
            report.files_failed.len(),
            report.chunks_written
        );
        Ok(report)
    }

    /// Process, embed and upsert one file
    async fn ingest_file(
        &self,
        collection_name: &str,
        collection_id: Uuid,
        file: &Path,
        ctx: &ProcessorContext,
    ) -> std::result::Result<(usize, usize), FileFailure> {
        let file_name = file.to_string_lossy().to_string();
        let fail = |stage: &str, cause: String| FileFailure {
            file: file_name.clone(),
            stage: stage.to_string(),
            cause,
        };

        let extension = file
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let processor = processor_for(extension).ok_or_else(|| {
            let err = RagError::UnsupportedFileType {
                extension: extension.to_string(),
                supported: SUPPORTED_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            };
            fail("dispatch", err.to_string())
        })?;

        let document_id = Uuid::new_v4().to_string();
        let mut document = processor
            .process(ctx, file, &document_id)
            .await
            .map_err(|e| fail("processing", e.to_string()))?;

        if document.chunks.is_empty() {
            warn!("File '{}' produced no chunks", file_name);
            return Ok((0, 0));
        }

        self.embed_document(&mut document)
            .await
            .map_err(|e| fail("embedding", e.to_string()))?;

        let written = self
            .store
            .add_chunks(collection_name, &document.chunks)
            .await
            .map_err(|e| fail("upsert", e.to_string()))?;

        if let Err(e) = self.catalog.add_file(collection_id, &file_name).await {
            error!("Failed to record file '{}' in catalog: {}", file_name, e);
        }

        Ok((1, written.len()))
    }

    /// Fill in embeddings for every chunk, preserving order
    async fn embed_document(&self, document: &mut Document) -> Result<()> {
        let texts: Vec<String> = document.chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;
        for (chunk, vector) in document.chunks.iter_mut().zip(vectors) {
            chunk.embedding = vector;
        }
        Ok(())
    }
}

/// Overlay resolved chunking overrides onto the static defaults
fn chunking_from_effective(base: &ChunkingConfig, effective: &EffectiveConfig) -> ChunkingConfig {
    let mut config = base.clone();
    if let Some(strategy) = effective.get_str("strategy") {
        config.strategy = match strategy {
            "semantic" => ChunkingStrategy::Semantic,
            "token" => ChunkingStrategy::Token,
            _ => ChunkingStrategy::Fixed,
        };
    }
    if let Some(min) = effective.get_usize("min_chunk_size") {
        config.min_chunk_size = min;
    }
    if let Some(max) = effective.get_usize("max_chunk_size") {
        config.max_chunk_size = max;
    }
    if let Some(overlap) = effective.get_usize("overlap") {
        config.overlap = overlap;
    }
    if let Some(percentile) = effective.get_f64("semantic_threshold_percentile") {
        config.semantic_threshold_percentile = percentile;
    }
    if let Some(max_tokens) = effective.get_usize("max_tokens") {
        config.max_tokens = max_tokens;
    }
    if let Some(token_overlap) = effective.get_usize("token_overlap") {
        config.token_overlap = token_overlap;
    }
    config
}
