//! Plain-text processor

use super::{processing_error, DocumentProcessor, ProcessorContext};
use crate::types::{ChunkMetadata, Document, DocumentChunk, SourceKind};
use async_trait::async_trait;
use std::path::Path;
use tracing::debug;

pub struct TxtProcessor;

#[async_trait]
impl DocumentProcessor for TxtProcessor {
    fn kind(&self) -> SourceKind {
        SourceKind::Txt
    }

    async fn process(
        &self,
        ctx: &ProcessorContext,
        file_path: &Path,
        document_id: &str,
    ) -> crate::error::Result<Document> {
        let text = tokio::fs::read_to_string(file_path)
            .await
            .map_err(|e| processing_error(document_id, "read", e))?;

        let name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| document_id.to_string());

        let mut document = Document::new(&name, file_path.to_string_lossy(), SourceKind::Txt);
        document.id = document_id.to_string();
        document.metadata.total_pages = Some(1);

        let chunks = ctx.chunk(&text).await?;
        for (i, chunk_text) in chunks.into_iter().enumerate() {
            if chunk_text.trim().is_empty() {
                continue;
            }
            document.chunks.push(
                DocumentChunk::new(document_id, chunk_text).with_metadata(ChunkMetadata {
                    source: Some(SourceKind::Txt),
                    source_id: Some(name.clone()),
                    chunk_number: Some(i as u32),
                    ..Default::default()
                }),
            );
        }

        document.metadata.total_chunks = Some(document.chunks.len() as u32);
        debug!(
            "TXT '{}': {} chunks",
            name,
            document.chunks.len()
        );
        Ok(document)
    }
}
