//! Excel (XLSX) processor
//!
//! Each worksheet becomes one logical section: its rows are rendered as
//! tab-joined lines under a `Sheet: <name>` header, chunked, and tagged
//! with the worksheet's 1-based index as the page number.

use super::{processing_error, DocumentProcessor, ProcessorContext};
use crate::types::{ChunkMetadata, Document, DocumentChunk, SourceKind};
use async_trait::async_trait;
use calamine::{open_workbook, Reader, Xlsx};
use std::path::Path;
use tracing::{debug, warn};

pub struct XlsxProcessor;

#[async_trait]
impl DocumentProcessor for XlsxProcessor {
    fn kind(&self) -> SourceKind {
        SourceKind::Xlsx
    }

    async fn process(
        &self,
        ctx: &ProcessorContext,
        file_path: &Path,
        document_id: &str,
    ) -> crate::error::Result<Document> {
        let path = file_path.to_path_buf();
        let doc_id = document_id.to_string();

        // calamine is synchronous; parse off the async runtime.
        let sheets = tokio::task::spawn_blocking(move || -> crate::error::Result<Vec<(String, String)>> {
            let mut workbook: Xlsx<_> = open_workbook(&path)
                .map_err(|e| processing_error(&doc_id, "read", e))?;

            let names = workbook.sheet_names().to_vec();
            let mut sheets = Vec::with_capacity(names.len());
            for name in names {
                let range = match workbook.worksheet_range(&name) {
                    Ok(range) => range,
                    Err(e) => {
                        warn!("Skipping worksheet '{}': {}", name, e);
                        continue;
                    }
                };
                let mut lines = vec![format!("Sheet: {name}")];
                for row in range.rows() {
                    let cells: Vec<String> =
                        row.iter().map(|cell| cell.to_string()).collect();
                    if cells.iter().any(|c| !c.trim().is_empty()) {
                        lines.push(cells.join("\t"));
                    }
                }
                sheets.push((name, lines.join("\n")));
            }
            Ok(sheets)
        })
        .await
        .map_err(|e| processing_error(document_id, "read", e))??;

        let name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| document_id.to_string());

        let mut document = Document::new(&name, file_path.to_string_lossy(), SourceKind::Xlsx);
        document.id = document_id.to_string();
        document.metadata.total_pages = Some(sheets.len() as u32);

        let mut chunk_number = 0u32;
        for (sheet_index, (sheet_name, text)) in sheets.iter().enumerate() {
            let chunks = match ctx.chunk(text).await {
                Ok(chunks) => chunks,
                Err(e) => {
                    warn!("Chunking failed for worksheet '{}': {}", sheet_name, e);
                    continue;
                }
            };
            for chunk_text in chunks {
                if chunk_text.trim().is_empty() {
                    continue;
                }
                document.chunks.push(
                    DocumentChunk::new(document_id, chunk_text).with_metadata(ChunkMetadata {
                        source: Some(SourceKind::Xlsx),
                        source_id: Some(name.clone()),
                        page_number: Some(sheet_index as u32 + 1),
                        chunk_number: Some(chunk_number),
                        ..Default::default()
                    }),
                );
                chunk_number += 1;
            }
        }

        if document.chunks.is_empty() && !sheets.is_empty() {
            debug!("XLSX '{}' produced no chunks from {} sheets", name, sheets.len());
        }

        document.metadata.total_chunks = Some(document.chunks.len() as u32);
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_fails() {
        let ctx = ProcessorContext::new(
            crate::chunking::Chunker::new(crate::config::ChunkingConfig::default()),
            None,
        );
        let result = XlsxProcessor
            .process(&ctx, Path::new("/nonexistent/sheet.xlsx"), "doc-1")
            .await;
        assert!(matches!(
            result,
            Err(crate::error::RagError::DocumentProcessing { .. })
        ));
    }
}
