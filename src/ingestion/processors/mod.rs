//! Format-aware document processors
//!
//! One processor per supported extension. Each opens the file with a
//! format-specific reader, extracts whole-document metadata, delegates
//! text to the chunker and yields a `Document` whose chunks carry
//! page/section metadata in processor-assigned order.

pub mod docx;
pub mod pdf;
pub mod txt;
pub mod xlsx;

pub use docx::DocxProcessor;
pub use pdf::PdfProcessor;
pub use txt::TxtProcessor;
pub use xlsx::XlsxProcessor;

use crate::chunking::Chunker;
use crate::embedding::EmbeddingClient;
use crate::error::{RagError, Result};
use crate::types::{Document, SourceKind};
use async_trait::async_trait;
use std::path::Path;

/// Extensions with a registered processor
pub const SUPPORTED_EXTENSIONS: [&str; 4] = ["pdf", "docx", "xlsx", "txt"];

/// Shared tooling handed to every processor invocation
pub struct ProcessorContext {
    pub chunker: Chunker,
    /// Needed only for the semantic chunking strategy
    pub embedder: Option<EmbeddingClient>,
}

impl ProcessorContext {
    pub fn new(chunker: Chunker, embedder: Option<EmbeddingClient>) -> Self {
        Self { chunker, embedder }
    }

    pub(crate) async fn chunk(&self, text: &str) -> Result<Vec<String>> {
        self.chunker.chunk(text, self.embedder.as_ref()).await
    }
}

/// A format-specific document processor
#[async_trait]
pub trait DocumentProcessor: Send + Sync {
    /// The source kind this processor handles
    fn kind(&self) -> SourceKind;

    /// Parse one file into a document with ordered chunks
    async fn process(
        &self,
        ctx: &ProcessorContext,
        file_path: &Path,
        document_id: &str,
    ) -> Result<Document>;
}

/// Look up the processor for a file extension
pub fn processor_for(extension: &str) -> Option<Box<dyn DocumentProcessor>> {
    match extension.to_lowercase().as_str() {
        "pdf" => Some(Box::new(PdfProcessor::new())),
        "docx" => Some(Box::new(DocxProcessor)),
        "xlsx" => Some(Box::new(XlsxProcessor)),
        "txt" => Some(Box::new(TxtProcessor)),
        _ => None,
    }
}

/// Build the processing error every variant raises on read failure
pub(crate) fn processing_error(
    document_id: &str,
    stage: &str,
    message: impl std::fmt::Display,
) -> RagError {
    RagError::DocumentProcessing {
        document_id: document_id.to_string(),
        stage: stage.to_string(),
        message: message.to_string(),
    }
}

/// Collapse runs of whitespace and trim
pub(crate) fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
