//! Word (DOCX) processor
//!
//! A .docx file is a zip archive; paragraph text lives in
//! `word/document.xml` as `<w:t>` runs and document metadata in
//! `docProps/core.xml`. The whole file is one logical section.

use super::{processing_error, DocumentProcessor, ProcessorContext};
use crate::types::{ChunkMetadata, Document, DocumentChunk, SourceKind};
use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::io::Read;
use std::path::Path;
use tracing::debug;

pub struct DocxProcessor;

struct DocxContents {
    text: String,
    title: Option<String>,
    author: Option<String>,
}

impl DocxProcessor {
    fn read_archive(path: &Path, document_id: &str) -> crate::error::Result<DocxContents> {
        let file = std::fs::File::open(path)
            .map_err(|e| processing_error(document_id, "read", e))?;
        let mut archive = zip::ZipArchive::new(file)
            .map_err(|e| processing_error(document_id, "read", e))?;

        let mut body_xml = String::new();
        archive
            .by_name("word/document.xml")
            .map_err(|e| processing_error(document_id, "read", e))?
            .read_to_string(&mut body_xml)
            .map_err(|e| processing_error(document_id, "read", e))?;

        let text = Self::extract_paragraphs(&body_xml, document_id)?;

        let (title, author) = match archive.by_name("docProps/core.xml") {
            Ok(mut core) => {
                let mut core_xml = String::new();
                core.read_to_string(&mut core_xml)
                    .map_err(|e| processing_error(document_id, "metadata", e))?;
                Self::extract_core_properties(&core_xml)
            }
            Err(_) => (None, None),
        };

        Ok(DocxContents {
            text,
            title,
            author,
        })
    }

    /// Collect `<w:t>` runs, breaking lines at paragraph ends
    fn extract_paragraphs(xml: &str, document_id: &str) -> crate::error::Result<String> {
        let mut reader = Reader::from_reader(xml.as_bytes());
        let mut text = String::new();
        let mut in_text_run = false;
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) if e.name().as_ref() == b"w:t" => in_text_run = true,
                Ok(Event::End(e)) => match e.name().as_ref() {
                    b"w:t" => in_text_run = false,
                    b"w:p" => text.push('\n'),
                    _ => {}
                },
                Ok(Event::Text(t)) if in_text_run => {
                    let run = t
                        .unescape()
                        .map_err(|e| processing_error(document_id, "parse", e))?;
                    text.push_str(&run);
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(processing_error(document_id, "parse", e)),
            }
            buf.clear();
        }

        Ok(text)
    }

    /// Pull dc:title and dc:creator out of core.xml
    fn extract_core_properties(xml: &str) -> (Option<String>, Option<String>) {
        let mut reader = Reader::from_reader(xml.as_bytes());
        let mut buf = Vec::new();
        let mut current: Option<&'static str> = None;
        let mut title = None;
        let mut author = None;

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) => {
                    current = match e.name().as_ref() {
                        b"dc:title" => Some("title"),
                        b"dc:creator" => Some("creator"),
                        _ => None,
                    };
                }
                Ok(Event::Text(t)) => {
                    if let Ok(value) = t.unescape() {
                        let value = value.trim().to_string();
                        if !value.is_empty() {
                            match current {
                                Some("title") => title = Some(value),
                                Some("creator") => author = Some(value),
                                _ => {}
                            }
                        }
                    }
                }
                Ok(Event::End(_)) => current = None,
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(_) => break,
            }
            buf.clear();
        }

        (title, author)
    }
}

#[async_trait]
impl DocumentProcessor for DocxProcessor {
    fn kind(&self) -> SourceKind {
        SourceKind::Docx
    }

    async fn process(
        &self,
        ctx: &ProcessorContext,
        file_path: &Path,
        document_id: &str,
    ) -> crate::error::Result<Document> {
        let path = file_path.to_path_buf();
        let doc_id = document_id.to_string();
        let contents =
            tokio::task::spawn_blocking(move || Self::read_archive(&path, &doc_id))
                .await
                .map_err(|e| processing_error(document_id, "read", e))??;

        let name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| document_id.to_string());

        let mut document = Document::new(&name, file_path.to_string_lossy(), SourceKind::Docx);
        document.id = document_id.to_string();
        document.metadata.title = contents.title;
        document.metadata.author = contents.author.clone();
        document.metadata.total_pages = Some(1);

        let chunks = ctx.chunk(&contents.text).await?;
        for (i, chunk_text) in chunks.into_iter().enumerate() {
            if chunk_text.trim().is_empty() {
                continue;
            }
            document.chunks.push(
                DocumentChunk::new(document_id, chunk_text).with_metadata(ChunkMetadata {
                    source: Some(SourceKind::Docx),
                    source_id: Some(name.clone()),
                    author: contents.author.clone(),
                    chunk_number: Some(i as u32),
                    ..Default::default()
                }),
            );
        }

        document.metadata.total_chunks = Some(document.chunks.len() as u32);
        debug!("DOCX '{}': {} chunks", name, document.chunks.len());
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_paragraphs() {
        let xml = r#"<?xml version="1.0"?>
            <w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
              <w:body>
                <w:p><w:r><w:t>First paragraph.</w:t></w:r></w:p>
                <w:p><w:r><w:t>Second </w:t></w:r><w:r><w:t>paragraph.</w:t></w:r></w:p>
              </w:body>
            </w:document>"#;
        let text = DocxProcessor::extract_paragraphs(xml, "doc-1").unwrap();
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        assert_eq!(lines, vec!["First paragraph.", "Second paragraph."]);
    }

    #[test]
    fn test_extract_core_properties() {
        let xml = r#"<?xml version="1.0"?>
            <cp:coreProperties xmlns:cp="ns" xmlns:dc="ns2">
              <dc:title>Annual Report</dc:title>
              <dc:creator>Ada Lovelace</dc:creator>
            </cp:coreProperties>"#;
        let (title, author) = DocxProcessor::extract_core_properties(xml);
        assert_eq!(title.as_deref(), Some("Annual Report"));
        assert_eq!(author.as_deref(), Some("Ada Lovelace"));
    }

    #[tokio::test]
    async fn test_missing_file_fails() {
        let ctx = ProcessorContext::new(
            crate::chunking::Chunker::new(crate::config::ChunkingConfig::default()),
            None,
        );
        let result = DocxProcessor
            .process(&ctx, Path::new("/nonexistent/file.docx"), "doc-1")
            .await;
        assert!(matches!(
            result,
            Err(crate::error::RagError::DocumentProcessing { .. })
        ));
    }
}
