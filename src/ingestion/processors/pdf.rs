//! PDF processor
//!
//! Per-page text extraction via lopdf with a whole-document pdf-extract
//! fallback, table inference from line geometry, and image extraction
//! from page XObjects with content-hash deduplication. Pages are
//! processed in parallel up to the machine's parallelism and reassembled
//! in page order; a failing page is skipped with a warning and only an
//! all-pages failure is fatal.

use super::{clean_text, processing_error, DocumentProcessor, ProcessorContext};
use crate::types::{ChunkMetadata, Document, DocumentChunk, DocumentMetadata, SourceKind};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::stream::{self, StreamExt};
use lopdf::{Dictionary, Object, ObjectId};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Minimum share of non-empty cells for an inferred table to be kept
const TABLE_FILL_RATIO: f32 = 0.25;

pub struct PdfProcessor;

impl PdfProcessor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PdfProcessor {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything extracted from one page before chunking
struct PageExtract {
    page_number: u32,
    text: String,
    tables: Vec<Vec<Vec<String>>>,
    images: Vec<PathBuf>,
}

#[async_trait]
impl DocumentProcessor for PdfProcessor {
    fn kind(&self) -> SourceKind {
        SourceKind::Pdf
    }

    async fn process(
        &self,
        ctx: &ProcessorContext,
        file_path: &Path,
        document_id: &str,
    ) -> crate::error::Result<Document> {
        let path = file_path.to_path_buf();
        let doc_id = document_id.to_string();
        let pdf = tokio::task::spawn_blocking(move || {
            lopdf::Document::load(&path).map_err(|e| processing_error(&doc_id, "read", e))
        })
        .await
        .map_err(|e| processing_error(document_id, "read", e))??;
        let pdf = Arc::new(pdf);

        let name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| document_id.to_string());

        let pages: Vec<(u32, ObjectId)> = pdf.get_pages().into_iter().collect();
        let page_count = pages.len();

        let mut document = Document::new(&name, file_path.to_string_lossy(), SourceKind::Pdf);
        document.id = document_id.to_string();
        document.metadata = extract_metadata(&pdf);
        document.metadata.total_pages = Some(page_count as u32);

        let image_dir = image_directory(file_path);
        let seen_hashes: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

        let parallelism = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(1)
            .min(page_count.max(1));

        // Extract pages concurrently; `buffered` keeps page order.
        let extracts: Vec<Option<PageExtract>> = stream::iter(pages)
            .map(|(page_number, page_id)| {
                let pdf = Arc::clone(&pdf);
                let image_dir = image_dir.clone();
                let seen_hashes = Arc::clone(&seen_hashes);
                async move {
                    tokio::task::spawn_blocking(move || {
                        extract_page(&pdf, page_number, page_id, &image_dir, &seen_hashes)
                    })
                    .await
                    .unwrap_or_else(|e| {
                        warn!("Page {} task failed: {}", page_number, e);
                        None
                    })
                }
            })
            .buffered(parallelism)
            .collect()
            .await;

        let mut extracts: Vec<PageExtract> = extracts.into_iter().flatten().collect();

        if extracts.is_empty() && page_count > 0 {
            // Per-page extraction got nothing; try the whole-document reader
            // before giving up.
            let path = file_path.to_path_buf();
            let fallback = tokio::task::spawn_blocking(move || pdf_extract::extract_text(&path))
                .await
                .ok()
                .and_then(|r| r.ok())
                .filter(|text| !text.trim().is_empty());

            match fallback {
                Some(text) => {
                    debug!("Using pdf-extract fallback for '{}'", name);
                    extracts.push(PageExtract {
                        page_number: 1,
                        text,
                        tables: Vec::new(),
                        images: Vec::new(),
                    });
                }
                None => {
                    return Err(processing_error(
                        document_id,
                        "extract",
                        format!("all {page_count} pages failed to process"),
                    ));
                }
            }
        }

        let mut chunk_number = 0u32;
        for extract in &extracts {
            let base_metadata = ChunkMetadata {
                source: Some(SourceKind::Pdf),
                source_id: Some(name.clone()),
                page_number: Some(extract.page_number),
                author: document.metadata.author.clone(),
                ..Default::default()
            };

            match ctx.chunk(&extract.text).await {
                Ok(chunks) => {
                    for chunk_text in chunks {
                        if chunk_text.trim().is_empty() {
                            continue;
                        }
                        document.chunks.push(
                            DocumentChunk::new(document_id, chunk_text).with_metadata(
                                ChunkMetadata {
                                    chunk_number: Some(chunk_number),
                                    ..base_metadata.clone()
                                },
                            ),
                        );
                        chunk_number += 1;
                    }
                }
                Err(e) => warn!(
                    "Chunking failed on page {}: {}; skipping page text",
                    extract.page_number, e
                ),
            }

            for (table_index, table) in extract.tables.iter().enumerate() {
                for chunk_text in ctx.chunker.chunk_table(table) {
                    document.chunks.push(
                        DocumentChunk::new(document_id, chunk_text).with_metadata(ChunkMetadata {
                            chunk_number: Some(chunk_number),
                            table_index: Some(table_index as u32),
                            ..base_metadata.clone()
                        }),
                    );
                    chunk_number += 1;
                }
            }

            for (image_index, image_path) in extract.images.iter().enumerate() {
                document.chunks.push(
                    DocumentChunk::new(
                        document_id,
                        format!("Image: {}", image_path.display()),
                    )
                    .with_metadata(ChunkMetadata {
                        chunk_number: Some(chunk_number),
                        image_index: Some(image_index as u32),
                        ..base_metadata.clone()
                    }),
                );
                chunk_number += 1;
            }
        }

        document.metadata.total_chunks = Some(document.chunks.len() as u32);
        debug!(
            "PDF '{}': {} pages, {} chunks",
            name,
            page_count,
            document.chunks.len()
        );
        Ok(document)
    }
}

fn image_directory(file_path: &Path) -> PathBuf {
    let stem = file_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());
    file_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!("{stem}_images"))
}

fn extract_page(
    pdf: &lopdf::Document,
    page_number: u32,
    page_id: ObjectId,
    image_dir: &Path,
    seen_hashes: &Mutex<HashSet<String>>,
) -> Option<PageExtract> {
    let text = match pdf.extract_text(&[page_number]) {
        Ok(text) => text,
        Err(e) => {
            warn!("Text extraction failed on page {}: {}", page_number, e);
            return None;
        }
    };

    let tables = infer_tables(&text);
    let images = extract_images(pdf, page_number, page_id, image_dir, seen_hashes);

    Some(PageExtract {
        page_number,
        text,
        tables,
        images,
    })
}

/// Whole-document metadata from the trailer Info dictionary
fn extract_metadata(pdf: &lopdf::Document) -> DocumentMetadata {
    let mut metadata = DocumentMetadata::default();

    let info = pdf
        .trailer
        .get(b"Info")
        .ok()
        .and_then(|obj| resolve_dict(pdf, obj));

    if let Some(info) = info {
        metadata.title = info_string(pdf, &info, b"Title");
        metadata.author = info_string(pdf, &info, b"Author");
        metadata.created_at = info_string(pdf, &info, b"CreationDate").and_then(parse_pdf_date);
        metadata.modified_at = info_string(pdf, &info, b"ModDate").and_then(parse_pdf_date);
    }

    metadata
}

fn resolve_dict(pdf: &lopdf::Document, obj: &Object) -> Option<Dictionary> {
    match obj {
        Object::Dictionary(dict) => Some(dict.clone()),
        Object::Reference(id) => pdf.get_dictionary(*id).ok().cloned(),
        _ => None,
    }
}

fn info_string(pdf: &lopdf::Document, dict: &Dictionary, key: &[u8]) -> Option<String> {
    let obj = dict.get(key).ok()?;
    let obj = match obj {
        Object::Reference(id) => pdf.get_object(*id).ok()?,
        other => other,
    };
    match obj {
        Object::String(bytes, _) => Some(decode_pdf_string(bytes)),
        _ => None,
    }
    .filter(|s| !s.trim().is_empty())
}

/// PDF text strings are either UTF-16BE with a BOM or PDFDocEncoding
fn decode_pdf_string(bytes: &[u8]) -> String {
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(bytes).to_string()
    }
}

/// Parse `D:YYYYMMDDHHmmSS...` dates
fn parse_pdf_date(raw: String) -> Option<DateTime<Utc>> {
    let digits: String = raw
        .trim_start_matches("D:")
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.len() < 8 {
        return None;
    }
    let padded = format!("{digits:0<14}");
    NaiveDateTime::parse_from_str(&padded, "%Y%m%d%H%M%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Infer tables from line geometry
///
/// Lines split at tabs or runs of two-plus spaces become candidate rows;
/// a contiguous run qualifies as a table when it has at least two rows,
/// at least two columns, a consistent column count and at least 25%
/// non-empty cells.
fn infer_tables(text: &str) -> Vec<Vec<Vec<String>>> {
    let mut tables = Vec::new();
    let mut current: Vec<Vec<String>> = Vec::new();

    for line in text.lines() {
        let cells = split_row(line);
        if cells.len() >= 2 {
            current.push(cells);
        } else {
            flush_table(&mut current, &mut tables);
        }
    }
    flush_table(&mut current, &mut tables);

    tables
}

fn split_row(line: &str) -> Vec<String> {
    line.split(|c: char| c == '\t')
        .flat_map(|part| part.split("  "))
        .map(|cell| clean_text(cell))
        .filter(|cell| !cell.is_empty())
        .collect()
}

fn flush_table(current: &mut Vec<Vec<String>>, tables: &mut Vec<Vec<Vec<String>>>) {
    if current.len() < 2 {
        current.clear();
        return;
    }

    let columns = current[0].len();
    let consistent = current.iter().all(|row| row.len() == columns);
    if !consistent || columns < 2 {
        current.clear();
        return;
    }

    let total_cells = current.len() * columns;
    let filled = current
        .iter()
        .flat_map(|row| row.iter())
        .filter(|cell| !cell.is_empty())
        .count();
    if (filled as f32) / (total_cells as f32) >= TABLE_FILL_RATIO {
        tables.push(std::mem::take(current));
    } else {
        current.clear();
    }
}

/// Extract page XObject images, dedup by content hash, write to disk
fn extract_images(
    pdf: &lopdf::Document,
    page_number: u32,
    page_id: ObjectId,
    image_dir: &Path,
    seen_hashes: &Mutex<HashSet<String>>,
) -> Vec<PathBuf> {
    let mut saved = Vec::new();

    let page_dict = match pdf.get_dictionary(page_id) {
        Ok(dict) => dict,
        Err(_) => return saved,
    };
    let resources = match page_dict.get(b"Resources").ok().and_then(|r| resolve_dict(pdf, r)) {
        Some(dict) => dict,
        None => return saved,
    };
    let xobjects = match resources.get(b"XObject").ok().and_then(|x| resolve_dict(pdf, x)) {
        Some(dict) => dict,
        None => return saved,
    };

    let mut image_index = 0u32;
    for (_name, obj) in xobjects.iter() {
        let stream = match obj {
            Object::Reference(id) => match pdf.get_object(*id) {
                Ok(Object::Stream(stream)) => stream,
                _ => continue,
            },
            Object::Stream(stream) => stream,
            _ => continue,
        };

        let is_image = stream
            .dict
            .get(b"Subtype")
            .ok()
            .and_then(|s| s.as_name().ok())
            .map(|n| n == b"Image")
            .unwrap_or(false);
        if !is_image {
            continue;
        }

        image_index += 1;
        let content = &stream.content;
        let hash = format!("{:x}", Sha256::digest(content));

        {
            let mut seen = match seen_hashes.lock() {
                Ok(seen) => seen,
                Err(_) => continue,
            };
            if !seen.insert(hash) {
                debug!(
                    "Skipping duplicate image on page {}, index {}",
                    page_number, image_index
                );
                continue;
            }
        }

        if let Err(e) = std::fs::create_dir_all(image_dir) {
            warn!("Cannot create image directory {:?}: {}", image_dir, e);
            return saved;
        }

        let extension = stream
            .dict
            .get(b"Filter")
            .ok()
            .and_then(|f| f.as_name().ok())
            .map(|name| match name {
                b"DCTDecode" => "jpg",
                b"JPXDecode" => "jp2",
                _ => "bin",
            })
            .unwrap_or("bin");

        let path = image_dir.join(format!("image_{page_number}_{image_index}.{extension}"));
        match std::fs::write(&path, content) {
            Ok(()) => {
                debug!("Saved image {:?}", path);
                saved.push(path);
            }
            Err(e) => warn!("Failed to write image {:?}: {}", path, e),
        }
    }

    saved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_tables_accepts_consistent_grid() {
        let text = "Header A\tHeader B\nvalue 1\tvalue 2\nvalue 3\tvalue 4\nplain prose line";
        let tables = infer_tables(text);
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].len(), 3);
        assert_eq!(tables[0][0], vec!["Header A", "Header B"]);
    }

    #[test]
    fn test_infer_tables_rejects_inconsistent_columns() {
        let text = "a\tb\nc\td\te\nf\tg";
        assert!(infer_tables(text).is_empty());
    }

    #[test]
    fn test_infer_tables_rejects_single_row() {
        let text = "only\tone\nprose";
        assert!(infer_tables(text).is_empty());
    }

    #[test]
    fn test_split_row_multiple_spaces() {
        let cells = split_row("alpha   beta  gamma");
        assert_eq!(cells, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_parse_pdf_date() {
        let parsed = parse_pdf_date("D:20240115093000Z".to_string()).unwrap();
        assert_eq!(parsed.format("%Y-%m-%d %H:%M").to_string(), "2024-01-15 09:30");

        assert!(parse_pdf_date("D:2024".to_string()).is_none());
        // Date-only strings pad out to midnight.
        assert!(parse_pdf_date("D:20240115".to_string()).is_some());
    }

    #[test]
    fn test_decode_pdf_string_utf16() {
        let bytes = [0xFE, 0xFF, 0x00, b'H', 0x00, b'i'];
        assert_eq!(decode_pdf_string(&bytes), "Hi");
        assert_eq!(decode_pdf_string(b"plain"), "plain");
    }

    #[test]
    fn test_image_directory_name() {
        let dir = image_directory(Path::new("/data/report.pdf"));
        assert_eq!(dir, Path::new("/data/report_images"));
    }
}
