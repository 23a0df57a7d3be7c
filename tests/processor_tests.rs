//! Format processors against generated fixture files

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Object, Stream};
use ragmill::chunking::Chunker;
use ragmill::config::ChunkingConfig;
use ragmill::ingestion::processors::{
    DocumentProcessor, DocxProcessor, PdfProcessor, ProcessorContext, TxtProcessor,
};
use ragmill::types::SourceKind;
use std::io::Write;
use std::path::Path;

fn ctx() -> ProcessorContext {
    let mut config = ChunkingConfig::default();
    config.min_chunk_size = 1;
    ProcessorContext::new(Chunker::new(config), None)
}

/// Build a one-page PDF containing the given sentence
fn write_pdf(path: &Path, text: &str) {
    let mut doc = lopdf::Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let content = Content {
        operations: vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), 12.into()]),
            Operation::new("Td", vec![50.into(), 700.into()]),
            Operation::new("Tj", vec![Object::string_literal(text)]),
            Operation::new("ET", vec![]),
        ],
    };
    let content_id = doc.add_object(Stream::new(
        dictionary! {},
        content.encode().unwrap(),
    ));

    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
        "Resources" => resources_id,
        "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
    });

    let pages = dictionary! {
        "Type" => "Pages",
        "Kids" => vec![page_id.into()],
        "Count" => 1,
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages));

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc.save(path).unwrap();
}

/// Build a minimal .docx archive with one paragraph and core metadata
fn write_docx(path: &Path, paragraph: &str, author: &str) {
    let file = std::fs::File::create(path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();

    writer.start_file("word/document.xml", options).unwrap();
    write!(
        writer,
        r#"<?xml version="1.0"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body><w:p><w:r><w:t>{paragraph}</w:t></w:r></w:p></w:body>
</w:document>"#
    )
    .unwrap();

    writer.start_file("docProps/core.xml", options).unwrap();
    write!(
        writer,
        r#"<?xml version="1.0"?>
<cp:coreProperties xmlns:cp="http://schemas.openxmlformats.org/package/2006/metadata/core-properties"
                   xmlns:dc="http://purl.org/dc/elements/1.1/">
  <dc:title>Fixture</dc:title>
  <dc:creator>{author}</dc:creator>
</cp:coreProperties>"#
    )
    .unwrap();

    writer.finish().unwrap();
}

#[tokio::test]
async fn test_pdf_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fixture.pdf");
    write_pdf(&path, "Python was created by Guido van Rossum.");

    let document = PdfProcessor::new()
        .process(&ctx(), &path, "doc-pdf")
        .await
        .unwrap();

    assert_eq!(document.source, SourceKind::Pdf);
    assert_eq!(document.metadata.total_pages, Some(1));
    assert!(!document.chunks.is_empty());

    let all_text: String = document
        .chunks
        .iter()
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    assert!(all_text.contains("Guido van Rossum"));
    assert_eq!(document.chunks[0].metadata.page_number, Some(1));
    assert_eq!(document.chunks[0].metadata.source, Some(SourceKind::Pdf));
}

#[tokio::test]
async fn test_docx_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fixture.docx");
    write_docx(
        &path,
        "Rust guarantees memory safety without garbage collection.",
        "Ada Lovelace",
    );

    let document = DocxProcessor
        .process(&ctx(), &path, "doc-docx")
        .await
        .unwrap();

    assert_eq!(document.source, SourceKind::Docx);
    assert_eq!(document.metadata.title.as_deref(), Some("Fixture"));
    assert_eq!(document.metadata.author.as_deref(), Some("Ada Lovelace"));
    assert!(!document.chunks.is_empty());
    assert!(document.chunks[0].text.contains("memory safety"));
    assert_eq!(
        document.chunks[0].metadata.author.as_deref(),
        Some("Ada Lovelace")
    );
}

#[tokio::test]
async fn test_chunk_numbers_are_sequential() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("long.txt");
    let mut file = std::fs::File::create(&path).unwrap();
    for i in 0..200 {
        writeln!(file, "Line {i} with some padding text to make chunks split.").unwrap();
    }
    drop(file);

    let document = TxtProcessor
        .process(&ctx(), &path, "doc-txt")
        .await
        .unwrap();

    assert!(document.chunks.len() > 1);
    for (i, chunk) in document.chunks.iter().enumerate() {
        assert_eq!(chunk.metadata.chunk_number, Some(i as u32));
    }
}

#[tokio::test]
async fn test_corrupt_pdf_is_a_processing_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.pdf");
    std::fs::write(&path, b"not a pdf at all").unwrap();

    let result = PdfProcessor::new().process(&ctx(), &path, "doc-bad").await;
    assert!(matches!(
        result,
        Err(ragmill::error::RagError::DocumentProcessing { .. })
    ));
}
