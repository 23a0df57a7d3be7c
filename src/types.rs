//! Domain data model: chunks, documents, collections

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Provenance of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Pdf,
    Docx,
    Xlsx,
    Txt,
    Web,
    Other,
}

impl SourceKind {
    /// Map a file extension to its source kind, if supported for ingestion
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "xlsx" => Some(Self::Xlsx),
            "txt" => Some(Self::Txt),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pdf => write!(f, "pdf"),
            Self::Docx => write!(f, "docx"),
            Self::Xlsx => write!(f, "xlsx"),
            Self::Txt => write!(f, "txt"),
            Self::Web => write!(f, "web"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Metadata attached to a chunk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ChunkMetadata {
    /// Where the chunk came from
    pub source: Option<SourceKind>,

    /// Identifier of the originating file or feed
    pub source_id: Option<String>,

    /// Page the chunk was extracted from (PDF) or worksheet index (XLSX)
    pub page_number: Option<u32>,

    /// Position of the chunk within its document
    pub chunk_number: Option<u32>,

    /// Index of the table the chunk was derived from, if any
    pub table_index: Option<u32>,

    /// Index of the image the chunk stands in for, if any
    pub image_index: Option<u32>,

    /// Source URL, when ingested from the web
    pub url: Option<String>,

    /// Document author, when the format carries one
    pub author: Option<String>,

    /// Character offsets into the source text, when known
    pub start_index: Option<usize>,
    pub end_index: Option<usize>,
}

/// The atomic unit of retrieval: a text window with its embedding
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DocumentChunk {
    /// Stable identifier, unique within a collection
    pub chunk_id: String,

    /// Parent document identifier
    pub document_id: String,

    /// Raw chunk text
    pub text: String,

    /// Dense vector; length equals the collection dimension
    pub embedding: Vec<f32>,

    /// Chunk metadata
    #[serde(default)]
    pub metadata: ChunkMetadata,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl DocumentChunk {
    /// Create a chunk with a fresh id and empty embedding
    pub fn new(document_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            chunk_id: Uuid::new_v4().to_string(),
            document_id: document_id.into(),
            text: text.into(),
            embedding: Vec::new(),
            metadata: ChunkMetadata::default(),
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: ChunkMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }
}

/// Whole-document metadata extracted by a format processor
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub total_pages: Option<u32>,
    pub total_chunks: Option<u32>,
}

/// A logical parent for chunks, produced during ingestion
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Document {
    /// Document identifier
    pub id: String,

    /// Display name (usually the file name)
    pub name: String,

    /// Origin path on disk
    pub path: String,

    /// Source kind
    pub source: SourceKind,

    /// Aggregate metadata
    pub metadata: DocumentMetadata,

    /// Chunks in processor-assigned order; embeddings filled in later
    pub chunks: Vec<DocumentChunk>,
}

impl Document {
    pub fn new(name: impl Into<String>, path: impl Into<String>, source: SourceKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            path: path.into(),
            source,
            metadata: DocumentMetadata::default(),
            chunks: Vec::new(),
        }
    }
}

/// Lifecycle status of a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CollectionStatus {
    Created,
    Processing,
    Completed,
    Error,
}

impl std::fmt::Display for CollectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for CollectionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown collection status: {other}")),
        }
    }
}

/// A named namespace of documents in the vector store
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CollectionRecord {
    pub id: Uuid,
    pub name: String,
    pub user_id: Uuid,
    pub is_private: bool,
    pub embedding_model: String,
    /// Immutable after the first chunk is written
    pub dimension: usize,
    pub status: CollectionStatus,
    pub files: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
