//! Retrieval-Augmented Generation backend
//!
//! A RAG backend that ingests heterogeneous documents into named
//! collections, embeds and persists chunks into a pluggable vector
//! store, and answers natural-language questions by retrieving
//! semantically similar chunks and composing them with an LLM call.
//! It integrates:
//! - Format-aware ingestion (PDF, DOCX, XLSX, TXT) with adaptive chunking
//! - A uniform vector-store contract over Milvus, Chroma, Weaviate,
//!   Pinecone and Elasticsearch
//! - A rewrite → retrieve → rerank → pack → generate search pipeline
//!   with an optional chain-of-thought reasoner
//! - Hierarchical runtime configuration and per-session conversations
//!
//! # Example
//!
//! ```rust,no_run
//! use ragmill::api::AppState;
//! use ragmill::config::Settings;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::from_env()?;
//!     settings.validate()?;
//!
//!     let state = AppState::new(settings).await?;
//!     ragmill::api::serve(state).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod catalog;
pub mod chunking;
pub mod config;
pub mod conversation;
pub mod cot;
pub mod embedding;
pub mod error;
pub mod ingestion;
pub mod init;
pub mod llm;
pub mod llm_params;
pub mod prompts;
pub mod rewriter;
pub mod runtime_config;
pub mod search;
pub mod store;
pub mod types;

// Re-export main types
pub use catalog::CollectionCatalog;
pub use chunking::{count_tokens, split_sentences, Chunker};
pub use config::{
    ChunkingConfig, ChunkingStrategy, EmbeddingConfig, Settings, VectorStoreConfig,
    VectorStoreKind,
};
pub use conversation::{ConversationMessage, ConversationSession, ConversationStore, MessageType};
pub use cot::{classify, CotOutput, CotReasoner, QuestionCategory, ReasoningStep};
pub use embedding::{cosine_similarity, EmbeddingClient};
pub use error::{RagError, Result};
pub use ingestion::{FileFailure, IngestionPipeline, IngestionReport};
pub use init::SystemInitializer;
pub use llm::{
    assistant_message, system_message, user_message, GenerationParams, GenerationResponse,
    LlmProvider, Message, Role,
};
pub use llm_params::{LlmParameters, LlmParametersService};
pub use prompts::{
    ContextStrategy, PromptTemplate, PromptTemplateRepository, TemplateType, TruncationMode,
};
pub use rewriter::{HydeRewriter, QueryRewriter, RewriterChain, SimpleExpander};
pub use runtime_config::{
    ConfigCategory, ConfigScope, ConfigSource, ConfigValueType, EffectiveConfig,
    RuntimeConfigInput, RuntimeConfigService, TypedValue,
};
pub use search::{DocumentSummary, SearchInput, SearchResult, SearchService, SearchStage};
pub use store::{
    create_vector_store, DistanceMetric, FilterOperator, MetadataFilter, QueryResult, VectorStore,
};
pub use types::{
    ChunkMetadata, CollectionRecord, CollectionStatus, Document, DocumentChunk, DocumentMetadata,
    SourceKind,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
