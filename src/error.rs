//! Error handling for the RAG backend

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Result type alias for the RAG backend
pub type Result<T> = std::result::Result<T, RagError>;

/// Main error type for the RAG backend
#[derive(Error, Debug)]
pub enum RagError {
    #[error("Unsupported file type: {extension}. Supported types: {}", supported.join(", "))]
    UnsupportedFileType {
        extension: String,
        supported: Vec<String>,
    },

    #[error("Document processing failed for {document_id} at {stage}: {message}")]
    DocumentProcessing {
        document_id: String,
        stage: String,
        message: String,
    },

    #[error("Embedding dimension mismatch: expected {expected}, got {got}")]
    EmbeddingDimensionMismatch { expected: usize, got: usize },

    #[error("Collection error: {0}")]
    Collection(String),

    #[error("Document error: {message}")]
    Document {
        message: String,
        /// Chunk ids the back-end rejected in a batch write
        failed_chunk_ids: Vec<String>,
    },

    #[error("LLM provider error: {provider} failed at {stage}: {message}")]
    LlmProvider {
        provider: String,
        stage: String,
        message: String,
    },

    #[error("Config value for '{key}' does not match declared type '{expected}'")]
    ConfigType { key: String, expected: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing prompt variable: {0}")]
    MissingPromptVariable(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Timeout during {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

/// Structured error body returned to API callers
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    pub status_code: u16,
    pub details: Value,
}

impl RagError {
    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RagError::Timeout(_) | RagError::Http(_) | RagError::LlmProvider { .. }
        )
    }

    /// Get error category for logging/metrics
    pub fn category(&self) -> &'static str {
        match self {
            RagError::UnsupportedFileType { .. } => "unsupported_file_type",
            RagError::DocumentProcessing { .. } => "document_processing",
            RagError::EmbeddingDimensionMismatch { .. } => "embedding_dimension_mismatch",
            RagError::Collection(_) => "collection",
            RagError::Document { .. } => "document",
            RagError::LlmProvider { .. } => "llm_provider",
            RagError::ConfigType { .. } => "config_type",
            RagError::Config(_) => "config",
            RagError::MissingPromptVariable(_) => "missing_prompt_variable",
            RagError::InvalidQuery(_) => "invalid_query",
            RagError::NotFound(_) => "not_found",
            RagError::AlreadyExists(_) => "already_exists",
            RagError::Validation(_) => "validation",
            RagError::Timeout(_) => "timeout",
            RagError::Io(_) => "io",
            RagError::Serialization(_) => "serialization",
            RagError::Http(_) => "http",
            RagError::Database(_) => "database",
            RagError::Generic(_) => "generic",
        }
    }

    /// HTTP status code the router maps this error to
    pub fn status_code(&self) -> u16 {
        match self {
            RagError::UnsupportedFileType { .. }
            | RagError::InvalidQuery(_)
            | RagError::Validation(_)
            | RagError::MissingPromptVariable(_)
            | RagError::Config(_)
            | RagError::ConfigType { .. } => 400,
            RagError::NotFound(_) => 404,
            RagError::AlreadyExists(_) => 409,
            RagError::Timeout(_) | RagError::LlmProvider { .. } => 503,
            _ => 500,
        }
    }

    /// Build the structured wire body for this error
    pub fn to_body(&self) -> ErrorBody {
        let details = match self {
            RagError::UnsupportedFileType {
                extension,
                supported,
            } => serde_json::json!({
                "file_type": extension,
                "supported_types": supported,
            }),
            RagError::DocumentProcessing {
                document_id, stage, ..
            } => serde_json::json!({
                "document_id": document_id,
                "stage": stage,
            }),
            RagError::EmbeddingDimensionMismatch { expected, got } => serde_json::json!({
                "expected": expected,
                "got": got,
            }),
            RagError::Document {
                failed_chunk_ids, ..
            } => serde_json::json!({
                "failed_chunk_ids": failed_chunk_ids,
            }),
            RagError::LlmProvider {
                provider, stage, ..
            } => serde_json::json!({
                "provider": provider,
                "stage": stage,
            }),
            RagError::ConfigType { key, expected } => serde_json::json!({
                "key": key,
                "expected_type": expected,
            }),
            _ => Value::Object(serde_json::Map::new()),
        };

        ErrorBody {
            error: self.category().to_string(),
            message: self.to_string(),
            status_code: self.status_code(),
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let timeout_error = RagError::Timeout("embedding".to_string());
        assert!(timeout_error.is_retryable());

        let config_error = RagError::Config("invalid config".to_string());
        assert!(!config_error.is_retryable());
    }

    #[test]
    fn test_error_category() {
        let mismatch = RagError::EmbeddingDimensionMismatch {
            expected: 384,
            got: 768,
        };
        assert_eq!(mismatch.category(), "embedding_dimension_mismatch");

        let missing = RagError::NotFound("collection x".to_string());
        assert_eq!(missing.category(), "not_found");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            RagError::InvalidQuery("empty".to_string()).status_code(),
            400
        );
        assert_eq!(RagError::NotFound("c".to_string()).status_code(), 404);
        assert_eq!(RagError::AlreadyExists("c".to_string()).status_code(), 409);
        assert_eq!(
            RagError::LlmProvider {
                provider: "watsonx".to_string(),
                stage: "generate".to_string(),
                message: "boom".to_string(),
            }
            .status_code(),
            503
        );
    }

    #[test]
    fn test_error_body_details() {
        let err = RagError::UnsupportedFileType {
            extension: "csv".to_string(),
            supported: vec!["pdf".to_string(), "txt".to_string()],
        };
        let body = err.to_body();
        assert_eq!(body.status_code, 400);
        assert_eq!(body.details["file_type"], "csv");
    }
}
