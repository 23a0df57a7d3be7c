//! Static deployment configuration
//!
//! This is the lowest-precedence tier of the runtime configuration
//! hierarchy: values here come from the environment or a config file and
//! are overridden by stored GLOBAL/USER/COLLECTION rows at resolve time.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Main configuration for the RAG backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Relational database (runtime config, templates, conversations, catalog)
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Vector store selection and endpoints
    pub vector_store: VectorStoreConfig,

    /// Embedding client settings
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Chunking defaults
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Retrieval defaults
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// LLM provider credentials and defaults
    #[serde(default)]
    pub llm: LlmSettings,

    /// Chain-of-thought defaults
    #[serde(default)]
    pub cot: CotConfig,

    /// Conversation windowing defaults
    #[serde(default)]
    pub conversation: ConversationConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,

    /// Bind port
    pub port: u16,
}

/// Relational database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL
    pub url: String,
}

/// Supported vector store back-ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorStoreKind {
    Milvus,
    Chroma,
    Weaviate,
    Pinecone,
    Elasticsearch,
}

impl std::fmt::Display for VectorStoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Milvus => write!(f, "milvus"),
            Self::Chroma => write!(f, "chroma"),
            Self::Weaviate => write!(f, "weaviate"),
            Self::Pinecone => write!(f, "pinecone"),
            Self::Elasticsearch => write!(f, "elasticsearch"),
        }
    }
}

/// Vector store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    /// Which back-end to use
    pub kind: VectorStoreKind,

    /// Base URL of the back-end (REST endpoint)
    pub url: String,

    /// API key, for back-ends that require one (Pinecone, hosted engines)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Basic-auth username (Elasticsearch, Milvus)
    #[serde(default)]
    pub username: Option<String>,

    /// Basic-auth password
    #[serde(default)]
    pub password: Option<String>,

    /// Upsert batch size for bulk APIs
    #[serde(default = "default_upsert_batch_size")]
    pub upsert_batch_size: usize,

    /// Per-query timeout in seconds
    #[serde(default = "default_store_timeout")]
    pub timeout: u64,
}

fn default_upsert_batch_size() -> usize {
    100
}

fn default_store_timeout() -> u64 {
    30
}

/// Embedding client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Embedding model identifier
    pub model: String,

    /// Embedding dimension the store is provisioned for
    pub dimension: usize,

    /// Texts per sub-batch
    pub batch_size: usize,

    /// Concurrent sub-batches in flight
    pub concurrency_limit: usize,

    /// Retries per sub-batch
    pub max_retries: u32,

    /// Initial backoff delay in seconds (doubles per retry)
    pub retry_delay: u64,

    /// Per-call timeout in seconds
    pub timeout: u64,
}

/// Chunking strategy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkingStrategy {
    Fixed,
    Semantic,
    Token,
}

/// Chunking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Strategy to use during ingestion
    pub strategy: ChunkingStrategy,

    /// Minimum chunk size in characters
    pub min_chunk_size: usize,

    /// Maximum chunk size in characters
    pub max_chunk_size: usize,

    /// Overlap between consecutive fixed-window chunks, in characters
    pub overlap: usize,

    /// Breakpoint percentile for semantic chunking (0-100)
    pub semantic_threshold_percentile: f64,

    /// Token budget per chunk for token-based chunking
    pub max_tokens: usize,

    /// Token overlap carried into the next token-based chunk
    pub token_overlap: usize,
}

/// Retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Number of chunks to retrieve
    pub top_k: usize,

    /// Enable query rewriting before retrieval
    pub enable_rewriting: bool,

    /// Enable the HyDE rewriter
    pub enable_hyde: bool,

    /// Enable LLM reranking of retrieved chunks
    pub enable_reranking: bool,

    /// Chunks kept after reranking
    pub rerank_top_k: usize,
}

/// Credentials and defaults for one LLM provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderCredentials {
    /// API key (absent disables the provider)
    pub api_key: Option<String>,

    /// Base URL override
    pub base_url: Option<String>,

    /// Project/workspace id, for providers that scope by project
    pub project_id: Option<String>,
}

/// LLM provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    /// Default provider name ("watsonx", "openai", "anthropic")
    pub default_provider: String,

    /// Default generation model id
    pub generation_model: String,

    /// Generation timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout: u64,

    /// Retries per generation call
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,

    /// WatsonX credentials
    #[serde(default)]
    pub watsonx: ProviderCredentials,

    /// OpenAI credentials
    #[serde(default)]
    pub openai: ProviderCredentials,

    /// Anthropic credentials
    #[serde(default)]
    pub anthropic: ProviderCredentials,
}

fn default_llm_timeout() -> u64 {
    60
}

fn default_llm_retries() -> u32 {
    3
}

/// Chain-of-thought configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CotConfig {
    /// Enable the reasoner
    pub enabled: bool,

    /// Maximum sub-questions per decomposition
    pub max_reasoning_depth: usize,

    /// Base token budget for a reasoning pass
    pub base_budget: usize,

    /// Budget multiplier applied to base_budget
    pub token_budget_multiplier: f64,

    /// Persist reasoning traces for later inspection
    pub persist_reasoning: bool,
}

/// Conversation windowing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Turns of history prepended to a prompt
    pub context_turns: usize,

    /// Token ceiling for the prepended history
    pub context_tokens: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:ragmill.db".to_string(),
        }
    }
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            kind: VectorStoreKind::Milvus,
            url: "http://localhost:19530".to_string(),
            api_key: None,
            username: None,
            password: None,
            upsert_batch_size: default_upsert_batch_size(),
            timeout: default_store_timeout(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "ibm/slate-125m-english-rtrvr".to_string(),
            dimension: 768,
            batch_size: 8,
            concurrency_limit: 4,
            max_retries: 3,
            retry_delay: 1,
            timeout: 30,
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: ChunkingStrategy::Fixed,
            min_chunk_size: 100,
            max_chunk_size: 1000,
            overlap: 100,
            semantic_threshold_percentile: 80.0,
            max_tokens: 256,
            token_overlap: 20,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            enable_rewriting: false,
            enable_hyde: false,
            enable_reranking: false,
            rerank_top_k: 3,
        }
    }
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            default_provider: "watsonx".to_string(),
            generation_model: "ibm/granite-13b-chat-v2".to_string(),
            watsonx: ProviderCredentials::default(),
            openai: ProviderCredentials::default(),
            anthropic: ProviderCredentials::default(),
            timeout: default_llm_timeout(),
            max_retries: default_llm_retries(),
        }
    }
}

impl Default for CotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_reasoning_depth: 3,
            base_budget: 4096,
            token_budget_multiplier: 2.0,
            persist_reasoning: false,
        }
    }
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            context_turns: 5,
            context_tokens: 1024,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            vector_store: VectorStoreConfig::default(),
            embedding: EmbeddingConfig::default(),
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            llm: LlmSettings::default(),
            cot: CotConfig::default(),
            conversation: ConversationConfig::default(),
        }
    }
}

impl Settings {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        let settings = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            Some("yaml") | Some("yml") => serde_yml::from_str(&content)?,
            _ => return Err(anyhow::anyhow!("Unsupported config file format")),
        };
        Ok(settings)
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("toml") => toml::to_string(self)?,
            Some("yaml") | Some("yml") => serde_yml::to_string(self)?,
            _ => return Err(anyhow::anyhow!("Unsupported config file format")),
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from environment variables
    ///
    /// Reads `RAGMILL_CONFIG` as an optional file path, then applies the
    /// flat connection/credential variables on top of it.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut settings = match std::env::var("RAGMILL_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };

        if let Ok(url) = std::env::var("DATABASE_URL") {
            settings.database.url = url;
        }
        if let Ok(kind) = std::env::var("VECTOR_STORE") {
            settings.vector_store.kind = serde_json::from_value(serde_json::Value::String(
                kind.to_lowercase(),
            ))
            .map_err(|_| anyhow::anyhow!("Unknown vector store kind: {}", kind))?;
        }
        if let Ok(url) = std::env::var("VECTOR_STORE_URL") {
            settings.vector_store.url = url;
        }
        if let Ok(key) = std::env::var("VECTOR_STORE_API_KEY") {
            settings.vector_store.api_key = Some(key);
        }
        if let Ok(model) = std::env::var("EMBEDDING_MODEL") {
            settings.embedding.model = model;
        }
        if let Ok(dim) = std::env::var("EMBEDDING_DIMENSION") {
            settings.embedding.dimension = dim
                .parse()
                .map_err(|_| anyhow::anyhow!("EMBEDDING_DIMENSION must be an integer"))?;
        }
        if let Ok(strategy) = std::env::var("CHUNKING_STRATEGY") {
            settings.chunking.strategy = serde_json::from_value(serde_json::Value::String(
                strategy.to_lowercase(),
            ))
            .map_err(|_| anyhow::anyhow!("Unknown chunking strategy: {}", strategy))?;
        }
        if let Ok(size) = std::env::var("UPSERT_BATCH_SIZE") {
            settings.vector_store.upsert_batch_size = size
                .parse()
                .map_err(|_| anyhow::anyhow!("UPSERT_BATCH_SIZE must be an integer"))?;
        }
        if let Ok(key) = std::env::var("WATSONX_API_KEY") {
            settings.llm.watsonx.api_key = Some(key);
        }
        if let Ok(project) = std::env::var("WATSONX_PROJECT_ID") {
            settings.llm.watsonx.project_id = Some(project);
        }
        if let Ok(url) = std::env::var("WATSONX_URL") {
            settings.llm.watsonx.base_url = Some(url);
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            settings.llm.openai.api_key = Some(key);
        }
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            settings.llm.anthropic.api_key = Some(key);
        }

        Ok(settings)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.vector_store.url.starts_with("http") {
            return Err(anyhow::anyhow!(
                "Invalid vector store URL: {}",
                self.vector_store.url
            ));
        }

        if self.embedding.model.is_empty() {
            return Err(anyhow::anyhow!("Embedding model name cannot be empty"));
        }

        if self.embedding.dimension == 0 {
            return Err(anyhow::anyhow!(
                "Embedding dimension must be greater than 0"
            ));
        }

        if self.embedding.batch_size == 0 || self.embedding.concurrency_limit == 0 {
            return Err(anyhow::anyhow!(
                "Embedding batch size and concurrency must be greater than 0"
            ));
        }

        if self.chunking.max_chunk_size < self.chunking.min_chunk_size {
            return Err(anyhow::anyhow!(
                "max_chunk_size must be greater than or equal to min_chunk_size"
            ));
        }

        if !(0.0..=100.0).contains(&self.chunking.semantic_threshold_percentile) {
            return Err(anyhow::anyhow!(
                "semantic_threshold_percentile must be between 0 and 100"
            ));
        }

        if self.retrieval.top_k == 0 {
            return Err(anyhow::anyhow!("top_k must be at least 1"));
        }

        if self.vector_store.upsert_batch_size == 0 {
            return Err(anyhow::anyhow!("upsert_batch_size must be at least 1"));
        }

        Ok(())
    }

    /// Flatten one category into the key/value map used as the static
    /// default tier of the runtime configuration resolver.
    pub fn category_defaults(&self, category: &str) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        match category {
            "llm" => {
                map.insert("provider".into(), self.llm.default_provider.clone().into());
                map.insert("model".into(), self.llm.generation_model.clone().into());
                map.insert("timeout".into(), self.llm.timeout.into());
                map.insert("max_retries".into(), self.llm.max_retries.into());
            }
            "chunking" => {
                map.insert(
                    "strategy".into(),
                    serde_json::to_value(self.chunking.strategy).unwrap_or_default(),
                );
                map.insert("min_chunk_size".into(), self.chunking.min_chunk_size.into());
                map.insert("max_chunk_size".into(), self.chunking.max_chunk_size.into());
                map.insert("overlap".into(), self.chunking.overlap.into());
                map.insert(
                    "semantic_threshold_percentile".into(),
                    self.chunking.semantic_threshold_percentile.into(),
                );
                map.insert("max_tokens".into(), self.chunking.max_tokens.into());
                map.insert("token_overlap".into(), self.chunking.token_overlap.into());
            }
            "retrieval" => {
                map.insert("top_k".into(), self.retrieval.top_k.into());
                map.insert(
                    "enable_rewriting".into(),
                    self.retrieval.enable_rewriting.into(),
                );
                map.insert("enable_hyde".into(), self.retrieval.enable_hyde.into());
            }
            "embedding" => {
                map.insert("model".into(), self.embedding.model.clone().into());
                map.insert("dimension".into(), self.embedding.dimension.into());
                map.insert("batch_size".into(), self.embedding.batch_size.into());
                map.insert(
                    "concurrency_limit".into(),
                    self.embedding.concurrency_limit.into(),
                );
                map.insert("max_retries".into(), self.embedding.max_retries.into());
                map.insert("retry_delay".into(), self.embedding.retry_delay.into());
            }
            "cot" => {
                map.insert("cot_enabled".into(), self.cot.enabled.into());
                map.insert(
                    "max_reasoning_depth".into(),
                    self.cot.max_reasoning_depth.into(),
                );
                map.insert("base_budget".into(), self.cot.base_budget.into());
                map.insert(
                    "token_budget_multiplier".into(),
                    self.cot.token_budget_multiplier.into(),
                );
                map.insert(
                    "persist_reasoning".into(),
                    self.cot.persist_reasoning.into(),
                );
            }
            "reranking" => {
                map.insert(
                    "enable_reranking".into(),
                    self.retrieval.enable_reranking.into(),
                );
                map.insert("rerank_top_k".into(), self.retrieval.rerank_top_k.into());
            }
            "system" => {
                map.insert(
                    "conversation_context_turns".into(),
                    self.conversation.context_turns.into(),
                );
                map.insert(
                    "conversation_context_tokens".into(),
                    self.conversation.context_tokens.into(),
                );
                map.insert(
                    "upsert_batch_size".into(),
                    self.vector_store.upsert_batch_size.into(),
                );
            }
            _ => {}
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.vector_store.kind, VectorStoreKind::Milvus);
        assert_eq!(settings.retrieval.top_k, 5);
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = Settings::default();
        assert!(settings.validate().is_ok());

        settings.vector_store.url = "not-a-url".to_string();
        assert!(settings.validate().is_err());

        settings = Settings::default();
        settings.embedding.dimension = 0;
        assert!(settings.validate().is_err());

        settings = Settings::default();
        settings.chunking.min_chunk_size = 500;
        settings.chunking.max_chunk_size = 100;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_category_defaults() {
        let settings = Settings::default();

        let llm = settings.category_defaults("llm");
        assert_eq!(llm.get("provider").and_then(|v| v.as_str()), Some("watsonx"));

        let retrieval = settings.category_defaults("retrieval");
        assert_eq!(retrieval.get("top_k").and_then(|v| v.as_u64()), Some(5));

        assert!(settings.category_defaults("nonexistent").is_empty());
    }

    #[test]
    #[serial_test::serial]
    fn test_env_overrides() {
        std::env::set_var("VECTOR_STORE", "chroma");
        std::env::set_var("EMBEDDING_DIMENSION", "384");
        std::env::set_var("UPSERT_BATCH_SIZE", "50");

        let settings = Settings::from_env().unwrap();
        assert_eq!(settings.vector_store.kind, VectorStoreKind::Chroma);
        assert_eq!(settings.embedding.dimension, 384);
        assert_eq!(settings.vector_store.upsert_batch_size, 50);

        std::env::remove_var("VECTOR_STORE");
        std::env::remove_var("EMBEDDING_DIMENSION");
        std::env::remove_var("UPSERT_BATCH_SIZE");
    }

    #[test]
    #[serial_test::serial]
    fn test_env_rejects_unknown_store() {
        std::env::set_var("VECTOR_STORE", "faiss");
        assert!(Settings::from_env().is_err());
        std::env::remove_var("VECTOR_STORE");
    }

    #[test]
    fn test_roundtrip_toml() {
        let settings = Settings::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        settings.to_file(&path).unwrap();
        let loaded = Settings::from_file(&path).unwrap();
        assert_eq!(loaded.embedding.dimension, settings.embedding.dimension);
        assert_eq!(loaded.vector_store.kind, settings.vector_store.kind);
    }
}
