//! End-to-end pipeline tests against an in-memory store and a stub LLM

mod test_helpers;

use ragmill::catalog::CollectionCatalog;
use ragmill::config::Settings;
use ragmill::conversation::ConversationStore;
use ragmill::cot::CotReasoner;
use ragmill::embedding::EmbeddingClient;
use ragmill::error::RagError;
use ragmill::ingestion::IngestionPipeline;
use ragmill::llm_params::LlmParametersService;
use ragmill::prompts::PromptTemplateRepository;
use ragmill::runtime_config::{
    ConfigCategory, ConfigScope, ConfigValueType, RuntimeConfigInput, RuntimeConfigService,
    TypedValue,
};
use ragmill::search::{SearchInput, SearchService, INSUFFICIENT_CONTEXT_ANSWER};
use ragmill::store::VectorStore;
use ragmill::types::CollectionStatus;
use serde_json::json;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use test_helpers::{InMemoryVectorStore, StubProvider};
use uuid::Uuid;

const DIMENSION: usize = 64;

struct Fixture {
    pool: SqlitePool,
    store: Arc<dyn VectorStore>,
    catalog: CollectionCatalog,
    runtime_config: RuntimeConfigService,
    ingestion: IngestionPipeline,
    search: SearchService,
    reasoner: CotReasoner,
    conversation: ConversationStore,
}

async fn fixture_with_provider(provider: StubProvider) -> Fixture {
    let mut settings = Settings::default();
    settings.embedding.dimension = DIMENSION;
    settings.embedding.batch_size = 4;
    let settings = Arc::new(settings);

    // One connection keeps every service on the same in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let provider: Arc<dyn ragmill::llm::LlmProvider> = Arc::new(provider);
    let embedder = EmbeddingClient::new(Arc::clone(&provider), settings.embedding.clone());
    let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());

    let catalog = CollectionCatalog::new(pool.clone());
    catalog.initialize().await.unwrap();
    let conversation = ConversationStore::new(pool.clone());
    conversation.initialize().await.unwrap();
    let runtime_config = RuntimeConfigService::new(pool.clone(), Arc::clone(&settings));
    runtime_config.initialize().await.unwrap();
    let prompts = PromptTemplateRepository::new(pool.clone());
    prompts.initialize().await.unwrap();
    let llm_params = LlmParametersService::new(pool.clone());
    llm_params.initialize().await.unwrap();

    let ingestion = IngestionPipeline::new(
        Arc::clone(&store),
        embedder.clone(),
        runtime_config.clone(),
        catalog.clone(),
        Arc::clone(&settings),
    );
    let search = SearchService::new(
        Arc::clone(&store),
        embedder,
        provider,
        runtime_config.clone(),
        prompts,
        llm_params,
        conversation.clone(),
        catalog.clone(),
        Arc::clone(&settings),
    );
    let reasoner = CotReasoner::new(search.clone(), pool.clone());
    reasoner.initialize().await.unwrap();

    Fixture {
        pool,
        store,
        catalog,
        runtime_config,
        ingestion,
        search,
        reasoner,
        conversation,
    }
}

async fn fixture() -> Fixture {
    fixture_with_provider(StubProvider::new(DIMENSION)).await
}

fn write_text_file(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    write!(file, "{content}").unwrap();
    path
}

/// Ingest a text file and answer a question about it
#[tokio::test]
async fn test_ingest_then_search() {
    let fx = fixture().await;
    let user = Uuid::new_v4();
    let collection = fx
        .catalog
        .create("notes", user, false, "stub-model", DIMENSION)
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let file = write_text_file(
        &dir,
        "python.txt",
        "Python was created by Guido van Rossum. It first appeared in 1991. \
         The language emphasizes readability.",
    );

    let report = fx.ingestion.ingest(collection.id, &[file]).await.unwrap();
    assert_eq!(report.files_succeeded, 1);
    assert!(report.files_failed.is_empty());
    assert!(report.chunks_written >= 1);

    let record = fx.catalog.get(collection.id).await.unwrap();
    assert_eq!(record.status, CollectionStatus::Completed);
    assert_eq!(record.files.len(), 1);

    let input = SearchInput {
        question: "Who created Python?".to_string(),
        collection_id: collection.id,
        user_id: user,
        session_id: None,
        config_metadata: None,
    };
    let result = fx.search.search(&input).await.unwrap();

    assert!(result.answer.contains("Guido van Rossum"));
    assert!(!result.query_results.is_empty());
    assert!(!result.documents.is_empty());
    assert_eq!(result.documents[0].document_name, "python.txt");
    assert!(result.execution_time >= 0.0);
}

/// An unsupported extension lands in the report, not in a crash
#[tokio::test]
async fn test_unsupported_extension_is_skipped() {
    let fx = fixture().await;
    let collection = fx
        .catalog
        .create("mixed", Uuid::new_v4(), false, "stub-model", DIMENSION)
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let good = write_text_file(&dir, "ok.txt", "Some ingestable text content here.");
    let bad = write_text_file(&dir, "data.csv", "a,b,c");

    let report = fx.ingestion.ingest(collection.id, &[good, bad]).await.unwrap();
    assert_eq!(report.files_succeeded, 1);
    assert_eq!(report.files_failed.len(), 1);
    assert_eq!(report.files_failed[0].stage, "dispatch");
    assert!(report.files_failed[0].cause.contains("Unsupported file type"));

    // A skipped file does not error the collection.
    let record = fx.catalog.get(collection.id).await.unwrap();
    assert_eq!(record.status, CollectionStatus::Completed);
}

/// Dimension mismatch fails the file and errors the collection
#[tokio::test]
async fn test_dimension_mismatch_errors_collection() {
    // Provider emits 32-dim vectors while the collection expects 64.
    let provider = StubProvider::new(32);
    let fx = fixture_with_provider(provider).await;
    let collection = fx
        .catalog
        .create("mismatched", Uuid::new_v4(), false, "stub-model", DIMENSION)
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let file = write_text_file(&dir, "doc.txt", "Some content that will fail to embed.");

    let report = fx.ingestion.ingest(collection.id, &[file]).await.unwrap();
    assert_eq!(report.files_succeeded, 0);
    assert_eq!(report.files_failed.len(), 1);
    assert_eq!(report.files_failed[0].stage, "embedding");
    assert!(report.files_failed[0]
        .cause
        .contains("dimension mismatch"));
    assert_eq!(report.chunks_written, 0);

    let record = fx.catalog.get(collection.id).await.unwrap();
    assert_eq!(record.status, CollectionStatus::Error);
}

/// Zero retrieved chunks return the insufficient-context answer
#[tokio::test]
async fn test_empty_collection_answer() {
    let fx = fixture().await;
    let user = Uuid::new_v4();
    let collection = fx
        .catalog
        .create("empty", user, false, "stub-model", DIMENSION)
        .await
        .unwrap();
    fx.store
        .create_collection(&collection.name, DIMENSION, Default::default(), None)
        .await
        .unwrap();

    let input = SearchInput {
        question: "Anything in here?".to_string(),
        collection_id: collection.id,
        user_id: user,
        session_id: None,
        config_metadata: None,
    };
    let result = fx.search.search(&input).await.unwrap();
    assert_eq!(result.answer, INSUFFICIENT_CONTEXT_ANSWER);
    assert!(result.query_results.is_empty());
}

/// Querying a collection missing from the store fails loudly
#[tokio::test]
async fn test_missing_collection_fails() {
    let fx = fixture().await;
    let user = Uuid::new_v4();
    // Catalog row exists but the store was never populated.
    let collection = fx
        .catalog
        .create("ghost", user, false, "stub-model", DIMENSION)
        .await
        .unwrap();

    let input = SearchInput {
        question: "hello?".to_string(),
        collection_id: collection.id,
        user_id: user,
        session_id: None,
        config_metadata: None,
    };
    let result = fx.search.search(&input).await;
    assert!(matches!(result, Err(RagError::Collection(_))));
}

/// HyDE stubbed to fail leaves the query unchanged and search still works
#[tokio::test]
async fn test_hyde_failure_falls_back() {
    let mut provider = StubProvider::new(DIMENSION);
    provider.fail_hyde = true;
    let fx = fixture_with_provider(provider).await;

    let user = Uuid::new_v4();
    let collection = fx
        .catalog
        .create("hyde", user, false, "stub-model", DIMENSION)
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let file = write_text_file(&dir, "doc.txt", "Rust is a systems programming language.");
    fx.ingestion.ingest(collection.id, &[file]).await.unwrap();

    // Enable HyDE for this user via a runtime-config override.
    fx.runtime_config
        .create(RuntimeConfigInput {
            scope: ConfigScope::User,
            category: ConfigCategory::Retrieval,
            config_key: "enable_hyde".to_string(),
            config_value: TypedValue::new(json!(true), ConfigValueType::Bool),
            user_id: Some(user),
            collection_id: None,
            is_active: true,
            description: None,
            created_by: None,
        })
        .await
        .unwrap();

    let input = SearchInput {
        question: "What is Rust?".to_string(),
        collection_id: collection.id,
        user_id: user,
        session_id: None,
        config_metadata: None,
    };
    let result = fx.search.search(&input).await.unwrap();
    // The failed rewriter kept the original query, so nothing was rewritten.
    assert!(result.rewritten_query.is_none());
    assert!(!result.answer.is_empty());
}

/// Session-bound searches append question and answer with token counts
#[tokio::test]
async fn test_search_records_conversation() {
    let fx = fixture().await;
    let user = Uuid::new_v4();
    let collection = fx
        .catalog
        .create("convo", user, false, "stub-model", DIMENSION)
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let file = write_text_file(&dir, "doc.txt", "Python was created by Guido van Rossum.");
    fx.ingestion.ingest(collection.id, &[file]).await.unwrap();

    let session = fx
        .conversation
        .create_session(user, collection.id)
        .await
        .unwrap();

    let input = SearchInput {
        question: "Who created Python?".to_string(),
        collection_id: collection.id,
        user_id: user,
        session_id: Some(session),
        config_metadata: None,
    };
    fx.search.search(&input).await.unwrap();

    let messages = fx.conversation.recent_messages(session, 10).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content, "Who created Python?");
    assert!(messages[1].content.contains("Guido van Rossum"));
    assert!(fx.conversation.token_usage(session).await.unwrap() > 0);
}

/// Three concurrent searches all succeed and overlap in time
#[tokio::test]
async fn test_concurrent_searches() {
    let fx = fixture().await;
    let user = Uuid::new_v4();
    let collection = fx
        .catalog
        .create("concurrent", user, false, "stub-model", DIMENSION)
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let file = write_text_file(
        &dir,
        "doc.txt",
        "Python was created by Guido van Rossum. Rust was started at Mozilla. \
         Go came out of Google.",
    );
    fx.ingestion.ingest(collection.id, &[file]).await.unwrap();

    let input = |question: &str| SearchInput {
        question: question.to_string(),
        collection_id: collection.id,
        user_id: user,
        session_id: None,
        config_metadata: None,
    };

    let input_a = input("Who created Python?");
    let input_b = input("Where did Rust start?");
    let input_c = input("Which company made Go?");

    let started = Instant::now();
    let (a, b, c) = tokio::join!(
        fx.search.search(&input_a),
        fx.search.search(&input_b),
        fx.search.search(&input_c),
    );
    let wall = started.elapsed().as_secs_f64();

    let a = a.unwrap();
    let b = b.unwrap();
    let c = c.unwrap();
    assert!(!a.answer.is_empty());
    assert!(!b.answer.is_empty());
    assert!(!c.answer.is_empty());
    // Concurrent execution: total wall-clock under the sum of the parts.
    assert!(wall < a.execution_time + b.execution_time + c.execution_time + 1.0);
}

/// CoT decomposes a comparison question and fuses the step answers
#[tokio::test]
async fn test_chain_of_thought_steps() {
    let mut provider = StubProvider::new(DIMENSION);
    provider.answer = "1. What is supervised learning?\n2. What is unsupervised learning?"
        .to_string();
    let fx = fixture_with_provider(provider).await;

    let user = Uuid::new_v4();
    let collection = fx
        .catalog
        .create("ml", user, false, "stub-model", DIMENSION)
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let file = write_text_file(
        &dir,
        "ml.txt",
        "Supervised learning uses labeled data, for example spam classification. \
         Unsupervised learning finds structure in unlabeled data, for example clustering.",
    );
    fx.ingestion.ingest(collection.id, &[file]).await.unwrap();

    fx.runtime_config
        .create(RuntimeConfigInput {
            scope: ConfigScope::User,
            category: ConfigCategory::Cot,
            config_key: "cot_enabled".to_string(),
            config_value: TypedValue::new(json!(true), ConfigValueType::Bool),
            user_id: Some(user),
            collection_id: None,
            is_active: true,
            description: None,
            created_by: None,
        })
        .await
        .unwrap();

    let input = SearchInput {
        question: "Compare supervised and unsupervised learning and give one example of each."
            .to_string(),
        collection_id: collection.id,
        user_id: user,
        session_id: None,
        config_metadata: None,
    };
    let result = fx.reasoner.reason(&input).await.unwrap();

    let cot = result.cot_output.expect("reasoning trace expected");
    assert!((2..=3).contains(&cot.reasoning_steps.len()));
    assert!(cot.token_usage > 0);
    assert!(cot.total_execution_time >= 0.0);
    assert!(!result.answer.is_empty());
}

/// Request-scoped overrides steer retrieval without stored rows
#[tokio::test]
async fn test_request_config_metadata_overrides_top_k() {
    let fx = fixture().await;
    let user = Uuid::new_v4();
    let collection = fx
        .catalog
        .create("topk", user, false, "stub-model", DIMENSION)
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let text: String = (0..80)
        .map(|i| format!("Fact number {i} about the system. "))
        .collect();
    let file = write_text_file(&dir, "facts.txt", &text);
    fx.ingestion.ingest(collection.id, &[file]).await.unwrap();

    let mut metadata = HashMap::new();
    metadata.insert("top_k".to_string(), json!(1));
    let input = SearchInput {
        question: "What facts are there?".to_string(),
        collection_id: collection.id,
        user_id: user,
        session_id: None,
        config_metadata: Some(metadata),
    };
    let result = fx.search.search(&input).await.unwrap();
    assert_eq!(result.query_results.len(), 1);
}

/// Reasoning traces persist when enabled
#[tokio::test]
async fn test_reasoning_trace_persistence() {
    let mut provider = StubProvider::new(DIMENSION);
    provider.answer = "1. First part?\n2. Second part?".to_string();
    let fx = fixture_with_provider(provider).await;

    let user = Uuid::new_v4();
    let collection = fx
        .catalog
        .create("traces", user, false, "stub-model", DIMENSION)
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let file = write_text_file(&dir, "doc.txt", "Content with two parts to compare.");
    fx.ingestion.ingest(collection.id, &[file]).await.unwrap();

    for (key, value) in [
        ("cot_enabled", json!(true)),
        ("persist_reasoning", json!(true)),
    ] {
        fx.runtime_config
            .create(RuntimeConfigInput {
                scope: ConfigScope::User,
                category: ConfigCategory::Cot,
                config_key: key.to_string(),
                config_value: TypedValue::new(value, ConfigValueType::Bool),
                user_id: Some(user),
                collection_id: None,
                is_active: true,
                description: None,
                created_by: None,
            })
            .await
            .unwrap();
    }

    let input = SearchInput {
        question: "Compare the first part and the second part.".to_string(),
        collection_id: collection.id,
        user_id: user,
        session_id: None,
        config_metadata: None,
    };
    fx.reasoner.reason(&input).await.unwrap();

    let traces = fx.reasoner.traces(user, collection.id).await.unwrap();
    assert_eq!(traces.len(), 1);
    assert!(!traces[0].reasoning_steps.is_empty());

    // Keep the pool alive to the end of the test.
    drop(fx.pool);
}
