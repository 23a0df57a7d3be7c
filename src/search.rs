//! Retrieval + generation pipeline
//!
//! One search request walks the stages
//! RECEIVED → RESOLVING_CONFIG → REWRITING → EMBEDDING → RETRIEVING →
//! (RERANKING) → PROMPTING → GENERATING → ASSEMBLING → DONE; a failure
//! at any stage is surfaced with its stage annotation. Zero retrieved
//! chunks short-circuit to an insufficient-context answer instead of a
//! blind LLM call.

use crate::catalog::CollectionCatalog;
use crate::config::Settings;
use crate::conversation::{ConversationStore, MessageType};
use crate::embedding::EmbeddingClient;
use crate::error::{RagError, Result};
use crate::llm::{generate_with_retries, user_message, LlmProvider, Role};
use crate::llm_params::LlmParametersService;
use crate::prompts::{PromptTemplateRepository, TemplateType, CONTEXT_VARIABLE};
use crate::rewriter::RewriterChain;
use crate::runtime_config::{ConfigCategory, RuntimeConfigService};
use crate::store::{MetadataFilter, QueryResult, VectorStore};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

/// The answer returned when retrieval comes back empty
pub const INSUFFICIENT_CONTEXT_ANSWER: &str =
    "I could not find relevant information in this collection to answer the question. \
     Try rephrasing it or adding more documents.";

/// Stages of a search request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStage {
    Received,
    ResolvingConfig,
    Rewriting,
    Embedding,
    Retrieving,
    Reranking,
    Prompting,
    Generating,
    Assembling,
    Done,
}

impl std::fmt::Display for SearchStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Received => "received",
            Self::ResolvingConfig => "resolving_config",
            Self::Rewriting => "rewriting",
            Self::Embedding => "embedding",
            Self::Retrieving => "retrieving",
            Self::Reranking => "reranking",
            Self::Prompting => "prompting",
            Self::Generating => "generating",
            Self::Assembling => "assembling",
            Self::Done => "done",
        };
        write!(f, "{name}")
    }
}

/// A search request
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SearchInput {
    pub question: String,
    pub collection_id: Uuid,
    pub user_id: Uuid,
    #[serde(default)]
    pub session_id: Option<Uuid>,
    /// Request-scoped config overrides; the `filter` key carries a
    /// metadata filter in the shared schema.
    #[serde(default)]
    pub config_metadata: Option<HashMap<String, Value>>,
}

/// Per-document provenance summary
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DocumentSummary {
    pub document_name: String,
    pub total_pages: Option<u32>,
    pub total_chunks: u32,
}

/// The assembled answer with chunk-level provenance
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SearchResult {
    pub answer: String,
    pub query_results: Vec<QueryResult>,
    pub documents: Vec<DocumentSummary>,
    pub rewritten_query: Option<String>,
    pub execution_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cot_output: Option<crate::cot::CotOutput>,
    #[serde(default)]
    pub tokens_used: Option<u32>,
}

/// The retrieval + generation pipeline
#[derive(Clone)]
pub struct SearchService {
    store: Arc<dyn VectorStore>,
    embedder: EmbeddingClient,
    provider: Arc<dyn LlmProvider>,
    runtime_config: RuntimeConfigService,
    prompts: PromptTemplateRepository,
    llm_params: LlmParametersService,
    conversation: ConversationStore,
    catalog: CollectionCatalog,
    settings: Arc<Settings>,
}

impl SearchService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: EmbeddingClient,
        provider: Arc<dyn LlmProvider>,
        runtime_config: RuntimeConfigService,
        prompts: PromptTemplateRepository,
        llm_params: LlmParametersService,
        conversation: ConversationStore,
        catalog: CollectionCatalog,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            store,
            embedder,
            provider,
            runtime_config,
            prompts,
            llm_params,
            conversation,
            catalog,
            settings,
        }
    }

    pub(crate) fn provider(&self) -> Arc<dyn LlmProvider> {
        Arc::clone(&self.provider)
    }

    pub(crate) fn runtime_config(&self) -> &RuntimeConfigService {
        &self.runtime_config
    }

    /// Run one search request through the pipeline
    pub async fn search(&self, input: &SearchInput) -> Result<SearchResult> {
        let started = Instant::now();
        let mut stage = SearchStage::Received;
        let result = self.run_stages(input, &mut stage, started).await;

        match result {
            Ok(result) => Ok(result),
            Err(e) => {
                error!("Search failed at stage {}: {}", stage, e);
                Err(e)
            }
        }
    }

    async fn run_stages(
        &self,
        input: &SearchInput,
        stage: &mut SearchStage,
        started: Instant,
    ) -> Result<SearchResult> {
        if input.question.trim().is_empty() {
            return Err(RagError::InvalidQuery("question cannot be empty".to_string()));
        }

        *stage = SearchStage::ResolvingConfig;
        let collection = self.catalog.get(input.collection_id).await?;

        let mut retrieval = self
            .runtime_config
            .effective(
                ConfigCategory::Retrieval,
                input.user_id,
                Some(input.collection_id),
            )
            .await?;
        let mut reranking = self
            .runtime_config
            .effective(
                ConfigCategory::Reranking,
                input.user_id,
                Some(input.collection_id),
            )
            .await?;
        if let Some(overrides) = &input.config_metadata {
            retrieval.merge_request(overrides);
            reranking.merge_request(overrides);
        }

        let top_k = retrieval.get_usize("top_k").unwrap_or(5).max(1);
        let enable_rewriting = retrieval.get_bool("enable_rewriting").unwrap_or(false);
        let enable_hyde = retrieval.get_bool("enable_hyde").unwrap_or(false);
        let enable_reranking = reranking.get_bool("enable_reranking").unwrap_or(false);
        let rerank_top_k = reranking.get_usize("rerank_top_k").unwrap_or(3).max(1);

        let filter = request_filter(input)?;
        let params = self.llm_params.default_for(input.user_id).await?;

        *stage = SearchStage::Rewriting;
        let rewritten = if enable_rewriting || enable_hyde {
            let chain = RewriterChain::from_flags(
                enable_rewriting,
                enable_hyde,
                Arc::clone(&self.provider),
                100,
            );
            chain.rewrite(&input.question, None).await?
        } else {
            input.question.clone()
        };
        let rewritten_query = (rewritten != input.question).then(|| rewritten.clone());

        *stage = SearchStage::Embedding;
        let query_vector = self.embedder.embed_one(&rewritten).await?;

        *stage = SearchStage::Retrieving;
        let mut results = self
            .store
            .query(&collection.name, &query_vector, top_k, filter.as_ref())
            .await?;
        debug!("Retrieved {} chunks from '{}'", results.len(), collection.name);

        if results.is_empty() {
            info!("No chunks retrieved; returning insufficient-context answer");
            return Ok(SearchResult {
                answer: INSUFFICIENT_CONTEXT_ANSWER.to_string(),
                query_results: Vec::new(),
                documents: Vec::new(),
                rewritten_query,
                execution_time: started.elapsed().as_secs_f64(),
                cot_output: None,
                tokens_used: None,
            });
        }

        if enable_reranking {
            *stage = SearchStage::Reranking;
            results = self
                .rerank(&input.question, results, rerank_top_k)
                .await;
        }

        *stage = SearchStage::Prompting;
        let template = self
            .prompts
            .default_for(input.user_id, TemplateType::RagQuery)
            .await?;

        let context_chunks: Vec<String> = results.iter().map(|r| r.chunk.text.clone()).collect();
        let mut variables = HashMap::new();
        variables.insert(
            CONTEXT_VARIABLE.to_string(),
            template.pack_context(&context_chunks),
        );
        variables.insert("question".to_string(), input.question.clone());

        if let Some(session_id) = input.session_id {
            if template.declares("history") {
                let transcript = self
                    .conversation
                    .windowed_transcript(
                        session_id,
                        self.settings.conversation.context_turns,
                        self.settings.conversation.context_tokens,
                    )
                    .await?;
                variables.insert("history".to_string(), transcript);
            }
        }

        let prompt = template.render(&variables)?;

        *stage = SearchStage::Generating;
        let response = generate_with_retries(
            self.provider.as_ref(),
            &[user_message(prompt)],
            &params,
            self.settings.llm.max_retries,
        )
        .await?;

        *stage = SearchStage::Assembling;
        let execution_time = started.elapsed().as_secs_f64();

        if let Some(session_id) = input.session_id {
            self.record_turn(session_id, input, &response.text, response.tokens_used, execution_time)
                .await;
        }

        let documents = summarize_documents(&results);
        *stage = SearchStage::Done;

        Ok(SearchResult {
            answer: response.text,
            query_results: results,
            documents,
            rewritten_query,
            execution_time,
            cot_output: None,
            tokens_used: response.tokens_used,
        })
    }

    /// LLM-scored rerank: each chunk rated 0-10 against the question
    ///
    /// Scoring failures keep the retrieval order for the affected chunk.
    async fn rerank(
        &self,
        question: &str,
        results: Vec<QueryResult>,
        keep: usize,
    ) -> Vec<QueryResult> {
        let mut scored: Vec<(f32, QueryResult)> = Vec::with_capacity(results.len());

        for result in results {
            let prompt = format!(
                "Rate how relevant the passage is to the question on a scale from 0 to 10. \
                 Respond with only the number.\n\nQuestion: {}\n\nPassage: {}",
                question, result.chunk.text
            );
            let params = crate::llm::GenerationParams {
                max_new_tokens: 8,
                temperature: 0.0,
                ..Default::default()
            };

            let score = match self.provider.generate(&[user_message(prompt)], &params).await {
                Ok(response) => parse_leading_number(&response.text)
                    .unwrap_or_else(|| {
                        warn!("Reranker returned no number; keeping retrieval score");
                        result.score * 10.0
                    }),
                Err(e) => {
                    warn!("Reranker call failed ({}); keeping retrieval score", e);
                    result.score * 10.0
                }
            };
            scored.push((score, result));
        }

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored
            .into_iter()
            .take(keep)
            .map(|(score, mut result)| {
                // Normalize the 0-10 judge score into the shared range.
                result.score = score / 10.0;
                result
            })
            .collect()
    }

    /// Suggest questions a user could ask about a collection
    ///
    /// Samples stored chunks by querying with the collection name and
    /// asks the LLM for a numbered list of candidate questions.
    pub async fn suggest_questions(
        &self,
        collection_id: Uuid,
        user_id: Uuid,
        count: usize,
    ) -> Result<Vec<String>> {
        let collection = self.catalog.get(collection_id).await?;
        let results = self
            .store
            .retrieve(&self.embedder, &collection.name, &collection.name, 5)
            .await?;

        if results.is_empty() {
            return Ok(Vec::new());
        }

        let sample: Vec<String> = results.iter().map(|r| r.chunk.text.clone()).collect();

        // A stored question-generation template wins over the default prompt.
        let prompt = match self
            .prompts
            .default_for(user_id, TemplateType::QuestionGeneration)
            .await
        {
            Ok(template) => {
                let mut variables = HashMap::new();
                variables.insert(
                    CONTEXT_VARIABLE.to_string(),
                    template.pack_context(&sample),
                );
                variables.insert("count".to_string(), count.max(1).to_string());
                template.render(&variables)?
            }
            Err(_) => format!(
                "Based on the following document excerpts, suggest {} questions a reader \
                 might ask. Respond with a numbered list only.\n\n{}",
                count.max(1),
                sample.join("\n\n")
            ),
        };
        let params = crate::llm::GenerationParams {
            max_new_tokens: 256,
            ..Default::default()
        };
        let response = generate_with_retries(
            self.provider.as_ref(),
            &[user_message(prompt)],
            &params,
            self.settings.llm.max_retries,
        )
        .await?;

        let mut questions = crate::cot::parse_numbered_list(&response.text);
        questions.truncate(count.max(1));
        Ok(questions)
    }

    /// Append the question/answer pair to the session log
    async fn record_turn(
        &self,
        session_id: Uuid,
        input: &SearchInput,
        answer: &str,
        tokens_used: Option<u32>,
        execution_time: f64,
    ) {
        let question_tokens = crate::chunking::count_tokens(&input.question) as u32;
        if let Err(e) = self
            .conversation
            .append_message(
                session_id,
                Role::User,
                MessageType::Question,
                &input.question,
                Some(question_tokens),
                None,
                None,
            )
            .await
        {
            warn!("Failed to record question in session {}: {}", session_id, e);
            return;
        }
        let answer_tokens =
            tokens_used.unwrap_or_else(|| crate::chunking::count_tokens(answer) as u32);
        if let Err(e) = self
            .conversation
            .append_message(
                session_id,
                Role::Assistant,
                MessageType::Answer,
                answer,
                Some(answer_tokens),
                Some(execution_time),
                None,
            )
            .await
        {
            warn!("Failed to record answer in session {}: {}", session_id, e);
        }
    }
}

/// Parse the request-level metadata filter, if any
fn request_filter(input: &SearchInput) -> Result<Option<MetadataFilter>> {
    let Some(metadata) = &input.config_metadata else {
        return Ok(None);
    };
    let Some(raw) = metadata.get("filter") else {
        return Ok(None);
    };
    let filter: MetadataFilter = serde_json::from_value(raw.clone())
        .map_err(|e| RagError::Validation(format!("invalid filter: {e}")))?;
    Ok(Some(filter))
}

/// Group scored chunks into per-document summaries
pub(crate) fn summarize_documents(results: &[QueryResult]) -> Vec<DocumentSummary> {
    let mut by_document: HashMap<String, DocumentSummary> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for result in results {
        let key = result.chunk.document_id.clone();
        let name = result
            .chunk
            .metadata
            .source_id
            .clone()
            .unwrap_or_else(|| key.clone());
        let entry = by_document.entry(key.clone()).or_insert_with(|| {
            order.push(key.clone());
            DocumentSummary {
                document_name: name,
                total_pages: None,
                total_chunks: 0,
            }
        });
        entry.total_chunks += 1;
        if let Some(page) = result.chunk.metadata.page_number {
            entry.total_pages = Some(entry.total_pages.unwrap_or(0).max(page));
        }
    }

    order
        .into_iter()
        .filter_map(|key| by_document.remove(&key))
        .collect()
}

fn number_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+(?:\.\d+)?").expect("number regex"))
}

fn parse_leading_number(text: &str) -> Option<f32> {
    number_regex()
        .find(text)?
        .as_str()
        .parse::<f32>()
        .ok()
        .map(|n| n.clamp(0.0, 10.0))
}
