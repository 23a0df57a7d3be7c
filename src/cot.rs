//! Chain-of-thought reasoner
//!
//! Classifies a question from surface features, decomposes non-simple
//! questions into sub-questions, runs each through the search pipeline
//! with earlier answers forwarded as context, and fuses the results with
//! an aggregation prompt. A token budget truncates remaining steps; any
//! failure falls back to the plain pipeline on the original question.

use crate::chunking::count_tokens;
use crate::error::{RagError, Result};
use crate::llm::{generate_with_retries, user_message, GenerationParams};
use crate::runtime_config::ConfigCategory;
use crate::search::{SearchInput, SearchResult, SearchService};
use crate::store::QueryResult;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Instant;
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

/// Question category from surface features
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionCategory {
    Simple,
    MultiPart,
    Causal,
    Comparison,
}

/// One reasoning step
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReasoningStep {
    pub sub_question: String,
    pub intermediate_answer: String,
    pub context_used: Vec<String>,
    pub execution_time: f64,
    pub token_usage: u32,
}

/// The full reasoning trace attached to a search result
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CotOutput {
    pub original_question: String,
    pub reasoning_steps: Vec<ReasoningStep>,
    pub token_usage: u32,
    pub total_execution_time: f64,
}

/// The chain-of-thought reasoner, wrapping the search pipeline
#[derive(Clone)]
pub struct CotReasoner {
    search: SearchService,
    pool: SqlitePool,
}

impl CotReasoner {
    pub fn new(search: SearchService, pool: SqlitePool) -> Self {
        Self { search, pool }
    }

    /// Create the trace table used when persistence is enabled
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reasoning_traces (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                collection_id TEXT NOT NULL,
                trace TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Answer a question, reasoning in steps when warranted
    ///
    /// Simple questions and disabled reasoning go straight to the plain
    /// pipeline; so does any reasoning failure.
    pub async fn reason(&self, input: &SearchInput) -> Result<SearchResult> {
        let cot = self
            .search
            .runtime_config()
            .effective(ConfigCategory::Cot, input.user_id, Some(input.collection_id))
            .await?;

        let enabled = cot.get_bool("cot_enabled").unwrap_or(false);
        let category = classify(&input.question);
        if !enabled || category == QuestionCategory::Simple {
            debug!("CoT skipped (enabled={}, category={:?})", enabled, category);
            return self.search.search(input).await;
        }

        let max_depth = cot.get_usize("max_reasoning_depth").unwrap_or(3).max(1);
        let base_budget = cot.get_usize("base_budget").unwrap_or(4096);
        let multiplier = cot.get_f64("token_budget_multiplier").unwrap_or(2.0);
        let persist = cot.get_bool("persist_reasoning").unwrap_or(false);
        let token_budget = ((base_budget as f64) * multiplier) as u32;

        match self
            .reason_inner(input, category, max_depth, token_budget)
            .await
        {
            Ok(result) => {
                if persist {
                    if let Some(output) = &result.cot_output {
                        if let Err(e) = self.persist_trace(input, output).await {
                            warn!("Failed to persist reasoning trace: {}", e);
                        }
                    }
                }
                Ok(result)
            }
            Err(e) => {
                warn!("Reasoning failed ({}); falling back to plain search", e);
                self.search.search(input).await
            }
        }
    }

    async fn reason_inner(
        &self,
        input: &SearchInput,
        category: QuestionCategory,
        max_depth: usize,
        token_budget: u32,
    ) -> Result<SearchResult> {
        let started = Instant::now();
        info!(
            "Reasoning over {:?} question with depth {}",
            category, max_depth
        );

        let sub_questions = self.decompose(&input.question, max_depth).await?;
        if sub_questions.is_empty() {
            return Err(RagError::Generic(anyhow::anyhow!(
                "decomposition produced no sub-questions"
            )));
        }

        let mut steps: Vec<ReasoningStep> = Vec::new();
        let mut token_usage = 0u32;
        let mut all_results: Vec<QueryResult> = Vec::new();
        let mut seen_chunks: HashSet<String> = HashSet::new();

        for sub_question in &sub_questions {
            if token_usage >= token_budget {
                warn!(
                    "Token budget {} exhausted after {} steps; truncating",
                    token_budget,
                    steps.len()
                );
                break;
            }

            let question = if steps.is_empty() {
                sub_question.clone()
            } else {
                let context: Vec<String> = steps
                    .iter()
                    .map(|s| format!("- {}: {}", s.sub_question, s.intermediate_answer))
                    .collect();
                format!(
                    "{}\n\nAnswers from earlier steps:\n{}",
                    sub_question,
                    context.join("\n")
                )
            };

            let step_started = Instant::now();
            let step_input = SearchInput {
                question,
                collection_id: input.collection_id,
                user_id: input.user_id,
                session_id: None,
                config_metadata: input.config_metadata.clone(),
            };
            let step_result = self.search.search(&step_input).await?;

            let step_tokens = step_result
                .tokens_used
                .unwrap_or_else(|| count_tokens(&step_result.answer) as u32);
            token_usage += step_tokens;

            for result in &step_result.query_results {
                if seen_chunks.insert(result.chunk_id.clone()) {
                    all_results.push(result.clone());
                }
            }

            steps.push(ReasoningStep {
                sub_question: sub_question.clone(),
                intermediate_answer: step_result.answer,
                context_used: step_result
                    .query_results
                    .iter()
                    .map(|r| r.chunk_id.clone())
                    .collect(),
                execution_time: step_started.elapsed().as_secs_f64(),
                token_usage: step_tokens,
            });
        }

        let final_answer = self.aggregate(&input.question, &steps).await?;
        token_usage += count_tokens(&final_answer) as u32;

        // Reuse the pipeline's grouping over the union of step results.
        let documents = crate::search::summarize_documents(&all_results);

        let total_execution_time = started.elapsed().as_secs_f64();
        Ok(SearchResult {
            answer: final_answer,
            query_results: all_results,
            documents,
            rewritten_query: None,
            execution_time: total_execution_time,
            cot_output: Some(CotOutput {
                original_question: input.question.clone(),
                reasoning_steps: steps,
                token_usage,
                total_execution_time,
            }),
            tokens_used: Some(token_usage),
        })
    }

    /// Ask the LLM to break the question into numbered sub-questions
    async fn decompose(&self, question: &str, max_depth: usize) -> Result<Vec<String>> {
        let prompt = format!(
            "Break the following question into at most {max_depth} simpler sub-questions \
             that can each be answered independently. Respond with a numbered list only.\n\n\
             Question: {question}"
        );
        let params = GenerationParams {
            max_new_tokens: 256,
            temperature: 0.0,
            ..Default::default()
        };
        let provider = self.search.provider();
        let response =
            generate_with_retries(provider.as_ref(), &[user_message(prompt)], &params, 2).await?;

        let mut sub_questions = parse_numbered_list(&response.text);
        sub_questions.truncate(max_depth);
        debug!("Decomposed into {} sub-questions", sub_questions.len());
        Ok(sub_questions)
    }

    /// Fuse the step answers into one final answer
    async fn aggregate(&self, question: &str, steps: &[ReasoningStep]) -> Result<String> {
        let findings: Vec<String> = steps
            .iter()
            .map(|s| format!("Q: {}\nA: {}", s.sub_question, s.intermediate_answer))
            .collect();
        let prompt = format!(
            "Original question: {}\n\nFindings from sub-questions:\n{}\n\n\
             Using only these findings, write a complete answer to the original question.",
            question,
            findings.join("\n\n")
        );
        let params = GenerationParams::default();
        let provider = self.search.provider();
        let response =
            generate_with_retries(provider.as_ref(), &[user_message(prompt)], &params, 2).await?;
        Ok(response.text)
    }

    async fn persist_trace(&self, input: &SearchInput, output: &CotOutput) -> Result<()> {
        sqlx::query(
            "INSERT INTO reasoning_traces (id, user_id, collection_id, trace, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(input.user_id.to_string())
        .bind(input.collection_id.to_string())
        .bind(serde_json::to_string(output)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stored traces for a user and collection, newest first
    pub async fn traces(&self, user_id: Uuid, collection_id: Uuid) -> Result<Vec<CotOutput>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT trace FROM reasoning_traces WHERE user_id = ?1 AND collection_id = ?2 ORDER BY created_at DESC",
        )
        .bind(user_id.to_string())
        .bind(collection_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(trace,)| serde_json::from_str(&trace).map_err(RagError::Serialization))
            .collect()
    }
}

fn comparison_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(compare|comparison|difference|differences|versus|vs\.?|contrast)\b")
            .expect("comparison regex")
    })
}

fn causal_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(why|cause|causes|because|reason|leads? to|results? in)\b")
            .expect("causal regex")
    })
}

fn interrogative_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(what|who|when|where|which|how|why)\b").expect("interrogative regex")
    })
}

/// Classify a question from surface features
pub fn classify(question: &str) -> QuestionCategory {
    if comparison_regex().is_match(question) {
        return QuestionCategory::Comparison;
    }
    if causal_regex().is_match(question) {
        return QuestionCategory::Causal;
    }

    let question_marks = question.matches('?').count();
    let interrogatives = interrogative_regex().find_iter(question).count();
    let has_conjunction = Regex::new(r"(?i)\b(and|also|additionally)\b")
        .map(|re| re.is_match(question))
        .unwrap_or(false);
    if question_marks >= 2 || (interrogatives >= 2 && has_conjunction) {
        return QuestionCategory::MultiPart;
    }

    QuestionCategory::Simple
}

fn numbered_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*\d+[.)]\s*(.+)$").expect("numbered line regex"))
}

/// Parse `1. ...` / `2) ...` lines out of an LLM list response
pub(crate) fn parse_numbered_list(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            numbered_line_regex()
                .captures(line)
                .map(|c| c[1].trim().to_string())
        })
        .filter(|line| !line.is_empty())
        .collect()
}
