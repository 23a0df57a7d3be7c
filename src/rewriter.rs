//! Query rewriting
//!
//! Rewriters compose in declared order; a failing rewriter is logged and
//! the previous value carries forward to the next. The chain rejects
//! blank input up front.

use crate::error::{RagError, Result};
use crate::llm::{user_message, GenerationParams, LlmProvider};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The boolean expansion suffix appended by the simple expander
const EXPANSION_SUFFIX: &str = " AND (relevant OR important OR key)";

/// A single query rewriting step
#[async_trait]
pub trait QueryRewriter: Send + Sync {
    fn name(&self) -> &str;

    async fn rewrite(&self, query: &str, context: Option<&Value>) -> Result<String>;
}

/// Appends a fixed boolean expansion once; applying it twice is a no-op
pub struct SimpleExpander;

#[async_trait]
impl QueryRewriter for SimpleExpander {
    fn name(&self) -> &str {
        "simple_expander"
    }

    async fn rewrite(&self, query: &str, _context: Option<&Value>) -> Result<String> {
        if query.contains(EXPANSION_SUFFIX.trim_start()) {
            return Ok(query.to_string());
        }
        Ok(format!("{query}{EXPANSION_SUFFIX}"))
    }
}

/// Hypothetical Document Embedding
///
/// Asks the LLM for a short hypothetical answer and concatenates it onto
/// the query. Any LLM failure returns the original query unchanged.
pub struct HydeRewriter {
    provider: Arc<dyn LlmProvider>,
    max_tokens: u32,
}

impl HydeRewriter {
    pub fn new(provider: Arc<dyn LlmProvider>, max_tokens: u32) -> Self {
        Self {
            provider,
            max_tokens,
        }
    }
}

#[async_trait]
impl QueryRewriter for HydeRewriter {
    fn name(&self) -> &str {
        "hyde"
    }

    async fn rewrite(&self, query: &str, context: Option<&Value>) -> Result<String> {
        let mut prompt = format!(
            "Generate a concise hypothetical document (maximum {} tokens) that would \
             perfectly answer the query: {}",
            self.max_tokens, query
        );
        if let Some(context) = context {
            prompt.push_str(&format!("\nAdditional context: {context}"));
        }

        let params = GenerationParams {
            max_new_tokens: self.max_tokens,
            ..Default::default()
        };

        match self.provider.generate(&[user_message(prompt)], &params).await {
            Ok(response) if !response.text.trim().is_empty() => {
                debug!("HyDE produced {} chars", response.text.len());
                Ok(format!("{} {}", query, response.text.trim()))
            }
            Ok(_) => {
                warn!("HyDE returned an empty document; keeping original query");
                Ok(query.to_string())
            }
            Err(e) => {
                warn!("HyDE generation failed ({}); keeping original query", e);
                Ok(query.to_string())
            }
        }
    }
}

/// A chain of rewriters with a keep-previous-on-error policy
pub struct RewriterChain {
    rewriters: Vec<Box<dyn QueryRewriter>>,
}

impl RewriterChain {
    pub fn new(rewriters: Vec<Box<dyn QueryRewriter>>) -> Self {
        Self { rewriters }
    }

    /// Build a chain from resolved retrieval settings
    pub fn from_flags(
        use_simple: bool,
        use_hyde: bool,
        provider: Arc<dyn LlmProvider>,
        hyde_max_tokens: u32,
    ) -> Self {
        let mut rewriters: Vec<Box<dyn QueryRewriter>> = Vec::new();
        if use_simple {
            rewriters.push(Box::new(SimpleExpander));
        }
        if use_hyde {
            rewriters.push(Box::new(HydeRewriter::new(provider, hyde_max_tokens)));
        }
        Self::new(rewriters)
    }

    pub fn is_empty(&self) -> bool {
        self.rewriters.is_empty()
    }

    /// Run the chain over a query
    pub async fn rewrite(&self, query: &str, context: Option<&Value>) -> Result<String> {
        if query.trim().is_empty() {
            return Err(RagError::InvalidQuery("query cannot be empty".to_string()));
        }

        let mut current = query.to_string();
        for rewriter in &self.rewriters {
            match rewriter.rewrite(&current, context).await {
                Ok(rewritten) => current = rewritten,
                Err(e) => {
                    warn!(
                        "Rewriter '{}' failed ({}); continuing with previous value",
                        rewriter.name(),
                        e
                    );
                }
            }
        }

        if current == query {
            debug!("Query unchanged after rewriting");
        } else {
            info!("Rewrote query ({} -> {} chars)", query.len(), current.len());
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{GenerationResponse, Message};

    struct FailingRewriter;

    #[async_trait]
    impl QueryRewriter for FailingRewriter {
        fn name(&self) -> &str {
            "failing"
        }

        async fn rewrite(&self, _query: &str, _context: Option<&Value>) -> Result<String> {
            Err(RagError::Generic(anyhow::anyhow!("boom")))
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl LlmProvider for FailingProvider {
        fn name(&self) -> &str {
            "failing"
        }

        async fn generate(
            &self,
            _messages: &[Message],
            _params: &GenerationParams,
        ) -> Result<GenerationResponse> {
            Err(RagError::LlmProvider {
                provider: "failing".to_string(),
                stage: "generate".to_string(),
                message: "stubbed failure".to_string(),
            })
        }

        async fn embed(&self, _texts: &[String], _model: &str) -> Result<Vec<Vec<f32>>> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn test_simple_expander_idempotent() {
        let expander = SimpleExpander;
        let once = expander.rewrite("rust traits", None).await.unwrap();
        assert!(once.ends_with("(relevant OR important OR key)"));

        let twice = expander.rewrite(&once, None).await.unwrap();
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let chain = RewriterChain::new(vec![Box::new(SimpleExpander)]);
        assert!(matches!(
            chain.rewrite("   ", None).await,
            Err(RagError::InvalidQuery(_))
        ));
    }

    #[tokio::test]
    async fn test_failing_rewriter_keeps_previous() {
        let chain = RewriterChain::new(vec![Box::new(SimpleExpander), Box::new(FailingRewriter)]);
        let result = chain.rewrite("rust traits", None).await.unwrap();
        assert!(result.starts_with("rust traits"));
        assert!(result.contains("relevant OR important"));
    }

    #[tokio::test]
    async fn test_hyde_falls_back_on_llm_failure() {
        let hyde = HydeRewriter::new(Arc::new(FailingProvider), 100);
        let result = hyde.rewrite("who created Python?", None).await.unwrap();
        assert_eq!(result, "who created Python?");
    }

    #[tokio::test]
    async fn test_empty_chain_passthrough() {
        let chain = RewriterChain::new(vec![]);
        assert!(chain.is_empty());
        let result = chain.rewrite("unchanged", None).await.unwrap();
        assert_eq!(result, "unchanged");
    }
}
