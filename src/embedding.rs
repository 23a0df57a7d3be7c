//! Batched embedding client
//!
//! Wraps an LLM provider's embedding endpoint with sub-batching, bounded
//! concurrency, retries with exponential backoff, and a dimension check
//! on every returned vector. Partial failure of any sub-batch fails the
//! whole call; there are never silent holes in the output.

use crate::config::EmbeddingConfig;
use crate::error::{RagError, Result};
use crate::llm::LlmProvider;
use futures::future::try_join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Embedding client over a provider
#[derive(Clone)]
pub struct EmbeddingClient {
    provider: Arc<dyn LlmProvider>,
    config: EmbeddingConfig,
    semaphore: Arc<Semaphore>,
}

impl EmbeddingClient {
    pub fn new(provider: Arc<dyn LlmProvider>, config: EmbeddingConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.concurrency_limit.max(1)));
        Self {
            provider,
            config,
            semaphore,
        }
    }

    /// The dimension this client is provisioned for
    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    /// The embedding model identifier
    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Embed a batch of texts
    ///
    /// Returns one vector per input, in input order. Fails with
    /// `EmbeddingDimensionMismatch` if the model returns vectors of the
    /// wrong length, and with the provider error if any sub-batch fails
    /// after retries.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let batch_size = self.config.batch_size.max(1);
        let batches: Vec<Vec<String>> = texts
            .chunks(batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        debug!(
            "Embedding {} texts in {} sub-batches of up to {}",
            texts.len(),
            batches.len(),
            batch_size
        );

        let tasks = batches.into_iter().map(|batch| {
            let client = self.clone();
            async move {
                let _permit = client
                    .semaphore
                    .acquire()
                    .await
                    .map_err(|e| RagError::Generic(anyhow::anyhow!(e)))?;
                client.embed_batch_with_retries(&batch).await
            }
        });

        let results = try_join_all(tasks).await?;
        let vectors: Vec<Vec<f32>> = results.into_iter().flatten().collect();

        if vectors.len() != texts.len() {
            return Err(RagError::LlmProvider {
                provider: self.provider.name().to_string(),
                stage: "embed".to_string(),
                message: format!("expected {} embeddings, got {}", texts.len(), vectors.len()),
            });
        }

        Ok(vectors)
    }

    /// Embed a single text
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| RagError::Generic(anyhow::anyhow!("embedding call returned nothing")))
    }

    async fn embed_batch_with_retries(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut delay = Duration::from_secs(self.config.retry_delay.max(1));
        let mut attempt = 0u32;
        loop {
            match self.embed_batch(batch).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        "Embedding sub-batch attempt {} failed: {}. Retrying in {:?}",
                        attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let vectors = self.provider.embed(batch, &self.config.model).await?;

        if vectors.len() != batch.len() {
            return Err(RagError::LlmProvider {
                provider: self.provider.name().to_string(),
                stage: "embed".to_string(),
                message: format!(
                    "expected {} embeddings, got {}",
                    batch.len(),
                    vectors.len()
                ),
            });
        }

        for vector in &vectors {
            if vector.len() != self.config.dimension {
                return Err(RagError::EmbeddingDimensionMismatch {
                    expected: self.config.dimension,
                    got: vector.len(),
                });
            }
        }

        Ok(vectors)
    }
}

/// Cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{GenerationParams, GenerationResponse, Message};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider stub returning fixed-dimension vectors
    struct StubProvider {
        dimension: usize,
        calls: AtomicUsize,
        fail_first: bool,
    }

    impl StubProvider {
        fn new(dimension: usize) -> Self {
            Self {
                dimension,
                calls: AtomicUsize::new(0),
                fail_first: false,
            }
        }
    }

    #[async_trait]
    impl LlmProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        async fn generate(
            &self,
            _messages: &[Message],
            _params: &GenerationParams,
        ) -> crate::error::Result<GenerationResponse> {
            unimplemented!("stub provider does not generate")
        }

        async fn embed(
            &self,
            texts: &[String],
            _model: &str,
        ) -> crate::error::Result<Vec<Vec<f32>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && call == 0 {
                return Err(RagError::Timeout("embedding".to_string()));
            }
            Ok(texts.iter().map(|_| vec![0.5; self.dimension]).collect())
        }
    }

    fn test_config(dimension: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            model: "test-model".to_string(),
            dimension,
            batch_size: 2,
            concurrency_limit: 2,
            max_retries: 2,
            retry_delay: 1,
            timeout: 5,
        }
    }

    #[tokio::test]
    async fn test_embed_preserves_count_and_order() {
        let client = EmbeddingClient::new(Arc::new(StubProvider::new(4)), test_config(4));
        let texts: Vec<String> = (0..5).map(|i| format!("text {i}")).collect();
        let vectors = client.embed(&texts).await.unwrap();
        assert_eq!(vectors.len(), 5);
        assert!(vectors.iter().all(|v| v.len() == 4));
    }

    #[tokio::test]
    async fn test_embed_empty_input() {
        let client = EmbeddingClient::new(Arc::new(StubProvider::new(4)), test_config(4));
        let vectors = client.embed(&[]).await.unwrap();
        assert!(vectors.is_empty());
    }

    #[tokio::test]
    async fn test_dimension_mismatch() {
        // Provider returns 8-dim vectors but the client expects 4.
        let client = EmbeddingClient::new(Arc::new(StubProvider::new(8)), test_config(4));
        let result = client.embed(&["hello".to_string()]).await;
        match result {
            Err(RagError::EmbeddingDimensionMismatch { expected, got }) => {
                assert_eq!(expected, 4);
                assert_eq!(got, 8);
            }
            other => panic!("expected dimension mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_on_timeout() {
        let provider = StubProvider {
            dimension: 4,
            calls: AtomicUsize::new(0),
            fail_first: true,
        };
        let client = EmbeddingClient::new(Arc::new(provider), test_config(4));
        let vectors = client.embed(&["hello".to_string()]).await.unwrap();
        assert_eq!(vectors.len(), 1);
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        let c = vec![0.0, 1.0, 0.0];

        assert_eq!(cosine_similarity(&a, &b), 1.0);
        assert_eq!(cosine_similarity(&a, &c), 0.0);
        assert_eq!(cosine_similarity(&a, &[]), 0.0);
    }
}
