//! OpenAI provider
//!
//! Chat-completions for generation and the embeddings endpoint for
//! vectors. Also serves any OpenAI-compatible gateway via `base_url`.

use crate::config::ProviderCredentials;
use crate::error::{RagError, Result};
use crate::llm::{GenerationParams, GenerationResponse, LlmProvider, Message};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error};

pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: u64,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: String,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    completion_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbedDatum {
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiProvider {
    pub fn new(credentials: ProviderCredentials, model: String, timeout: u64) -> Result<Self> {
        let api_key = credentials
            .api_key
            .ok_or_else(|| RagError::Config("OpenAI API key not configured".to_string()))?;
        let base_url = credentials
            .base_url
            .unwrap_or_else(|| "https://api.openai.com".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .map_err(RagError::Http)?;

        Ok(Self {
            client,
            base_url,
            api_key,
            model,
            timeout,
        })
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!("{}/v1/{}", self.base_url.trim_end_matches('/'), endpoint)
    }

    fn provider_error(&self, stage: &str, message: impl Into<String>) -> RagError {
        RagError::LlmProvider {
            provider: "openai".to_string(),
            stage: stage.to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<GenerationResponse> {
        params.validate()?;

        let request = ChatRequest {
            model: &self.model,
            messages,
            max_tokens: params.max_new_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            seed: params.random_seed,
        };

        let url = self.api_url("chat/completions");
        debug!("OpenAI chat request with {} messages", messages.len());

        let response = timeout(
            Duration::from_secs(self.timeout),
            self.client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&request)
                .send(),
        )
        .await
        .map_err(|_| RagError::Timeout("llm generation".to_string()))?
        .map_err(|e| self.provider_error("generate", e.to_string()))?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!("OpenAI chat error: {}", error_text);
            return Err(self.provider_error("generate", error_text));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| self.provider_error("generate", e.to_string()))?;

        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| self.provider_error("generate", "empty choice list"))?;

        Ok(GenerationResponse {
            text: choice.message.content,
            tokens_used: body.usage.and_then(|u| u.completion_tokens),
            model: body.model,
            finish_reason: choice.finish_reason,
        })
    }

    async fn embed(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>> {
        let request = EmbedRequest {
            model,
            input: texts,
        };

        let url = self.api_url("embeddings");
        debug!("OpenAI embedding request for {} texts", texts.len());

        let response = timeout(
            Duration::from_secs(self.timeout),
            self.client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&request)
                .send(),
        )
        .await
        .map_err(|_| RagError::Timeout("embedding".to_string()))?
        .map_err(|e| self.provider_error("embed", e.to_string()))?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!("OpenAI embedding error: {}", error_text);
            return Err(self.provider_error("embed", error_text));
        }

        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| self.provider_error("embed", e.to_string()))?;

        // The API may return data out of order; reassemble by index.
        let mut vectors = vec![Vec::new(); body.data.len()];
        for datum in body.data {
            if datum.index >= vectors.len() {
                return Err(self.provider_error("embed", "embedding index out of range"));
            }
            vectors[datum.index] = datum.embedding;
        }

        Ok(vectors)
    }
}
