//! IBM WatsonX provider
//!
//! Talks to the watsonx.ai text generation and embedding REST endpoints.
//! Generation uses the plain-text completion API, so the message list is
//! flattened into a single input string.

use crate::config::ProviderCredentials;
use crate::error::{RagError, Result};
use crate::llm::{flatten_messages, GenerationParams, GenerationResponse, LlmProvider, Message};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error};

const API_VERSION: &str = "2024-05-31";

pub struct WatsonxProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    project_id: String,
    model: String,
    timeout: u64,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model_id: &'a str,
    input: String,
    parameters: WatsonxParameters,
    project_id: &'a str,
}

#[derive(Debug, Serialize)]
struct WatsonxParameters {
    max_new_tokens: u32,
    min_new_tokens: u32,
    temperature: f32,
    top_k: u32,
    top_p: f32,
    repetition_penalty: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    random_seed: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    results: Vec<GenerateResult>,
    #[serde(default)]
    model_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateResult {
    generated_text: String,
    #[serde(default)]
    generated_token_count: Option<u32>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model_id: &'a str,
    inputs: &'a [String],
    project_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    results: Vec<EmbedResult>,
}

#[derive(Debug, Deserialize)]
struct EmbedResult {
    embedding: Vec<f32>,
}

impl WatsonxProvider {
    pub fn new(credentials: ProviderCredentials, model: String, timeout: u64) -> Result<Self> {
        let api_key = credentials
            .api_key
            .ok_or_else(|| RagError::Config("WatsonX API key not configured".to_string()))?;
        let project_id = credentials
            .project_id
            .ok_or_else(|| RagError::Config("WatsonX project id not configured".to_string()))?;
        let base_url = credentials
            .base_url
            .unwrap_or_else(|| "https://us-south.ml.cloud.ibm.com".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .map_err(RagError::Http)?;

        Ok(Self {
            client,
            base_url,
            api_key,
            project_id,
            model,
            timeout,
        })
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!(
            "{}/ml/v1/{}?version={}",
            self.base_url.trim_end_matches('/'),
            endpoint,
            API_VERSION
        )
    }

    fn provider_error(&self, stage: &str, message: impl Into<String>) -> RagError {
        RagError::LlmProvider {
            provider: "watsonx".to_string(),
            stage: stage.to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl LlmProvider for WatsonxProvider {
    fn name(&self) -> &str {
        "watsonx"
    }

    async fn generate(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<GenerationResponse> {
        params.validate()?;

        let request = GenerateRequest {
            model_id: &self.model,
            input: flatten_messages(messages),
            parameters: WatsonxParameters {
                max_new_tokens: params.max_new_tokens,
                min_new_tokens: params.min_new_tokens,
                temperature: params.temperature,
                top_k: params.top_k,
                top_p: params.top_p,
                repetition_penalty: params.repetition_penalty,
                random_seed: params.random_seed,
            },
            project_id: &self.project_id,
        };

        let url = self.api_url("text/generation");
        debug!("WatsonX generation request to {}", url);

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
            error!("WatsonX generation error: {}", error_text);
            return Err(self.provider_error("generate", error_text));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| self.provider_error("generate", e.to_string()))?;

        let result = body
            .results
            .into_iter()
            .next()
            .ok_or_else(|| self.provider_error("generate", "empty result list"))?;

        Ok(GenerationResponse {
            text: result.generated_text,
            tokens_used: result.generated_token_count,
            model: body.model_id.unwrap_or_else(|| self.model.clone()),
            finish_reason: result.stop_reason,
        })
    }

    async fn embed(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>> {
        let request = EmbedRequest {
            model_id: model,
            inputs: texts,
            project_id: &self.project_id,
        };

        let url = self.api_url("text/embeddings");
        debug!("WatsonX embedding request for {} texts", texts.len());

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
            error!("WatsonX embedding error: {}", error_text);
            return Err(self.provider_error("embed", error_text));
        }

        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| self.provider_error("embed", e.to_string()))?;

        Ok(body.results.into_iter().map(|r| r.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_credentials() -> ProviderCredentials {
        ProviderCredentials {
            api_key: Some("key".to_string()),
            base_url: Some("https://example.com/".to_string()),
            project_id: Some("project".to_string()),
        }
    }

    #[test]
    fn test_requires_credentials() {
        let missing_key = ProviderCredentials {
            api_key: None,
            base_url: None,
            project_id: Some("p".to_string()),
        };
        assert!(WatsonxProvider::new(missing_key, "m".to_string(), 60).is_err());

        let missing_project = ProviderCredentials {
            api_key: Some("k".to_string()),
            base_url: None,
            project_id: None,
        };
        assert!(WatsonxProvider::new(missing_project, "m".to_string(), 60).is_err());
    }

    #[test]
    fn test_api_url() {
        let provider =
            WatsonxProvider::new(test_credentials(), "ibm/granite-13b-chat-v2".to_string(), 60)
                .unwrap();
        assert_eq!(
            provider.api_url("text/generation"),
            format!(
                "https://example.com/ml/v1/text/generation?version={}",
                API_VERSION
            )
        );
    }

    #[test]
    fn test_request_serialization_omits_missing_seed() {
        let params = WatsonxParameters {
            max_new_tokens: 100,
            min_new_tokens: 1,
            temperature: 0.7,
            top_k: 50,
            top_p: 1.0,
            repetition_penalty: 1.1,
            random_seed: None,
        };
        let json = serde_json::to_value(&params).unwrap();
        assert!(json.get("random_seed").is_none());
        assert_eq!(json["max_new_tokens"], 100);
    }
}
