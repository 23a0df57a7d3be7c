//! Anthropic provider
//!
//! Generation via the messages endpoint. Anthropic exposes no embedding
//! API, so `embed` fails; the embedding client should be configured with
//! a provider that has one.

use crate::config::ProviderCredentials;
use crate::error::{RagError, Result};
use crate::llm::{GenerationParams, GenerationResponse, LlmProvider, Message, Role};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: u64,
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    temperature: f32,
    top_p: f32,
    top_k: u32,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    model: String,
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    output_tokens: Option<u32>,
}

impl AnthropicProvider {
    pub fn new(credentials: ProviderCredentials, model: String, timeout: u64) -> Result<Self> {
        let api_key = credentials
            .api_key
            .ok_or_else(|| RagError::Config("Anthropic API key not configured".to_string()))?;
        let base_url = credentials
            .base_url
            .unwrap_or_else(|| "https://api.anthropic.com".to_string());

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

    fn provider_error(&self, stage: &str, message: impl Into<String>) -> RagError {
        RagError::LlmProvider {
            provider: "anthropic".to_string(),
            stage: stage.to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn generate(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<GenerationResponse> {
        params.validate()?;

        // The system prompt is a top-level field, not part of the turn list.
        let system = messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str());
        let turns: Vec<WireMessage> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| WireMessage {
                role: match m.role {
                    Role::User => "user",
                    _ => "assistant",
                },
                content: &m.content,
            })
            .collect();

        let request = MessagesRequest {
            model: &self.model,
            max_tokens: params.max_new_tokens,
            messages: turns,
            system,
            temperature: params.temperature.min(1.0),
            top_p: params.top_p,
            top_k: params.top_k,
        };

        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        debug!("Anthropic messages request with {} turns", messages.len());

        let response = timeout(
            Duration::from_secs(self.timeout),
            self.client
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
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
            error!("Anthropic messages error: {}", error_text);
            return Err(self.provider_error("generate", error_text));
        }

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|e| self.provider_error("generate", e.to_string()))?;

        let text = body
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        Ok(GenerationResponse {
            text,
            tokens_used: body.usage.and_then(|u| u.output_tokens),
            model: body.model,
            finish_reason: body.stop_reason,
        })
    }

    async fn embed(&self, _texts: &[String], _model: &str) -> Result<Vec<Vec<f32>>> {
        Err(self.provider_error("embed", "Anthropic does not expose an embedding API"))
    }
}
