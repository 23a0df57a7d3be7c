//! Language model integration
//!
//! One trait over the supported providers (WatsonX, OpenAI, Anthropic),
//! plus the message and generation-parameter types shared by the search
//! pipeline, the reasoner and the rewriters.

use crate::error::{RagError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use utoipa::ToSchema;

pub mod providers;

pub use providers::anthropic::AnthropicProvider;
pub use providers::openai::OpenAiProvider;
pub use providers::watsonx::WatsonxProvider;

/// Message role in a conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// A message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// Generation controls, validated against the documented bounds
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct GenerationParams {
    pub max_new_tokens: u32,
    pub min_new_tokens: u32,
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub repetition_penalty: f32,
    #[serde(default)]
    pub random_seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 1024,
            min_new_tokens: 1,
            temperature: 0.7,
            top_k: 50,
            top_p: 1.0,
            repetition_penalty: 1.1,
            random_seed: None,
        }
    }
}

impl GenerationParams {
    /// Validate parameter bounds
    pub fn validate(&self) -> Result<()> {
        if self.min_new_tokens > self.max_new_tokens {
            return Err(RagError::Validation(
                "min_new_tokens must not exceed max_new_tokens".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(RagError::Validation(
                "temperature must be between 0.0 and 2.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(RagError::Validation(
                "top_p must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.top_k < 1 {
            return Err(RagError::Validation("top_k must be at least 1".to_string()));
        }
        if !(1.0..=2.0).contains(&self.repetition_penalty) {
            return Err(RagError::Validation(
                "repetition_penalty must be between 1.0 and 2.0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Response from text generation
#[derive(Debug, Clone)]
pub struct GenerationResponse {
    pub text: String,
    pub tokens_used: Option<u32>,
    pub model: String,
    pub finish_reason: Option<String>,
}

/// Trait for language model providers
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name ("watsonx", "openai", "anthropic")
    fn name(&self) -> &str;

    /// Generate text from a conversation
    async fn generate(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<GenerationResponse>;

    /// Generate embeddings for a batch of texts
    async fn embed(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>>;
}

/// Generate with retries and exponential backoff
///
/// Retries only errors the provider marks retryable; the final failure is
/// surfaced as the provider error of the last attempt.
pub async fn generate_with_retries(
    provider: &dyn LlmProvider,
    messages: &[Message],
    params: &GenerationParams,
    max_retries: u32,
) -> Result<GenerationResponse> {
    let mut delay = Duration::from_secs(1);
    let mut attempt = 0u32;
    loop {
        match provider.generate(messages, params).await {
            Ok(response) => return Ok(response),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                attempt += 1;
                warn!(
                    "Generation attempt {} failed on {}: {}. Retrying in {:?}",
                    attempt,
                    provider.name(),
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Flatten a message list into a single prompt string for providers with a
/// plain-text completion API.
pub fn flatten_messages(messages: &[Message]) -> String {
    let mut out = String::new();
    for message in messages {
        match message.role {
            Role::System => {
                out.push_str(&message.content);
                out.push_str("\n\n");
            }
            Role::User => {
                out.push_str(&message.content);
                out.push('\n');
            }
            Role::Assistant => {
                out.push_str(&message.content);
                out.push('\n');
            }
        }
    }
    out.trim_end().to_string()
}

/// Helper function to create a system message
pub fn system_message(content: impl Into<String>) -> Message {
    Message {
        role: Role::System,
        content: content.into(),
    }
}

/// Helper function to create a user message
pub fn user_message(content: impl Into<String>) -> Message {
    Message {
        role: Role::User,
        content: content.into(),
    }
}

/// Helper function to create an assistant message
pub fn assistant_message(content: impl Into<String>) -> Message {
    Message {
        role: Role::Assistant,
        content: content.into(),
    }
}

/// Build the provider selected by the settings
pub fn provider_from_settings(
    settings: &crate::config::Settings,
) -> Result<Arc<dyn LlmProvider>> {
    let llm = &settings.llm;
    match llm.default_provider.as_str() {
        "watsonx" => Ok(Arc::new(WatsonxProvider::new(
            llm.watsonx.clone(),
            llm.generation_model.clone(),
            llm.timeout,
        )?)),
        "openai" => Ok(Arc::new(OpenAiProvider::new(
            llm.openai.clone(),
            llm.generation_model.clone(),
            llm.timeout,
        )?)),
        "anthropic" => Ok(Arc::new(AnthropicProvider::new(
            llm.anthropic.clone(),
            llm.generation_model.clone(),
            llm.timeout,
        )?)),
        other => Err(RagError::Config(format!("Unknown LLM provider: {other}"))),
    }
}
