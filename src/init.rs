//! System initialization
//!
//! Reconciles the LLM provider and model rows against the static
//! deployment settings on every boot: configured providers are upserted,
//! and WatsonX gets one default generation model and one default
//! embedding model row, updated in place when the configured identifiers
//! drift. Safe to run repeatedly.

use crate::config::Settings;
use crate::error::{RagError, Result};
use chrono::Utc;
use sqlx::{sqlite::SqlitePool, Row};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Model purpose within a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    Generation,
    Embedding,
}

impl std::fmt::Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generation => write!(f, "generation"),
            Self::Embedding => write!(f, "embedding"),
        }
    }
}

/// Startup reconciliation of providers and models
pub struct SystemInitializer {
    pool: SqlitePool,
    settings: Arc<Settings>,
}

impl SystemInitializer {
    pub fn new(pool: SqlitePool, settings: Arc<Settings>) -> Self {
        Self { pool, settings }
    }

    /// Create tables and reconcile rows; returns the provider names seen
    pub async fn run(&self) -> Result<Vec<String>> {
        self.create_tables().await?;

        let mut initialized = Vec::new();

        let llm = &self.settings.llm;
        let candidates = [
            (
                "watsonx",
                llm.watsonx.api_key.is_some() && llm.watsonx.project_id.is_some(),
                llm.watsonx
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://us-south.ml.cloud.ibm.com".to_string()),
            ),
            (
                "openai",
                llm.openai.api_key.is_some(),
                llm.openai
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com".to_string()),
            ),
            (
                "anthropic",
                llm.anthropic.api_key.is_some(),
                llm.anthropic
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            ),
        ];

        for (name, configured, base_url) in candidates {
            if !configured {
                continue;
            }
            let is_default = llm.default_provider == name;
            let provider_id = self.upsert_provider(name, &base_url, is_default).await?;
            initialized.push(name.to_string());

            if name == "watsonx" {
                self.ensure_model(
                    provider_id,
                    ModelType::Generation,
                    &llm.generation_model,
                )
                .await?;
                self.ensure_model(
                    provider_id,
                    ModelType::Embedding,
                    &self.settings.embedding.model,
                )
                .await?;
            }
        }

        if initialized.is_empty() {
            warn!("No LLM providers are configured");
        } else {
            info!("Initialized providers: {}", initialized.join(", "));
        }
        Ok(initialized)
    }

    async fn create_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS llm_providers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                base_url TEXT NOT NULL,
                is_default INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS llm_models (
                id TEXT PRIMARY KEY,
                provider_id TEXT NOT NULL REFERENCES llm_providers(id),
                model_id TEXT NOT NULL,
                model_type TEXT NOT NULL,
                is_default INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(provider_id, model_type)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert or update a provider row, returning its id
    async fn upsert_provider(
        &self,
        name: &str,
        base_url: &str,
        is_default: bool,
    ) -> Result<Uuid> {
        let existing = sqlx::query("SELECT id, base_url FROM llm_providers WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        match existing {
            Some(row) => {
                let id: String = row.get("id");
                let stored_url: String = row.get("base_url");
                if stored_url != base_url {
                    info!("Updating provider '{}' base URL", name);
                }
                sqlx::query(
                    "UPDATE llm_providers SET base_url = ?1, is_default = ?2, updated_at = ?3 WHERE name = ?4",
                )
                .bind(base_url)
                .bind(is_default)
                .bind(Utc::now().to_rfc3339())
                .bind(name)
                .execute(&self.pool)
                .await?;
                Uuid::parse_str(&id).map_err(|e| RagError::Validation(e.to_string()))
            }
            None => {
                let id = Uuid::new_v4();
                info!("Registering provider '{}'", name);
                sqlx::query(
                    r#"
                    INSERT INTO llm_providers (id, name, base_url, is_default, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    "#,
                )
                .bind(id.to_string())
                .bind(name)
                .bind(base_url)
                .bind(is_default)
                .bind(Utc::now().to_rfc3339())
                .bind(Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await?;
                Ok(id)
            }
        }
    }

    /// Ensure one default model row of a type, fixing drift in place
    async fn ensure_model(
        &self,
        provider_id: Uuid,
        model_type: ModelType,
        model_id: &str,
    ) -> Result<()> {
        let existing = sqlx::query(
            "SELECT id, model_id FROM llm_models WHERE provider_id = ?1 AND model_type = ?2",
        )
        .bind(provider_id.to_string())
        .bind(model_type.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match existing {
            Some(row) => {
                let stored: String = row.get("model_id");
                if stored != model_id {
                    let id: String = row.get("id");
                    info!(
                        "Model drift for {} {}: '{}' -> '{}'",
                        provider_id, model_type, stored, model_id
                    );
                    sqlx::query(
                        "UPDATE llm_models SET model_id = ?1, updated_at = ?2 WHERE id = ?3",
                    )
                    .bind(model_id)
                    .bind(Utc::now().to_rfc3339())
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
                }
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO llm_models (id, provider_id, model_id, model_type, is_default, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6)
                    "#,
                )
                .bind(Uuid::new_v4().to_string())
                .bind(provider_id.to_string())
                .bind(model_id)
                .bind(model_type.to_string())
                .bind(Utc::now().to_rfc3339())
                .bind(Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }
}
