//! Per-user LLM generation parameter sets
//!
//! Users keep named parameter sets with at most one default; the search
//! pipeline resolves the default set (or validated request overrides)
//! into the generation call.

use crate::error::{RagError, Result};
use crate::llm::GenerationParams;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePool, Row};
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

/// A stored parameter set
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LlmParameters {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub params: GenerationParams,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LlmParameters {
    pub fn new(user_id: Uuid, name: impl Into<String>, params: GenerationParams) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            name: name.into(),
            params,
            is_default: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }
}

/// Service over the llm_parameters table
#[derive(Clone)]
pub struct LlmParametersService {
    pool: SqlitePool,
}

impl LlmParametersService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS llm_parameters (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                params TEXT NOT NULL,
                is_default INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Store a parameter set; making it default clears the previous one
    pub async fn save(&self, parameters: &LlmParameters) -> Result<()> {
        parameters.params.validate()?;

        let mut tx = self.pool.begin().await?;

        if parameters.is_default {
            sqlx::query("UPDATE llm_parameters SET is_default = 0 WHERE user_id = ?1")
                .bind(parameters.user_id.to_string())
                .execute(&mut *tx)
                .await?;
        }

        let result = sqlx::query(
            r#"
            INSERT OR REPLACE INTO llm_parameters
                (id, user_id, name, params, is_default, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(parameters.id.to_string())
        .bind(parameters.user_id.to_string())
        .bind(&parameters.name)
        .bind(serde_json::to_string(&parameters.params)?)
        .bind(parameters.is_default)
        .bind(parameters.created_at.to_rfc3339())
        .bind(parameters.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(RagError::AlreadyExists(format!(
                    "parameter set '{}' already exists for user {}",
                    parameters.name, parameters.user_id
                )));
            }
            Err(e) => return Err(e.into()),
        }

        tx.commit().await?;
        info!(
            "Saved LLM parameters '{}' for user {}",
            parameters.name, parameters.user_id
        );
        Ok(())
    }

    /// The user's default parameter set, or the library defaults
    pub async fn default_for(&self, user_id: Uuid) -> Result<GenerationParams> {
        let row = sqlx::query(
            "SELECT params FROM llm_parameters WHERE user_id = ?1 AND is_default = 1",
        )
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let params: String = row.get("params");
                Ok(serde_json::from_str(&params)?)
            }
            None => Ok(GenerationParams::default()),
        }
    }

    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<LlmParameters>> {
        let rows = sqlx::query("SELECT * FROM llm_parameters WHERE user_id = ?1 ORDER BY name")
            .bind(user_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_parameters).collect()
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM llm_parameters WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RagError::NotFound(format!("llm parameters {id}")));
        }
        Ok(())
    }
}

fn row_to_parameters(row: sqlx::sqlite::SqliteRow) -> Result<LlmParameters> {
    let id: String = row.get("id");
    let user_id: String = row.get("user_id");
    let params: String = row.get("params");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(LlmParameters {
        id: Uuid::parse_str(&id).map_err(|e| RagError::Validation(e.to_string()))?,
        user_id: Uuid::parse_str(&user_id).map_err(|e| RagError::Validation(e.to_string()))?,
        name: row.get("name"),
        params: serde_json::from_str(&params)?,
        is_default: row.get("is_default"),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| RagError::Validation(e.to_string()))?
            .with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| RagError::Validation(e.to_string()))?
            .with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_service() -> LlmParametersService {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let service = LlmParametersService::new(pool);
        service.initialize().await.unwrap();
        service
    }

    #[tokio::test]
    async fn test_default_falls_back_to_library_defaults() {
        let service = test_service().await;
        let params = service.default_for(Uuid::new_v4()).await.unwrap();
        assert_eq!(params.max_new_tokens, GenerationParams::default().max_new_tokens);
    }

    #[tokio::test]
    async fn test_single_default_per_user() {
        let service = test_service().await;
        let user = Uuid::new_v4();

        let mut creative = GenerationParams::default();
        creative.temperature = 1.2;
        service
            .save(&LlmParameters::new(user, "creative", creative).as_default())
            .await
            .unwrap();

        let mut precise = GenerationParams::default();
        precise.temperature = 0.1;
        service
            .save(&LlmParameters::new(user, "precise", precise).as_default())
            .await
            .unwrap();

        let resolved = service.default_for(user).await.unwrap();
        assert!((resolved.temperature - 0.1).abs() < f32::EPSILON);

        let sets = service.list_for_user(user).await.unwrap();
        assert_eq!(sets.iter().filter(|s| s.is_default).count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_params_rejected() {
        let service = test_service().await;
        let mut params = GenerationParams::default();
        params.temperature = 5.0;
        let result = service
            .save(&LlmParameters::new(Uuid::new_v4(), "bad", params))
            .await;
        assert!(matches!(result, Err(RagError::Validation(_))));
    }
}
