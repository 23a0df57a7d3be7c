//! Runtime configuration with hierarchical scopes
//!
//! Stored overrides resolve with the precedence
//! collection > user > global > static settings. Values are typed JSON
//! (`{value, type}`); a stored value that fails its declared type is
//! treated as missing at resolve time so the next tier shows through.

use crate::config::Settings;
use crate::error::{RagError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqlitePool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

/// Configuration scope, ordered by precedence (low to high)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConfigScope {
    Global,
    User,
    Collection,
}

impl std::fmt::Display for ConfigScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::User => write!(f, "user"),
            Self::Collection => write!(f, "collection"),
        }
    }
}

impl std::str::FromStr for ConfigScope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "global" => Ok(Self::Global),
            "user" => Ok(Self::User),
            "collection" => Ok(Self::Collection),
            other => Err(format!("unknown config scope: {other}")),
        }
    }
}

/// Configuration category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConfigCategory {
    Llm,
    Chunking,
    Retrieval,
    Embedding,
    Cot,
    Reranking,
    Podcast,
    Question,
    Logging,
    System,
}

impl std::fmt::Display for ConfigCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Llm => "llm",
            Self::Chunking => "chunking",
            Self::Retrieval => "retrieval",
            Self::Embedding => "embedding",
            Self::Cot => "cot",
            Self::Reranking => "reranking",
            Self::Podcast => "podcast",
            Self::Question => "question",
            Self::Logging => "logging",
            Self::System => "system",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for ConfigCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "llm" => Ok(Self::Llm),
            "chunking" => Ok(Self::Chunking),
            "retrieval" => Ok(Self::Retrieval),
            "embedding" => Ok(Self::Embedding),
            "cot" => Ok(Self::Cot),
            "reranking" => Ok(Self::Reranking),
            "podcast" => Ok(Self::Podcast),
            "question" => Ok(Self::Question),
            "logging" => Ok(Self::Logging),
            "system" => Ok(Self::System),
            other => Err(format!("unknown config category: {other}")),
        }
    }
}

/// Declared type of a stored value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConfigValueType {
    Int,
    Float,
    Str,
    Bool,
    List,
    Dict,
}

impl std::fmt::Display for ConfigValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Str => "str",
            Self::Bool => "bool",
            Self::List => "list",
            Self::Dict => "dict",
        };
        write!(f, "{name}")
    }
}

/// A JSON value with its declared type: `{value, type}` on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TypedValue {
    pub value: Value,
    #[serde(rename = "type")]
    pub value_type: ConfigValueType,
}

impl TypedValue {
    pub fn new(value: impl Into<Value>, value_type: ConfigValueType) -> Self {
        Self {
            value: value.into(),
            value_type,
        }
    }

    /// Check that the value matches its declared type
    pub fn check(&self, key: &str) -> Result<()> {
        let matches = match self.value_type {
            ConfigValueType::Int => self.value.is_i64() || self.value.is_u64(),
            // Integers coerce losslessly into floats.
            ConfigValueType::Float => self.value.is_number(),
            ConfigValueType::Str => self.value.is_string(),
            ConfigValueType::Bool => self.value.is_boolean(),
            ConfigValueType::List => self.value.is_array(),
            ConfigValueType::Dict => self.value.is_object(),
        };
        if matches {
            Ok(())
        } else {
            Err(RagError::ConfigType {
                key: key.to_string(),
                expected: self.value_type.to_string(),
            })
        }
    }
}

/// Where a resolved key came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    Global,
    User,
    Collection,
    Request,
}

impl From<ConfigScope> for ConfigSource {
    fn from(scope: ConfigScope) -> Self {
        match scope {
            ConfigScope::Global => Self::Global,
            ConfigScope::User => Self::User,
            ConfigScope::Collection => Self::Collection,
        }
    }
}

/// Input for creating a runtime configuration row
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RuntimeConfigInput {
    pub scope: ConfigScope,
    pub category: ConfigCategory,
    pub config_key: String,
    pub config_value: TypedValue,
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub collection_id: Option<Uuid>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_by: Option<Uuid>,
}

fn default_true() -> bool {
    true
}

impl RuntimeConfigInput {
    /// Validate scope constraints and the typed value
    pub fn validate(&self) -> Result<()> {
        if self.config_key.is_empty() {
            return Err(RagError::Validation(
                "config_key cannot be empty".to_string(),
            ));
        }

        match self.scope {
            ConfigScope::Global => {
                if self.user_id.is_some() || self.collection_id.is_some() {
                    return Err(RagError::Validation(
                        "global scope must not carry user_id or collection_id".to_string(),
                    ));
                }
            }
            ConfigScope::User => {
                if self.user_id.is_none() {
                    return Err(RagError::Validation(
                        "user scope requires user_id".to_string(),
                    ));
                }
                if self.collection_id.is_some() {
                    return Err(RagError::Validation(
                        "user scope must not carry collection_id".to_string(),
                    ));
                }
            }
            ConfigScope::Collection => {
                if self.user_id.is_none() || self.collection_id.is_none() {
                    return Err(RagError::Validation(
                        "collection scope requires both user_id and collection_id".to_string(),
                    ));
                }
            }
        }

        self.config_value.check(&self.config_key)
    }
}

/// A stored runtime configuration row
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RuntimeConfigRow {
    pub id: Uuid,
    pub scope: ConfigScope,
    pub category: ConfigCategory,
    pub config_key: String,
    pub config_value: TypedValue,
    pub user_id: Option<Uuid>,
    pub collection_id: Option<Uuid>,
    pub is_active: bool,
    pub description: Option<String>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The merged configuration for one category, with source tracking
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct EffectiveConfig {
    pub values: HashMap<String, Value>,
    pub sources: HashMap<String, ConfigSource>,
}

impl EffectiveConfig {
    fn apply(&mut self, key: String, value: Value, source: ConfigSource) {
        self.values.insert(key.clone(), value);
        self.sources.insert(key, source);
    }

    /// Merge request-scoped overrides on top of everything stored
    pub fn merge_request(&mut self, overrides: &HashMap<String, Value>) {
        for (key, value) in overrides {
            self.apply(key.clone(), value.clone(), ConfigSource::Request);
        }
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.values.get(key)?.as_u64().map(|v| v as usize)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.values.get(key)?.as_f64()
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.get(key)?.as_bool()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key)?.as_str()
    }

    pub fn source(&self, key: &str) -> Option<ConfigSource> {
        self.sources.get(key).copied()
    }
}

/// Service over the runtime_configs table
#[derive(Clone)]
pub struct RuntimeConfigService {
    pool: SqlitePool,
    settings: Arc<Settings>,
}

impl RuntimeConfigService {
    pub fn new(pool: SqlitePool, settings: Arc<Settings>) -> Self {
        Self { pool, settings }
    }

    /// Create the backing table and its uniqueness constraint
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runtime_configs (
                id TEXT PRIMARY KEY,
                scope TEXT NOT NULL,
                category TEXT NOT NULL,
                config_key TEXT NOT NULL,
                config_value TEXT NOT NULL,
                user_id TEXT,
                collection_id TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                description TEXT,
                created_by TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_runtime_configs_identity
            ON runtime_configs(scope, category, config_key,
                               ifnull(user_id, ''), ifnull(collection_id, ''))
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Create a new configuration row
    pub async fn create(&self, input: RuntimeConfigInput) -> Result<RuntimeConfigRow> {
        // The input validates itself; this re-check guards callers that
        // construct inputs without going through deserialization.
        input.validate()?;

        let row = RuntimeConfigRow {
            id: Uuid::new_v4(),
            scope: input.scope,
            category: input.category,
            config_key: input.config_key,
            config_value: input.config_value,
            user_id: input.user_id,
            collection_id: input.collection_id,
            is_active: input.is_active,
            description: input.description,
            created_by: input.created_by,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let result = sqlx::query(
            r#"
            INSERT INTO runtime_configs
                (id, scope, category, config_key, config_value, user_id, collection_id,
                 is_active, description, created_by, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(row.id.to_string())
        .bind(row.scope.to_string())
        .bind(row.category.to_string())
        .bind(&row.config_key)
        .bind(serde_json::to_string(&row.config_value)?)
        .bind(row.user_id.map(|u| u.to_string()))
        .bind(row.collection_id.map(|c| c.to_string()))
        .bind(row.is_active)
        .bind(&row.description)
        .bind(row.created_by.map(|c| c.to_string()))
        .bind(row.created_at.to_rfc3339())
        .bind(row.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                info!(
                    "Created runtime config {}:{}:{}",
                    row.scope, row.category, row.config_key
                );
                Ok(row)
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(RagError::AlreadyExists(format!(
                    "runtime config ({}, {}, {}) already exists",
                    row.scope, row.category, row.config_key
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch a row by id
    pub async fn get(&self, id: Uuid) -> Result<RuntimeConfigRow> {
        let row = sqlx::query("SELECT * FROM runtime_configs WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_config)
            .transpose()?
            .ok_or_else(|| RagError::NotFound(format!("runtime config {id}")))
    }

    /// Replace the value of an existing row
    pub async fn update_value(&self, id: Uuid, value: TypedValue) -> Result<RuntimeConfigRow> {
        let existing = self.get(id).await?;
        value.check(&existing.config_key)?;

        sqlx::query(
            "UPDATE runtime_configs SET config_value = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(serde_json::to_string(&value)?)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        self.get(id).await
    }

    /// Delete a row by id
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM runtime_configs WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RagError::NotFound(format!("runtime config {id}")));
        }
        Ok(())
    }

    /// Resolve the effective configuration for a category
    ///
    /// Precedence, lowest first: static settings, GLOBAL rows, USER rows
    /// matching `user_id`, COLLECTION rows matching `collection_id`. Rows
    /// whose value fails its declared type are skipped with a warning so
    /// the lower tier shows through.
    pub async fn effective(
        &self,
        category: ConfigCategory,
        user_id: Uuid,
        collection_id: Option<Uuid>,
    ) -> Result<EffectiveConfig> {
        let mut effective = EffectiveConfig::default();

        for (key, value) in self.settings.category_defaults(&category.to_string()) {
            effective.apply(key, value, ConfigSource::Default);
        }

        let rows = sqlx::query(
            r#"
            SELECT * FROM runtime_configs
            WHERE category = ?1 AND is_active = 1
              AND (
                    (scope = 'global' AND user_id IS NULL AND collection_id IS NULL)
                 OR (scope = 'user' AND user_id = ?2)
                 OR (scope = 'collection' AND collection_id = ?3)
              )
            ORDER BY CASE scope
                WHEN 'global' THEN 0
                WHEN 'user' THEN 1
                WHEN 'collection' THEN 2
            END
            "#,
        )
        .bind(category.to_string())
        .bind(user_id.to_string())
        .bind(collection_id.map(|c| c.to_string()).unwrap_or_default())
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let config = row_to_config(row)?;
            if config.config_value.check(&config.config_key).is_err() {
                warn!(
                    "Runtime config {}:{} fails its declared type '{}'; ignoring",
                    config.scope, config.config_key, config.config_value.value_type
                );
                continue;
            }
            effective.apply(
                config.config_key,
                config.config_value.value,
                config.scope.into(),
            );
        }

        debug!(
            "Resolved {} effective keys for category {}",
            effective.values.len(),
            category
        );
        Ok(effective)
    }

    /// List rows, optionally filtered by scope and user
    pub async fn list(
        &self,
        scope: Option<ConfigScope>,
        user_id: Option<Uuid>,
    ) -> Result<Vec<RuntimeConfigRow>> {
        let rows = match (scope, user_id) {
            (Some(scope), Some(user)) => {
                sqlx::query(
                    "SELECT * FROM runtime_configs WHERE scope = ?1 AND user_id = ?2 ORDER BY category, config_key",
                )
                .bind(scope.to_string())
                .bind(user.to_string())
                .fetch_all(&self.pool)
                .await?
            }
            (Some(scope), None) => {
                sqlx::query("SELECT * FROM runtime_configs WHERE scope = ?1 ORDER BY category, config_key")
                    .bind(scope.to_string())
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, Some(user)) => {
                sqlx::query("SELECT * FROM runtime_configs WHERE user_id = ?1 ORDER BY category, config_key")
                    .bind(user.to_string())
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, None) => {
                sqlx::query("SELECT * FROM runtime_configs ORDER BY category, config_key")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter().map(row_to_config).collect()
    }
}

fn row_to_config(row: sqlx::sqlite::SqliteRow) -> Result<RuntimeConfigRow> {
    let id: String = row.get("id");
    let scope: String = row.get("scope");
    let category: String = row.get("category");
    let config_value: String = row.get("config_value");
    let user_id: Option<String> = row.get("user_id");
    let collection_id: Option<String> = row.get("collection_id");
    let created_by: Option<String> = row.get("created_by");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    let parse_uuid = |value: Option<String>| -> Result<Option<Uuid>> {
        value
            .map(|v| Uuid::parse_str(&v).map_err(|e| RagError::Validation(e.to_string())))
            .transpose()
    };

    Ok(RuntimeConfigRow {
        id: Uuid::parse_str(&id).map_err(|e| RagError::Validation(e.to_string()))?,
        scope: scope.parse().map_err(|e: String| RagError::Validation(e))?,
        category: category
            .parse()
            .map_err(|e: String| RagError::Validation(e))?,
        config_key: row.get("config_key"),
        config_value: serde_json::from_str(&config_value)?,
        user_id: parse_uuid(user_id)?,
        collection_id: parse_uuid(collection_id)?,
        is_active: row.get("is_active"),
        description: row.get("description"),
        created_by: parse_uuid(created_by)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| RagError::Validation(e.to_string()))?
            .with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| RagError::Validation(e.to_string()))?
            .with_timezone(&Utc),
    })
}
