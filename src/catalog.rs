//! Collection catalog
//!
//! Relational bookkeeping for collections: dimension, status and the
//! ingested file list. The vector store holds the chunks; this catalog
//! is what the ingestion pipeline and the API consult for lifecycle
//! state.

use crate::error::{RagError, Result};
use crate::types::{CollectionRecord, CollectionStatus};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePool, Row};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Clone)]
pub struct CollectionCatalog {
    pool: SqlitePool,
}

impl CollectionCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the backing table
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS collections (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL,
                is_private INTEGER NOT NULL DEFAULT 0,
                embedding_model TEXT NOT NULL,
                dimension INTEGER NOT NULL,
                status TEXT NOT NULL,
                files TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Register a new collection in CREATED state
    pub async fn create(
        &self,
        name: &str,
        user_id: Uuid,
        is_private: bool,
        embedding_model: &str,
        dimension: usize,
    ) -> Result<CollectionRecord> {
        let record = CollectionRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            user_id,
            is_private,
            embedding_model: embedding_model.to_string(),
            dimension,
            status: CollectionStatus::Created,
            files: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let result = sqlx::query(
            r#"
            INSERT INTO collections
                (id, name, user_id, is_private, embedding_model, dimension, status, files, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.name)
        .bind(record.user_id.to_string())
        .bind(record.is_private)
        .bind(&record.embedding_model)
        .bind(record.dimension as i64)
        .bind(record.status.to_string())
        .bind("[]")
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                info!("Registered collection '{}' ({})", record.name, record.id);
                Ok(record)
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                RagError::AlreadyExists(format!("collection '{name}' already exists")),
            ),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch a collection by id
    pub async fn get(&self, id: Uuid) -> Result<CollectionRecord> {
        let row = sqlx::query("SELECT * FROM collections WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_record)
            .transpose()?
            .ok_or_else(|| RagError::NotFound(format!("collection {id}")))
    }

    /// Fetch a collection by name
    pub async fn get_by_name(&self, name: &str) -> Result<CollectionRecord> {
        let row = sqlx::query("SELECT * FROM collections WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_record)
            .transpose()?
            .ok_or_else(|| RagError::NotFound(format!("collection '{name}'")))
    }

    /// Update the lifecycle status
    pub async fn set_status(&self, id: Uuid, status: CollectionStatus) -> Result<()> {
        let result = sqlx::query(
            "UPDATE collections SET status = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(status.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RagError::NotFound(format!("collection {id}")));
        }
        debug!("Collection {} -> {}", id, status);
        Ok(())
    }

    /// Append a file to the collection's ingested file list
    pub async fn add_file(&self, id: Uuid, file: &str) -> Result<()> {
        let record = self.get(id).await?;
        let mut files = record.files;
        if !files.iter().any(|f| f == file) {
            files.push(file.to_string());
        }

        sqlx::query("UPDATE collections SET files = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(serde_json::to_string(&files)?)
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove a collection record
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM collections WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RagError::NotFound(format!("collection {id}")));
        }
        Ok(())
    }

    /// List the collections owned by a user
    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<CollectionRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM collections WHERE user_id = ?1 ORDER BY created_at DESC",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_record).collect()
    }
}

fn row_to_record(row: sqlx::sqlite::SqliteRow) -> Result<CollectionRecord> {
    let id: String = row.get("id");
    let user_id: String = row.get("user_id");
    let status: String = row.get("status");
    let files: String = row.get("files");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    let dimension: i64 = row.get("dimension");

    Ok(CollectionRecord {
        id: Uuid::parse_str(&id).map_err(|e| RagError::Validation(e.to_string()))?,
        name: row.get("name"),
        user_id: Uuid::parse_str(&user_id).map_err(|e| RagError::Validation(e.to_string()))?,
        is_private: row.get("is_private"),
        embedding_model: row.get("embedding_model"),
        dimension: dimension as usize,
        status: status
            .parse()
            .map_err(|e: String| RagError::Validation(e))?,
        files: serde_json::from_str(&files).unwrap_or_default(),
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

    async fn test_catalog() -> CollectionCatalog {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let catalog = CollectionCatalog::new(pool);
        catalog.initialize().await.unwrap();
        catalog
    }

    #[tokio::test]
    async fn test_create_and_fetch() {
        let catalog = test_catalog().await;
        let user = Uuid::new_v4();

        let record = catalog
            .create("papers", user, true, "test-model", 384)
            .await
            .unwrap();
        assert_eq!(record.status, CollectionStatus::Created);
        assert_eq!(record.dimension, 384);

        let fetched = catalog.get(record.id).await.unwrap();
        assert_eq!(fetched.name, "papers");
        assert_eq!(fetched.user_id, user);

        let by_name = catalog.get_by_name("papers").await.unwrap();
        assert_eq!(by_name.id, record.id);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let catalog = test_catalog().await;
        let user = Uuid::new_v4();

        catalog
            .create("dup", user, false, "m", 128)
            .await
            .unwrap();
        let result = catalog.create("dup", user, false, "m", 128).await;
        assert!(matches!(result, Err(RagError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_status_transitions_and_files() {
        let catalog = test_catalog().await;
        let record = catalog
            .create("c", Uuid::new_v4(), false, "m", 64)
            .await
            .unwrap();

        catalog
            .set_status(record.id, CollectionStatus::Processing)
            .await
            .unwrap();
        catalog.add_file(record.id, "report.pdf").await.unwrap();
        catalog.add_file(record.id, "report.pdf").await.unwrap();
        catalog
            .set_status(record.id, CollectionStatus::Completed)
            .await
            .unwrap();

        let fetched = catalog.get(record.id).await.unwrap();
        assert_eq!(fetched.status, CollectionStatus::Completed);
        assert_eq!(fetched.files, vec!["report.pdf"]);
    }

    #[tokio::test]
    async fn test_missing_collection() {
        let catalog = test_catalog().await;
        assert!(matches!(
            catalog.get(Uuid::new_v4()).await,
            Err(RagError::NotFound(_))
        ));
        assert!(matches!(
            catalog
                .set_status(Uuid::new_v4(), CollectionStatus::Error)
                .await,
            Err(RagError::NotFound(_))
        ));
    }
}
