//! Conversation state: sessions and their message log
//!
//! Append-only per-session log with token accounting and windowed
//! transcripts for prompt history. Deleting a session cascades to its
//! messages.

use crate::error::{RagError, Result};
use crate::llm::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqlitePool, Row};
use tracing::{debug, info};
use utoipa::ToSchema;
use uuid::Uuid;

/// Message intent within a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Question,
    Answer,
    FollowUp,
    System,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Question => "question",
            Self::Answer => "answer",
            Self::FollowUp => "follow_up",
            Self::System => "system",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "question" => Ok(Self::Question),
            "answer" => Ok(Self::Answer),
            "follow_up" => Ok(Self::FollowUp),
            "system" => Ok(Self::System),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

/// A conversation session
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ConversationSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub collection_id: Uuid,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// A message within a session
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ConversationMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: Role,
    pub message_type: MessageType,
    pub content: String,
    pub token_count: Option<u32>,
    pub execution_time: Option<f64>,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Store over the conversation tables
#[derive(Clone)]
pub struct ConversationStore {
    pool: SqlitePool,
}

impl ConversationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn initialize(&self) -> Result<()> {
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversation_sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                collection_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversation_messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL
                    REFERENCES conversation_sessions(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                message_type TEXT NOT NULL,
                content TEXT NOT NULL,
                token_count INTEGER,
                execution_time REAL,
                metadata TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_session ON conversation_messages(session_id, created_at)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Open a new session
    pub async fn create_session(&self, user_id: Uuid, collection_id: Uuid) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO conversation_sessions (id, user_id, collection_id, status, created_at) VALUES (?1, ?2, ?3, 'active', ?4)",
        )
        .bind(id.to_string())
        .bind(user_id.to_string())
        .bind(collection_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        info!("Created conversation session {}", id);
        Ok(id)
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<ConversationSession> {
        let row = sqlx::query("SELECT * FROM conversation_sessions WHERE id = ?1")
            .bind(session_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        let row = row.ok_or_else(|| RagError::NotFound(format!("session {session_id}")))?;
        let id: String = row.get("id");
        let user_id: String = row.get("user_id");
        let collection_id: String = row.get("collection_id");
        let created_at: String = row.get("created_at");

        Ok(ConversationSession {
            id: Uuid::parse_str(&id).map_err(|e| RagError::Validation(e.to_string()))?,
            user_id: Uuid::parse_str(&user_id).map_err(|e| RagError::Validation(e.to_string()))?,
            collection_id: Uuid::parse_str(&collection_id)
                .map_err(|e| RagError::Validation(e.to_string()))?,
            status: row.get("status"),
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| RagError::Validation(e.to_string()))?
                .with_timezone(&Utc),
        })
    }

    /// Append a message to a session
    #[allow(clippy::too_many_arguments)]
    pub async fn append_message(
        &self,
        session_id: Uuid,
        role: Role,
        message_type: MessageType,
        content: &str,
        token_count: Option<u32>,
        execution_time: Option<f64>,
        metadata: Option<Value>,
    ) -> Result<Uuid> {
        // Messages must reference an existing session.
        self.get_session(session_id).await?;

        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO conversation_messages
                (id, session_id, role, message_type, content, token_count, execution_time, metadata, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(id.to_string())
        .bind(session_id.to_string())
        .bind(role.to_string())
        .bind(message_type.to_string())
        .bind(content)
        .bind(token_count.map(|t| t as i64))
        .bind(execution_time)
        .bind(metadata.map(|m| m.to_string()))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!("Appended {} message to session {}", role, session_id);
        Ok(id)
    }

    /// The most recent `count` messages, in chronological order
    pub async fn recent_messages(
        &self,
        session_id: Uuid,
        count: usize,
    ) -> Result<Vec<ConversationMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM conversation_messages
            WHERE session_id = ?1
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?2
            "#,
        )
        .bind(session_id.to_string())
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut messages: Vec<ConversationMessage> =
            rows.into_iter().map(row_to_message).collect::<Result<_>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// Total tokens recorded across a session's messages
    pub async fn token_usage(&self, session_id: Uuid) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(token_count), 0) AS total FROM conversation_messages WHERE session_id = ?1",
        )
        .bind(session_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.get("total");
        Ok(total.max(0) as u64)
    }

    /// Delete a session; messages cascade
    pub async fn delete_session(&self, session_id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM conversation_sessions WHERE id = ?1")
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RagError::NotFound(format!("session {session_id}")));
        }
        info!("Deleted session {} and its messages", session_id);
        Ok(())
    }

    /// A windowed transcript for prompt history
    ///
    /// At most `max_turns` most-recent turns and `max_tokens` total
    /// tokens (counted with the shared tokenizer when a message carries
    /// no stored count), rendered oldest-first as `role: content` lines.
    pub async fn windowed_transcript(
        &self,
        session_id: Uuid,
        max_turns: usize,
        max_tokens: usize,
    ) -> Result<String> {
        let messages = self.recent_messages(session_id, max_turns * 2).await?;

        let mut lines: Vec<String> = Vec::new();
        let mut budget = max_tokens;
        // Walk newest-first so the budget keeps the most recent turns.
        for message in messages.iter().rev() {
            let tokens = message
                .token_count
                .map(|t| t as usize)
                .unwrap_or_else(|| crate::chunking::count_tokens(&message.content));
            if tokens > budget {
                break;
            }
            budget -= tokens;
            lines.push(format!("{}: {}", message.role, message.content));
        }
        lines.reverse();
        Ok(lines.join("\n"))
    }
}

fn row_to_message(row: sqlx::sqlite::SqliteRow) -> Result<ConversationMessage> {
    let id: String = row.get("id");
    let session_id: String = row.get("session_id");
    let role: String = row.get("role");
    let message_type: String = row.get("message_type");
    let token_count: Option<i64> = row.get("token_count");
    let metadata: Option<String> = row.get("metadata");
    let created_at: String = row.get("created_at");

    Ok(ConversationMessage {
        id: Uuid::parse_str(&id).map_err(|e| RagError::Validation(e.to_string()))?,
        session_id: Uuid::parse_str(&session_id)
            .map_err(|e| RagError::Validation(e.to_string()))?,
        role: role.parse().map_err(|e: String| RagError::Validation(e))?,
        message_type: message_type
            .parse()
            .map_err(|e: String| RagError::Validation(e))?,
        content: row.get("content"),
        token_count: token_count.map(|t| t as u32),
        execution_time: row.get("execution_time"),
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| RagError::Validation(e.to_string()))?
            .with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> ConversationStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = ConversationStore::new(pool);
        store.initialize().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let store = test_store().await;
        let session = store
            .create_session(Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap();

        store
            .append_message(
                session,
                Role::User,
                MessageType::Question,
                "Who created Python?",
                Some(5),
                None,
                None,
            )
            .await
            .unwrap();
        store
            .append_message(
                session,
                Role::Assistant,
                MessageType::Answer,
                "Guido van Rossum.",
                Some(6),
                Some(0.4),
                None,
            )
            .await
            .unwrap();

        let messages = store.recent_messages(session, 10).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);

        assert_eq!(store.token_usage(session).await.unwrap(), 11);

        store.delete_session(session).await.unwrap();
        assert!(store.recent_messages(session, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_message_requires_session() {
        let store = test_store().await;
        let result = store
            .append_message(
                Uuid::new_v4(),
                Role::User,
                MessageType::Question,
                "orphan",
                None,
                None,
                None,
            )
            .await;
        assert!(matches!(result, Err(RagError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_token_usage_matches_sum() {
        let store = test_store().await;
        let session = store
            .create_session(Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap();

        let counts = [3u32, 7, 11];
        for (i, count) in counts.iter().enumerate() {
            store
                .append_message(
                    session,
                    Role::User,
                    MessageType::Question,
                    &format!("message {i}"),
                    Some(*count),
                    None,
                    None,
                )
                .await
                .unwrap();
        }

        assert_eq!(
            store.token_usage(session).await.unwrap(),
            counts.iter().map(|c| *c as u64).sum::<u64>()
        );
    }

    #[tokio::test]
    async fn test_windowed_transcript_budget() {
        let store = test_store().await;
        let session = store
            .create_session(Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap();

        for i in 0..4 {
            store
                .append_message(
                    session,
                    if i % 2 == 0 { Role::User } else { Role::Assistant },
                    if i % 2 == 0 {
                        MessageType::Question
                    } else {
                        MessageType::Answer
                    },
                    &format!("turn number {i}"),
                    Some(10),
                    None,
                    None,
                )
                .await
                .unwrap();
        }

        // Budget fits only the last two messages.
        let transcript = store.windowed_transcript(session, 4, 20).await.unwrap();
        let lines: Vec<&str> = transcript.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("turn number 2"));
        assert!(lines[1].contains("turn number 3"));
    }
}
