// PostgreSQL chat storage

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ChatStorage, Conversation, Message, MessageRole, TurnStatus};
use crate::config::DatabaseConfig;
use crate::types::{AppError, AppResult};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS conversations (
        id TEXT PRIMARY KEY,
        title TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        metadata JSONB,
        turn_status TEXT NOT NULL DEFAULT 'idle'
    )
    "#,
    "ALTER TABLE conversations ADD COLUMN IF NOT EXISTS turn_status TEXT NOT NULL DEFAULT 'idle'",
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        seq BIGSERIAL,
        conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        metadata JSONB
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_messages_conversation_id ON messages(conversation_id)",
    "CREATE INDEX IF NOT EXISTS idx_conversations_updated_at ON conversations(updated_at DESC)",
];

const CONVERSATION_COLUMNS: &str = "id, title, created_at, updated_at, metadata, turn_status";

pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub async fn connect(config: &DatabaseConfig) -> AppResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        // Test connection
        sqlx::query("SELECT 1").fetch_one(&pool).await?;

        info!(max_connections = config.max_connections, "PostgreSQL pool ready");
        Ok(Self { pool })
    }
}

fn conversation_from_row(row: &PgRow) -> AppResult<Conversation> {
    Ok(Conversation {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        metadata: row.try_get("metadata")?,
        turn_status: row.try_get::<String, _>("turn_status")?.parse()?,
    })
}

fn message_from_row(row: &PgRow) -> AppResult<Message> {
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        role: row.try_get::<String, _>("role")?.parse()?,
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
        metadata: row.try_get("metadata")?,
    })
}

#[async_trait]
impl ChatStorage for PostgresStorage {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn initialize(&self) -> AppResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("PostgreSQL schema ready");
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    async fn health_check(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    async fn create_conversation(&self, id: &str, title: Option<&str>, metadata: Option<Value>) -> AppResult<Conversation> {
        let row = sqlx::query(&format!(
            "INSERT INTO conversations (id, title, created_at, updated_at, metadata, turn_status) \
             VALUES ($1, $2, $3, $3, $4, 'idle') RETURNING {}",
            CONVERSATION_COLUMNS
        ))
        .bind(id)
        .bind(title)
        .bind(Utc::now())
        .bind(metadata)
        .fetch_one(&self.pool)
        .await?;

        debug!(conversation_id = %id, "Conversation created");
        conversation_from_row(&row)
    }

    async fn get_conversation(&self, id: &str) -> AppResult<Option<Conversation>> {
        let row = sqlx::query(&format!("SELECT {} FROM conversations WHERE id = $1", CONVERSATION_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn list_conversations(&self, limit: i64, offset: i64) -> AppResult<Vec<Conversation>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM conversations ORDER BY updated_at DESC LIMIT $1 OFFSET $2",
            CONVERSATION_COLUMNS
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(conversation_from_row).collect()
    }

    async fn update_conversation(
        &self,
        id: &str,
        title: Option<&str>,
        metadata: Option<Value>,
    ) -> AppResult<Option<Conversation>> {
        let row = sqlx::query(&format!(
            "UPDATE conversations SET title = COALESCE($1, title), metadata = COALESCE($2, metadata), \
             updated_at = $3 WHERE id = $4 RETURNING {}",
            CONVERSATION_COLUMNS
        ))
        .bind(title)
        .bind(metadata)
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn delete_conversation(&self, id: &str) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE conversation_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM conversations WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_turn_status(&self, id: &str, status: TurnStatus) -> AppResult<()> {
        let result = sqlx::query("UPDATE conversations SET turn_status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Conversation {}", id)));
        }
        Ok(())
    }

    async fn add_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
        metadata: Option<Value>,
    ) -> AppResult<Message> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO conversations (id, created_at, updated_at, turn_status) VALUES ($1, $2, $2, 'idle') \
             ON CONFLICT (id) DO UPDATE SET updated_at = EXCLUDED.updated_at",
        )
        .bind(conversation_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, role, content, created_at, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(role.as_str())
        .bind(content)
        .bind(now)
        .bind(&metadata)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Message {
            id,
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            created_at: now,
            metadata,
        })
    }

    async fn get_messages(&self, conversation_id: &str, limit: Option<i64>) -> AppResult<Vec<Message>> {
        // LIMIT NULL is no limit
        let rows = sqlx::query(
            "SELECT id, conversation_id, role, content, created_at, metadata FROM ( \
                SELECT * FROM messages WHERE conversation_id = $1 \
                ORDER BY created_at DESC, seq DESC LIMIT $2 \
             ) recent ORDER BY created_at ASC, seq ASC",
        )
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn delete_messages(&self, conversation_id: &str) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE conversation_id = $1")
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
