// SQLite chat storage

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
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
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        metadata TEXT,
        turn_status TEXT NOT NULL DEFAULT 'idle'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at TEXT NOT NULL,
        metadata TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_messages_conversation_id ON messages(conversation_id)",
    "CREATE INDEX IF NOT EXISTS idx_conversations_updated_at ON conversations(updated_at)",
];

const CONVERSATION_COLUMNS: &str = "id, title, created_at, updated_at, metadata, turn_status";

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn connect(config: &DatabaseConfig) -> AppResult<Self> {
        // Every connection to `:memory:` is its own database
        let in_memory = config.url.contains(":memory:") || config.url.contains("mode=memory");

        let mut options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }
        let mut pool_options = SqlitePoolOptions::new();
        pool_options = if in_memory {
            pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options
                .max_connections(config.max_connections)
                .min_connections(config.min_connections)
        };

        let pool = pool_options.connect_with(options).await?;
        info!(url = %config.url, in_memory, "SQLite pool ready");
        Ok(Self { pool })
    }

    /// Fresh private database, schema included
    pub async fn in_memory() -> AppResult<Self> {
        let storage = Self::connect(&DatabaseConfig {
            backend: crate::config::DatabaseBackend::Sqlite,
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
        })
        .await?;
        storage.initialize().await?;
        Ok(storage)
    }

    /// Databases created before turn tracking lack the status column
    async fn ensure_turn_status_column(&self) -> AppResult<()> {
        let present: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info('conversations') WHERE name = 'turn_status'")
                .fetch_one(&self.pool)
                .await?;
        if present == 0 {
            info!("Adding turn_status column to conversations");
            sqlx::query("ALTER TABLE conversations ADD COLUMN turn_status TEXT NOT NULL DEFAULT 'idle'")
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}

fn encode_metadata(metadata: Option<&Value>) -> AppResult<Option<String>> {
    Ok(match metadata {
        Some(value) => Some(serde_json::to_string(value)?),
        None => None,
    })
}

fn decode_metadata(raw: Option<String>) -> AppResult<Option<Value>> {
    Ok(match raw {
        Some(text) if !text.is_empty() => Some(serde_json::from_str(&text)?),
        _ => None,
    })
}

fn conversation_from_row(row: &SqliteRow) -> AppResult<Conversation> {
    Ok(Conversation {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        metadata: decode_metadata(row.try_get("metadata")?)?,
        turn_status: row.try_get::<String, _>("turn_status")?.parse()?,
    })
}

fn message_from_row(row: &SqliteRow) -> AppResult<Message> {
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        role: row.try_get::<String, _>("role")?.parse()?,
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
        metadata: decode_metadata(row.try_get("metadata")?)?,
    })
}

#[async_trait]
impl ChatStorage for SqliteStorage {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn initialize(&self) -> AppResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        self.ensure_turn_status_column().await?;
        info!("SQLite schema ready");
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
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO conversations (id, title, created_at, updated_at, metadata, turn_status) VALUES (?, ?, ?, ?, ?, 'idle')",
        )
        .bind(id)
        .bind(title)
        .bind(now)
        .bind(now)
        .bind(encode_metadata(metadata.as_ref())?)
        .execute(&self.pool)
        .await?;

        debug!(conversation_id = %id, "Conversation created");
        Ok(Conversation {
            id: id.to_string(),
            title: title.map(String::from),
            created_at: now,
            updated_at: now,
            metadata,
            turn_status: TurnStatus::Idle,
        })
    }

    async fn get_conversation(&self, id: &str) -> AppResult<Option<Conversation>> {
        let row = sqlx::query(&format!("SELECT {} FROM conversations WHERE id = ?", CONVERSATION_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn list_conversations(&self, limit: i64, offset: i64) -> AppResult<Vec<Conversation>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM conversations ORDER BY updated_at DESC LIMIT ? OFFSET ?",
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
        let result = sqlx::query(
            "UPDATE conversations SET title = COALESCE(?, title), metadata = COALESCE(?, metadata), updated_at = ? WHERE id = ?",
        )
        .bind(title)
        .bind(encode_metadata(metadata.as_ref())?)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_conversation(id).await
    }

    async fn delete_conversation(&self, id: &str) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_turn_status(&self, id: &str, status: TurnStatus) -> AppResult<()> {
        let result = sqlx::query("UPDATE conversations SET turn_status = ? WHERE id = ?")
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
            "INSERT INTO conversations (id, created_at, updated_at, turn_status) VALUES (?, ?, ?, 'idle') \
             ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at",
        )
        .bind(conversation_id)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, role, content, created_at, metadata) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(role.as_str())
        .bind(content)
        .bind(now)
        .bind(encode_metadata(metadata.as_ref())?)
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
        // rowid breaks ties between messages written in the same instant
        let rows = sqlx::query(
            "SELECT id, conversation_id, role, content, created_at, metadata FROM ( \
                SELECT *, rowid AS seq FROM messages WHERE conversation_id = ? \
                ORDER BY created_at DESC, rowid DESC LIMIT ? \
             ) ORDER BY created_at ASC, seq ASC",
        )
        .bind(conversation_id)
        .bind(limit.unwrap_or(-1))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn delete_messages(&self, conversation_id: &str) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_appended_message_is_listed_last() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage.add_message("c1", MessageRole::User, "first", None).await.unwrap();
        let content = "Second message with unicode: naïve café ✓";
        let added = storage
            .add_message("c1", MessageRole::Assistant, content, Some(json!({"tools_used": ["tavily_search"]})))
            .await
            .unwrap();

        let messages = storage.get_messages("c1", None).await.unwrap();
        assert_eq!(messages.len(), 2);
        let last = messages.last().unwrap();
        assert_eq!(last.id, added.id);
        assert_eq!(last.content, content);
        assert_eq!(last.role, MessageRole::Assistant);
        assert_eq!(last.metadata, Some(json!({"tools_used": ["tavily_search"]})));

        // add_message created the conversation on the fly
        let conversation = storage.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(conversation.turn_status, TurnStatus::Idle);
    }

    #[tokio::test]
    async fn test_message_limit_keeps_most_recent() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        for i in 0..5 {
            storage
                .add_message("c1", MessageRole::User, &format!("m{}", i), None)
                .await
                .unwrap();
        }
        let recent: Vec<String> = storage
            .get_messages("c1", Some(2))
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(recent, vec!["m3", "m4"]);
    }

    #[tokio::test]
    async fn test_conversation_lifecycle() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage
            .create_conversation("a", None, Some(json!({"provider": "openai"})))
            .await
            .unwrap();
        storage.create_conversation("b", Some("Second"), None).await.unwrap();
        storage.add_message("a", MessageRole::User, "hello", None).await.unwrap();

        let listed: Vec<String> = storage
            .list_conversations(10, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(listed, vec!["a", "b"]);
        assert_eq!(storage.list_conversations(1, 1).await.unwrap()[0].id, "b");

        let title = storage.generate_title("a", "hello there").await.unwrap();
        assert_eq!(title, "hello there");
        let updated = storage.get_conversation("a").await.unwrap().unwrap();
        assert_eq!(updated.title.as_deref(), Some("hello there"));
        assert_eq!(updated.metadata, Some(json!({"provider": "openai"})));
        assert!(storage.update_conversation("missing", Some("x"), None).await.unwrap().is_none());

        storage.set_turn_status("a", TurnStatus::Failed).await.unwrap();
        assert_eq!(
            storage.get_conversation("a").await.unwrap().unwrap().turn_status,
            TurnStatus::Failed
        );
        assert!(storage.set_turn_status("missing", TurnStatus::Idle).await.is_err());

        assert!(storage.delete_conversation("a").await.unwrap());
        assert!(!storage.delete_conversation("a").await.unwrap());
        assert!(storage.get_messages("a", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_messages_counts_rows() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage.add_message("c", MessageRole::User, "q", None).await.unwrap();
        storage.add_message("c", MessageRole::Assistant, "a", None).await.unwrap();
        assert_eq!(storage.delete_messages("c").await.unwrap(), 2);
        assert!(storage.get_conversation("c").await.unwrap().is_some());
        storage.health_check().await.unwrap();
        assert_eq!(storage.backend_name(), "sqlite");
    }
}
