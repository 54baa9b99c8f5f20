//! Chat storage
//!
//! Conversations and their append-only messages behind [`ChatStorage`], with
//! two interchangeable backends picked by `DATABASE_BACKEND`. Both create their
//! schema on [`ChatStorage::initialize`]; queries are built at runtime so the
//! crate compiles without a live database.

pub mod models;
pub mod postgres;
pub mod sqlite;

pub use models::*;
pub use postgres::PostgresStorage;
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::config::{DatabaseBackend, DatabaseConfig};
use crate::types::AppResult;

#[async_trait]
pub trait ChatStorage: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Create tables and indexes if they do not exist
    async fn initialize(&self) -> AppResult<()>;

    async fn close(&self);

    async fn health_check(&self) -> AppResult<()>;

    async fn create_conversation(&self, id: &str, title: Option<&str>, metadata: Option<Value>) -> AppResult<Conversation>;

    async fn get_conversation(&self, id: &str) -> AppResult<Option<Conversation>>;

    /// Most recently updated first
    async fn list_conversations(&self, limit: i64, offset: i64) -> AppResult<Vec<Conversation>>;

    /// Only the given fields change; `None` on an unknown id
    async fn update_conversation(
        &self,
        id: &str,
        title: Option<&str>,
        metadata: Option<Value>,
    ) -> AppResult<Option<Conversation>>;

    /// Removes the conversation and its messages
    async fn delete_conversation(&self, id: &str) -> AppResult<bool>;

    async fn set_turn_status(&self, id: &str, status: TurnStatus) -> AppResult<()>;

    /// Append a message, creating the conversation if needed and touching `updated_at`
    async fn add_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
        metadata: Option<Value>,
    ) -> AppResult<Message>;

    /// Oldest first. With a limit, the most recent `limit` messages.
    async fn get_messages(&self, conversation_id: &str, limit: Option<i64>) -> AppResult<Vec<Message>>;

    async fn delete_messages(&self, conversation_id: &str) -> AppResult<u64>;

    async fn generate_title(&self, conversation_id: &str, first_message: &str) -> AppResult<String> {
        let title = make_title(first_message);
        self.update_conversation(conversation_id, Some(&title), None).await?;
        Ok(title)
    }
}

pub type SharedStorage = Arc<dyn ChatStorage>;

/// Connect the configured backend. The schema is not touched until `initialize`.
pub async fn create_storage(config: &DatabaseConfig) -> anyhow::Result<SharedStorage> {
    info!(backend = ?config.backend, "Connecting chat storage");
    let storage: SharedStorage = match config.backend {
        DatabaseBackend::Sqlite => Arc::new(SqliteStorage::connect(config).await?),
        DatabaseBackend::Postgres => Arc::new(PostgresStorage::connect(config).await?),
    };
    Ok(storage)
}
