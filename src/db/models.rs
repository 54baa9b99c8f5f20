// Conversation and message records shared by both storage backends

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use crate::types::{AppError, LLMMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

impl FromStr for MessageRole {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "system" => Ok(MessageRole::System),
            other => Err(AppError::Internal(format!("Unknown message role: {}", other))),
        }
    }
}

/// Whether a turn is running on a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    #[default]
    Idle,
    InProgress,
    Failed,
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStatus::Idle => "idle",
            TurnStatus::InProgress => "in_progress",
            TurnStatus::Failed => "failed",
        }
    }
}

impl FromStr for TurnStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(TurnStatus::Idle),
            "in_progress" => Ok(TurnStatus::InProgress),
            "failed" => Ok(TurnStatus::Failed),
            other => Err(AppError::Internal(format!("Unknown turn status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: Option<Value>,
    pub turn_status: TurnStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub metadata: Option<Value>,
}

impl Message {
    /// History entry for an LLM request
    pub fn to_llm_message(&self) -> LLMMessage {
        LLMMessage::new(self.role.as_str(), self.content.as_str())
    }
}

/// Title derived from the opening message: first 50 characters, trimmed
pub fn make_title(first_message: &str) -> String {
    let mut title: String = first_message.chars().take(50).collect();
    title = title.trim().to_string();
    if first_message.chars().count() > 50 {
        title.push_str("...");
    }
    title
}
