// Shared application state and HTTP request/response bodies

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use validator::Validate;

use crate::agents::TurnConfig;
use crate::config::Config;
use crate::db::{Conversation, Message, SharedStorage};
use crate::llm::LLM;
use crate::settings::SettingsStore;
use crate::types::{AppError, AppResult, LLMProvider, ModelInfo};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub storage: SharedStorage,
    pub settings: Arc<SettingsStore>,
    /// Fixed client for every turn instead of one built per provider
    pub llm_client: Option<LLM>,
}

impl AppState {
    pub fn new(config: Config, storage: SharedStorage) -> Self {
        let settings = SettingsStore::new(
            config.settings_file.clone(),
            crate::settings::UiSettings::from_config(&config),
        );
        Self {
            config: Arc::new(config),
            storage,
            settings: Arc::new(settings),
            llm_client: None,
        }
    }

    pub fn with_llm_client(mut self, llm: LLM) -> Self {
        self.llm_client = Some(llm);
        self
    }

    /// Client for a provider's default model, used for catalogue lookups
    pub fn llm_for_provider(&self, provider: LLMProvider) -> AppResult<LLM> {
        match &self.llm_client {
            Some(llm) => Ok(llm.clone()),
            None => LLM::from_config(&self.config.llm, provider, None),
        }
    }

    /// Provider client for a turn; a provider without a key is the caller's mistake
    pub fn llm_for(&self, turn: &TurnConfig) -> AppResult<LLM> {
        match &self.llm_client {
            Some(llm) => Ok(llm.with_model(turn.model.as_deref())),
            None => LLM::from_config(&self.config.llm, turn.provider, turn.model.clone())
                .map_err(|e| AppError::InvalidRequest(e.to_string())),
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct ChatRequest {
    #[validate(length(min = 1, max = 32000, message = "message must be 1-32000 characters"))]
    pub message: String,
    pub conversation_id: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    #[validate(length(max = 20000))]
    pub system_prompt: Option<String>,
    /// Replaces the planner's role preamble for this turn
    #[validate(length(max = 20000))]
    pub planner_system_prompt: Option<String>,
    pub deep_research: Option<bool>,
    pub multi_agent: Option<bool>,
    #[serde(default)]
    pub stream: bool,
    pub timezone: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
    pub conversation_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ListConversationsQuery {
    #[serde(default = "default_page_size")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_page_size() -> i64 {
    50
}

#[derive(Debug, Serialize)]
pub struct ConversationDetail {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub messages: Vec<Message>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateConversationRequest {
    #[validate(length(min = 1, max = 200))]
    pub title: Option<String>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    #[default]
    Basic,
    Deep,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SearchRequest {
    #[validate(length(min = 1, max = 2000))]
    pub query: String,
    #[serde(default)]
    pub search_type: SearchType,
    #[serde(default = "default_search_results")]
    #[validate(range(min = 1, max = 20))]
    pub max_results: usize,
}

fn default_search_results() -> usize {
    5
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub database: String,
}

#[derive(Debug, Serialize)]
pub struct ProviderInfo {
    pub name: String,
    pub available: bool,
    pub default_model: String,
    pub models: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub providers: Vec<ProviderInfo>,
    pub tavily_available: bool,
    pub serpapi_available: bool,
    pub search_available: bool,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub provider: String,
    pub models: Vec<ModelInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
