//! Settings Module
//!
//! UI preferences persisted as a JSON file: the provider and model picked in
//! the browser, a custom system prompt and the research toggles. They seed
//! every chat request that leaves those fields out.

pub mod routes;
pub mod storage;

pub use routes::router;
pub use storage::SettingsStore;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::types::LLMProvider;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UiSettings {
    pub provider: LLMProvider,
    /// Empty means the provider's default model
    pub model: String,
    pub system_prompt: Option<String>,
    pub deep_research: bool,
    pub multi_agent: bool,
}

impl Default for UiSettings {
    fn default() -> Self {
        Self {
            provider: LLMProvider::OpenAI,
            model: String::new(),
            system_prompt: None,
            deep_research: false,
            multi_agent: true,
        }
    }
}

impl UiSettings {
    /// Settings before the user has saved anything
    pub fn from_config(config: &Config) -> Self {
        Self {
            provider: config.llm.default_provider,
            model: config.llm.default_model.clone().unwrap_or_default(),
            ..Self::default()
        }
    }

    pub fn model(&self) -> Option<&str> {
        Some(self.model.trim()).filter(|m| !m.is_empty())
    }

    pub fn apply(&mut self, update: UpdateSettingsRequest) {
        if let Some(provider) = update.provider {
            self.provider = provider;
        }
        if let Some(model) = update.model {
            self.model = model;
        }
        if let Some(prompt) = update.system_prompt {
            // An empty prompt resets to the built-in one
            self.system_prompt = Some(prompt).filter(|p| !p.trim().is_empty());
        }
        if let Some(deep_research) = update.deep_research {
            self.deep_research = deep_research;
        }
        if let Some(multi_agent) = update.multi_agent {
            self.multi_agent = multi_agent;
        }
    }
}

/// Partial update; absent fields keep their saved value
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateSettingsRequest {
    pub provider: Option<LLMProvider>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub deep_research: Option<bool>,
    pub multi_agent: Option<bool>,
}
