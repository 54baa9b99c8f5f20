use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use tracing::debug;

use crate::config::LLMConfig;
use crate::types::{AppError, AppResult, Completion, LLMMessage, LLMProvider, LLMRequest, LLMResponse, ModelInfo};
use crate::utils::retry::{with_retry, RetryPolicy};

pub type ChunkStream = BoxStream<'static, AppResult<String>>;

#[async_trait]
pub trait LLMAdapter: Send + Sync {
    async fn create_chat_completion(&self, request: &LLMRequest) -> AppResult<LLMResponse>;

    /// Completion that may answer with tool calls instead of text. Adapters
    /// without function calling ignore `request.tools`.
    async fn create_chat_completion_with_tools(&self, request: &LLMRequest) -> AppResult<Completion> {
        self.create_chat_completion(request).await.map(Completion::FinalAnswer)
    }

    async fn create_chat_completion_stream(&self, _request: &LLMRequest) -> AppResult<ChunkStream> {
        Err(AppError::llm_status("Streaming not supported by this adapter", 400))
    }

    /// Models the provider currently offers for chat
    async fn list_models(&self) -> AppResult<Vec<ModelInfo>> {
        Err(AppError::llm_status("Model listing not supported by this adapter", 400))
    }
}

/// Configuration for one provider client (renamed to avoid conflict with the LLMProvider enum)
#[derive(Debug, Clone)]
pub struct LLMProviderConfig {
    pub provider: LLMProvider,
    pub api_key: String,
    pub model: String,
    /// Overrides the provider's default endpoint (OpenRouter, proxies, tests)
    pub api_base: Option<String>,
}

/// Provider-agnostic client handed to every agent
#[derive(Clone)]
pub struct LLM {
    adapter: Arc<dyn LLMAdapter>,
    provider: LLMProvider,
    model: String,
    retry: RetryPolicy,
}

impl LLM {
    pub fn new(config: LLMProviderConfig) -> Self {
        let adapter: Arc<dyn LLMAdapter> = match config.provider {
            LLMProvider::OpenAI => Arc::new(match &config.api_base {
                Some(base) => crate::llm::openai::OpenAIAdapter::new_with_api_base(&config.api_key, base),
                None => crate::llm::openai::OpenAIAdapter::new(&config.api_key),
            }),
            LLMProvider::Anthropic => Arc::new(match &config.api_base {
                Some(base) => crate::llm::anthropic::AnthropicAdapter::new_with_api_base(&config.api_key, base),
                None => crate::llm::anthropic::AnthropicAdapter::new(&config.api_key),
            }),
            LLMProvider::OpenRouter => Arc::new(crate::llm::openrouter::OpenRouterAdapter::new(
                &config.api_key,
                config.api_base.as_deref(),
            )),
        };

        Self {
            adapter,
            provider: config.provider,
            model: config.model,
            retry: RetryPolicy::default(),
        }
    }

    /// Build a client from the service configuration; fails when the provider has no key
    pub fn from_config(config: &LLMConfig, provider: LLMProvider, model: Option<String>) -> AppResult<Self> {
        let api_key = config
            .api_key(provider)
            .ok_or_else(|| AppError::Config(format!("{} API key not configured", provider)))?;
        let api_base = match provider {
            LLMProvider::OpenRouter => Some(config.openrouter_base_url.clone()),
            _ => None,
        };

        Ok(Self::new(LLMProviderConfig {
            provider,
            api_key,
            model: model.unwrap_or_else(|| config.model_for(provider)),
            api_base,
        }))
    }

    pub fn from_adapter(adapter: Arc<dyn LLMAdapter>, provider: LLMProvider, model: impl Into<String>) -> Self {
        Self {
            adapter,
            provider,
            model: model.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Same provider and credentials, different model
    pub fn with_model(&self, model: Option<&str>) -> Self {
        match model {
            Some(m) if !m.is_empty() => Self {
                model: m.to_string(),
                ..self.clone()
            },
            _ => self.clone(),
        }
    }

    pub fn provider(&self) -> LLMProvider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Request pre-filled with this client's provider and model
    pub fn request(&self, messages: Vec<LLMMessage>) -> LLMRequest {
        LLMRequest::new(self.provider.to_string(), self.model.clone(), messages)
    }

    pub async fn create_chat_completion(&self, request: &LLMRequest) -> AppResult<LLMResponse> {
        debug!(provider = %self.provider, model = %request.model, messages = request.messages.len(), "LLM completion");
        with_retry(self.retry, || self.adapter.create_chat_completion(request)).await
    }

    pub async fn create_chat_completion_with_tools(&self, request: &LLMRequest) -> AppResult<Completion> {
        debug!(provider = %self.provider, model = %request.model, tools = request.tools.len(), "LLM completion with tools");
        with_retry(self.retry, || self.adapter.create_chat_completion_with_tools(request)).await
    }

    pub async fn create_chat_completion_stream(&self, request: &LLMRequest) -> AppResult<ChunkStream> {
        debug!(provider = %self.provider, model = %request.model, "LLM streaming completion");
        with_retry(self.retry, || self.adapter.create_chat_completion_stream(request)).await
    }

    pub async fn list_models(&self) -> AppResult<Vec<ModelInfo>> {
        debug!(provider = %self.provider, "Listing provider models");
        with_retry(self.retry, || self.adapter.list_models()).await
    }

    /// Single-prompt helper used by the classifier, planner and deep search
    pub async fn prompt(&self, prompt: &str, temperature: f32, max_tokens: u32) -> AppResult<String> {
        let request = self
            .request(vec![LLMMessage::user(prompt)])
            .with_temperature(temperature)
            .with_max_tokens(max_tokens);
        Ok(self.create_chat_completion(&request).await?.content)
    }
}

impl std::fmt::Debug for LLM {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LLM")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .finish()
    }
}
