// OpenRouter adapter
// OpenRouter speaks the OpenAI chat completions dialect, so this wraps OpenAIAdapter

use crate::llm::openai::ModelList;
use crate::llm::provider::{ChunkStream, LLMAdapter};
use crate::types::{AppResult, Completion, LLMRequest, LLMResponse, ModelInfo, ModelPricing};
use async_trait::async_trait;
use serde::Deserialize;

const OPENROUTER_API_BASE: &str = "https://openrouter.ai/api/v1";

#[derive(Deserialize)]
struct OpenRouterModel {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    context_length: Option<u64>,
    #[serde(default)]
    pricing: Option<ModelPricing>,
}

pub struct OpenRouterAdapter {
    inner: crate::llm::openai::OpenAIAdapter,
}

impl OpenRouterAdapter {
    pub fn new(api_key: &str, api_base: Option<&str>) -> Self {
        let inner = crate::llm::openai::OpenAIAdapter::new_with_api_base(
            api_key,
            api_base.unwrap_or(OPENROUTER_API_BASE),
        )
        .with_header("X-Title", "Research Chat");
        Self { inner }
    }
}

#[async_trait]
impl LLMAdapter for OpenRouterAdapter {
    async fn create_chat_completion(&self, request: &LLMRequest) -> AppResult<LLMResponse> {
        self.inner.create_chat_completion(request).await
    }

    async fn create_chat_completion_with_tools(&self, request: &LLMRequest) -> AppResult<Completion> {
        self.inner.create_chat_completion_with_tools(request).await
    }

    async fn create_chat_completion_stream(&self, request: &LLMRequest) -> AppResult<ChunkStream> {
        self.inner.create_chat_completion_stream(request).await
    }

    async fn list_models(&self) -> AppResult<Vec<ModelInfo>> {
        let list: ModelList<OpenRouterModel> = self.inner.get_json("/models").await?;
        let mut models: Vec<ModelInfo> = list
            .data
            .into_iter()
            .map(|m| ModelInfo {
                name: m.name.unwrap_or_else(|| m.id.clone()),
                id: m.id,
                description: m.description,
                context_length: m.context_length,
                pricing: m.pricing,
            })
            .collect();
        models.sort_by_key(|m| m.name.to_lowercase());
        Ok(models)
    }
}
