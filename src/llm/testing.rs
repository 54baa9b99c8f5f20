// Scripted LLM adapter for unit tests

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::llm::provider::{ChunkStream, LLMAdapter, LLM};
use crate::types::{AppResult, Completion, LLMProvider, LLMRequest, LLMResponse, ModelInfo, ToolCall};
use crate::utils::retry::RetryPolicy;

type Handler = Box<dyn Fn(&LLMRequest) -> AppResult<Completion> + Send + Sync>;

pub struct FakeAdapter {
    handler: Handler,
    requests: Mutex<Vec<LLMRequest>>,
}

impl FakeAdapter {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&LLMRequest) -> AppResult<Completion> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Always answers with the same text
    pub fn text(reply: &str) -> Arc<Self> {
        let reply = reply.to_string();
        Self::new(move |_| Ok(final_answer(&reply)))
    }

    /// Replays the given outcomes in order, then answers with an empty string
    pub fn scripted(outcomes: Vec<AppResult<Completion>>) -> Arc<Self> {
        let queue = Mutex::new(VecDeque::from(outcomes));
        Self::new(move |_| {
            queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(final_answer("")))
        })
    }

    pub fn requests(&self) -> Vec<LLMRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn call(&self, request: &LLMRequest) -> AppResult<Completion> {
        self.requests.lock().unwrap().push(request.clone());
        (self.handler)(request)
    }
}

#[async_trait]
impl LLMAdapter for FakeAdapter {
    async fn create_chat_completion(&self, request: &LLMRequest) -> AppResult<LLMResponse> {
        match self.call(request)? {
            Completion::FinalAnswer(response) => Ok(response),
            Completion::ToolRequest { content, .. } => Ok(LLMResponse {
                content,
                ..Default::default()
            }),
        }
    }

    async fn create_chat_completion_with_tools(&self, request: &LLMRequest) -> AppResult<Completion> {
        self.call(request)
    }

    async fn create_chat_completion_stream(&self, request: &LLMRequest) -> AppResult<ChunkStream> {
        let text = self.create_chat_completion(request).await?.content;
        let chunks: Vec<AppResult<String>> = text
            .split_inclusive(' ')
            .map(|word| Ok(word.to_string()))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }

    async fn list_models(&self) -> AppResult<Vec<ModelInfo>> {
        Ok(vec![ModelInfo::new("fake-model", "Fake Model")])
    }
}

pub fn final_answer(text: &str) -> Completion {
    Completion::FinalAnswer(LLMResponse {
        content: text.to_string(),
        finish_reason: "stop".to_string(),
        ..Default::default()
    })
}

pub fn tool_request(calls: Vec<ToolCall>) -> Completion {
    Completion::ToolRequest {
        content: String::new(),
        calls,
    }
}

/// Client over a fake adapter with retries disabled
pub fn fake_llm(adapter: Arc<FakeAdapter>) -> LLM {
    LLM::from_adapter(adapter, LLMProvider::OpenAI, "fake-model").with_retry(RetryPolicy::none())
}

/// Text of the last user message in a request
pub fn last_user_text(request: &LLMRequest) -> String {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.clone())
        .unwrap_or_default()
}
