// OpenAI chat completions adapter
// Also serves any OpenAI-compatible endpoint via `new_with_api_base` (OpenRouter, proxies)

use crate::llm::provider::{ChunkStream, LLMAdapter};
use crate::types::{AppError, AppResult, Completion, LLMMessage, LLMRequest, LLMResponse, ModelInfo, TokenUsage, ToolCall};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{future, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// Catalogue entries that are not chat models
const EXCLUDED_MODEL_PREFIXES: &[&str] = &[
    "text-embedding",
    "embedding",
    "tts",
    "whisper",
    "dall-e",
    "davinci",
    "babbage",
    "curie",
    "ada",
    "moderation",
    "code-",
    "text-search",
    "text-similarity",
    "ft:",
    "ft-",
];
const CHAT_MODEL_MARKERS: &[&str] = &["gpt-", "o1", "o3", "o4", "chatgpt"];

pub struct OpenAIAdapter {
    client: Client,
    api_key: String,
    api_base: String,
    extra_headers: Vec<(String, String)>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    kind: String,
    function: WireFunction,
}

#[derive(Serialize, Deserialize)]
struct WireFunction {
    name: String,
    /// JSON-encoded arguments object
    arguments: String,
}

#[derive(Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireToolDef,
}

#[derive(Serialize)]
struct WireToolDef {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct ModelList<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

#[derive(Deserialize)]
struct OpenAIModel {
    id: String,
}

fn function_type() -> String {
    "function".to_string()
}

impl OpenAIAdapter {
    pub fn new(api_key: &str) -> Self {
        Self::new_with_api_base(api_key, OPENAI_API_BASE)
    }

    pub fn new_with_api_base(api_key: &str, api_base: &str) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
            extra_headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.extra_headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Reasoning models reject `max_tokens` and any non-default temperature
    fn is_reasoning_model(model: &str) -> bool {
        let model = model.rsplit('/').next().unwrap_or(model).to_lowercase();
        model.starts_with("o1") || model.starts_with("o3") || model.starts_with("o4") || model.starts_with("gpt-5")
    }

    fn convert_message(msg: &LLMMessage) -> WireMessage {
        WireMessage {
            role: msg.role.clone(),
            content: if msg.content.is_empty() && !msg.tool_calls.is_empty() {
                None
            } else {
                Some(msg.content.clone())
            },
            tool_calls: msg
                .tool_calls
                .iter()
                .map(|call| WireToolCall {
                    id: call.id.clone(),
                    kind: function_type(),
                    function: WireFunction {
                        name: call.name.clone(),
                        arguments: call.arguments.to_string(),
                    },
                })
                .collect(),
            tool_call_id: msg.tool_call_id.clone(),
        }
    }

    fn build_body<'a>(request: &'a LLMRequest, stream: bool) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system_instruction {
            messages.push(WireMessage {
                role: "system".to_string(),
                content: Some(system.clone()),
                tool_calls: Vec::new(),
                tool_call_id: None,
            });
        }
        messages.extend(request.messages.iter().map(Self::convert_message));

        let reasoning = Self::is_reasoning_model(&request.model);
        ChatRequest {
            model: &request.model,
            messages,
            max_tokens: if reasoning { None } else { request.max_tokens },
            max_completion_tokens: if reasoning { request.max_tokens } else { None },
            temperature: if reasoning { None } else { request.temperature },
            tools: request
                .tools
                .iter()
                .map(|t| WireTool {
                    kind: "function",
                    function: WireToolDef {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    },
                })
                .collect(),
            stream,
        }
    }

    async fn send(&self, body: &ChatRequest<'_>) -> AppResult<reqwest::Response> {
        let url = format!("{}/chat/completions", self.api_base);
        let mut builder = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body);
        for (name, value) in &self.extra_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| AppError::llm(format!("OpenAI request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::llm_status(
                format!("OpenAI API error ({}): {}", status, error_text),
                status.as_u16(),
            ));
        }
        Ok(response)
    }

    /// GET against the API base with the same auth and headers as completions
    pub(crate) async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> AppResult<T> {
        let url = format!("{}{}", self.api_base, path);
        let mut builder = self.client.get(&url).bearer_auth(&self.api_key);
        for (name, value) in &self.extra_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| AppError::llm(format!("Request to {} failed: {}", path, e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::llm_status(format!("API error: {}", status.as_u16()), status.as_u16()));
        }
        response
            .json()
            .await
            .map_err(|e| AppError::llm(format!("Failed to parse {} response: {}", path, e)))
    }

    async fn complete(&self, request: &LLMRequest) -> AppResult<(LLMResponse, Vec<ToolCall>)> {
        let body = Self::build_body(request, false);
        let response: ChatResponse = self
            .send(&body)
            .await?
            .json()
            .await
            .map_err(|e| AppError::llm(format!("Failed to parse OpenAI response: {}", e)))?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AppError::llm_status("OpenAI returned no choices", 502))?;

        let calls = choice
            .message
            .tool_calls
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.function.name,
                arguments: serde_json::from_str(&call.function.arguments)
                    .unwrap_or(Value::String(call.function.arguments)),
            })
            .collect();

        let usage = response
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        Ok((
            LLMResponse {
                content: choice.message.content.unwrap_or_default(),
                finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
                usage,
            },
            calls,
        ))
    }
}

fn is_chat_model(id: &str) -> bool {
    let id = id.to_lowercase();
    !EXCLUDED_MODEL_PREFIXES.iter().any(|p| id.starts_with(p)) && CHAT_MODEL_MARKERS.iter().any(|m| id.contains(m))
}

/// Newer families first: o3, o1, gpt-4.1, gpt-4o, gpt-4.5, other gpt-4, gpt-3
fn model_rank(id: &str) -> u8 {
    let id = id.to_lowercase();
    if id.starts_with("o3") {
        0
    } else if id.starts_with("o1") {
        1
    } else if id.contains("4.1") || id.contains("4-1") {
        2
    } else if id.contains("4o") || id.contains("4-o") {
        3
    } else if id.contains("4.5") {
        4
    } else if id.starts_with("gpt-4") {
        5
    } else if id.starts_with("gpt-3") {
        6
    } else {
        7
    }
}

/// Content delta carried by one SSE `data:` payload, if any
fn parse_stream_delta(data: &str) -> AppResult<Option<String>> {
    let chunk: StreamChunk = serde_json::from_str(data)
        .map_err(|e| AppError::llm(format!("Malformed OpenAI stream chunk: {}", e)))?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|c| !c.is_empty()))
}

#[async_trait]
impl LLMAdapter for OpenAIAdapter {
    async fn create_chat_completion(&self, request: &LLMRequest) -> AppResult<LLMResponse> {
        self.complete(request).await.map(|(response, _)| response)
    }

    async fn create_chat_completion_with_tools(&self, request: &LLMRequest) -> AppResult<Completion> {
        let (response, calls) = self.complete(request).await?;
        if calls.is_empty() {
            Ok(Completion::FinalAnswer(response))
        } else {
            Ok(Completion::ToolRequest {
                content: response.content,
                calls,
            })
        }
    }

    async fn create_chat_completion_stream(&self, request: &LLMRequest) -> AppResult<ChunkStream> {
        let body = Self::build_body(request, true);
        let response = self.send(&body).await?;

        let stream = response
            .bytes_stream()
            .eventsource()
            .take_while(|event| future::ready(!matches!(event, Ok(e) if e.data.trim() == "[DONE]")))
            .filter_map(|event| async move {
                match event {
                    Ok(e) => parse_stream_delta(&e.data).transpose(),
                    Err(e) => Some(Err(AppError::llm(format!("OpenAI stream error: {}", e)))),
                }
            })
            .boxed();

        Ok(stream)
    }

    async fn list_models(&self) -> AppResult<Vec<ModelInfo>> {
        let list: ModelList<OpenAIModel> = self.get_json("/models").await?;
        let mut models: Vec<ModelInfo> = list
            .data
            .into_iter()
            .filter(|m| is_chat_model(&m.id))
            .map(|m| ModelInfo::new(m.id.clone(), m.id))
            .collect();
        models.sort_by(|a, b| (model_rank(&a.id), a.id.to_lowercase()).cmp(&(model_rank(&b.id), b.id.to_lowercase())));
        Ok(models)
    }
}
