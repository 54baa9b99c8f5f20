// Anthropic Messages API adapter
// System prompts travel outside the message list and tool results are user-role content blocks

use crate::llm::provider::{ChunkStream, LLMAdapter};
use crate::types::{AppError, AppResult, Completion, LLMRequest, LLMResponse, ModelInfo, TokenUsage, ToolCall};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{future, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const CONTEXT_WINDOW: u64 = 200_000;

/// Served when the models endpoint refuses the key or is unavailable
const KNOWN_MODELS: &[(&str, &str)] = &[
    ("claude-sonnet-4-20250514", "Claude Sonnet 4"),
    ("claude-3-5-sonnet-20241022", "Claude 3.5 Sonnet"),
    ("claude-3-5-haiku-20241022", "Claude 3.5 Haiku"),
    ("claude-3-opus-20240229", "Claude 3 Opus"),
    ("claude-3-sonnet-20240229", "Claude 3 Sonnet"),
    ("claude-3-haiku-20240307", "Claude 3 Haiku"),
];

pub struct AnthropicAdapter {
    client: Client,
    api_key: String,
    api_base: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Deserialize)]
struct ModelPage {
    #[serde(default)]
    data: Vec<AnthropicModel>,
}

#[derive(Deserialize)]
struct AnthropicModel {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    context_window: Option<u64>,
}

#[derive(Deserialize)]
struct StreamDelta {
    delta: DeltaBody,
}

#[derive(Deserialize)]
struct DeltaBody {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicAdapter {
    pub fn new(api_key: &str) -> Self {
        Self::new_with_api_base(api_key, ANTHROPIC_API_BASE)
    }

    pub fn new_with_api_base(api_key: &str, api_base: &str) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    /// Split out system text and convert the rest to Anthropic message objects.
    /// Consecutive tool results are merged into one user turn.
    fn convert_messages(request: &LLMRequest) -> (Option<String>, Vec<Value>) {
        let mut system_parts: Vec<String> = request.system_instruction.iter().cloned().collect();
        let mut messages: Vec<Value> = Vec::new();

        for msg in &request.messages {
            match msg.role.as_str() {
                "system" => system_parts.push(msg.content.clone()),
                "tool" => {
                    let block = json!({
                        "type": "tool_result",
                        "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                        "content": msg.content,
                    });
                    let merged = messages.last_mut().and_then(|last| {
                        let is_tool_turn = last["role"] == "user"
                            && last["content"]
                                .as_array()
                                .map(|blocks| blocks.iter().all(|b| b["type"] == "tool_result"))
                                .unwrap_or(false);
                        if is_tool_turn {
                            last["content"].as_array_mut()
                        } else {
                            None
                        }
                    });
                    match merged {
                        Some(blocks) => blocks.push(block),
                        None => messages.push(json!({"role": "user", "content": [block]})),
                    }
                }
                "assistant" if !msg.tool_calls.is_empty() => {
                    let mut blocks = Vec::new();
                    if !msg.content.is_empty() {
                        blocks.push(json!({"type": "text", "text": msg.content}));
                    }
                    for call in &msg.tool_calls {
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.name,
                            "input": call.arguments,
                        }));
                    }
                    messages.push(json!({"role": "assistant", "content": blocks}));
                }
                role => messages.push(json!({"role": role, "content": msg.content})),
            }
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };
        (system, messages)
    }

    fn build_body(request: &LLMRequest, stream: bool) -> Value {
        let (system, messages) = Self::convert_messages(request);
        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": stream,
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|t| json!({"name": t.name, "description": t.description, "input_schema": t.parameters}))
                .collect();
        }
        body
    }

    async fn send(&self, body: &Value) -> AppResult<reqwest::Response> {
        let url = format!("{}/messages", self.api_base);
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| AppError::llm(format!("Anthropic request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::llm_status(
                format!("Anthropic API error ({}): {}", status, error_text),
                status.as_u16(),
            ));
        }
        Ok(response)
    }

    async fn complete(&self, request: &LLMRequest) -> AppResult<Completion> {
        let body = Self::build_body(request, false);
        let response: MessagesResponse = self
            .send(&body)
            .await?
            .json()
            .await
            .map_err(|e| AppError::llm(format!("Failed to parse Anthropic response: {}", e)))?;

        let mut text = String::new();
        let mut calls = Vec::new();
        for block in response.content {
            match block {
                ContentBlock::Text { text: t } => text.push_str(&t),
                ContentBlock::ToolUse { id, name, input } => calls.push(ToolCall {
                    id,
                    name,
                    arguments: input,
                }),
                ContentBlock::Other => {}
            }
        }

        if !calls.is_empty() {
            return Ok(Completion::ToolRequest { content: text, calls });
        }

        let usage = response
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.input_tokens,
                completion_tokens: u.output_tokens,
                total_tokens: u.input_tokens + u.output_tokens,
            })
            .unwrap_or_default();

        Ok(Completion::FinalAnswer(LLMResponse {
            content: text,
            finish_reason: response.stop_reason.unwrap_or_else(|| "end_turn".to_string()),
            usage,
        }))
    }
}

fn known_models() -> Vec<ModelInfo> {
    KNOWN_MODELS
        .iter()
        .map(|(id, name)| ModelInfo {
            context_length: Some(CONTEXT_WINDOW),
            ..ModelInfo::new(*id, *name)
        })
        .collect()
}

fn parse_stream_event(event: &str, data: &str) -> AppResult<Option<String>> {
    match event {
        "content_block_delta" => {
            let delta: StreamDelta = serde_json::from_str(data)
                .map_err(|e| AppError::llm(format!("Malformed Anthropic stream chunk: {}", e)))?;
            if delta.delta.kind == "text_delta" {
                Ok(delta.delta.text.filter(|t| !t.is_empty()))
            } else {
                Ok(None)
            }
        }
        "error" => Err(AppError::llm(format!("Anthropic stream error: {}", data))),
        _ => Ok(None),
    }
}

#[async_trait]
impl LLMAdapter for AnthropicAdapter {
    async fn create_chat_completion(&self, request: &LLMRequest) -> AppResult<LLMResponse> {
        match self.complete(request).await? {
            Completion::FinalAnswer(response) => Ok(response),
            Completion::ToolRequest { content, .. } => Ok(LLMResponse {
                content,
                finish_reason: "tool_use".to_string(),
                usage: TokenUsage::default(),
            }),
        }
    }

    async fn create_chat_completion_with_tools(&self, request: &LLMRequest) -> AppResult<Completion> {
        self.complete(request).await
    }

    async fn create_chat_completion_stream(&self, request: &LLMRequest) -> AppResult<ChunkStream> {
        let body = Self::build_body(request, true);
        let response = self.send(&body).await?;

        let stream = response
            .bytes_stream()
            .eventsource()
            .take_while(|event| future::ready(!matches!(event, Ok(e) if e.event == "message_stop")))
            .filter_map(|event| async move {
                match event {
                    Ok(e) => parse_stream_event(&e.event, &e.data).transpose(),
                    Err(e) => Some(Err(AppError::llm(format!("Anthropic stream error: {}", e)))),
                }
            })
            .boxed();

        Ok(stream)
    }

    async fn list_models(&self) -> AppResult<Vec<ModelInfo>> {
        let url = format!("{}/models", self.api_base);
        let response = self
            .client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await
            .map_err(|e| AppError::llm(format!("Anthropic request failed: {}", e)))?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "Anthropic models endpoint refused, serving known models");
            return Ok(known_models());
        }

        let page: ModelPage = response
            .json()
            .await
            .map_err(|e| AppError::llm(format!("Failed to parse Anthropic models: {}", e)))?;
        Ok(page
            .data
            .into_iter()
            .map(|m| ModelInfo {
                name: m.display_name.unwrap_or_else(|| m.id.clone()),
                id: m.id,
                description: None,
                context_length: m.context_window,
                pricing: None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LLMMessage, ToolSpec};

    #[test]
    fn test_system_prompt_is_separate() {
        let req = LLMRequest::new(
            "anthropic",
            "claude-sonnet-4-20250514",
            vec![LLMMessage::system("extra rules"), LLMMessage::user("hi")],
        )
        .with_system("be brief");
        let body = AnthropicAdapter::build_body(&req, false);
        assert_eq!(body["system"], "be brief\n\nextra rules");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["max_tokens"], 4096);
    }

    #[test]
    fn test_tool_round_trip_shape() {
        let call = ToolCall {
            id: "tu_1".into(),
            name: "search".into(),
            arguments: json!({"query": "rust"}),
        };
        let call2 = ToolCall {
            id: "tu_2".into(),
            name: "search".into(),
            arguments: json!({"query": "tokio"}),
        };
        let req = LLMRequest::new(
            "anthropic",
            "claude",
            vec![
                LLMMessage::user("q"),
                LLMMessage::assistant_tool_calls("", vec![call, call2]),
                LLMMessage::tool_result("tu_1", "r1"),
                LLMMessage::tool_result("tu_2", "r2"),
            ],
        )
        .with_tools(vec![ToolSpec {
            name: "search".into(),
            description: "web".into(),
            parameters: json!({"type": "object"}),
        }]);
        let body = AnthropicAdapter::build_body(&req, false);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["content"][0]["type"], "tool_use");
        assert_eq!(messages[2]["content"].as_array().unwrap().len(), 2);
        assert_eq!(messages[2]["content"][1]["tool_use_id"], "tu_2");
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
    }

    #[test]
    fn test_parse_stream_event() {
        let data = r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#;
        assert_eq!(parse_stream_event("content_block_delta", data).unwrap().as_deref(), Some("Hi"));
        assert_eq!(parse_stream_event("ping", "{}").unwrap(), None);
        assert!(parse_stream_event("error", r#"{"type":"overloaded_error"}"#).is_err());
    }

    #[tokio::test]
    async fn test_tool_use_response() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/messages")
            .match_header("x-api-key", "ak")
            .match_header("anthropic-version", ANTHROPIC_VERSION)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "content": [
                        {"type": "text", "text": "Let me search."},
                        {"type": "tool_use", "id": "tu_1", "name": "search", "input": {"query": "x"}}
                    ],
                    "stop_reason": "tool_use",
                    "usage": {"input_tokens": 10, "output_tokens": 4}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let adapter = AnthropicAdapter::new_with_api_base("ak", &server.url());
        let req = LLMRequest::new("anthropic", "claude", vec![LLMMessage::user("q")]);
        match adapter.create_chat_completion_with_tools(&req).await.unwrap() {
            Completion::ToolRequest { content, calls } => {
                assert_eq!(content, "Let me search.");
                assert_eq!(calls[0].arguments, json!({"query": "x"}));
            }
            other => panic!("expected tool request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_text_deltas() {
        let mut server = mockito::Server::new_async().await;
        let body = concat!(
            "event: message_start\ndata: {\"type\":\"message_start\"}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\" there\"}}\n\n",
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        );
        server
            .mock("POST", "/messages")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let adapter = AnthropicAdapter::new_with_api_base("ak", &server.url());
        let req = LLMRequest::new("anthropic", "claude", vec![LLMMessage::user("q")]);
        let chunks: Vec<String> = adapter
            .create_chat_completion_stream(&req)
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks, vec!["Hello", " there"]);
    }

    #[tokio::test]
    async fn test_list_models_uses_display_names() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/models")
            .match_header("x-api-key", "sk-ant")
            .match_header("anthropic-version", ANTHROPIC_VERSION)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":[{"id":"claude-sonnet-4-20250514","display_name":"Claude Sonnet 4","type":"model"}]}"#)
            .create_async()
            .await;

        let adapter = AnthropicAdapter::new_with_api_base("sk-ant", &server.url());
        let models = adapter.list_models().await.unwrap();
        assert_eq!(models, vec![ModelInfo::new("claude-sonnet-4-20250514", "Claude Sonnet 4")]);
    }

    #[tokio::test]
    async fn test_list_models_falls_back_to_known_models() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/models").with_status(403).create_async().await;

        let adapter = AnthropicAdapter::new_with_api_base("sk-ant", &server.url());
        let models = adapter.list_models().await.unwrap();
        assert_eq!(models.len(), KNOWN_MODELS.len());
        assert!(models.iter().all(|m| m.context_length == Some(200_000)));
    }
}
