//! Tool adapters
//!
//! Thin wrappers over external HTTP services (web search, page scraping) plus
//! a local clock. Every adapter follows the same contract: [`Tool::describe`]
//! returns the function-calling schema and [`Tool::invoke`] never fails.
//! Network or argument errors come back as a `ToolResult` with
//! `success == false` so a single broken source cannot abort a turn.

pub mod datetime;
pub mod deep_search;
pub mod scraper;
pub mod serpapi;
pub mod tavily;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::SearchConfig;
use crate::events::ProgressEmitter;
use crate::llm::LLM;
use crate::types::{AppError, AppResult, ToolSpec};

pub use datetime::DateTimeTool;
pub use deep_search::DeepSearchTool;
pub use scraper::WebScraperTool;
pub use serpapi::SerpApiSearchTool;
pub use tavily::TavilySearchTool;

/// A cited web page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool: String,
    pub arguments: Value,
    pub success: bool,
    pub output: Value,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(tool: &str, arguments: Value, output: Value, sources: Vec<Source>) -> Self {
        Self {
            tool: tool.to_string(),
            arguments,
            success: true,
            output,
            sources,
            error: None,
        }
    }

    pub fn failed(tool: &str, arguments: Value, error: impl Into<String>) -> Self {
        Self {
            tool: tool.to_string(),
            arguments,
            success: false,
            output: Value::Null,
            sources: Vec::new(),
            error: Some(error.into()),
        }
    }

    /// Fold an adapter outcome into a result, logging failures
    pub fn from_outcome(tool: &str, arguments: Value, outcome: AppResult<(Value, Vec<Source>)>) -> Self {
        match outcome {
            Ok((output, sources)) => Self::ok(tool, arguments, output, sources),
            Err(e) => {
                warn!(tool = %tool, error = %e, "Tool invocation failed");
                let message = match e {
                    AppError::Tool(m) | AppError::InvalidRequest(m) => m,
                    other => other.to_string(),
                };
                Self::failed(tool, arguments, message)
            }
        }
    }

    /// Text handed back to the model for this result
    pub fn to_context(&self) -> String {
        if self.success {
            serde_json::to_string(&self.output).unwrap_or_default()
        } else {
            format!(
                "Error: {}",
                self.error.as_deref().unwrap_or("tool failed without a message")
            )
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn describe(&self) -> ToolSpec;

    async fn invoke(&self, arguments: Value) -> ToolResult;

    fn name(&self) -> String {
        self.describe().name
    }
}

/// Deserialize tool arguments, mapping schema violations to a tool error
pub(crate) fn parse_args<T: serde::de::DeserializeOwned>(tool: &str, arguments: &Value) -> AppResult<T> {
    let value = if arguments.is_null() {
        Value::Object(Default::default())
    } else {
        arguments.clone()
    };
    serde_json::from_value(value).map_err(|e| AppError::Tool(format!("Invalid arguments for {}: {}", tool, e)))
}

/// One hit from a web search backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    pub results: Vec<SearchHit>,
}

impl SearchResponse {
    pub fn sources(&self) -> Vec<Source> {
        self.results
            .iter()
            .filter(|hit| !hit.url.is_empty())
            .map(|hit| Source {
                title: hit.title.clone(),
                url: hit.url.clone(),
            })
            .collect()
    }
}

/// Plain web search used by deep search and the direct search endpoint
#[async_trait]
pub trait SearchBackend: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn search(&self, query: &str, max_results: usize) -> AppResult<SearchResponse>;
}

/// Pick the configured search backend, Tavily first
pub fn search_backend(config: &SearchConfig) -> Option<Arc<dyn SearchBackend>> {
    if config.has_tavily() {
        Some(Arc::new(TavilySearchTool::new(&config.tavily_api_key)))
    } else if config.has_serpapi() {
        Some(Arc::new(SerpApiSearchTool::new(&config.serpapi_key)))
    } else {
        None
    }
}

/// The tools offered to the model for one turn
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tools for a turn: the clock always, search tools when keyed, and the
    /// scraper plus deep search only in deep-research mode.
    pub fn for_turn(
        config: &SearchConfig,
        llm: &LLM,
        deep_research: bool,
        default_timezone: &str,
        emitter: &ProgressEmitter,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(DateTimeTool::new(default_timezone)));

        if config.has_tavily() {
            registry.register(Arc::new(
                TavilySearchTool::new(&config.tavily_api_key).with_max_results(config.max_results),
            ));
        }
        if config.has_serpapi() {
            registry.register(Arc::new(
                SerpApiSearchTool::new(&config.serpapi_key).with_max_results(config.max_results),
            ));
        }

        if deep_research {
            registry.register(Arc::new(WebScraperTool::new()));
            if let Some(backend) = search_backend(config) {
                registry.register(Arc::new(DeepSearchTool::new(
                    backend,
                    llm.clone(),
                    emitter.with_source("deep_search"),
                )));
            }
        }

        debug!(tools = ?registry.names(), deep_research, "Tool registry built");
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn with(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.describe()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    /// First registered web search tool, used for plan steps that only say "search"
    pub fn default_search(&self) -> Option<String> {
        self.names()
            .into_iter()
            .find(|n| n == tavily::TOOL_NAME || n == serpapi::TOOL_NAME)
    }

    pub async fn invoke(&self, name: &str, arguments: Value) -> ToolResult {
        match self.get(name) {
            Some(tool) => tool.invoke(arguments).await,
            None => ToolResult::failed(name, arguments, format!("Unknown tool: {}", name)),
        }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry").field("tools", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::llm::testing::{fake_llm, FakeAdapter};
    use serde_json::json;

    fn search_config(tavily: &str, serpapi: &str) -> SearchConfig {
        SearchConfig {
            tavily_api_key: tavily.to_string(),
            serpapi_key: serpapi.to_string(),
            max_results: 5,
        }
    }

    #[test]
    fn test_registry_respects_keys_and_mode() {
        let llm = fake_llm(FakeAdapter::text(""));
        let emitter = ProgressEmitter::noop();

        let bare = ToolRegistry::for_turn(&search_config("", ""), &llm, false, "UTC", &emitter);
        assert_eq!(bare.names(), vec!["get_current_datetime"]);
        assert!(bare.default_search().is_none());

        let deep = ToolRegistry::for_turn(&search_config("tvly", "serp"), &llm, true, "UTC", &emitter);
        assert_eq!(
            deep.names(),
            vec!["get_current_datetime", "tavily_search", "serpapi_search", "web_scraper", "deep_search"]
        );
        assert_eq!(deep.default_search().as_deref(), Some("tavily_search"));
        assert_eq!(deep.specs().len(), 5);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_failed_result() {
        let registry = ToolRegistry::new();
        let result = registry.invoke("nope", json!({})).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Unknown tool: nope"));
        assert!(result.to_context().starts_with("Error:"));
    }

    #[test]
    fn test_search_backend_prefers_tavily() {
        let config = Config::from_vars(|k| match k {
            "TAVILY_API_KEY" | "SERPAPI_API_KEY" => Some("key".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(search_backend(&config.search).unwrap().backend_name(), "tavily");
        assert!(search_backend(&search_config("", "")).is_none());
        assert_eq!(search_backend(&search_config("", "s")).unwrap().backend_name(), "serpapi");
    }

    #[test]
    fn test_parse_args_reports_tool() {
        #[derive(Debug, Deserialize)]
        struct Args {
            #[allow(dead_code)]
            query: String,
        }
        let err = parse_args::<Args>("tavily_search", &json!({})).unwrap_err();
        assert!(err.to_string().contains("Invalid arguments for tavily_search"));
    }
}
