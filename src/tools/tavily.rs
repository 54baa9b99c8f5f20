// Tavily web search

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::info;

use super::{parse_args, SearchBackend, SearchHit, SearchResponse, Tool, ToolResult};
use crate::types::{AppError, AppResult, ToolSpec};

pub const TOOL_NAME: &str = "tavily_search";
const TAVILY_API_BASE: &str = "https://api.tavily.com";

pub struct TavilySearchTool {
    client: Client,
    api_key: String,
    api_base: String,
    max_results: usize,
}

#[derive(Debug, Deserialize)]
struct TavilyArgs {
    query: String,
    #[serde(default = "default_depth")]
    search_depth: String,
    #[serde(default)]
    max_results: Option<usize>,
    #[serde(default)]
    include_domains: Vec<String>,
    #[serde(default)]
    exclude_domains: Vec<String>,
}

fn default_depth() -> String {
    "basic".to_string()
}

#[derive(Serialize)]
struct TavilyRequest<'a> {
    query: &'a str,
    search_depth: &'a str,
    max_results: usize,
    include_answer: bool,
    include_domains: &'a [String],
    exclude_domains: &'a [String],
}

#[derive(Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    results: Vec<TavilyHit>,
}

#[derive(Deserialize)]
struct TavilyHit {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    score: Option<f64>,
}

impl TavilySearchTool {
    pub fn new(api_key: &str) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            api_key: api_key.to_string(),
            api_base: TAVILY_API_BASE.to_string(),
            max_results: 5,
        }
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results.clamp(1, 20);
        self
    }

    async fn run(&self, args: &TavilyArgs) -> AppResult<SearchResponse> {
        if args.query.trim().is_empty() {
            return Err(AppError::Tool("Search query must not be empty".to_string()));
        }
        if args.search_depth != "basic" && args.search_depth != "advanced" {
            return Err(AppError::Tool(format!(
                "search_depth must be 'basic' or 'advanced', got '{}'",
                args.search_depth
            )));
        }
        let max_results = args.max_results.unwrap_or(self.max_results).clamp(1, 20);

        info!(query = %args.query, depth = %args.search_depth, max_results, "Searching via Tavily");

        let body = TavilyRequest {
            query: &args.query,
            search_depth: &args.search_depth,
            max_results,
            include_answer: true,
            include_domains: &args.include_domains,
            exclude_domains: &args.exclude_domains,
        };

        let response = self
            .client
            .post(format!("{}/search", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Tool(format!("Tavily request failed: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 401 {
            return Err(AppError::Tool("Invalid Tavily API key".to_string()));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::Tool(format!("Tavily API error ({}): {}", status, text)));
        }

        let parsed: TavilyResponse = response
            .json()
            .await
            .map_err(|e| AppError::Tool(format!("Failed to parse Tavily response: {}", e)))?;

        let results: Vec<SearchHit> = parsed
            .results
            .into_iter()
            .map(|hit| SearchHit {
                title: hit.title,
                url: hit.url,
                content: hit.content,
                score: hit.score,
                date: None,
            })
            .collect();

        info!(count = results.len(), "Tavily search completed");
        Ok(SearchResponse {
            query: args.query.clone(),
            answer: parsed.answer.filter(|a| !a.is_empty()),
            results,
        })
    }
}

#[async_trait]
impl Tool for TavilySearchTool {
    fn describe(&self) -> ToolSpec {
        ToolSpec {
            name: TOOL_NAME.to_string(),
            description: "Search the web for current information using Tavily. Use this for finding up-to-date information, news, facts, and general web content.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "The search query to look up"},
                    "search_depth": {
                        "type": "string",
                        "enum": ["basic", "advanced"],
                        "description": "Search depth - 'basic' for quick results, 'advanced' for more thorough search",
                        "default": "basic"
                    },
                    "max_results": {
                        "type": "integer",
                        "description": "Maximum number of results to return",
                        "default": 5,
                        "minimum": 1,
                        "maximum": 20
                    },
                    "include_domains": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "List of domains to specifically include in search"
                    },
                    "exclude_domains": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "List of domains to exclude from search"
                    }
                },
                "required": ["query"]
            }),
        }
    }

    async fn invoke(&self, arguments: Value) -> ToolResult {
        let outcome = async {
            let args: TavilyArgs = parse_args(TOOL_NAME, &arguments)?;
            let response = self.run(&args).await?;
            let sources = response.sources();
            Ok::<_, AppError>((serde_json::to_value(&response)?, sources))
        }
        .await;
        ToolResult::from_outcome(TOOL_NAME, arguments, outcome)
    }
}

#[async_trait]
impl SearchBackend for TavilySearchTool {
    fn backend_name(&self) -> &'static str {
        "tavily"
    }

    async fn search(&self, query: &str, max_results: usize) -> AppResult<SearchResponse> {
        self.run(&TavilyArgs {
            query: query.to_string(),
            search_depth: "advanced".to_string(),
            max_results: Some(max_results),
            include_domains: Vec::new(),
            exclude_domains: Vec::new(),
        })
        .await
    }
}
