//! SerpAPI Google search
//!
//! Queries the `google` engine over plain HTTP and flattens the parts of the
//! response the research pipeline cares about:
//! - answer box (answer or snippet)
//! - knowledge graph title and description
//! - organic results, normalised to the shared [`SearchHit`] shape
//! - up to five related searches

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

use super::{parse_args, SearchBackend, SearchHit, SearchResponse, Tool, ToolResult};
use crate::types::{AppError, AppResult, ToolSpec};

pub const TOOL_NAME: &str = "serpapi_search";
const SERPAPI_BASE: &str = "https://serpapi.com";
const MAX_RELATED_SEARCHES: usize = 5;

/// SerpAPI client exposed as a tool
pub struct SerpApiSearchTool {
    client: Client,
    api_key: String,
    api_base: String,
    max_results: usize,
}

#[derive(Debug, Deserialize)]
struct SerpArgs {
    query: String,
    #[serde(default)]
    num_results: Option<usize>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default = "default_gl")]
    gl: String,
    #[serde(default = "default_hl")]
    hl: String,
}

fn default_gl() -> String {
    "us".to_string()
}

fn default_hl() -> String {
    "en".to_string()
}

/// Parsed Google results beyond the plain hit list
#[derive(Debug, Clone)]
struct GoogleResults {
    response: SearchResponse,
    knowledge_graph: Option<Value>,
    related_searches: Vec<String>,
}

impl SerpApiSearchTool {
    pub fn new(api_key: &str) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            api_key: api_key.to_string(),
            api_base: SERPAPI_BASE.to_string(),
            max_results: 10,
        }
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    /// Set maximum results per search
    pub fn with_max_results(mut self, max: usize) -> Self {
        self.max_results = max.clamp(1, 100);
        self
    }

    async fn search_google(&self, args: &SerpArgs) -> AppResult<GoogleResults> {
        if args.query.trim().is_empty() {
            return Err(AppError::Tool("Search query must not be empty".to_string()));
        }
        let num = args.num_results.unwrap_or(self.max_results).clamp(1, 100);

        info!(query = %args.query, num, "Searching Google via SerpAPI");

        let mut params: Vec<(&str, String)> = vec![
            ("engine", "google".to_string()),
            ("q", args.query.clone()),
            ("api_key", self.api_key.clone()),
            ("num", num.to_string()),
            ("gl", args.gl.clone()),
            ("hl", args.hl.clone()),
        ];
        if let Some(location) = &args.location {
            params.push(("location", location.clone()));
        }

        let response = self
            .client
            .get(format!("{}/search", self.api_base))
            .query(&params)
            .send()
            .await
            .map_err(|e| AppError::Tool(format!("SerpAPI request failed: {}", e)))?;

        let status = response.status();
        match status.as_u16() {
            401 => return Err(AppError::Tool("Invalid SerpAPI API key".to_string())),
            429 => return Err(AppError::Tool("SerpAPI rate limit exceeded".to_string())),
            _ if !status.is_success() => {
                return Err(AppError::Tool(format!("SerpAPI HTTP error: {}", status.as_u16())))
            }
            _ => {}
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| AppError::Tool(format!("Failed to parse search results: {}", e)))?;

        debug!("Raw Google response received");
        let parsed = parse_google_results(&args.query, &data);
        info!(count = parsed.response.results.len(), "Google search completed");
        Ok(parsed)
    }
}

fn parse_google_results(query: &str, data: &Value) -> GoogleResults {
    let answer = data
        .get("answer_box")
        .and_then(|b| b.get("answer").or_else(|| b.get("snippet")))
        .and_then(|v| v.as_str())
        .map(String::from);

    let knowledge_graph = data.get("knowledge_graph").filter(|kg| kg.is_object()).map(|kg| {
        json!({
            "title": kg.get("title"),
            "description": kg.get("description"),
        })
    });

    let results = data
        .get("organic_results")
        .and_then(|r| r.as_array())
        .map(|arr| {
            arr.iter()
                .map(|result| SearchHit {
                    title: result
                        .get("title")
                        .and_then(|v| v.as_str())
                        .unwrap_or("Untitled")
                        .to_string(),
                    url: result
                        .get("link")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    content: result
                        .get("snippet")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    score: None,
                    date: result.get("date").and_then(|v| v.as_str()).map(String::from),
                })
                .collect()
        })
        .unwrap_or_default();

    let related_searches = data
        .get("related_searches")
        .and_then(|r| r.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|rs| rs.get("query").and_then(|v| v.as_str()).map(String::from))
                .take(MAX_RELATED_SEARCHES)
                .collect()
        })
        .unwrap_or_default();

    GoogleResults {
        response: SearchResponse {
            query: query.to_string(),
            answer,
            results,
        },
        knowledge_graph,
        related_searches,
    }
}

#[async_trait]
impl Tool for SerpApiSearchTool {
    fn describe(&self) -> ToolSpec {
        ToolSpec {
            name: TOOL_NAME.to_string(),
            description: "Search Google using SerpAPI for current information, news, and facts. Provides organic search results from Google.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "The search query to look up on Google"},
                    "num_results": {
                        "type": "integer",
                        "description": "Number of organic results to return (1-100)",
                        "default": 10,
                        "minimum": 1,
                        "maximum": 100
                    },
                    "location": {
                        "type": "string",
                        "description": "Location for localized results (e.g., 'Austin, Texas', 'London, England')"
                    },
                    "gl": {"type": "string", "description": "Country code for search (e.g., 'us', 'uk', 'ca')", "default": "us"},
                    "hl": {"type": "string", "description": "Language code (e.g., 'en', 'es', 'fr')", "default": "en"}
                },
                "required": ["query"]
            }),
        }
    }

    async fn invoke(&self, arguments: Value) -> ToolResult {
        let outcome = async {
            let args: SerpArgs = parse_args(TOOL_NAME, &arguments)?;
            let parsed = self.search_google(&args).await?;
            let sources = parsed.response.sources();
            let mut output = serde_json::to_value(&parsed.response)?;
            output["knowledge_graph"] = parsed.knowledge_graph.unwrap_or(Value::Null);
            output["related_searches"] = json!(parsed.related_searches);
            Ok::<_, AppError>((output, sources))
        }
        .await;
        ToolResult::from_outcome(TOOL_NAME, arguments, outcome)
    }
}

#[async_trait]
impl SearchBackend for SerpApiSearchTool {
    fn backend_name(&self) -> &'static str {
        "serpapi"
    }

    async fn search(&self, query: &str, max_results: usize) -> AppResult<SearchResponse> {
        let args = SerpArgs {
            query: query.to_string(),
            num_results: Some(max_results),
            location: None,
            gl: default_gl(),
            hl: default_hl(),
        };
        Ok(self.search_google(&args).await?.response)
    }
}
