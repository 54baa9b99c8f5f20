//! Multi-query deep search
//!
//! Breaks a research question into sub-queries with the LLM, runs every
//! search concurrently, reads the top unique pages concurrently and asks the
//! LLM for one synthesized markdown answer. Progress is reported on the turn's
//! emitter so the browser can show the intermediate steps.

use async_trait::async_trait;
use futures::future::join_all;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use tracing::{info, warn};

use super::scraper::{ScrapedPage, WebScraperTool};
use super::{parse_args, SearchBackend, SearchResponse, Source, Tool, ToolResult};
use crate::events::{ProgressEmitter, ProgressStatus};
use crate::llm::LLM;
use crate::types::{AppError, AppResult, LLMMessage, ToolSpec};

pub const TOOL_NAME: &str = "deep_search";
const SCRAPE_MAX_LENGTH: usize = 6000;
const PAGE_EXCERPT_CHARS: usize = 3000;
const SNIPPET_EXCERPT_CHARS: usize = 300;
const ANALYST_PROMPT: &str = "You are an expert research analyst.";

static JSON_ARRAY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)\[.*\]").expect("valid regex"));

#[derive(Debug, Clone, Deserialize)]
pub struct DeepSearchOptions {
    #[serde(default = "default_sub_queries")]
    pub num_sub_queries: usize,
    #[serde(default = "default_results_per_query")]
    pub max_results_per_query: usize,
    #[serde(default = "default_true")]
    pub scrape_pages: bool,
    #[serde(default = "default_pages")]
    pub max_pages_to_scrape: usize,
}

fn default_sub_queries() -> usize {
    3
}

fn default_results_per_query() -> usize {
    5
}

fn default_true() -> bool {
    true
}

fn default_pages() -> usize {
    5
}

impl Default for DeepSearchOptions {
    fn default() -> Self {
        Self {
            num_sub_queries: default_sub_queries(),
            max_results_per_query: default_results_per_query(),
            scrape_pages: true,
            max_pages_to_scrape: default_pages(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeepSearchArgs {
    query: String,
    #[serde(flatten)]
    options: DeepSearchOptions,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeepSearchReport {
    pub query: String,
    pub sub_queries: Vec<String>,
    pub synthesis: String,
    pub sources: Vec<Source>,
    pub pages_scraped: usize,
    pub raw_results: Vec<SearchResponse>,
}

pub struct DeepSearchTool {
    backend: Arc<dyn SearchBackend>,
    scraper: WebScraperTool,
    llm: LLM,
    emitter: ProgressEmitter,
}

impl DeepSearchTool {
    pub fn new(backend: Arc<dyn SearchBackend>, llm: LLM, emitter: ProgressEmitter) -> Self {
        Self {
            backend,
            scraper: WebScraperTool::new(),
            llm,
            emitter,
        }
    }

    pub async fn research(&self, query: &str, options: &DeepSearchOptions) -> AppResult<DeepSearchReport> {
        if query.trim().is_empty() {
            return Err(AppError::Tool("Research query must not be empty".to_string()));
        }
        let preview: String = query.chars().take(50).collect();
        self.emitter.progress(
            "start",
            ProgressStatus::InProgress,
            format!("Starting deep research on: {}...", preview),
            0,
        );

        let sub_queries = self
            .generate_sub_queries(query, options.num_sub_queries.clamp(1, 5))
            .await;
        let mut all_queries = vec![query.to_string()];
        all_queries.extend(sub_queries.iter().filter(|q| q.as_str() != query).cloned());

        self.emitter.progress(
            "search",
            ProgressStatus::InProgress,
            format!("Searching {} queries...", all_queries.len()),
            15,
        );
        let outcomes = join_all(
            all_queries
                .iter()
                .map(|q| self.backend.search(q, options.max_results_per_query)),
        )
        .await;
        let searches: Vec<SearchResponse> = outcomes
            .into_iter()
            .zip(&all_queries)
            .filter_map(|(outcome, q)| match outcome {
                Ok(response) => Some(response),
                Err(e) => {
                    warn!(query = %q, error = %e, "Deep search sub-query failed");
                    None
                }
            })
            .collect();
        self.emitter.progress(
            "search",
            ProgressStatus::Completed,
            format!("Found results from {} searches", searches.len()),
            40,
        );

        if searches.is_empty() {
            self.emitter.progress("error", ProgressStatus::Failed, "All searches failed", 0);
            return Err(AppError::Tool("All searches failed".to_string()));
        }

        let pages = if options.scrape_pages {
            self.scrape_top_results(&searches, options.max_pages_to_scrape).await
        } else {
            Vec::new()
        };

        let synthesis = match self.synthesize(query, &searches, &pages).await {
            Ok(text) => text,
            Err(e) => {
                self.emitter.progress("error", ProgressStatus::Failed, e.to_string(), 0);
                return Err(e);
            }
        };

        let mut seen = HashSet::new();
        let sources = searches
            .iter()
            .flat_map(|s| s.sources())
            .filter(|s| seen.insert(s.url.clone()))
            .collect();

        info!(query = %query, searches = searches.len(), pages = pages.len(), "Deep search completed");
        Ok(DeepSearchReport {
            query: query.to_string(),
            sub_queries,
            synthesis,
            sources,
            pages_scraped: pages.len(),
            raw_results: searches,
        })
    }

    async fn generate_sub_queries(&self, query: &str, count: usize) -> Vec<String> {
        self.emitter.progress(
            "generate_queries",
            ProgressStatus::InProgress,
            "Analyzing query and generating research questions...",
            5,
        );

        let prompt = format!(
            "You are a research assistant. Given a complex query, generate {count} specific sub-queries that will help comprehensively answer the main question.\n\n\
             Main Query: {query}\n\n\
             Generate {count} different search queries that explore different aspects of this topic. Each query should be specific and searchable.\n\n\
             Respond with a JSON array of strings, nothing else. Example:\n[\"query 1\", \"query 2\", \"query 3\"]",
            count = count,
            query = query
        );

        let parsed = match self.llm.prompt(&prompt, 0.3, 500).await {
            Ok(text) => parse_query_list(&text),
            Err(e) => {
                warn!(error = %e, "Sub-query generation failed, using the original query");
                None
            }
        };

        match parsed {
            Some(mut queries) if !queries.is_empty() => {
                queries.truncate(count);
                self.emitter.progress(
                    "generate_queries",
                    ProgressStatus::Completed,
                    format!("Generated {} research questions", queries.len()),
                    10,
                );
                queries
            }
            _ => vec![query.to_string()],
        }
    }

    async fn scrape_top_results(&self, searches: &[SearchResponse], max_pages: usize) -> Vec<ScrapedPage> {
        self.emitter.progress(
            "scrape_pages",
            ProgressStatus::InProgress,
            format!("Reading full content from top {} pages...", max_pages),
            50,
        );

        let mut seen = HashSet::new();
        let urls: Vec<String> = searches
            .iter()
            .flat_map(|s| s.results.iter())
            .filter(|hit| !hit.url.is_empty() && seen.insert(hit.url.clone()))
            .map(|hit| hit.url.clone())
            .take(max_pages)
            .collect();

        let pages: Vec<ScrapedPage> = join_all(urls.iter().map(|url| self.scraper.scrape(url, SCRAPE_MAX_LENGTH)))
            .await
            .into_iter()
            .filter_map(Result::ok)
            .collect();

        self.emitter.progress(
            "scrape_pages",
            ProgressStatus::Completed,
            format!("Successfully read {} pages", pages.len()),
            65,
        );
        pages
    }

    async fn synthesize(&self, query: &str, searches: &[SearchResponse], pages: &[ScrapedPage]) -> AppResult<String> {
        self.emitter.progress(
            "synthesize",
            ProgressStatus::InProgress,
            "Analyzing and synthesizing all information...",
            75,
        );

        let mut formatted_results = String::new();
        for (i, search) in searches.iter().enumerate() {
            formatted_results.push_str(&format!("\n\n### Search {}: {}\n", i + 1, search.query));
            if let Some(answer) = &search.answer {
                formatted_results.push_str(&format!("**Quick Answer:** {}\n", answer));
            }
            for hit in search.results.iter().take(3) {
                let excerpt: String = hit.content.chars().take(SNIPPET_EXCERPT_CHARS).collect();
                formatted_results.push_str(&format!("\n- **{}** ({})\n  {}...\n", hit.title, hit.url, excerpt));
            }
        }

        let mut formatted_pages = String::new();
        for page in pages.iter().take(5) {
            let excerpt: String = page.content.chars().take(PAGE_EXCERPT_CHARS).collect();
            formatted_pages.push_str(&format!(
                "\n\n### Page: {}\nURL: {}\nContent:\n{}\n",
                if page.title.is_empty() { "Unknown" } else { page.title.as_str() },
                page.url,
                excerpt
            ));
        }

        let prompt = format!(
            "{system}\n\n\
             Based on the search results and full page content below, provide a comprehensive, well-structured answer to the query.\n\n\
             ## Original Query\n{query}\n\n\
             ## Search Results Summary\n{results}\n\n\
             ## Full Page Content\n{pages}\n\n\
             ## Instructions\n\
             Provide a comprehensive answer that:\n\
             1. Directly addresses the original query with specific details\n\
             2. Synthesizes information from multiple sources\n\
             3. Includes relevant facts, statistics, and examples found in the content\n\
             4. Uses proper markdown formatting (headers, lists, tables where appropriate)\n\
             5. Cites sources with URLs where possible\n\
             6. Highlights any conflicting information or uncertainties\n\
             7. Provides actionable insights or conclusions\n\n\
             Write your response:",
            system = ANALYST_PROMPT,
            query = query,
            results = formatted_results,
            pages = formatted_pages,
        );

        let request = self
            .llm
            .request(vec![LLMMessage::user(prompt)])
            .with_temperature(0.5)
            .with_max_tokens(4000);
        let synthesis = self.llm.create_chat_completion(&request).await?.content;

        self.emitter.progress("synthesize", ProgressStatus::Completed, "Research complete!", 100);
        Ok(synthesis)
    }
}

/// Pull a list of strings out of model output, tolerating code fences and prose
fn parse_query_list(text: &str) -> Option<Vec<String>> {
    let candidate = JSON_ARRAY_RE.find(text).map(|m| m.as_str()).unwrap_or(text);
    serde_json::from_str::<Vec<String>>(candidate.trim())
        .ok()
        .map(|qs| qs.into_iter().map(|q| q.trim().to_string()).filter(|q| !q.is_empty()).collect())
}

#[async_trait]
impl Tool for DeepSearchTool {
    fn describe(&self) -> ToolSpec {
        ToolSpec {
            name: TOOL_NAME.to_string(),
            description: "Perform a deep, comprehensive search on a complex topic. Use this for research questions that require multiple searches and synthesis of information from various sources.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "The main research query or question to investigate"},
                    "num_sub_queries": {
                        "type": "integer",
                        "description": "Number of sub-queries to generate for comprehensive research",
                        "default": 3,
                        "minimum": 1,
                        "maximum": 5
                    },
                    "scrape_pages": {
                        "type": "boolean",
                        "description": "Whether to read full page content",
                        "default": true
                    }
                },
                "required": ["query"]
            }),
        }
    }

    async fn invoke(&self, arguments: Value) -> ToolResult {
        let outcome = async {
            let args: DeepSearchArgs = parse_args(TOOL_NAME, &arguments)?;
            let report = self.research(&args.query, &args.options).await?;
            let sources = report.sources.clone();
            let output = json!({
                "query": report.query,
                "sub_queries": report.sub_queries,
                "synthesis": report.synthesis,
                "sources": report.sources,
                "pages_scraped": report.pages_scraped,
            });
            Ok::<_, AppError>((output, sources))
        }
        .await;
        ToolResult::from_outcome(TOOL_NAME, arguments, outcome)
    }
}
