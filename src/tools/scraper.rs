// Web page scraper: fetch HTML and reduce it to readable text

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, USER_AGENT};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info};

use super::{parse_args, Source, Tool, ToolResult};
use crate::types::{AppError, AppResult, ToolSpec};

pub const TOOL_NAME: &str = "web_scraper";
pub const DEFAULT_MAX_LENGTH: usize = 8000;
const TRUNCATION_MARKER: &str = "...[truncated]";

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Elements whose whole subtree is noise
const STRIPPED_ELEMENTS: &[&str] = &[
    "script", "style", "nav", "header", "footer", "aside", "form", "button", "iframe", "noscript", "svg",
    "video", "audio",
];

static STRIPPED_RE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    STRIPPED_ELEMENTS
        .iter()
        .map(|tag| Regex::new(&format!(r"(?is)<{tag}\b[^>]*>.*?</{tag}\s*>", tag = tag)).expect("valid regex"))
        .collect()
});

static COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("valid regex"));

static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title\s*>").expect("valid regex"));

static META_DESC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<meta\s+[^>]*name\s*=\s*["']description["'][^>]*content\s*=\s*["']([^"']*)["']"#)
        .expect("valid regex")
});

static META_DESC_REVERSED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<meta\s+[^>]*content\s*=\s*["']([^"']*)["'][^>]*name\s*=\s*["']description["']"#)
        .expect("valid regex")
});

/// Main-content containers, most specific first
static CONTAINER_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?is)<main\b[^>]*>(.*)</main\s*>",
        r"(?is)<article\b[^>]*>(.*)</article\s*>",
        r#"(?is)<[a-z0-9]+\b[^>]*role\s*=\s*["']main["'][^>]*>(.*)</[a-z0-9]+\s*>"#,
        r"(?is)<body\b[^>]*>(.*)</body\s*>",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

static BLOCK_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)</?(p|div|br|li|ul|ol|h[1-6]|tr|td|th|table|section|blockquote|pre|dd|dt)\b[^>]*>")
        .expect("valid regex")
});

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]+>").expect("valid regex"));
static SPACES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t\u{a0}]+").expect("valid regex"));
static BLANK_LINES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n\s*\n").expect("valid regex"));

#[derive(Debug, Deserialize)]
struct ScrapeArgs {
    url: String,
    #[serde(default)]
    max_length: Option<usize>,
}

/// Readable text extracted from one HTML document
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapedPage {
    pub url: String,
    pub title: String,
    pub description: String,
    pub content: String,
}

pub struct WebScraperTool {
    client: Client,
}

impl Default for WebScraperTool {
    fn default() -> Self {
        Self::new()
    }
}

impl WebScraperTool {
    pub fn new() -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    pub async fn scrape(&self, url: &str, max_length: usize) -> AppResult<ScrapedPage> {
        let parsed = reqwest::Url::parse(url).map_err(|e| AppError::Tool(format!("Invalid URL '{}': {}", url, e)))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(AppError::Tool(format!("Unsupported URL scheme: {}", parsed.scheme())));
        }

        info!(url = %url, "Scraping page");
        let response = self.client.get(parsed).send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Tool("Request timed out".to_string())
            } else {
                AppError::Tool(format!("Failed to fetch URL: {}", e))
            }
        })?;

        let status = response.status();
        if status.as_u16() != 200 {
            return Err(AppError::Tool(format!("HTTP {}: Failed to fetch URL", status.as_u16())));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.contains("text/html") && !content_type.contains("application/xhtml") {
            return Err(AppError::Tool(format!("Unsupported content type: {}", content_type)));
        }

        let final_url = response.url().to_string();
        let html = response
            .text()
            .await
            .map_err(|e| AppError::Tool(format!("Failed to read page body: {}", e)))?;

        let page = extract_page(&final_url, &html, max_length);
        debug!(url = %final_url, chars = page.content.len(), "Page extracted");
        Ok(page)
    }
}

/// Reduce an HTML document to title, meta description and main text
pub fn extract_page(url: &str, html: &str, max_length: usize) -> ScrapedPage {
    let title = TITLE_RE
        .captures(html)
        .map(|c| decode_entities(c[1].trim()))
        .unwrap_or_default();
    let description = META_DESC_RE
        .captures(html)
        .or_else(|| META_DESC_REVERSED_RE.captures(html))
        .map(|c| decode_entities(c[1].trim()))
        .unwrap_or_default();

    let mut cleaned = COMMENT_RE.replace_all(html, "").into_owned();
    for re in STRIPPED_RE.iter() {
        cleaned = re.replace_all(&cleaned, "").into_owned();
    }

    let main = CONTAINER_RES
        .iter()
        .find_map(|re| re.captures(&cleaned).map(|c| c[1].to_string()))
        .unwrap_or(cleaned);

    let text = BLOCK_TAG_RE.replace_all(&main, "\n");
    let text = TAG_RE.replace_all(&text, "");
    let text = decode_entities(&text);
    let text = SPACES_RE.replace_all(&text, " ");
    let text: String = text.lines().map(str::trim).collect::<Vec<_>>().join("\n");
    let text = BLANK_LINES_RE.replace_all(text.trim(), "\n\n").into_owned();

    ScrapedPage {
        url: url.to_string(),
        title,
        description,
        content: truncate_chars(&text, max_length),
    }
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&amp;", "&")
}

/// Cut at `max_chars` characters, marking the cut
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}{}", &text[..byte_idx], TRUNCATION_MARKER),
        None => text.to_string(),
    }
}

#[async_trait]
impl Tool for WebScraperTool {
    fn describe(&self) -> ToolSpec {
        ToolSpec {
            name: TOOL_NAME.to_string(),
            description: "Fetch and extract the main content from a webpage URL. Use this to read the full content of a page when you need more details than the search snippet provides.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string", "description": "The URL of the webpage to scrape"},
                    "max_length": {
                        "type": "integer",
                        "description": "Maximum content length to return",
                        "default": DEFAULT_MAX_LENGTH
                    }
                },
                "required": ["url"]
            }),
        }
    }

    async fn invoke(&self, arguments: Value) -> ToolResult {
        let outcome = async {
            let args: ScrapeArgs = parse_args(TOOL_NAME, &arguments)?;
            let page = self
                .scrape(&args.url, args.max_length.unwrap_or(DEFAULT_MAX_LENGTH))
                .await?;
            let output = json!({
                "url": page.url,
                "title": page.title,
                "description": page.description,
                "content": page.content,
                "content_length": page.content.chars().count(),
            });
            let source = Source {
                title: if page.title.is_empty() { page.url.clone() } else { page.title.clone() },
                url: page.url,
            };
            Ok::<_, AppError>((output, vec![source]))
        }
        .await;
        ToolResult::from_outcome(TOOL_NAME, arguments, outcome)
    }
}
