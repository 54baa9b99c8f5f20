//! Reply Agent
//!
//! Final stage of every turn. Turns the question, the conversation history and
//! whatever the research steps produced into the answer the user sees:
//! numbered inline citations, a `## References` section, no tool-call
//! artifacts. Streams deltas as `response_chunk` events when asked to. A stream
//! that breaks before its first delta falls back to a plain completion; one
//! that breaks later keeps the text the user has already seen.

use futures::StreamExt;
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::{info, warn};

use crate::events::ProgressEmitter;
use crate::llm::LLM;
use crate::tools::{Source, ToolResult};
use crate::types::{AppResult, LLMMessage, LLMRequest};

pub const SYNTHESIS_SYSTEM_PROMPT: &str = "You are an expert research assistant. Synthesize the provided research results into a comprehensive, well-structured response. Use proper citations and maintain an encyclopedic tone.\n\nCRITICAL: Do NOT include XML tags, tool names like <deep_search>, or any tool invocation syntax in your response. Your response should be pure content only, formatted with proper markdown and citations.";

pub const PARTIAL_FAILURE_NOTE: &str = "\n\n*Note: Some research components encountered issues but I've provided the best answer possible with available information.*";

pub const BEST_EFFORT_NOTE: &str = "\n\n*Note: Research stopped at its step limit, so this answer is a best-effort summary of what was found.*";

pub const INSUFFICIENT_INFORMATION: &str = "I apologize, but I encountered errors while researching your question. Please try again or rephrase your query.";

const ARTIFACT_TAGS: &[&str] = &[
    "deep_search",
    "tavily_search",
    "serpapi_search",
    "web_scraper",
    "get_current_datetime",
    "planner",
    "search",
];

static ARTIFACT_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    ARTIFACT_TAGS
        .iter()
        .flat_map(|tag| {
            [
                Regex::new(&format!(r"(?s)<{tag}\b[^>]*>.*?</{tag}>", tag = tag)).expect("valid regex"),
                Regex::new(&format!(r"</?{tag}\b[^>]*/?>", tag = tag)).expect("valid regex"),
            ]
        })
        .collect()
});

static BLANK_RUN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n\s*\n\s*\n").expect("valid regex"));

static CITED_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\]\((https?://[^)\s]+)\)").expect("valid regex"));

static REFERENCES_HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*(?:#{1,6}\s*|\*\*)references\b").expect("valid regex"));

pub struct ReplyAgent {
    llm: LLM,
    emitter: ProgressEmitter,
    system_prompt: String,
    known_facts: Option<String>,
    stream: bool,
}

impl ReplyAgent {
    pub fn new(llm: LLM, emitter: &ProgressEmitter) -> Self {
        Self {
            llm,
            emitter: emitter.clone(),
            system_prompt: SYNTHESIS_SYSTEM_PROMPT.to_string(),
            known_facts: None,
            stream: false,
        }
    }

    pub fn with_system_prompt(mut self, prompt: Option<&str>) -> Self {
        if let Some(p) = prompt.filter(|p| !p.trim().is_empty()) {
            self.system_prompt = p.to_string();
        }
        self
    }

    /// Facts gathered before research, such as the current date. They go into
    /// the prompt context, not the numbered results.
    pub fn with_known_facts(mut self, facts: Option<&str>) -> Self {
        self.known_facts = facts.filter(|f| !f.trim().is_empty()).map(String::from);
        self
    }

    pub fn with_streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Write the answer. With no results this is a plain conversational
    /// completion; otherwise the results are rendered into a research prompt.
    pub async fn synthesize(
        &self,
        query: &str,
        history: &[LLMMessage],
        results: &[ToolResult],
        best_effort: bool,
    ) -> AppResult<String> {
        info!(
            query_len = query.len(),
            results = results.len(),
            failed = results.iter().filter(|r| !r.success).count(),
            best_effort,
            "Synthesizing reply"
        );

        let mut messages = history.to_vec();
        let request = if results.is_empty() {
            messages.push(LLMMessage::user(query));
            let system = match &self.known_facts {
                Some(facts) => format!("{}\n\nKnown Facts:\n{}", self.system_prompt, facts),
                None => self.system_prompt.clone(),
            };
            self.llm.request(messages).with_system(system)
        } else {
            messages.push(LLMMessage::user(self.create_synthesis_prompt(query, results)));
            self.llm
                .request(messages)
                .with_system(self.system_prompt.as_str())
                .with_temperature(0.7)
                .with_max_tokens(2000)
        };

        let text = self.complete(&request).await?;
        let mut answer = Self::finalize(&text, results);
        if best_effort {
            answer.push_str(BEST_EFFORT_NOTE);
        }
        Ok(answer)
    }

    /// Clean up model text and attach references and failure notes
    pub fn finalize(text: &str, results: &[ToolResult]) -> String {
        let cleaned = strip_tool_artifacts(text);
        if cleaned.is_empty() {
            return INSUFFICIENT_INFORMATION.to_string();
        }

        let mut answer = ensure_references(&cleaned, &collect_sources(results));
        if results.iter().any(|r| !r.success) {
            answer.push_str(PARTIAL_FAILURE_NOTE);
        }
        answer
    }

    fn create_synthesis_prompt(&self, query: &str, results: &[ToolResult]) -> String {
        let guidance = if results.iter().all(|r| !r.success) {
            "None of the research steps returned usable information. Say plainly that there was insufficient information to answer fully, then give only what you can state with confidence, clearly caveated."
        } else {
            "Based on the research results above, provide a comprehensive answer to the user's query. Include citations to sources where appropriate."
        };

        let facts = match &self.known_facts {
            Some(facts) => format!("Known Facts:\n{}\n\n", facts),
            None => String::new(),
        };
        format!(
            "User Query: {query}\n\n{facts}Research Results:\n{context}\n\n{guidance}",
            query = query,
            facts = facts,
            context = render_research_context(results),
            guidance = guidance,
        )
    }

    async fn complete(&self, request: &LLMRequest) -> AppResult<String> {
        if !self.stream {
            return self.complete_once(request).await;
        }

        match self.llm.create_chat_completion_stream(request).await {
            Ok(mut stream) => {
                let mut full = String::new();
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(delta) => {
                            if !delta.is_empty() {
                                self.emitter.chunk(delta.as_str());
                                full.push_str(&delta);
                            }
                        }
                        Err(e) if full.trim().is_empty() => {
                            warn!(error = %e, "Stream failed before any text, falling back");
                            return self.complete_once(request).await;
                        }
                        Err(e) => {
                            // A fresh completion could contradict what was already streamed
                            warn!(error = %e, received = full.len(), "Stream broke mid-answer, keeping partial text");
                            return Ok(full);
                        }
                    }
                }

                if full.trim().is_empty() {
                    warn!("Streaming returned empty response, falling back");
                    return self.complete_once(request).await;
                }
                Ok(full)
            }
            Err(e) => {
                warn!(error = %e, "Streaming not available, falling back to standard completion");
                self.complete_once(request).await
            }
        }
    }

    async fn complete_once(&self, request: &LLMRequest) -> AppResult<String> {
        let response = self.llm.create_chat_completion(request).await?;
        info!(response_len = response.content.len(), "Generated reply");
        Ok(response.content)
    }
}

/// One block per result, in plan order. Failed steps still get a block so the
/// model knows what is missing.
pub fn render_research_context(results: &[ToolResult]) -> String {
    results
        .iter()
        .enumerate()
        .map(|(i, result)| {
            let mut block = format!("### Result {} ({})\n", i + 1, result.tool);
            if !result.arguments.is_null() && result.arguments != serde_json::json!({}) {
                block.push_str(&format!("Input: {}\n", result.arguments));
            }
            if result.success {
                block.push_str(&result.to_context());
                if !result.sources.is_empty() {
                    block.push_str("\nSources:\n");
                    for source in &result.sources {
                        block.push_str(&format!("- {}: {}\n", source.title, source.url));
                    }
                }
            } else {
                block.push_str(&format!(
                    "No information available: {}",
                    result.error.as_deref().unwrap_or("step failed")
                ));
            }
            block
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Sources from every successful result, first occurrence of each URL wins
pub fn collect_sources(results: &[ToolResult]) -> Vec<Source> {
    let mut seen = HashSet::new();
    results
        .iter()
        .filter(|r| r.success)
        .flat_map(|r| r.sources.iter())
        .filter(|s| !s.url.is_empty() && seen.insert(s.url.clone()))
        .cloned()
        .collect()
}

pub fn strip_tool_artifacts(text: &str) -> String {
    let mut cleaned = text.to_string();
    for re in ARTIFACT_RES.iter() {
        cleaned = re.replace_all(&cleaned, "").into_owned();
    }
    BLANK_RUN_RE.replace_all(&cleaned, "\n\n").trim().to_string()
}

/// Append a references section unless the answer already has one. Cited URLs
/// are listed in first-use order; with no inline citations the collected
/// sources are listed instead.
pub fn ensure_references(text: &str, sources: &[Source]) -> String {
    if REFERENCES_HEADING_RE.is_match(text) {
        return text.to_string();
    }

    let mut seen = HashSet::new();
    let cited: Vec<&str> = CITED_URL_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .filter(|url| seen.insert(*url))
        .collect();

    let entries: Vec<(String, String)> = if cited.is_empty() {
        sources.iter().map(|s| (s.title.clone(), s.url.clone())).collect()
    } else {
        cited
            .into_iter()
            .map(|url| {
                let title = sources
                    .iter()
                    .find(|s| s.url == url)
                    .map(|s| s.title.clone())
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| url.to_string());
                (title, url.to_string())
            })
            .collect()
    };

    if entries.is_empty() {
        return text.to_string();
    }

    let mut out = format!("{}\n\n## References\n\n", text.trim_end());
    for (i, (title, url)) in entries.iter().enumerate() {
        let title = if title.is_empty() { url } else { title };
        out.push_str(&format!("{}. [{}]({})\n", i + 1, title, url));
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StreamEvent;
    use crate::llm::testing::{fake_llm, last_user_text, FakeAdapter};
    use crate::llm::{ChunkStream, LLMAdapter};
    use crate::types::{AppError, LLMProvider, LLMResponse};
    use crate::utils::retry::RetryPolicy;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn search_result(url: &str) -> ToolResult {
        ToolResult::ok(
            "tavily_search",
            json!({"query": "q"}),
            json!({"results": [{"url": url}]}),
            vec![Source {
                title: format!("Title of {}", url),
                url: url.to_string(),
            }],
        )
    }

    #[test]
    fn test_strip_tool_artifacts() {
        let text = "Intro.\n<deep_search>rust async</deep_search>\n\n\n\nBody <tavily_search query=\"x\"/> text.\n</search>";
        assert_eq!(strip_tool_artifacts(text), "Intro.\n\nBody  text.");
        assert_eq!(strip_tool_artifacts("<research>kept</research>"), "<research>kept</research>");
    }

    #[test]
    fn test_references_follow_first_use_order() {
        let text = "B first.<sup>[[1]](https://b.example)</sup> A next.<sup>[[2]](https://a.example)</sup> B again.<sup>[[1]](https://b.example)</sup>";
        let sources = vec![
            Source { title: "A".into(), url: "https://a.example".into() },
            Source { title: "B".into(), url: "https://b.example".into() },
        ];
        let out = ensure_references(text, &sources);
        assert!(out.ends_with("## References\n\n1. [B](https://b.example)\n2. [A](https://a.example)"));
    }

    #[test]
    fn test_references_from_sources_when_uncited() {
        let sources = vec![Source { title: "A".into(), url: "https://a.example".into() }];
        let out = ensure_references("Plain answer.", &sources);
        assert_eq!(out, "Plain answer.\n\n## References\n\n1. [A](https://a.example)");

        assert_eq!(ensure_references("Plain answer.", &[]), "Plain answer.");
        let existing = "Text\n\n## References\n1. [x](https://x.example)";
        assert_eq!(ensure_references(existing, &sources), existing);
    }

    #[test]
    fn test_collect_sources_skips_failures_and_duplicates() {
        let results = vec![
            search_result("https://a.example"),
            ToolResult::failed("tavily_search", json!({}), "down"),
            search_result("https://a.example"),
            search_result("https://b.example"),
        ];
        let urls: Vec<_> = collect_sources(&results).into_iter().map(|s| s.url).collect();
        assert_eq!(urls, vec!["https://a.example", "https://b.example"]);
    }

    #[tokio::test]
    async fn test_synthesis_prompt_covers_every_result() {
        let adapter = FakeAdapter::text("A is documented.<sup>[[1]](https://a.example)</sup>");
        let agent = ReplyAgent::new(fake_llm(adapter.clone()), &ProgressEmitter::noop());
        let results = vec![
            search_result("https://a.example"),
            ToolResult::failed("tavily_search", json!({"query": "b"}), "timeout"),
            search_result("https://c.example"),
        ];

        let answer = agent.synthesize("Tell me about A", &[], &results, false).await.unwrap();
        assert!(answer.contains("1. [Title of https://a.example](https://a.example)"));
        assert!(answer.ends_with(PARTIAL_FAILURE_NOTE));

        let request = &adapter.requests()[0];
        let prompt = last_user_text(request);
        assert_eq!(prompt.matches("### Result ").count(), 3);
        assert!(prompt.contains("No information available: timeout"));
        assert_eq!(request.system_instruction.as_deref(), Some(SYNTHESIS_SYSTEM_PROMPT));
        assert!(request.tools.is_empty());
    }

    #[tokio::test]
    async fn test_all_failed_degrades_to_insufficient_information() {
        let adapter = FakeAdapter::text("There is insufficient information to answer this fully.");
        let agent = ReplyAgent::new(fake_llm(adapter.clone()), &ProgressEmitter::noop());
        let results = vec![ToolResult::failed("tavily_search", json!({}), "down")];

        let answer = agent.synthesize("q", &[], &results, false).await.unwrap();
        assert!(answer.starts_with("There is insufficient information"));
        assert!(last_user_text(&adapter.requests()[0]).contains("insufficient information"));

        let empty = ReplyAgent::new(fake_llm(FakeAdapter::text("")), &ProgressEmitter::noop());
        assert_eq!(empty.synthesize("q", &[], &results, false).await.unwrap(), INSUFFICIENT_INFORMATION);
    }

    #[tokio::test]
    async fn test_streaming_emits_growing_chunks() {
        let adapter = FakeAdapter::text("Rust is a systems language.");
        let (emitter, mut rx) = ProgressEmitter::channel();
        let agent = ReplyAgent::new(fake_llm(adapter), &emitter).with_streaming(true);

        let answer = agent.synthesize("What is Rust?", &[], &[], false).await.unwrap();
        assert_eq!(answer, "Rust is a systems language.");

        drop(agent);
        drop(emitter);
        let mut accumulated = String::new();
        while let Some(event) = rx.recv().await {
            if let StreamEvent::ResponseChunk { content } = event {
                accumulated.push_str(&content);
            }
        }
        assert_eq!(accumulated, answer);
    }

    /// Stream that yields `before_error` deltas and then breaks
    struct BrokenStream {
        before_error: Vec<&'static str>,
        completions: AtomicUsize,
    }

    impl BrokenStream {
        fn llm(before_error: Vec<&'static str>) -> (LLM, Arc<Self>) {
            let adapter = Arc::new(Self {
                before_error,
                completions: AtomicUsize::new(0),
            });
            let llm = LLM::from_adapter(adapter.clone(), LLMProvider::OpenAI, "m").with_retry(RetryPolicy::none());
            (llm, adapter)
        }
    }

    #[async_trait]
    impl LLMAdapter for BrokenStream {
        async fn create_chat_completion(&self, _request: &LLMRequest) -> AppResult<LLMResponse> {
            self.completions.fetch_add(1, Ordering::SeqCst);
            Ok(LLMResponse {
                content: "Recovered answer.".into(),
                ..Default::default()
            })
        }

        async fn create_chat_completion_stream(&self, _request: &LLMRequest) -> AppResult<ChunkStream> {
            let mut chunks: Vec<AppResult<String>> = self.before_error.iter().map(|c| Ok(c.to_string())).collect();
            chunks.push(Err(AppError::llm("connection reset")));
            Ok(futures::stream::iter(chunks).boxed())
        }
    }

    #[tokio::test]
    async fn test_stream_failure_before_text_falls_back_to_completion() {
        let (llm, adapter) = BrokenStream::llm(vec![]);
        let agent = ReplyAgent::new(llm, &ProgressEmitter::noop()).with_streaming(true);
        let answer = agent.synthesize("q", &[], &[], true).await.unwrap();
        assert!(answer.starts_with("Recovered answer."));
        assert!(answer.ends_with(BEST_EFFORT_NOTE));
        assert_eq!(adapter.completions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stream_failure_mid_answer_keeps_streamed_text() {
        let (llm, adapter) = BrokenStream::llm(vec!["Rust was ", "first released in 2015."]);
        let (emitter, mut rx) = ProgressEmitter::channel();
        let agent = ReplyAgent::new(llm, &emitter).with_streaming(true);

        let answer = agent.synthesize("q", &[], &[], false).await.unwrap();
        drop(agent);
        drop(emitter);

        assert_eq!(answer, "Rust was first released in 2015.");
        assert_eq!(adapter.completions.load(Ordering::SeqCst), 0);
        let mut streamed = String::new();
        while let Some(event) = rx.recv().await {
            if let StreamEvent::ResponseChunk { content } = event {
                streamed.push_str(&content);
            }
        }
        assert!(answer.starts_with(&streamed));
    }

    #[tokio::test]
    async fn test_known_facts_are_context_not_results() {
        let adapter = FakeAdapter::text("Answer.");
        let agent = ReplyAgent::new(fake_llm(adapter.clone()), &ProgressEmitter::noop())
            .with_known_facts(Some("Current date and time: Friday, March 15, 2024"));
        let results = vec![search_result("https://a.example")];

        agent.synthesize("What happened today?", &[], &results, false).await.unwrap();
        let prompt = last_user_text(&adapter.requests()[0]);
        assert_eq!(prompt.matches("### Result ").count(), 1);
        assert!(prompt.contains("Known Facts:\nCurrent date and time: Friday, March 15, 2024"));

        agent.synthesize("What day is it?", &[], &[], false).await.unwrap();
        let system = adapter.requests()[1].system_instruction.clone().unwrap();
        assert!(system.ends_with("Known Facts:\nCurrent date and time: Friday, March 15, 2024"));
    }
}
