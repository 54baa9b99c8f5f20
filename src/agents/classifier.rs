//! Query Classifier
//!
//! Decides how a turn is routed. A keyword pass answers the obvious cases
//! (temporal questions, comparisons, short definitions, research requests,
//! news) without touching the network; anything else costs one small LLM
//! call that must answer with a JSON object. Classification never fails:
//! any provider or parse problem yields `general` / `sequential`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::{debug, info, warn};

use crate::agents::format_conversation_history;
use crate::llm::LLM;
use crate::types::LLMMessage;

static TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    keyword_regex(&[
        "yesterday", "today", "tomorrow", "last week", "this week", "next week", "last month",
        "this month", "recently", "latest", "current", "now", "when", "what time", "date",
    ])
});

static COMPARISON_RE: LazyLock<Regex> = LazyLock::new(|| {
    keyword_regex(&["vs", "versus", "compare", "comparison", "difference", "better", "which is", "or", "between"])
});

static RESEARCH_RE: LazyLock<Regex> = LazyLock::new(|| {
    keyword_regex(&[
        "research", "analyze", "study", "investigate", "explore", "explain", "comprehensive",
        "detailed", "in-depth", "overview",
    ])
});

static NEWS_RE: LazyLock<Regex> = LazyLock::new(|| keyword_regex(&["news", "update", "information"]));

static JSON_OBJECT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{[^{}]*\}").expect("valid regex"));

const SIMPLE_PREFIXES: &[&str] = &["what is", "who is", "where is", "define", "meaning of"];
const SIMPLE_MAX_WORDS: usize = 6;

/// Whole-word, case-insensitive alternation so "or" does not match "for"
fn keyword_regex(words: &[&str]) -> Regex {
    let alternation = words.iter().map(|w| regex::escape(w)).collect::<Vec<_>>().join("|");
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternation)).expect("valid regex")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryCategory {
    SimpleFact,
    SimpleSearch,
    ComplexResearch,
    TimeBased,
    Comparison,
    General,
}

impl QueryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryCategory::SimpleFact => "simple_fact",
            QueryCategory::SimpleSearch => "simple_search",
            QueryCategory::ComplexResearch => "complex_research",
            QueryCategory::TimeBased => "time_based",
            QueryCategory::Comparison => "comparison",
            QueryCategory::General => "general",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "simple_fact" => Some(QueryCategory::SimpleFact),
            "simple_search" => Some(QueryCategory::SimpleSearch),
            "complex_research" => Some(QueryCategory::ComplexResearch),
            "time_based" => Some(QueryCategory::TimeBased),
            "comparison" => Some(QueryCategory::Comparison),
            "general" => Some(QueryCategory::General),
            _ => None,
        }
    }
}

impl std::fmt::Display for QueryCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Answer in one call, no tools
    Direct,
    Sequential,
    Parallel,
    Conditional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "low" => Complexity::Low,
            "high" => Complexity::High,
            _ => Complexity::Medium,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAnalysis {
    pub category: QueryCategory,
    pub strategy: ExecutionStrategy,
    pub requires_planning: bool,
    pub needs_datetime: bool,
    pub complexity: Complexity,
    pub confidence: f32,
    pub reasoning: String,
}

impl QueryAnalysis {
    fn new(
        category: QueryCategory,
        strategy: ExecutionStrategy,
        requires_planning: bool,
        complexity: Complexity,
        confidence: f32,
        reasoning: &str,
    ) -> Self {
        Self {
            category,
            strategy,
            requires_planning,
            needs_datetime: category == QueryCategory::TimeBased,
            complexity,
            confidence,
            reasoning: reasoning.to_string(),
        }
    }

    /// Routing used when classification cannot be trusted
    pub fn fallback(reason: &str) -> Self {
        Self::new(
            QueryCategory::General,
            ExecutionStrategy::Sequential,
            false,
            Complexity::Medium,
            0.5,
            reason,
        )
    }
}

#[derive(Debug, Deserialize)]
struct LlmClassification {
    query_type: String,
    #[serde(default)]
    requires_planning: bool,
    #[serde(default)]
    complexity: Option<String>,
}

pub struct QueryClassifier {
    llm: LLM,
    keyword_routing: bool,
}

impl QueryClassifier {
    pub fn new(llm: LLM) -> Self {
        Self {
            llm,
            keyword_routing: true,
        }
    }

    /// Skip the keyword pass and always ask the model
    pub fn llm_only(mut self) -> Self {
        self.keyword_routing = false;
        self
    }

    pub async fn classify(&self, query: &str, history: &[LLMMessage]) -> QueryAnalysis {
        if self.keyword_routing {
            if let Some(analysis) = classify_by_keywords(query) {
                info!(category = %analysis.category, strategy = ?analysis.strategy, "Query classified by keywords");
                return analysis;
            }
        }

        let analysis = self.classify_with_llm(query, history).await;
        info!(
            category = %analysis.category,
            strategy = ?analysis.strategy,
            confidence = analysis.confidence,
            "Query classified"
        );
        analysis
    }

    async fn classify_with_llm(&self, query: &str, history: &[LLMMessage]) -> QueryAnalysis {
        let prompt = Self::create_classification_prompt(query, history);

        let response = match self.llm.prompt(&prompt, 0.1, 150).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Classification call failed, using fallback routing");
                return QueryAnalysis::fallback(&format!("Classification failed: {}", e));
            }
        };

        match parse_classification(&response) {
            Some(analysis) => analysis,
            None => {
                debug!(response = %response, "Unparseable classification");
                QueryAnalysis::fallback("Classification response was not valid JSON")
            }
        }
    }

    fn create_classification_prompt(query: &str, history: &[LLMMessage]) -> String {
        let context = if history.is_empty() {
            String::new()
        } else {
            format!("\n\nRecent conversation:\n{}", format_conversation_history(history, 4, 300))
        };

        format!(
            r#"Analyze the following user query and classify it for routing to appropriate research agents.

User Query: "{query}"{context}

Classify the query type as ONE of:
- simple_fact: Single concept definitions or straightforward questions
- simple_search: Current information, news, or updates
- complex_research: Multi-faceted research requiring deep analysis
- time_based: Questions involving specific dates or time periods
- comparison: Comparing two or more things
- general: Default for unclear queries

Also determine:
- requires_planning: true if the query benefits from a structured research plan, false otherwise
- complexity: low, medium, or high

Respond ONLY with a JSON object in this exact format:
{{
    "query_type": "...",
    "requires_planning": true/false,
    "complexity": "low/medium/high"
}}"#,
            query = query,
            context = context,
        )
    }
}

/// Keyword fast path; `None` means the query needs the model
pub fn classify_by_keywords(query: &str) -> Option<QueryAnalysis> {
    use ExecutionStrategy::{Direct, Sequential};
    use QueryCategory::*;

    let lowered = query.trim().to_lowercase();
    let has_time = TIME_RE.is_match(&lowered);
    let has_comparison = COMPARISON_RE.is_match(&lowered);
    let has_research = RESEARCH_RE.is_match(&lowered);
    let is_simple = SIMPLE_PREFIXES.iter().any(|p| lowered.starts_with(p))
        && lowered.split_whitespace().count() <= SIMPLE_MAX_WORDS;

    let analysis = if has_time && has_research {
        QueryAnalysis::new(TimeBased, Sequential, true, Complexity::High, 0.85, "Temporal research query")
    } else if has_time {
        QueryAnalysis::new(TimeBased, Sequential, false, Complexity::Medium, 0.9, "Temporal keywords detected")
    } else if has_comparison {
        QueryAnalysis::new(Comparison, Sequential, true, Complexity::High, 0.9, "Comparison keywords detected")
    } else if is_simple {
        QueryAnalysis::new(SimpleFact, Direct, false, Complexity::Low, 0.8, "Short definitional question")
    } else if has_research {
        QueryAnalysis::new(ComplexResearch, Sequential, true, Complexity::High, 0.85, "Research keywords detected")
    } else if NEWS_RE.is_match(&lowered) {
        QueryAnalysis::new(SimpleSearch, Direct, false, Complexity::Low, 0.8, "News or update request")
    } else {
        return None;
    };
    Some(analysis)
}

/// Pull the first flat JSON object out of a model reply
fn parse_classification(response: &str) -> Option<QueryAnalysis> {
    let object = JSON_OBJECT_RE.find(response)?;
    let parsed: LlmClassification = serde_json::from_str(object.as_str()).ok()?;
    let category = QueryCategory::from_label(&parsed.query_type)?;

    let strategy = if category == QueryCategory::TimeBased || parsed.requires_planning {
        ExecutionStrategy::Sequential
    } else {
        ExecutionStrategy::Direct
    };
    let complexity = parsed
        .complexity
        .as_deref()
        .map(Complexity::from_label)
        .unwrap_or(Complexity::Medium);

    Some(QueryAnalysis::new(
        category,
        strategy,
        parsed.requires_planning,
        complexity,
        0.7,
        "Classified by model",
    ))
}
