//! Planning Agent
//!
//! Turns a research question into an [`ExecutionPlan`]: a goal plus ordered
//! steps that are either concrete tool calls (`tavily_search {query}`,
//! `web_scraper {url}`) or sub-questions answered by another LLM call.
//! Independent searches are marked parallel so the executor can fan them out.
//! Plans live for one turn only and are never persisted.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::ops::Range;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

use crate::agents::format_conversation_history;
use crate::events::{ProgressEmitter, ProgressStatus};
use crate::llm::LLM;
use crate::tools::{datetime, scraper, ToolRegistry};
use crate::types::{AppError, AppResult, LLMMessage};

pub const PLANNER_SYSTEM_PROMPT: &str = "You are a research planning assistant. Your task is to create a detailed, structured research plan for the following query.";

const DEFAULT_NUM_STEPS: usize = 3;
const MAX_QUERIES_PER_STEP: usize = 3;

static JSON_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    ToolCall { tool: String, arguments: Value },
    SubQuestion { question: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub number: usize,
    pub description: String,
    pub kind: StepKind,
    /// May run concurrently with neighbouring parallel steps
    pub parallel: bool,
    pub status: StepStatus,
}

impl PlanStep {
    pub fn tool_call(number: usize, description: &str, tool: &str, arguments: Value, parallel: bool) -> Self {
        Self {
            number,
            description: description.to_string(),
            kind: StepKind::ToolCall {
                tool: tool.to_string(),
                arguments,
            },
            parallel,
            status: StepStatus::Pending,
        }
    }

    pub fn sub_question(number: usize, question: &str, parallel: bool) -> Self {
        Self {
            number,
            description: question.to_string(),
            kind: StepKind::SubQuestion {
                question: question.to_string(),
            },
            parallel,
            status: StepStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub goal: String,
    pub steps: Vec<PlanStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_sources: Option<u32>,
}

impl ExecutionPlan {
    /// Index ranges executed as one unit: runs of consecutive parallel steps,
    /// every other step alone.
    pub fn groups(&self) -> Vec<Range<usize>> {
        let mut groups = Vec::new();
        let mut start = 0;
        while start < self.steps.len() {
            let mut end = start + 1;
            if self.steps[start].parallel {
                while end < self.steps.len() && self.steps[end].parallel {
                    end += 1;
                }
            }
            groups.push(start..end);
            start = end;
        }
        groups
    }
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    goal: String,
    steps: Vec<RawStep>,
    #[serde(default)]
    expected_sources: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    step_number: usize,
    action: String,
    description: String,
    #[serde(default)]
    search_queries: Option<Vec<String>>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    parallel: Option<bool>,
}

pub struct PlanningAgent {
    llm: LLM,
    system_prompt: String,
    num_steps: usize,
    emitter: ProgressEmitter,
}

impl PlanningAgent {
    pub fn new(llm: LLM, emitter: &ProgressEmitter) -> Self {
        Self {
            llm,
            system_prompt: PLANNER_SYSTEM_PROMPT.to_string(),
            num_steps: DEFAULT_NUM_STEPS,
            emitter: emitter.with_source("planner_agent"),
        }
    }

    pub fn with_system_prompt(mut self, prompt: Option<&str>) -> Self {
        if let Some(p) = prompt.filter(|p| !p.trim().is_empty()) {
            self.system_prompt = p.to_string();
        }
        self
    }

    /// Ask the model for a plan and resolve its steps against the available tools.
    /// `extra_context` carries facts gathered before planning, such as today's date.
    pub async fn generate_plan(
        &self,
        query: &str,
        history: &[LLMMessage],
        extra_context: Option<&str>,
        tools: &ToolRegistry,
    ) -> AppResult<ExecutionPlan> {
        info!(query_len = query.len(), num_steps = self.num_steps, "Generating research plan");
        self.emitter.progress(
            "planner_analyzing",
            ProgressStatus::InProgress,
            "Analyzing query to create research strategy...",
            10,
        );

        let prompt = self.create_planning_prompt(query, history, extra_context);
        self.emitter.progress(
            "planner_generating",
            ProgressStatus::InProgress,
            format!("Creating {}-step research plan for '{}'", self.num_steps, preview(query, 50)),
            40,
        );

        let plan = match self.llm.prompt(&prompt, 0.3, 1000).await {
            Ok(response) => parse_plan(&response).and_then(|raw| resolve_plan(raw, tools)),
            Err(e) => Err(e),
        };

        match &plan {
            Ok(plan) => {
                info!(goal = %plan.goal, steps = plan.steps.len(), "Research plan ready");
                self.emitter.progress(
                    "planner_complete",
                    ProgressStatus::Completed,
                    format!("Created {}-step research plan", plan.steps.len()),
                    100,
                );
            }
            Err(e) => {
                warn!(error = %e, "Planning failed");
                self.emitter.progress(
                    "planner_error",
                    ProgressStatus::Failed,
                    format!("Planning failed: {}", e),
                    100,
                );
            }
        }
        plan
    }

    fn create_planning_prompt(&self, query: &str, history: &[LLMMessage], extra_context: Option<&str>) -> String {
        let mut context = String::new();
        if !history.is_empty() {
            context.push_str(&format!(
                "\n\nConversation Context:\n{}",
                format_conversation_history(history, 5, 500)
            ));
        }
        if let Some(extra) = extra_context {
            context.push_str(&format!("\n\nKnown Facts:\n{}", extra));
        }

        format!(
            r#"{system_prompt}

Query: "{query}"{context}

Create a research plan that breaks down this query into {num_steps} specific, actionable research steps. Each step should:
1. Have a clear action (search, scrape, or analyze)
2. Include specific search queries if the action is "search"
3. Be focused on gathering specific information

Respond ONLY with a JSON object in this exact format:
{{
    "goal": "A clear statement of what we're trying to learn",
    "steps": [
        {{
            "step_number": 1,
            "action": "search",
            "description": "Brief description of what this step accomplishes",
            "search_queries": ["specific search query 1", "specific search query 2"],
            "parallel": true
        }},
        ...
    ],
    "expected_sources": 10
}}

Rules:
- Use "search" action for web searches
- Use "scrape" with a "url" field only when a specific page must be read
- Use "analyze" for a sub-question answered by reasoning over earlier results
- Each search step should have 1-3 specific, searchable queries
- Set "parallel" to true when a step does not depend on earlier steps
- Focus on different aspects of the topic across steps
- Be specific and actionable
- Expected_sources should be your estimate of how many sources we'll need

Generate the plan now:"#,
            system_prompt = self.system_prompt,
            query = query,
            context = context,
            num_steps = self.num_steps,
        )
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    } else {
        text.to_string()
    }
}

fn parse_plan(response: &str) -> AppResult<RawPlan> {
    let block = JSON_BLOCK_RE
        .find(response)
        .ok_or_else(|| AppError::Internal("Planner returned no JSON object".to_string()))?;
    let raw: RawPlan = serde_json::from_str(block.as_str())
        .map_err(|e| AppError::Internal(format!("Invalid plan structure: {}", e)))?;

    if raw.goal.trim().is_empty() {
        return Err(AppError::Internal("Plan is missing a goal".to_string()));
    }
    for step in &raw.steps {
        if step.action == "search" && step.search_queries.as_ref().map_or(true, |q| q.is_empty()) {
            return Err(AppError::Internal(format!(
                "Step {}: search action requires a search_queries list",
                step.step_number
            )));
        }
    }
    Ok(raw)
}

/// Map model steps onto tools that exist this turn. Searches become one
/// step per query; anything the registry cannot serve becomes a sub-question.
fn resolve_plan(raw: RawPlan, tools: &ToolRegistry) -> AppResult<ExecutionPlan> {
    let search_tool = tools.default_search();
    let has_scraper = tools.get(scraper::TOOL_NAME).is_some();
    let mut steps = Vec::new();

    for step in raw.steps {
        let number = steps.len() + 1;
        match step.action.as_str() {
            "search" => {
                let queries: Vec<String> = step
                    .search_queries
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|q| !q.trim().is_empty())
                    .take(MAX_QUERIES_PER_STEP)
                    .collect();
                let parallel = step.parallel.unwrap_or(true);
                match &search_tool {
                    Some(tool) => {
                        for (offset, query) in queries.into_iter().enumerate() {
                            steps.push(PlanStep::tool_call(
                                number + offset,
                                &step.description,
                                tool,
                                json!({ "query": query }),
                                parallel,
                            ));
                        }
                    }
                    None => {
                        let question = format!("{} ({})", step.description, queries.join("; "));
                        steps.push(PlanStep::sub_question(number, &question, parallel));
                    }
                }
            }
            "scrape" if has_scraper && step.url.is_some() => {
                let url = step.url.unwrap_or_default();
                steps.push(PlanStep::tool_call(
                    number,
                    &step.description,
                    scraper::TOOL_NAME,
                    json!({ "url": url }),
                    step.parallel.unwrap_or(true),
                ));
            }
            "datetime" if tools.get(datetime::TOOL_NAME).is_some() => {
                steps.push(PlanStep::tool_call(
                    number,
                    &step.description,
                    datetime::TOOL_NAME,
                    json!({}),
                    step.parallel.unwrap_or(true),
                ));
            }
            other => {
                debug!(action = %other, step = step.step_number, "Planning step resolved as sub-question");
                steps.push(PlanStep::sub_question(number, &step.description, step.parallel.unwrap_or(false)));
            }
        }
    }

    if steps.is_empty() {
        return Err(AppError::Internal("Plan contains no steps".to_string()));
    }

    Ok(ExecutionPlan {
        goal: raw.goal,
        steps,
        expected_sources: raw.expected_sources,
    })
}
