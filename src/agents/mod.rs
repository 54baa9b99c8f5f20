//! Agent System
//!
//! The agents that turn one user message into one cited answer:
//!
//! - **Query Classifier**: picks a category and an execution strategy
//! - **Planning Agent**: breaks research questions into tool calls and sub-questions
//! - **Executor**: runs the plan, or lets the model drive tools in a bounded loop
//! - **Reply Agent**: synthesizes the final answer with citations
//!
//! ## Pipeline Overview
//!
//! ```text
//! User Message
//!      │
//!      ▼
//! ┌─────────────┐
//! │ Classifier  │  → category + strategy (keywords first, then LLM)
//! └─────────────┘
//!      │
//!      ├──────────────────┬─────────────────────┐
//!      ▼                  ▼                     ▼
//!   direct         ┌─────────────┐       ┌─────────────┐
//!  (no tools)      │  Planning   │       │  Tool loop  │  → model calls tools
//!      │           │   Agent     │       │  (≤ N turns)│
//!      │           └─────────────┘       └─────────────┘
//!      │                  │                     │
//!      │                  ▼                     │
//!      │           ┌─────────────┐              │
//!      │           │  Executor   │  → steps, parallel groups joined in order
//!      │           └─────────────┘              │
//!      ▼                  ▼                     ▼
//! ┌──────────────────────────────────────────────────┐
//! │                  Reply Agent                     │  → cited answer, streamed
//! └──────────────────────────────────────────────────┘
//!      │
//!      ▼
//!  User Response
//! ```
//!
//! Every stage reports through the turn's [`ProgressEmitter`].

pub mod classifier;
pub mod executor;
pub mod planning;
pub mod reply;

pub use classifier::{Complexity, ExecutionStrategy, QueryAnalysis, QueryCategory, QueryClassifier};
pub use executor::{Executor, ExecutorState, ToolLoopOutcome, SEARCH_SYSTEM_PROMPT};
pub use planning::{ExecutionPlan, PlanStep, PlanningAgent, StepKind, StepStatus};
pub use reply::{ReplyAgent, SYNTHESIS_SYSTEM_PROMPT};

use serde_json::json;
use tracing::{info, warn};

use crate::config::Config;
use crate::events::{ProgressEmitter, ProgressStatus};
use crate::llm::LLM;
use crate::tools::{datetime, Source, ToolRegistry, ToolResult};
use crate::types::{AppResult, LLMMessage, LLMProvider};

/// Render prior messages for inclusion in a prompt
pub fn format_conversation_history(messages: &[LLMMessage], max_messages: usize, max_chars: usize) -> String {
    if messages.is_empty() {
        return "No previous conversation.".to_string();
    }

    let start = messages.len().saturating_sub(max_messages);
    messages[start..]
        .iter()
        .map(|m| {
            let content = if m.content.chars().count() > max_chars {
                format!("{}...", m.content.chars().take(max_chars).collect::<String>())
            } else {
                m.content.clone()
            };
            format!("{}: {}", m.role.to_uppercase(), content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Everything that varies per turn, resolved before the pipeline starts
#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub provider: LLMProvider,
    pub model: Option<String>,
    pub planner_model: Option<String>,
    pub classifier_model: Option<String>,
    pub system_prompt: Option<String>,
    pub planner_system_prompt: Option<String>,
    pub deep_research: bool,
    pub multi_agent: bool,
    pub stream: bool,
    pub timezone: String,
    pub max_tool_iterations: usize,
}

impl TurnConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            provider: config.llm.default_provider,
            model: config.llm.default_model.clone(),
            planner_model: config.llm.planner_model.clone(),
            classifier_model: config.llm.classifier_model.clone(),
            system_prompt: None,
            planner_system_prompt: None,
            deep_research: false,
            multi_agent: true,
            stream: true,
            timezone: config.agent.default_timezone.clone(),
            max_tool_iterations: config.agent.max_tool_iterations,
        }
    }
}

/// How a classified turn is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// One synthesis call, no tools
    Direct,
    /// Planner, then executor over the plan
    Plan,
    /// Model-driven function calling
    ToolLoop,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Direct => "direct",
            Route::Plan => "plan",
            Route::ToolLoop => "tool_loop",
        }
    }
}

pub fn route(analysis: &QueryAnalysis, multi_agent: bool, has_tools: bool) -> Route {
    if analysis.strategy == ExecutionStrategy::Direct && analysis.category != QueryCategory::SimpleSearch {
        Route::Direct
    } else if multi_agent && analysis.requires_planning {
        Route::Plan
    } else if has_tools {
        Route::ToolLoop
    } else {
        Route::Direct
    }
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub content: String,
    pub analysis: QueryAnalysis,
    pub route: Route,
    pub tools_used: Vec<String>,
    pub sources: Vec<Source>,
    pub failed_steps: usize,
    pub best_effort: bool,
}

/// One turn through classifier, planner or tool loop, and reply agent
pub struct ResearchPipeline {
    llm: LLM,
    tools: ToolRegistry,
    config: TurnConfig,
    emitter: ProgressEmitter,
    classifier: QueryClassifier,
}

impl ResearchPipeline {
    pub fn new(llm: LLM, tools: ToolRegistry, config: TurnConfig, emitter: &ProgressEmitter) -> Self {
        let classifier = QueryClassifier::new(llm.with_model(config.classifier_model.as_deref()));
        Self {
            llm,
            tools,
            config,
            emitter: emitter.clone(),
            classifier,
        }
    }

    pub fn with_classifier(mut self, classifier: QueryClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Run the turn and emit the final `response` event. Only provider
    /// failures in the tool loop or the synthesis call are returned as errors.
    pub async fn run(&self, query: &str, history: &[LLMMessage]) -> AppResult<TurnOutcome> {
        let master = self.emitter.with_source("master_agent");
        master.progress("analyzing", ProgressStatus::InProgress, "Analyzing your request...", 5);

        let analysis = self.classifier.classify(query, history).await;
        let mut route = route(&analysis, self.config.multi_agent, !self.tools.is_empty());
        info!(
            category = %analysis.category,
            strategy = ?analysis.strategy,
            route = ?route,
            deep_research = self.config.deep_research,
            "Routing turn"
        );
        master.progress(
            "routing",
            ProgressStatus::InProgress,
            format!("Planning {} response...", analysis.category.as_str().replace('_', " ")),
            10,
        );

        let mut executor =
            Executor::new(self.llm.clone(), self.tools.clone(), &self.emitter).with_max_iterations(self.config.max_tool_iterations);
        let mut results: Vec<ToolResult> = Vec::new();

        // Temporal questions get the clock before anything else looks at them.
        // The reading is context for later prompts, not a research result.
        let mut current_time = None;
        let mut clock_read = false;
        if analysis.needs_datetime && route != Route::Direct && self.tools.get(datetime::TOOL_NAME).is_some() {
            let arguments = json!({ "timezone": self.config.timezone, "format": "full" });
            master.tool_call(datetime::TOOL_NAME, &arguments);
            let result = self.tools.invoke(datetime::TOOL_NAME, arguments).await;
            clock_read = true;
            if result.success {
                current_time = result.output["formatted"].as_str().map(|s| format!("Current date and time: {}", s));
            } else {
                warn!(error = ?result.error, "Clock read failed");
            }
        }

        let mut direct_answer = None;
        let mut best_effort = false;

        if route == Route::Plan {
            executor.transition(ExecutorState::Planning);
            let planner = PlanningAgent::new(self.llm.with_model(self.config.planner_model.as_deref()), &self.emitter)
                .with_system_prompt(self.config.planner_system_prompt.as_deref());
            match planner
                .generate_plan(query, history, current_time.as_deref(), &self.tools)
                .await
            {
                Ok(mut plan) => results.extend(executor.execute_plan(&mut plan, query).await),
                Err(e) => {
                    warn!(error = %e, "No usable plan, answering directly");
                    route = Route::Direct;
                }
            }
        } else if route == Route::ToolLoop {
            let system_prompt = self.tool_loop_system_prompt(current_time.as_deref());
            let mut messages = history.to_vec();
            messages.push(LLMMessage::user(query));

            let outcome = executor.run_tool_loop(&system_prompt, messages).await?;
            results.extend(outcome.results);
            direct_answer = outcome.answer;
            best_effort = outcome.hit_cap;
        }

        let content = match direct_answer {
            Some(answer) => {
                master.progress("formatting", ProgressStatus::InProgress, "Formatting with citations...", 95);
                ReplyAgent::finalize(&answer, &results)
            }
            None => {
                executor.transition(ExecutorState::Synthesizing);
                master.progress(
                    "synthesizing",
                    ProgressStatus::InProgress,
                    "Analyzing and synthesizing results...",
                    90,
                );
                let reply = ReplyAgent::new(self.llm.clone(), &self.emitter)
                    .with_system_prompt(self.config.system_prompt.as_deref())
                    .with_known_facts(current_time.as_deref())
                    .with_streaming(self.config.stream);
                match reply.synthesize(query, history, &results, best_effort).await {
                    Ok(content) => content,
                    Err(e) => {
                        executor.transition(ExecutorState::Failed);
                        return Err(e);
                    }
                }
            }
        };

        executor.transition(ExecutorState::Done);
        master.progress("complete", ProgressStatus::Completed, "Response ready", 100);
        self.emitter.response(content.as_str());

        let mut tools_used: Vec<String> = Vec::new();
        if clock_read {
            tools_used.push(datetime::TOOL_NAME.to_string());
        }
        for result in &results {
            if !tools_used.contains(&result.tool) {
                tools_used.push(result.tool.clone());
            }
        }

        info!(
            route = ?route,
            tools = tools_used.len(),
            response_len = content.len(),
            best_effort,
            "Turn complete"
        );

        Ok(TurnOutcome {
            content,
            analysis,
            route,
            tools_used,
            sources: reply::collect_sources(&results),
            failed_steps: results.iter().filter(|r| !r.success).count(),
            best_effort,
        })
    }

    fn tool_loop_system_prompt(&self, current_time: Option<&str>) -> String {
        let mut prompt = self
            .config
            .system_prompt
            .clone()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| SEARCH_SYSTEM_PROMPT.to_string());
        prompt.push_str(&format!(
            "\n\n## User Context\n- User's timezone: {tz}\n- When using get_current_datetime, always pass timezone=\"{tz}\" to get correct local time.",
            tz = self.config.timezone
        ));
        if let Some(now) = current_time {
            prompt.push_str(&format!("\n- {}", now));
        }
        prompt
    }
}
