//! Executor
//!
//! Runs the research half of a turn. Two modes:
//!
//! - **Plan mode**: walks an [`ExecutionPlan`] in order. Consecutive parallel
//!   steps are dispatched together and joined before the next sequential
//!   step; results always come back in plan order.
//! - **Tool loop**: the model is offered the tool specs and may ask for tool
//!   calls, up to `max_iterations` round trips. Hitting the cap hands control
//!   back without an answer so the caller can force a best-effort synthesis.
//!
//! ```text
//! idle ──► planning ──► running_steps ──► synthesizing ──► done
//!   │                        ▲
//!   └────────────────────────┘           (any non-idle) ──► failed
//! ```

use futures::future::join_all;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::agents::planning::{ExecutionPlan, PlanStep, StepKind, StepStatus};
use crate::agents::reply::render_research_context;
use crate::events::{ProgressEmitter, ProgressStatus};
use crate::llm::LLM;
use crate::tools::{ToolRegistry, ToolResult};
use crate::types::{AppResult, Completion, LLMMessage};

pub const SUB_QUESTION_TOOL: &str = "sub_question";

pub const SEARCH_SYSTEM_PROMPT: &str = r###"You are an expert research assistant that produces comprehensive, well-sourced research reports. Your responses should read like Wikipedia articles or academic research summaries.

## Available Tools
1. **get_current_datetime**: Get current date/time. ALWAYS use this first when the user's query involves time-sensitive information, relative dates (yesterday, last week, this month), or when you need to construct date-specific search queries.
2. **tavily_search**: Quick web search for current information, news, and facts using Tavily.
3. **serpapi_search**: Google search results via SerpAPI. Provides organic Google results with answer boxes and knowledge graphs. Good for general queries and factual information.
4. **deep_search**: Comprehensive research that searches multiple queries, reads full page content, and synthesizes information. Use this for complex topics.
5. **web_scraper**: Read the full content of a specific webpage URL.

## CRITICAL Tool Usage Rules
- Use tools by calling them through the function calling mechanism - NEVER mention them in your text response
- Do NOT write things like "<deep_search>query</deep_search>" or "I'll use the deep_search tool" in your response
- Call tools silently without describing what you're doing
- Your text responses should ONLY contain the final research answer, never tool invocation descriptions
- The user should never see tool names or execution details in your response text

## Response Guidelines

### Writing Style
- Write in a formal, encyclopedic tone similar to Wikipedia
- Use complete paragraphs with flowing prose, not bullet points
- Provide comprehensive coverage of the topic with depth and nuance
- Include relevant context, background, and implications
- Maintain objectivity and present multiple perspectives when applicable

### Citations (CRITICAL)
- Every factual claim MUST have a citation
- Use superscript numbers for citations: <sup>[[1]](URL)</sup>
- Place citations immediately after the relevant sentence or claim
- Number citations sequentially starting from 1
- At the end, include a "## References" section listing all sources

### Structure
- Start with an introductory paragraph summarizing the topic
- Use ## headers to organize major sections
- Provide detailed paragraphs under each section
- End with a "## References" section listing all cited sources

### Important Rules
- ALWAYS search for information before answering - never make up facts
- If search results are insufficient, acknowledge limitations
- Cross-reference multiple sources when possible
- Include dates and specific details when available
- Every paragraph should have at least one citation"###;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Idle,
    Planning,
    RunningSteps,
    Synthesizing,
    Done,
    Failed,
}

/// What the tool loop produced
#[derive(Debug, Clone)]
pub struct ToolLoopOutcome {
    /// `None` when the model produced no usable final answer
    pub answer: Option<String>,
    pub results: Vec<ToolResult>,
    pub iterations: usize,
    /// Every iteration asked for tools and the cap cut the loop short
    pub hit_cap: bool,
}

pub struct Executor {
    llm: LLM,
    tools: ToolRegistry,
    emitter: ProgressEmitter,
    max_iterations: usize,
    state: ExecutorState,
}

impl Executor {
    pub fn new(llm: LLM, tools: ToolRegistry, emitter: &ProgressEmitter) -> Self {
        Self {
            llm,
            tools,
            emitter: emitter.clone(),
            max_iterations: 5,
            state: ExecutorState::Idle,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    pub fn transition(&mut self, next: ExecutorState) {
        debug!(from = ?self.state, to = ?next, "Executor state change");
        self.state = next;
    }

    /// Run every step of the plan. Never fails: a broken step becomes a
    /// failed result in its plan position.
    pub async fn execute_plan(&mut self, plan: &mut ExecutionPlan, query: &str) -> Vec<ToolResult> {
        self.transition(ExecutorState::RunningSteps);
        let total = plan.steps.len();
        let mut results: Vec<ToolResult> = Vec::with_capacity(total);
        info!(goal = %plan.goal, steps = total, "Executing research plan");

        for group in plan.groups() {
            for index in group.clone() {
                let step = &mut plan.steps[index];
                step.status = StepStatus::InProgress;
                self.emit_step(step, total, results.len(), ProgressStatus::Started);
            }

            // Sub-questions see everything gathered by earlier groups
            let context = render_research_context(&results);
            let pending: Vec<_> = group
                .clone()
                .map(|index| self.run_step(&plan.steps[index], query, &context))
                .collect();
            let outcomes = join_all(pending).await;

            for (index, result) in group.zip(outcomes) {
                let step = &mut plan.steps[index];
                step.status = if result.success {
                    StepStatus::Completed
                } else {
                    StepStatus::Failed
                };
                let status = if result.success {
                    ProgressStatus::Completed
                } else {
                    ProgressStatus::Failed
                };
                self.emit_step(step, total, results.len() + 1, status);
                results.push(result);
            }
        }

        let failed = results.iter().filter(|r| !r.success).count();
        info!(steps = total, failed, "Research plan finished");
        results
    }

    async fn run_step(&self, step: &PlanStep, query: &str, context: &str) -> ToolResult {
        match &step.kind {
            StepKind::ToolCall { tool, arguments } => self.tools.invoke(tool, arguments.clone()).await,
            StepKind::SubQuestion { question } => self.answer_sub_question(query, question, context).await,
        }
    }

    async fn answer_sub_question(&self, query: &str, question: &str, context: &str) -> ToolResult {
        let arguments = json!({ "question": question });
        let known = if context.is_empty() {
            String::new()
        } else {
            format!("\n\nFindings so far:\n{}", context)
        };
        let prompt = format!(
            "You are helping answer a larger research question.\n\nOverall question: {query}\n\nSub-question: {question}{known}\n\nAnswer the sub-question concisely and factually. If you are unsure, say so.",
            query = query,
            question = question,
            known = known,
        );

        match self.llm.prompt(&prompt, 0.3, 800).await {
            Ok(answer) if !answer.trim().is_empty() => {
                ToolResult::ok(SUB_QUESTION_TOOL, arguments, json!({ "answer": answer.trim() }), Vec::new())
            }
            Ok(_) => ToolResult::failed(SUB_QUESTION_TOOL, arguments, "Empty answer"),
            Err(e) => {
                warn!(error = %e, "Sub-question failed");
                ToolResult::failed(SUB_QUESTION_TOOL, arguments, e.to_string())
            }
        }
    }

    fn emit_step(&self, step: &PlanStep, total: usize, finished: usize, status: ProgressStatus) {
        let progress = 15 + (70 * finished / total.max(1)) as u8;
        let detail = match status {
            ProgressStatus::Started | ProgressStatus::InProgress => {
                format!("Step {}/{}: {}", step.number, total, step.description)
            }
            ProgressStatus::Completed => format!("Completed step {}: {}", step.number, step.description),
            ProgressStatus::Failed => format!("Step {} found no information: {}", step.number, step.description),
        };
        match &step.kind {
            StepKind::ToolCall { tool, arguments } => {
                self.emitter
                    .tool_progress("research_step", status, detail, progress, tool, arguments)
            }
            StepKind::SubQuestion { .. } => self.emitter.progress("research_step", status, detail, progress),
        }
    }

    /// Function-calling loop. Provider errors are fatal and returned; tool
    /// errors are fed back to the model as text.
    pub async fn run_tool_loop(&mut self, system_prompt: &str, mut messages: Vec<LLMMessage>) -> AppResult<ToolLoopOutcome> {
        self.transition(ExecutorState::RunningSteps);
        let specs = self.tools.specs();
        let mut results = Vec::new();

        for iteration in 1..=self.max_iterations {
            self.emitter.thinking(if iteration == 1 {
                "Analyzing your request..."
            } else {
                "Processing results..."
            });

            let request = self
                .llm
                .request(messages.clone())
                .with_system(system_prompt)
                .with_tools(specs.clone());
            let completion = match self.llm.create_chat_completion_with_tools(&request).await {
                Ok(completion) => completion,
                Err(e) => {
                    self.transition(ExecutorState::Failed);
                    return Err(e);
                }
            };

            match completion {
                Completion::FinalAnswer(response) => {
                    self.emitter
                        .progress("writing", ProgressStatus::InProgress, "Writing response...", 80);
                    info!(iteration, tools_called = results.len(), "Tool loop finished");
                    let answer = Some(response.content).filter(|c| !c.trim().is_empty());
                    return Ok(ToolLoopOutcome {
                        answer,
                        results,
                        iterations: iteration,
                        hit_cap: false,
                    });
                }
                Completion::ToolRequest { content, calls } => {
                    debug!(iteration, calls = calls.len(), "Model requested tools");
                    messages.push(LLMMessage::assistant_tool_calls(content, calls.clone()));

                    let total = calls.len();
                    for (idx, call) in calls.iter().enumerate() {
                        self.emitter.tool_call(&call.name, &call.arguments);
                        self.emitter.tool_progress(
                            "tool_execution",
                            ProgressStatus::InProgress,
                            format!("Executing {} ({}/{})", call.name, idx + 1, total),
                            (idx * 50 / total) as u8,
                            &call.name,
                            &call.arguments,
                        );

                        let result = self.tools.invoke(&call.name, call.arguments.clone()).await;

                        self.emitter.tool_progress(
                            "tool_execution",
                            if result.success {
                                ProgressStatus::Completed
                            } else {
                                ProgressStatus::Failed
                            },
                            format!("Completed {}", call.name),
                            ((idx + 1) * 50 / total) as u8,
                            &call.name,
                            &call.arguments,
                        );
                        messages.push(LLMMessage::tool_result(call.id.as_str(), result.to_context()));
                        results.push(result);
                    }

                    self.emitter.progress(
                        "analyzing",
                        ProgressStatus::InProgress,
                        "Analyzing search results...",
                        60,
                    );
                }
            }
        }

        warn!(max_iterations = self.max_iterations, "Tool loop reached its iteration cap");
        Ok(ToolLoopOutcome {
            answer: None,
            results,
            iterations: self.max_iterations,
            hit_cap: true,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::events::StreamEvent;
    use crate::llm::testing::{fake_llm, final_answer, tool_request, FakeAdapter};
    use crate::tools::{Source, Tool};
    use crate::types::{AppError, ToolCall, ToolSpec};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Tool with a fixed delay that records when it finished
    pub(crate) struct FakeTool {
        pub name: String,
        pub delay: Duration,
        pub fail: bool,
        pub finished: Arc<Mutex<Vec<String>>>,
    }

    impl FakeTool {
        pub(crate) fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                delay: Duration::ZERO,
                fail: false,
                finished: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl Tool for FakeTool {
        fn describe(&self) -> ToolSpec {
            ToolSpec {
                name: self.name.clone(),
                description: "fake".into(),
                parameters: json!({"type": "object", "properties": {"query": {"type": "string"}}}),
            }
        }

        async fn invoke(&self, arguments: Value) -> ToolResult {
            tokio::time::sleep(self.delay).await;
            let query = arguments["query"].as_str().unwrap_or_default().to_string();
            self.finished.lock().unwrap().push(query.clone());
            if self.fail || query.starts_with("fail") {
                return ToolResult::failed(&self.name, arguments, format!("{} unavailable", query));
            }
            let url = format!("https://{}.example/", query.replace(' ', "-"));
            ToolResult::ok(
                &self.name,
                arguments,
                json!({"results": [{"title": query, "url": url, "content": format!("About {}", query)}]}),
                vec![Source { title: query.clone(), url }],
            )
        }
    }

    fn search_step(number: usize, query: &str, parallel: bool) -> PlanStep {
        PlanStep::tool_call(number, query, "tavily_search", json!({ "query": query }), parallel)
    }

    #[tokio::test]
    async fn test_failed_steps_keep_their_slot() {
        let tools = ToolRegistry::new().with(Arc::new(FakeTool::new("tavily_search")));
        let mut executor = Executor::new(fake_llm(FakeAdapter::text("")), tools, &ProgressEmitter::noop());
        let mut plan = ExecutionPlan {
            goal: "g".into(),
            steps: vec![
                search_step(1, "alpha", true),
                search_step(2, "fail beta", true),
                search_step(3, "gamma", false),
                search_step(4, "fail delta", false),
            ],
            expected_sources: None,
        };

        let results = executor.execute_plan(&mut plan, "q").await;
        assert_eq!(results.len(), 4);
        let successes: Vec<bool> = results.iter().map(|r| r.success).collect();
        assert_eq!(successes, vec![true, false, true, false]);
        let statuses: Vec<StepStatus> = plan.steps.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![StepStatus::Completed, StepStatus::Failed, StepStatus::Completed, StepStatus::Failed]
        );
        assert_eq!(executor.state(), ExecutorState::RunningSteps);
    }

    #[tokio::test]
    async fn test_parallel_results_stay_in_plan_order() {
        let finished = Arc::new(Mutex::new(Vec::new()));
        let slow = FakeTool {
            name: "slow_search".into(),
            delay: Duration::from_millis(200),
            fail: false,
            finished: finished.clone(),
        };
        let fast = FakeTool {
            name: "fast_search".into(),
            delay: Duration::from_millis(10),
            fail: false,
            finished: finished.clone(),
        };
        let tools = ToolRegistry::new().with(Arc::new(slow)).with(Arc::new(fast));
        let mut executor = Executor::new(fake_llm(FakeAdapter::text("")), tools, &ProgressEmitter::noop());
        let mut plan = ExecutionPlan {
            goal: "g".into(),
            steps: vec![
                PlanStep::tool_call(1, "A", "slow_search", json!({"query": "A"}), true),
                PlanStep::tool_call(2, "B", "fast_search", json!({"query": "B"}), true),
            ],
            expected_sources: None,
        };

        let results = executor.execute_plan(&mut plan, "q").await;
        let tools_in_order: Vec<&str> = results.iter().map(|r| r.tool.as_str()).collect();
        assert_eq!(tools_in_order, vec!["slow_search", "fast_search"]);
        // B finished first, so the two really ran concurrently
        assert_eq!(*finished.lock().unwrap(), vec!["B".to_string(), "A".to_string()]);
    }

    #[tokio::test]
    async fn test_each_step_emits_start_and_end() {
        let tools = ToolRegistry::new().with(Arc::new(FakeTool::new("tavily_search")));
        let (emitter, mut rx) = ProgressEmitter::channel();
        let mut executor = Executor::new(fake_llm(FakeAdapter::text("")), tools, &emitter);
        let mut plan = ExecutionPlan {
            goal: "g".into(),
            steps: vec![search_step(1, "alpha", true), search_step(2, "fail beta", true)],
            expected_sources: None,
        };
        executor.execute_plan(&mut plan, "q").await;
        drop(executor);
        drop(emitter);

        let mut statuses = Vec::new();
        while let Some(event) = rx.recv().await {
            if let StreamEvent::Progress { status, tool, .. } = event {
                assert_eq!(tool.as_deref(), Some("tavily_search"));
                statuses.push(status);
            }
        }
        assert_eq!(
            statuses,
            vec![
                ProgressStatus::Started,
                ProgressStatus::Started,
                ProgressStatus::Completed,
                ProgressStatus::Failed
            ]
        );
    }

    #[tokio::test]
    async fn test_sub_questions_use_the_model() {
        let adapter = FakeAdapter::new(|request| {
            let prompt = crate::llm::testing::last_user_text(request);
            if prompt.contains("Findings so far") {
                Ok(final_answer("B is faster"))
            } else {
                Err(AppError::llm_status("boom", 500))
            }
        });
        let tools = ToolRegistry::new().with(Arc::new(FakeTool::new("tavily_search")));
        let mut executor = Executor::new(fake_llm(adapter), tools, &ProgressEmitter::noop());
        let mut plan = ExecutionPlan {
            goal: "g".into(),
            steps: vec![
                PlanStep::sub_question(1, "What is A?", false),
                search_step(2, "alpha", false),
                PlanStep::sub_question(3, "Which is faster?", false),
            ],
            expected_sources: None,
        };

        let results = executor.execute_plan(&mut plan, "Compare A and B").await;
        assert!(!results[0].success);
        assert_eq!(results[0].tool, SUB_QUESTION_TOOL);
        assert!(results[1].success);
        assert_eq!(results[2].output["answer"], "B is faster");
    }

    fn call(id: &str, name: &str, query: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: json!({ "query": query }),
        }
    }

    #[tokio::test]
    async fn test_tool_loop_feeds_results_back() {
        let adapter = FakeAdapter::scripted(vec![
            Ok(tool_request(vec![call("c1", "tavily_search", "rust"), call("c2", "missing_tool", "x")])),
            Ok(final_answer("Rust is fast.")),
        ]);
        let tools = ToolRegistry::new().with(Arc::new(FakeTool::new("tavily_search")));
        let mut executor = Executor::new(fake_llm(adapter.clone()), tools, &ProgressEmitter::noop());

        let outcome = executor
            .run_tool_loop(SEARCH_SYSTEM_PROMPT, vec![LLMMessage::user("Tell me about Rust")])
            .await
            .unwrap();
        assert_eq!(outcome.answer.as_deref(), Some("Rust is fast."));
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.results.len(), 2);
        assert!(!outcome.results[1].success);

        let second = &adapter.requests()[1];
        assert_eq!(second.tools.len(), 1);
        let roles: Vec<&str> = second.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "assistant", "tool", "tool"]);
        assert_eq!(second.messages[3].tool_call_id.as_deref(), Some("c2"));
        assert!(second.messages[3].content.contains("Unknown tool: missing_tool"));
    }

    #[tokio::test]
    async fn test_tool_loop_stops_at_cap() {
        let adapter = FakeAdapter::new(|_| Ok(tool_request(vec![call("again", "tavily_search", "more")])));
        let tools = ToolRegistry::new().with(Arc::new(FakeTool::new("tavily_search")));
        let mut executor = Executor::new(fake_llm(adapter.clone()), tools, &ProgressEmitter::noop()).with_max_iterations(3);

        let outcome = executor
            .run_tool_loop("system", vec![LLMMessage::user("loop forever")])
            .await
            .unwrap();
        assert!(outcome.answer.is_none());
        assert!(outcome.hit_cap);
        assert_eq!(outcome.iterations, 3);
        assert_eq!(outcome.results.len(), 3);
        assert_eq!(adapter.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_tool_loop_provider_error_is_fatal() {
        let adapter = FakeAdapter::new(|_| Err(AppError::llm_status("unauthorized", 401)));
        let mut executor = Executor::new(fake_llm(adapter), ToolRegistry::new(), &ProgressEmitter::noop());
        let err = executor
            .run_tool_loop("system", vec![LLMMessage::user("hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::LLMApi { .. }));
        assert_eq!(executor.state(), ExecutorState::Failed);
    }

    #[tokio::test]
    async fn test_empty_final_answer_is_not_a_cap() {
        let adapter = FakeAdapter::scripted(vec![Ok(final_answer("   "))]);
        let tools = ToolRegistry::new().with(Arc::new(FakeTool::new("tavily_search")));
        let mut executor = Executor::new(fake_llm(adapter), tools, &ProgressEmitter::noop());

        let outcome = executor
            .run_tool_loop("system", vec![LLMMessage::user("hi")])
            .await
            .unwrap();
        assert!(outcome.answer.is_none());
        assert!(!outcome.hit_cap);
        assert_eq!(outcome.iterations, 1);
    }

    #[test]
    fn test_search_prompt_asks_for_references() {
        assert_eq!(SEARCH_SYSTEM_PROMPT.matches("\"## References\"").count(), 2);
        assert!(SEARCH_SYSTEM_PROMPT.ends_with("Every paragraph should have at least one citation"));
    }
}
