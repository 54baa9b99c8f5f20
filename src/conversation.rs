//! Conversation turns
//!
//! A turn wraps one [`ResearchPipeline`] run with persistence: the
//! conversation is created (and titled) on its first message, history is
//! loaded before the new user message is appended, and the answer is stored
//! with its tool metadata once the pipeline returns. Provider failures end
//! the turn with an apology that is persisted like any other answer, and
//! the conversation is marked `failed`. So does any storage error after the
//! turn went `in_progress`. Every turn ends with a `done` event.

use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::agents::ResearchPipeline;
use crate::db::{Message, MessageRole, SharedStorage, TurnStatus};
use crate::events::ProgressEmitter;
use crate::types::{AppResult, LLMMessage};

pub const APOLOGY: &str =
    "I apologize, but I encountered errors while researching your question. Please try again or rephrase your query.";

#[derive(Debug, Clone)]
pub struct TurnReply {
    pub conversation_id: String,
    pub content: String,
    pub failed: bool,
}

#[derive(Clone)]
pub struct ConversationService {
    storage: SharedStorage,
    history_limit: usize,
}

impl ConversationService {
    pub fn new(storage: SharedStorage, history_limit: usize) -> Self {
        Self { storage, history_limit }
    }

    /// Run the turn in a detached task. The turn completes and is persisted
    /// even if the event receiver goes away.
    pub fn spawn(
        self,
        conversation_id: Option<String>,
        message: String,
        pipeline: ResearchPipeline,
        emitter: ProgressEmitter,
    ) -> JoinHandle<AppResult<TurnReply>> {
        tokio::spawn(async move {
            self.run_turn(conversation_id.as_deref(), &message, &pipeline, &emitter)
                .await
        })
    }

    pub async fn run_turn(
        &self,
        conversation_id: Option<&str>,
        message: &str,
        pipeline: &ResearchPipeline,
        emitter: &ProgressEmitter,
    ) -> AppResult<TurnReply> {
        let result = self.run_inner(conversation_id, message, pipeline, emitter).await;
        if let Err(e) = &result {
            error!(error = %e, "Turn aborted");
            emitter.error(e.to_string());
        }
        emitter.done();
        result
    }

    async fn run_inner(
        &self,
        conversation_id: Option<&str>,
        message: &str,
        pipeline: &ResearchPipeline,
        emitter: &ProgressEmitter,
    ) -> AppResult<TurnReply> {
        let conversation_id = match conversation_id.map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };

        let history: Vec<LLMMessage> = match self.storage.get_conversation(&conversation_id).await? {
            Some(_) => self
                .storage
                .get_messages(&conversation_id, Some(self.history_limit as i64))
                .await?
                .iter()
                .map(Message::to_llm_message)
                .collect(),
            None => {
                self.storage.create_conversation(&conversation_id, None, None).await?;
                self.storage.generate_title(&conversation_id, message).await?;
                info!(conversation_id = %conversation_id, "Started conversation");
                Vec::new()
            }
        };
        emitter.conversation_id(&conversation_id);

        self.storage
            .add_message(&conversation_id, MessageRole::User, message, None)
            .await?;
        self.storage
            .set_turn_status(&conversation_id, TurnStatus::InProgress)
            .await?;

        let result = self
            .answer(&conversation_id, message, &history, pipeline, emitter)
            .await;
        if result.is_err() {
            if let Err(e) = self
                .storage
                .set_turn_status(&conversation_id, TurnStatus::Failed)
                .await
            {
                error!(conversation_id = %conversation_id, error = %e, "Could not mark turn failed");
            }
        }
        result
    }

    /// Everything after the turn is marked `in_progress`
    async fn answer(
        &self,
        conversation_id: &str,
        message: &str,
        history: &[LLMMessage],
        pipeline: &ResearchPipeline,
        emitter: &ProgressEmitter,
    ) -> AppResult<TurnReply> {
        let conversation_id = conversation_id.to_string();
        match pipeline.run(message, history).await {
            Ok(outcome) => {
                let metadata = json!({
                    "tools_used": outcome.tools_used,
                    "category": outcome.analysis.category.as_str(),
                    "route": outcome.route.as_str(),
                    "best_effort": outcome.best_effort,
                    "failed_steps": outcome.failed_steps,
                    "sources": outcome.sources,
                });
                self.storage
                    .add_message(&conversation_id, MessageRole::Assistant, &outcome.content, Some(metadata))
                    .await?;
                self.storage
                    .set_turn_status(&conversation_id, TurnStatus::Idle)
                    .await?;
                Ok(TurnReply {
                    conversation_id,
                    content: outcome.content,
                    failed: false,
                })
            }
            Err(e) => {
                error!(conversation_id = %conversation_id, error = %e, "Provider call failed, turn abandoned");
                emitter.error(e.to_string());
                emitter.response(APOLOGY);
                self.storage
                    .add_message(
                        &conversation_id,
                        MessageRole::Assistant,
                        APOLOGY,
                        Some(json!({ "error": true, "detail": e.to_string() })),
                    )
                    .await?;
                self.storage
                    .set_turn_status(&conversation_id, TurnStatus::Failed)
                    .await?;
                Ok(TurnReply {
                    conversation_id,
                    content: APOLOGY.to_string(),
                    failed: true,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{QueryClassifier, TurnConfig};
    use crate::db::{ChatStorage, Conversation, SqliteStorage};
    use crate::events::StreamEvent;
    use crate::llm::testing::{fake_llm, FakeAdapter};
    use crate::tools::ToolRegistry;
    use crate::types::{AppError, LLMProvider};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// SQLite storage whose assistant writes fail while `full` is set
    struct FullDisk {
        inner: SqliteStorage,
        full: AtomicBool,
    }

    #[async_trait]
    impl ChatStorage for FullDisk {
        fn backend_name(&self) -> &'static str {
            "full-disk"
        }

        async fn initialize(&self) -> AppResult<()> {
            self.inner.initialize().await
        }

        async fn close(&self) {
            self.inner.close().await
        }

        async fn health_check(&self) -> AppResult<()> {
            self.inner.health_check().await
        }

        async fn create_conversation(&self, id: &str, title: Option<&str>, metadata: Option<Value>) -> AppResult<Conversation> {
            self.inner.create_conversation(id, title, metadata).await
        }

        async fn get_conversation(&self, id: &str) -> AppResult<Option<Conversation>> {
            self.inner.get_conversation(id).await
        }

        async fn list_conversations(&self, limit: i64, offset: i64) -> AppResult<Vec<Conversation>> {
            self.inner.list_conversations(limit, offset).await
        }

        async fn update_conversation(
            &self,
            id: &str,
            title: Option<&str>,
            metadata: Option<Value>,
        ) -> AppResult<Option<Conversation>> {
            self.inner.update_conversation(id, title, metadata).await
        }

        async fn delete_conversation(&self, id: &str) -> AppResult<bool> {
            self.inner.delete_conversation(id).await
        }

        async fn set_turn_status(&self, id: &str, status: TurnStatus) -> AppResult<()> {
            self.inner.set_turn_status(id, status).await
        }

        async fn add_message(
            &self,
            conversation_id: &str,
            role: MessageRole,
            content: &str,
            metadata: Option<Value>,
        ) -> AppResult<Message> {
            if role == MessageRole::Assistant && self.full.load(Ordering::SeqCst) {
                return Err(AppError::Internal("disk full".into()));
            }
            self.inner.add_message(conversation_id, role, content, metadata).await
        }

        async fn get_messages(&self, conversation_id: &str, limit: Option<i64>) -> AppResult<Vec<Message>> {
            self.inner.get_messages(conversation_id, limit).await
        }

        async fn delete_messages(&self, conversation_id: &str) -> AppResult<u64> {
            self.inner.delete_messages(conversation_id).await
        }
    }

    fn turn_config() -> TurnConfig {
        TurnConfig {
            provider: LLMProvider::OpenAI,
            model: None,
            planner_model: None,
            classifier_model: None,
            system_prompt: None,
            planner_system_prompt: None,
            deep_research: false,
            multi_agent: true,
            stream: false,
            timezone: "UTC".into(),
            max_tool_iterations: 5,
        }
    }

    async fn service() -> (ConversationService, SharedStorage) {
        let storage: SharedStorage = Arc::new(SqliteStorage::in_memory().await.unwrap());
        (ConversationService::new(storage.clone(), 20), storage)
    }

    async fn collect(mut rx: tokio::sync::mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_turn_persists_both_messages() {
        let (service, storage) = service().await;
        let adapter = FakeAdapter::text("Hello! How can I help today?");
        let llm = fake_llm(adapter);
        let (emitter, rx) = ProgressEmitter::channel();
        let pipeline = ResearchPipeline::new(llm.clone(), ToolRegistry::new(), turn_config(), &emitter)
            .with_classifier(QueryClassifier::new(llm).llm_only());

        let reply = service
            .spawn(None, "hello there".into(), pipeline, emitter)
            .await
            .unwrap()
            .unwrap();
        assert!(!reply.failed);
        assert!(reply.content.contains("How can I help"));

        let events = collect(rx).await;
        assert_eq!(events.last(), Some(&StreamEvent::Done));
        assert!(events.contains(&StreamEvent::ConversationId {
            conversation_id: reply.conversation_id.clone()
        }));
        assert_eq!(events.iter().filter(|e| matches!(e, StreamEvent::Response { .. })).count(), 1);

        let conversation = storage.get_conversation(&reply.conversation_id).await.unwrap().unwrap();
        assert_eq!(conversation.title.as_deref(), Some("hello there"));
        assert_eq!(conversation.turn_status, TurnStatus::Idle);

        let messages = storage.get_messages(&reply.conversation_id, None).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1].content, reply.content);
        assert_eq!(messages[1].metadata.as_ref().unwrap()["route"], "direct");
    }

    #[tokio::test]
    async fn test_follow_up_sees_history() {
        let (service, _storage) = service().await;
        let adapter = FakeAdapter::text("Noted.");
        let llm = fake_llm(adapter.clone());

        let mut conversation_id = None;
        for message in ["my name is Ada", "what is my name?"] {
            let pipeline = ResearchPipeline::new(llm.clone(), ToolRegistry::new(), turn_config(), &ProgressEmitter::noop())
                .with_classifier(QueryClassifier::new(llm.clone()).llm_only());
            let reply = service
                .run_turn(conversation_id.as_deref(), message, &pipeline, &ProgressEmitter::noop())
                .await
                .unwrap();
            conversation_id = Some(reply.conversation_id);
        }

        let last = adapter.requests().pop().unwrap();
        assert!(last.messages.iter().any(|m| m.content == "my name is Ada"));
        assert!(last.messages.iter().any(|m| m.content == "Noted."));
    }

    #[tokio::test]
    async fn test_provider_failure_marks_conversation_failed() {
        let (service, storage) = service().await;
        let llm = fake_llm(FakeAdapter::new(|_| Err(AppError::llm_status("upstream down", 503))));
        let (emitter, rx) = ProgressEmitter::channel();
        let pipeline = ResearchPipeline::new(llm.clone(), ToolRegistry::new(), turn_config(), &emitter)
            .with_classifier(QueryClassifier::new(llm).llm_only());

        let reply = service
            .run_turn(Some("conv-1"), "why is the sky blue?", &pipeline, &emitter)
            .await
            .unwrap();
        drop(pipeline);
        drop(emitter);
        assert!(reply.failed);
        assert_eq!(reply.content, APOLOGY);

        let events = collect(rx).await;
        assert!(events.iter().any(|e| matches!(e, StreamEvent::Error { .. })));
        assert!(events.contains(&StreamEvent::Response { content: APOLOGY.into() }));
        assert_eq!(events.last(), Some(&StreamEvent::Done));

        let conversation = storage.get_conversation("conv-1").await.unwrap().unwrap();
        assert_eq!(conversation.turn_status, TurnStatus::Failed);
        let messages = storage.get_messages("conv-1", None).await.unwrap();
        assert_eq!(messages[0].content, "why is the sky blue?");
        assert_eq!(messages[1].metadata.as_ref().unwrap()["error"], true);
    }

    #[tokio::test]
    async fn test_failed_answer_write_marks_turn_failed() {
        let disk = Arc::new(FullDisk {
            inner: SqliteStorage::in_memory().await.unwrap(),
            full: AtomicBool::new(true),
        });
        let storage: SharedStorage = disk.clone();
        let service = ConversationService::new(storage.clone(), 20);
        let llm = fake_llm(FakeAdapter::text("An answer."));
        let pipeline = || {
            ResearchPipeline::new(llm.clone(), ToolRegistry::new(), turn_config(), &ProgressEmitter::noop())
                .with_classifier(QueryClassifier::new(llm.clone()).llm_only())
        };

        let (emitter, rx) = ProgressEmitter::channel();
        let err = service
            .run_turn(Some("conv-disk"), "first question", &pipeline(), &emitter)
            .await
            .unwrap_err();
        drop(emitter);
        assert!(err.to_string().contains("disk full"));
        let events = collect(rx).await;
        assert!(events.iter().any(|e| matches!(e, StreamEvent::Error { .. })));
        assert_eq!(events.last(), Some(&StreamEvent::Done));

        let conversation = storage.get_conversation("conv-disk").await.unwrap().unwrap();
        assert_eq!(conversation.turn_status, TurnStatus::Failed);

        // The next turn on the same conversation recovers
        disk.full.store(false, Ordering::SeqCst);
        let reply = service
            .run_turn(Some("conv-disk"), "second question", &pipeline(), &ProgressEmitter::noop())
            .await
            .unwrap();
        assert!(!reply.failed);
        let conversation = storage.get_conversation("conv-disk").await.unwrap().unwrap();
        assert_eq!(conversation.turn_status, TurnStatus::Idle);
        let roles: Vec<MessageRole> = storage
            .get_messages("conv-disk", None)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.role)
            .collect();
        assert_eq!(roles, vec![MessageRole::User, MessageRole::User, MessageRole::Assistant]);
    }
}

