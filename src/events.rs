//! Turn events and the progress emitter
//!
//! Every in-flight turn owns one unbounded channel. The pipeline stages push
//! [`StreamEvent`]s through a [`ProgressEmitter`]; the HTTP layer is the only
//! consumer and forwards them to the browser in order. A closed receiver is
//! not an error: the turn keeps running and its answer is still persisted.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Started,
    InProgress,
    Completed,
    Failed,
}

/// Events emitted while a turn runs, serialized as `{"type": "...", ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Progress {
        step: String,
        status: ProgressStatus,
        detail: String,
        /// Overall completion, 0..=100
        progress: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        arguments: Option<Value>,
        /// Agent that produced the event
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    ToolCall {
        tool: String,
        arguments: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    Thinking {
        content: String,
    },
    ResponseChunk {
        content: String,
    },
    Response {
        content: String,
    },
    ConversationId {
        conversation_id: String,
    },
    Error {
        message: String,
    },
    Done,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done)
    }
}

/// Producer side of a turn's event channel
#[derive(Debug, Clone)]
pub struct ProgressEmitter {
    tx: Option<mpsc::UnboundedSender<StreamEvent>>,
    source: Option<String>,
}

impl ProgressEmitter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx), source: None }, rx)
    }

    /// Emitter that discards everything
    pub fn noop() -> Self {
        Self { tx: None, source: None }
    }

    /// Same channel, events labelled with the given agent
    pub fn with_source(&self, source: &str) -> Self {
        Self {
            tx: self.tx.clone(),
            source: Some(source.to_string()),
        }
    }

    pub fn send(&self, event: StreamEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                trace!("Event receiver dropped, discarding event");
            }
        }
    }

    pub fn progress(&self, step: &str, status: ProgressStatus, detail: impl Into<String>, progress: u8) {
        self.send(StreamEvent::Progress {
            step: step.to_string(),
            status,
            detail: detail.into(),
            progress: progress.min(100),
            tool: None,
            arguments: None,
            source: self.source.clone(),
        });
    }

    pub fn tool_progress(
        &self,
        step: &str,
        status: ProgressStatus,
        detail: impl Into<String>,
        progress: u8,
        tool: &str,
        arguments: &Value,
    ) {
        self.send(StreamEvent::Progress {
            step: step.to_string(),
            status,
            detail: detail.into(),
            progress: progress.min(100),
            tool: Some(tool.to_string()),
            arguments: Some(arguments.clone()),
            source: self.source.clone(),
        });
    }

    pub fn tool_call(&self, tool: &str, arguments: &Value) {
        self.send(StreamEvent::ToolCall {
            tool: tool.to_string(),
            arguments: arguments.clone(),
            source: self.source.clone(),
        });
    }

    pub fn thinking(&self, content: impl Into<String>) {
        self.send(StreamEvent::Thinking { content: content.into() });
    }

    pub fn chunk(&self, content: impl Into<String>) {
        self.send(StreamEvent::ResponseChunk { content: content.into() });
    }

    pub fn response(&self, content: impl Into<String>) {
        self.send(StreamEvent::Response { content: content.into() });
    }

    pub fn conversation_id(&self, id: &str) {
        self.send(StreamEvent::ConversationId {
            conversation_id: id.to_string(),
        });
    }

    pub fn error(&self, message: impl Into<String>) {
        self.send(StreamEvent::Error { message: message.into() });
    }

    pub fn done(&self) {
        self.send(StreamEvent::Done);
    }
}
