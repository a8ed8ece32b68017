//! Protocol-server handoff: the inbound request a run serves and the sink
//! it reports through. Wire framing and transport live elsewhere.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use strand_core::error::{Result, StrandError};
use strand_core::types::ChatMessage;

/// The inbound request a run was started for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    pub context_id: String,
    pub task_id: String,
    pub message: ChatMessage,
}

impl RequestContext {
    pub fn new(context_id: impl Into<String>, task_id: impl Into<String>, message: ChatMessage) -> Self {
        Self {
            context_id: context_id.into(),
            task_id: task_id.into(),
            message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Submitted,
    Working,
    InputRequired,
    Completed,
    Canceled,
    Failed,
}

impl TaskState {
    /// No further updates follow a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Canceled | Self::Failed)
    }
}

/// What a run sends back to the protocol layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundEvent {
    Message {
        context_id: String,
        task_id: String,
        message: ChatMessage,
    },
    StatusUpdate {
        context_id: String,
        task_id: String,
        state: TaskState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<ChatMessage>,
        is_final: bool,
    },
}

impl OutboundEvent {
    pub fn is_final(&self) -> bool {
        matches!(self, Self::StatusUpdate { is_final: true, .. })
    }
}

/// Outbound half of a handoff, bound to one request.
#[derive(Debug, Clone)]
pub struct OutboundSink {
    context_id: String,
    task_id: String,
    tx: mpsc::Sender<OutboundEvent>,
}

impl OutboundSink {
    /// A sink for `request` plus the receiver the protocol layer drains.
    pub fn channel(request: &RequestContext, capacity: usize) -> (Self, mpsc::Receiver<OutboundEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                context_id: request.context_id.clone(),
                task_id: request.task_id.clone(),
                tx,
            },
            rx,
        )
    }

    pub async fn send(&self, event: OutboundEvent) -> Result<()> {
        self.tx.send(event).await.map_err(|_| StrandError::OutboundClosed)
    }

    pub async fn send_message(&self, message: ChatMessage) -> Result<()> {
        self.send(OutboundEvent::Message {
            context_id: self.context_id.clone(),
            task_id: self.task_id.clone(),
            message,
        })
        .await
    }

    pub async fn update_status(&self, state: TaskState, message: Option<ChatMessage>) -> Result<()> {
        debug!(task_id = %self.task_id, state = ?state, "Task status update");
        self.send(OutboundEvent::StatusUpdate {
            context_id: self.context_id.clone(),
            task_id: self.task_id.clone(),
            state,
            message,
            is_final: state.is_terminal(),
        })
        .await
    }

    pub async fn complete(&self, message: ChatMessage) -> Result<()> {
        self.update_status(TaskState::Completed, Some(message)).await
    }

    pub async fn fail(&self, reason: impl Into<String>) -> Result<()> {
        self.update_status(TaskState::Failed, Some(ChatMessage::assistant_text(reason)))
            .await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Inbound request and outbound sink injected into a run.
#[derive(Debug, Clone)]
pub struct Handoff {
    request: Arc<RequestContext>,
    sink: OutboundSink,
}

impl Handoff {
    pub fn new(request: RequestContext, sink: OutboundSink) -> Self {
        Self {
            request: Arc::new(request),
            sink,
        }
    }

    pub fn request(&self) -> &RequestContext {
        &self.request
    }

    pub fn sink(&self) -> &OutboundSink {
        &self.sink
    }
}
