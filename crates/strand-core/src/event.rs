use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AgentId, ModerationResult, RunId, ToolFailure};

/// Lifecycle occurrence emitted by the interpreter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    AgentStarting {
        input: serde_json::Value,
    },
    AgentCompleted {
        result: serde_json::Value,
    },
    /// The run ended without reaching the finish node.
    AgentExecutionFailed {
        error: String,
    },
    StrategyStarting {
        strategy: String,
    },
    StrategyCompleted {
        strategy: String,
        result: serde_json::Value,
    },
    NodeExecutionStarting {
        node_id: String,
        input: serde_json::Value,
    },
    NodeExecutionCompleted {
        node_id: String,
        output: serde_json::Value,
        elapsed_ms: u64,
    },
    LlmCallStarting {
        prompt_id: String,
        model: String,
        tools: Vec<String>,
    },
    LlmCallCompleted {
        prompt_id: String,
        model: String,
        responses: usize,
        tool_calls: usize,
    },
    ModerationCompleted {
        prompt_id: String,
        result: ModerationResult,
    },
    ToolCallStarting {
        call_id: String,
        tool: String,
        arguments: serde_json::Value,
    },
    ToolCallCompleted {
        call_id: String,
        tool: String,
        content: String,
    },
    ToolCallFailed {
        call_id: String,
        tool: String,
        failure: ToolFailure,
    },
    /// A feature handler or message processor failed; delivery continued.
    FeatureHandlerFailed {
        feature: String,
        event: EventKind,
        error: String,
    },
}

/// Discriminant of `AgentEvent`, used to register handlers per event type.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AgentStarting,
    AgentCompleted,
    AgentExecutionFailed,
    StrategyStarting,
    StrategyCompleted,
    NodeExecutionStarting,
    NodeExecutionCompleted,
    LlmCallStarting,
    LlmCallCompleted,
    ModerationCompleted,
    ToolCallStarting,
    ToolCallCompleted,
    ToolCallFailed,
    FeatureHandlerFailed,
}

impl EventKind {
    pub const ALL: [EventKind; 14] = [
        Self::AgentStarting,
        Self::AgentCompleted,
        Self::AgentExecutionFailed,
        Self::StrategyStarting,
        Self::StrategyCompleted,
        Self::NodeExecutionStarting,
        Self::NodeExecutionCompleted,
        Self::LlmCallStarting,
        Self::LlmCallCompleted,
        Self::ModerationCompleted,
        Self::ToolCallStarting,
        Self::ToolCallCompleted,
        Self::ToolCallFailed,
        Self::FeatureHandlerFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentStarting => "agent_starting",
            Self::AgentCompleted => "agent_completed",
            Self::AgentExecutionFailed => "agent_execution_failed",
            Self::StrategyStarting => "strategy_starting",
            Self::StrategyCompleted => "strategy_completed",
            Self::NodeExecutionStarting => "node_execution_starting",
            Self::NodeExecutionCompleted => "node_execution_completed",
            Self::LlmCallStarting => "llm_call_starting",
            Self::LlmCallCompleted => "llm_call_completed",
            Self::ModerationCompleted => "moderation_completed",
            Self::ToolCallStarting => "tool_call_starting",
            Self::ToolCallCompleted => "tool_call_completed",
            Self::ToolCallFailed => "tool_call_failed",
            Self::FeatureHandlerFailed => "feature_handler_failed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AgentEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::AgentStarting { .. } => EventKind::AgentStarting,
            Self::AgentCompleted { .. } => EventKind::AgentCompleted,
            Self::AgentExecutionFailed { .. } => EventKind::AgentExecutionFailed,
            Self::StrategyStarting { .. } => EventKind::StrategyStarting,
            Self::StrategyCompleted { .. } => EventKind::StrategyCompleted,
            Self::NodeExecutionStarting { .. } => EventKind::NodeExecutionStarting,
            Self::NodeExecutionCompleted { .. } => EventKind::NodeExecutionCompleted,
            Self::LlmCallStarting { .. } => EventKind::LlmCallStarting,
            Self::LlmCallCompleted { .. } => EventKind::LlmCallCompleted,
            Self::ModerationCompleted { .. } => EventKind::ModerationCompleted,
            Self::ToolCallStarting { .. } => EventKind::ToolCallStarting,
            Self::ToolCallCompleted { .. } => EventKind::ToolCallCompleted,
            Self::ToolCallFailed { .. } => EventKind::ToolCallFailed,
            Self::FeatureHandlerFailed { .. } => EventKind::FeatureHandlerFailed,
        }
    }

    /// Whether this event ends a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::AgentCompleted { .. } | Self::AgentExecutionFailed { .. }
        )
    }
}

/// An event stamped with the identity of the run that produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    pub agent_id: AgentId,
    pub run_id: RunId,
    pub strategy: String,
    pub timestamp: DateTime<Utc>,
    pub event: AgentEvent,
}

impl EventEnvelope {
    pub fn new(agent_id: AgentId, run_id: RunId, strategy: impl Into<String>, event: AgentEvent) -> Self {
        Self {
            agent_id,
            run_id,
            strategy: strategy.into(),
            timestamp: Utc::now(),
            event,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: EventEnvelope) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
