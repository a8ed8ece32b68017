use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Identity of an agent definition (stable across runs).
    AgentId
);
string_id!(
    /// Identity of a single run of an agent.
    RunId
);
string_id!(
    /// Identity of a conversation that may span several runs.
    SessionId
);

/// Role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single content block in a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

/// A chat message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::text_with_role(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text_with_role(Role::User, text)
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::text_with_role(Role::Assistant, text)
    }

    /// An assistant message requesting the given tool calls.
    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: calls
                .into_iter()
                .map(|c| ContentBlock::ToolUse {
                    id: c.id,
                    name: c.name,
                    input: c.arguments,
                })
                .collect(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            role: Role::Tool,
            content: vec![ContentBlock::ToolResult {
                tool_use_id: tool_use_id.into(),
                content: content.into(),
                is_error,
            }],
            timestamp: Some(Utc::now()),
        }
    }

    /// One message carrying the results of several tool calls, in order.
    pub fn tool_results(outcomes: &[ToolCallOutcome]) -> Self {
        Self {
            role: Role::Tool,
            content: outcomes
                .iter()
                .map(|o| ContentBlock::ToolResult {
                    tool_use_id: o.call_id.clone(),
                    content: o.content.clone(),
                    is_error: !o.is_success(),
                })
                .collect(),
            timestamp: Some(Utc::now()),
        }
    }

    fn text_with_role(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentBlock::Text { text: text.into() }],
            timestamp: Some(Utc::now()),
        }
    }

    /// Extract all text content from this message.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Extract all tool use blocks from this message as tool calls.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }
}

/// The conversation sent to a model: the session state of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Prompt {
    pub id: String,
    pub messages: Vec<ChatMessage>,
}

impl Prompt {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            messages: Vec::new(),
        }
    }

    pub fn with_system(mut self, text: impl Into<String>) -> Self {
        self.messages.push(ChatMessage::system(text));
        self
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Stop reason from the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

/// A streaming delta from the LLM.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    /// A chunk of text content.
    TextDelta(String),

    /// Start of a tool use block.
    ToolUseStart {
        index: usize,
        id: String,
        name: String,
    },

    /// A chunk of tool use input JSON.
    ToolInputDelta { index: usize, delta: String },

    /// The response is complete.
    Stop(StopReason),
}

/// Verdict of a moderation request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModerationResult {
    pub is_harmful: bool,
    #[serde(default)]
    pub categories: Vec<String>,
}

impl ModerationResult {
    pub fn clean() -> Self {
        Self::default()
    }

    pub fn harmful(categories: Vec<String>) -> Self {
        Self {
            is_harmful: true,
            categories,
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Result of a tool execution as reported by the tool itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Why a tool call did not succeed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolFailure {
    NotFound,
    InvalidArguments { message: String },
    ExecutionFailed { message: String },
    TimedOut { timeout_secs: u64 },
}

impl std::fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "tool not found"),
            Self::InvalidArguments { message } => write!(f, "invalid arguments: {}", message),
            Self::ExecutionFailed { message } => write!(f, "execution failed: {}", message),
            Self::TimedOut { timeout_secs } => write!(f, "timed out after {}s", timeout_secs),
        }
    }
}

/// The outcome of one tool call. Failures are data: the graph routes them
/// back to the model instead of aborting the run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallOutcome {
    pub call_id: String,
    pub tool: String,
    pub arguments: serde_json::Value,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ToolFailure>,
}

impl ToolCallOutcome {
    pub fn success(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            arguments: call.arguments.clone(),
            content: content.into(),
            failure: None,
        }
    }

    pub fn failed(call: &ToolCall, failure: ToolFailure) -> Self {
        Self {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            arguments: call.arguments.clone(),
            content: format!("Error: {}", failure),
            failure: Some(failure),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// The tool-result message fed back to the model.
    pub fn to_message(&self) -> ChatMessage {
        ChatMessage::tool_result(&self.call_id, &self.content, !self.is_success())
    }
}

/// Tool definition for sending to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Context passed to tools during execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub agent_id: AgentId,
    pub run_id: RunId,
    pub call_id: String,
}

impl ToolContext {
    pub fn new(agent_id: AgentId, run_id: RunId, call_id: impl Into<String>) -> Self {
        Self {
            agent_id,
            run_id,
            call_id: call_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_calls_extracted_in_order() {
        let msg = ChatMessage::assistant_tool_calls(vec![
            ToolCall::new("c1", "add", json!({"a": 1, "b": 2})),
            ToolCall::new("c2", "mul", json!({"a": 3, "b": 4})),
        ]);
        assert!(msg.has_tool_calls());
        let calls = msg.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "c1");
        assert_eq!(calls[1].name, "mul");
    }

    #[test]
    fn test_text_message_has_no_tool_calls() {
        let msg = ChatMessage::assistant_text("4");
        assert!(!msg.has_tool_calls());
        assert_eq!(msg.text(), "4");
    }

    #[test]
    fn test_failed_outcome_message_is_error() {
        let call = ToolCall::new("c1", "missing", json!({}));
        let outcome = ToolCallOutcome::failed(&call, ToolFailure::NotFound);
        assert!(!outcome.is_success());
        match &outcome.to_message().content[0] {
            ContentBlock::ToolResult {
                tool_use_id,
                is_error,
                ..
            } => {
                assert_eq!(tool_use_id, "c1");
                assert!(is_error);
            }
            other => panic!("unexpected block: {:?}", other),
        }
    }

    #[test]
    fn test_tool_failure_serialization_tag() {
        let failure = ToolFailure::TimedOut { timeout_secs: 3 };
        let value = serde_json::to_value(&failure).unwrap();
        assert_eq!(value["kind"], "timed_out");
        assert_eq!(value["timeout_secs"], 3);
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(RunId::new(), RunId::new());
        assert_eq!(AgentId::from("calc").as_str(), "calc");
    }
}
