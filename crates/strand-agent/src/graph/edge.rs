use std::any::type_name;
use std::sync::Arc;

use strand_core::error::{Result, StrandError};
use strand_core::types::{ChatMessage, ToolCall, ToolCallOutcome};

use super::node::{AnyValue, NodeValue};
use super::nodes::Moderated;

type ForwardFn = Arc<dyn Fn(&AnyValue) -> Option<Result<AnyValue>> + Send + Sync>;

/// An edge connecting two nodes in the graph arena.
///
/// Edges leaving a node are tried in declaration order; the first one whose
/// route yields a value is taken.
pub struct Edge {
    from: String,
    to: String,
    label: Option<String>,
    forward: ForwardFn,
}

impl Edge {
    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn to(&self) -> &str {
        &self.to
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// `None` when the route does not match `output`.
    pub(crate) fn forward(&self, output: &AnyValue) -> Option<Result<AnyValue>> {
        (self.forward)(output)
    }
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Edge")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("label", &self.label)
            .finish()
    }
}

/// Typed routing for an edge: a predicate over the source node's output
/// combined with a transform into the target node's input.
///
/// ```ignore
/// builder.edge(&llm, &exec, on_tool_call());
/// builder.edge(&llm, &finish, Route::when(|m: &ChatMessage| !m.has_tool_calls()).map(|m| m.text()));
/// ```
pub struct Route<O, T> {
    forward: Arc<dyn Fn(&O) -> Option<T> + Send + Sync>,
    label: Option<String>,
}

impl<O, T> Clone for Route<O, T> {
    fn clone(&self) -> Self {
        Self {
            forward: Arc::clone(&self.forward),
            label: self.label.clone(),
        }
    }
}

impl<O: NodeValue> Route<O, O> {
    /// Matches every output and forwards it unchanged.
    pub fn always() -> Self {
        Self {
            forward: Arc::new(|output: &O| Some(output.clone())),
            label: None,
        }
    }

    /// Matches outputs satisfying `predicate` and forwards them unchanged.
    pub fn when(predicate: impl Fn(&O) -> bool + Send + Sync + 'static) -> Self {
        Self {
            forward: Arc::new(move |output: &O| predicate(output).then(|| output.clone())),
            label: None,
        }
    }
}

impl<O: NodeValue, T: NodeValue> Route<O, T> {
    /// Narrow the route with a further condition on the value it produces.
    pub fn and(self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        let forward = self.forward;
        Self {
            forward: Arc::new(move |output: &O| forward(output).filter(|value| predicate(value))),
            label: self.label,
        }
    }

    pub fn map<U: NodeValue>(self, transform: impl Fn(T) -> U + Send + Sync + 'static) -> Route<O, U> {
        let forward = self.forward;
        Route {
            forward: Arc::new(move |output: &O| forward(output).map(&transform)),
            label: self.label,
        }
    }

    /// Transform and filter in one step; `None` means the edge does not match.
    pub fn filter_map<U: NodeValue>(
        self,
        transform: impl Fn(T) -> Option<U> + Send + Sync + 'static,
    ) -> Route<O, U> {
        let forward = self.forward;
        Route {
            forward: Arc::new(move |output: &O| forward(output).and_then(&transform)),
            label: self.label,
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Evaluate the route against a source output.
    pub fn apply(&self, output: &O) -> Option<T> {
        (self.forward)(output)
    }

    pub(crate) fn into_edge(self, from: String, to: String) -> Edge {
        let forward = self.forward;
        let source = from.clone();
        let erased: ForwardFn = Arc::new(move |value: &AnyValue| match (**value).downcast_ref::<O>() {
            Some(output) => forward(output).map(|next| Ok(Box::new(next) as AnyValue)),
            None => Some(Err(StrandError::TypeMismatch {
                node_id: source.clone(),
                expected: type_name::<O>(),
            })),
        });
        Edge {
            from,
            to,
            label: self.label,
            forward: erased,
        }
    }
}

/// The first tool call of an assistant message that requested tools.
pub fn on_tool_call() -> Route<ChatMessage, ToolCall> {
    Route::when(ChatMessage::has_tool_calls)
        .filter_map(|message| message.tool_calls().into_iter().next())
        .label("tool call")
}

/// Every tool call of an assistant message that requested tools.
pub fn on_tool_calls() -> Route<ChatMessage, Vec<ToolCall>> {
    Route::when(ChatMessage::has_tool_calls)
        .map(|message| message.tool_calls())
        .label("tool calls")
}

/// The text of an assistant message that requested no tools.
pub fn on_assistant_message() -> Route<ChatMessage, String> {
    Route::when(|message: &ChatMessage| !message.has_tool_calls())
        .map(|message| message.text())
        .label("assistant message")
}

pub fn on_tool_success() -> Route<ToolCallOutcome, ToolCallOutcome> {
    Route::when(ToolCallOutcome::is_success).label("tool succeeded")
}

pub fn on_tool_failure() -> Route<ToolCallOutcome, ToolCallOutcome> {
    Route::when(|outcome: &ToolCallOutcome| !outcome.is_success()).label("tool failed")
}

/// The moderated message, when moderation ran and found nothing harmful.
pub fn on_clean() -> Route<Moderated, ChatMessage> {
    Route::when(Moderated::is_clean)
        .map(|moderated| moderated.message)
        .label("clean")
}

pub fn on_harmful() -> Route<Moderated, ChatMessage> {
    Route::when(Moderated::is_harmful)
        .map(|moderated| moderated.message)
        .label("harmful")
}

/// Moderation itself failed; the message is forwarded unchecked.
pub fn on_moderation_failed() -> Route<Moderated, ChatMessage> {
    Route::when(|moderated: &Moderated| moderated.error.is_some())
        .map(|moderated| moderated.message)
        .label("moderation failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strand_core::types::{ModerationResult, ToolFailure};

    fn tool_message() -> ChatMessage {
        ChatMessage::assistant_tool_calls(vec![
            ToolCall::new("c1", "calculator", json!({"expression": "2+2"})),
            ToolCall::new("c2", "calculator", json!({"expression": "3+3"})),
        ])
    }

    #[test]
    fn test_always_and_when() {
        assert_eq!(Route::<u32, u32>::always().apply(&7), Some(7));
        let even = Route::when(|n: &u32| n % 2 == 0);
        assert_eq!(even.apply(&4), Some(4));
        assert_eq!(even.apply(&5), None);
    }

    #[test]
    fn test_map_and_filter_compose() {
        let route = Route::when(|n: &u32| *n > 1)
            .map(|n| n * 10)
            .and(|n| *n < 100)
            .map(|n| n.to_string());
        assert_eq!(route.apply(&5), Some("50".to_string()));
        assert_eq!(route.apply(&1), None);
        assert_eq!(route.apply(&20), None);
    }

    #[test]
    fn test_tool_call_routes() {
        let message = tool_message();
        assert_eq!(on_tool_call().apply(&message).unwrap().id, "c1");
        assert_eq!(on_tool_calls().apply(&message).unwrap().len(), 2);
        assert!(on_assistant_message().apply(&message).is_none());

        let text = ChatMessage::assistant_text("4");
        assert!(on_tool_call().apply(&text).is_none());
        assert_eq!(on_assistant_message().apply(&text), Some("4".to_string()));
    }

    #[test]
    fn test_tool_outcome_routes() {
        let call = ToolCall::new("c1", "calculator", json!({}));
        let ok = ToolCallOutcome::success(&call, "4");
        let failed = ToolCallOutcome::failed(&call, ToolFailure::NotFound);
        assert!(on_tool_success().apply(&ok).is_some());
        assert!(on_tool_success().apply(&failed).is_none());
        assert!(on_tool_failure().apply(&failed).is_some());
    }

    #[test]
    fn test_moderation_routes() {
        let clean = Moderated {
            message: ChatMessage::user("hi"),
            result: Some(ModerationResult::clean()),
            error: None,
        };
        let harmful = Moderated {
            message: ChatMessage::user("bad"),
            result: Some(ModerationResult::harmful(vec!["violence".into()])),
            error: None,
        };
        let failed = Moderated {
            message: ChatMessage::user("?"),
            result: None,
            error: Some("unsupported".into()),
        };
        assert!(on_clean().apply(&clean).is_some());
        assert!(on_harmful().apply(&clean).is_none());
        assert!(on_harmful().apply(&harmful).is_some());
        assert!(on_clean().apply(&failed).is_none());
        assert!(on_moderation_failed().apply(&failed).is_some());
    }

    #[test]
    fn test_erased_edge_type_mismatch() {
        let edge = Route::<u32, u32>::always().into_edge("a".into(), "b".into());
        let wrong: AnyValue = Box::new("text".to_string());
        assert!(matches!(
            edge.forward(&wrong),
            Some(Err(StrandError::TypeMismatch { .. }))
        ));
        let right: AnyValue = Box::new(3u32);
        assert!(matches!(edge.forward(&right), Some(Ok(_))));
        assert_eq!(edge.from(), "a");
        assert_eq!(edge.to(), "b");
    }
}
