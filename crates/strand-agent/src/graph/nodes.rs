//! Built-in node kinds: LLM requests, tool execution, history compression,
//! moderation and subgraphs.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::warn;

use strand_core::error::{Result, StrandError};
use strand_core::types::{ChatMessage, ModerationResult, StreamDelta, ToolCall, ToolCallOutcome};

use super::builder::{Graph, GraphBuilder, NodeHandle, START_NODE_ID};
use super::interpreter::run_from;
use super::node::{NodeKind, NodeValue};
use crate::compression::HistoryCompression;
use crate::context::AgentContext;

/// Output of a moderation node. Moderation failures are data, so the graph
/// can route around them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Moderated {
    pub message: ChatMessage,
    #[serde(default)]
    pub result: Option<ModerationResult>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Moderated {
    pub fn is_clean(&self) -> bool {
        self.result.as_ref().is_some_and(|r| !r.is_harmful)
    }

    pub fn is_harmful(&self) -> bool {
        self.result.as_ref().is_some_and(|r| r.is_harmful)
    }
}

/// Append `text` to the session as a user message unless it is empty.
async fn push_user_text(ctx: &AgentContext, text: String) {
    if !text.is_empty() {
        ctx.append(ChatMessage::user(text)).await;
    }
}

async fn request_and_record(ctx: &AgentContext) -> Result<ChatMessage> {
    let response = ctx.request_llm().await?;
    ctx.append(response.clone()).await;
    Ok(response)
}

impl<I: NodeValue, O: NodeValue> GraphBuilder<I, O> {
    /// Append the input as a user message and ask the model.
    ///
    /// The assistant response is appended to the session and becomes the
    /// node's output.
    pub fn llm_request(&mut self, id: impl Into<String>) -> NodeHandle<String, ChatMessage> {
        self.add_node(
            id,
            NodeKind::LlmRequest { choices: 1 },
            |text: String, ctx: AgentContext| -> BoxFuture<'static, Result<ChatMessage>> {
                Box::pin(async move {
                    push_user_text(&ctx, text).await;
                    request_and_record(&ctx).await
                })
            },
        )
    }

    /// Like `llm_request`, passing each streamed delta to `on_delta`.
    pub fn llm_request_streaming(
        &mut self,
        id: impl Into<String>,
        on_delta: impl Fn(&StreamDelta) + Send + Sync + 'static,
    ) -> NodeHandle<String, ChatMessage> {
        let on_delta = Arc::new(on_delta);
        self.add_node(
            id,
            NodeKind::LlmRequest { choices: 1 },
            move |text: String, ctx: AgentContext| -> BoxFuture<'static, Result<ChatMessage>> {
                let on_delta = Arc::clone(&on_delta);
                Box::pin(async move {
                    push_user_text(&ctx, text).await;
                    let response = ctx.request_llm_streaming(|delta| on_delta(delta)).await?;
                    ctx.append(response.clone()).await;
                    Ok(response)
                })
            },
        )
    }

    /// Ask for `choices` alternative responses. Nothing is appended to the
    /// session until one is picked with `select_choice`.
    pub fn llm_request_multiple_choices(
        &mut self,
        id: impl Into<String>,
        choices: usize,
    ) -> NodeHandle<String, Vec<ChatMessage>> {
        self.add_node(
            id,
            NodeKind::LlmRequest { choices },
            move |text: String, ctx: AgentContext| -> BoxFuture<'static, Result<Vec<ChatMessage>>> {
                Box::pin(async move {
                    push_user_text(&ctx, text).await;
                    ctx.request_llm_choices(choices).await
                })
            },
        )
    }

    /// Pick one of several responses and append it to the session.
    ///
    /// The selector's index is clamped to the available choices.
    pub fn select_choice(
        &mut self,
        id: impl Into<String>,
        selector: impl Fn(&[ChatMessage]) -> usize + Send + Sync + 'static,
    ) -> NodeHandle<Vec<ChatMessage>, ChatMessage> {
        let id = id.into();
        let node_id = id.clone();
        let selector = Arc::new(selector);
        self.add_node(
            id,
            NodeKind::Transform,
            move |mut choices: Vec<ChatMessage>, ctx: AgentContext| -> BoxFuture<'static, Result<ChatMessage>> {
                let selector = Arc::clone(&selector);
                let node_id = node_id.clone();
                Box::pin(async move {
                    if choices.is_empty() {
                        return Err(StrandError::NodeExecution {
                            node_id,
                            message: "no choices to select from".into(),
                        });
                    }
                    let index = selector(&choices).min(choices.len() - 1);
                    let chosen = choices.swap_remove(index);
                    ctx.append(chosen.clone()).await;
                    Ok(chosen)
                })
            },
        )
    }

    /// Append a tool outcome to the session and ask the model again.
    pub fn llm_send_tool_result(&mut self, id: impl Into<String>) -> NodeHandle<ToolCallOutcome, ChatMessage> {
        self.add_node(
            id,
            NodeKind::LlmRequest { choices: 1 },
            |outcome: ToolCallOutcome, ctx: AgentContext| -> BoxFuture<'static, Result<ChatMessage>> {
                Box::pin(async move {
                    ctx.append(outcome.to_message()).await;
                    request_and_record(&ctx).await
                })
            },
        )
    }

    /// Append several tool outcomes as one message and ask the model again.
    pub fn llm_send_tool_results(
        &mut self,
        id: impl Into<String>,
    ) -> NodeHandle<Vec<ToolCallOutcome>, ChatMessage> {
        self.add_node(
            id,
            NodeKind::LlmRequest { choices: 1 },
            |outcomes: Vec<ToolCallOutcome>, ctx: AgentContext| -> BoxFuture<'static, Result<ChatMessage>> {
                Box::pin(async move {
                    ctx.append(ChatMessage::tool_results(&outcomes)).await;
                    request_and_record(&ctx).await
                })
            },
        )
    }

    /// Run one tool call. Failures come back as data in the outcome.
    pub fn execute_tool(&mut self, id: impl Into<String>) -> NodeHandle<ToolCall, ToolCallOutcome> {
        self.add_node(
            id,
            NodeKind::ToolExecution { parallel: false },
            |call: ToolCall, ctx: AgentContext| -> BoxFuture<'static, Result<ToolCallOutcome>> {
                Box::pin(async move { Ok(ctx.execute_tool(call).await) })
            },
        )
    }

    /// Run several tool calls. With `parallel` they are dispatched together
    /// and the node completes once every call has an outcome.
    pub fn execute_tools(
        &mut self,
        id: impl Into<String>,
        parallel: bool,
    ) -> NodeHandle<Vec<ToolCall>, Vec<ToolCallOutcome>> {
        self.add_node(
            id,
            NodeKind::ToolExecution { parallel },
            move |calls: Vec<ToolCall>, ctx: AgentContext| -> BoxFuture<'static, Result<Vec<ToolCallOutcome>>> {
                Box::pin(async move { Ok(ctx.execute_tools(calls, parallel).await) })
            },
        )
    }

    /// Compress the session history and pass the input through unchanged.
    pub fn compress_history<T: NodeValue>(
        &mut self,
        id: impl Into<String>,
        strategy: HistoryCompression,
    ) -> NodeHandle<T, T> {
        self.add_node(
            id,
            NodeKind::HistoryCompression,
            move |value: T, ctx: AgentContext| -> BoxFuture<'static, Result<T>> {
                let strategy = strategy.clone();
                Box::pin(async move {
                    strategy.apply(&ctx).await?;
                    Ok(value)
                })
            },
        )
    }

    /// Check a message for harmful content.
    pub fn moderate(&mut self, id: impl Into<String>) -> NodeHandle<ChatMessage, Moderated> {
        let id = id.into();
        let node_id = id.clone();
        self.add_node(
            id,
            NodeKind::Moderation,
            move |message: ChatMessage, ctx: AgentContext| -> BoxFuture<'static, Result<Moderated>> {
                let node_id = node_id.clone();
                Box::pin(async move {
                    let moderated = match ctx.moderate(&message).await {
                        Ok(result) => Moderated {
                            message,
                            result: Some(result),
                            error: None,
                        },
                        Err(e) => {
                            warn!(node_id = %node_id, error = %e, "Moderation failed");
                            Moderated {
                                message,
                                result: None,
                                error: Some(e.to_string()),
                            }
                        }
                    };
                    Ok(moderated)
                })
            },
        )
    }

    /// Embed `graph` as a single node.
    ///
    /// The nested graph shares the run identity and session. Its tools are
    /// limited to `tool_scope` when given, and it is cancelled with the run.
    pub fn subgraph<A: NodeValue, B: NodeValue>(
        &mut self,
        id: impl Into<String>,
        graph: Graph<A, B>,
        tool_scope: Option<Vec<String>>,
    ) -> NodeHandle<A, B> {
        let data = Arc::clone(graph.data());
        let scope = tool_scope.clone();
        self.add_node(
            id,
            NodeKind::Subgraph { tool_scope },
            move |input: A, ctx: AgentContext| -> BoxFuture<'static, Result<B>> {
                let data = Arc::clone(&data);
                let child = ctx.scoped(scope.as_deref());
                Box::pin(async move {
                    let output = run_from(&data, &child, START_NODE_ID, Box::new(input))
                        .await
                        .map_err(|failure| failure.error)?;
                    output.downcast::<B>().map(|b| *b).map_err(|_| StrandError::TypeMismatch {
                        node_id: data.name().to_string(),
                        expected: std::any::type_name::<B>(),
                    })
                })
            },
        )
    }
}
