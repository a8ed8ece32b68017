use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::checkpoint::Checkpoint;
use crate::config::ModelConfig;
use crate::error::{Result, StrandError};
use crate::types::*;

/// LLM client: the engine's only view of a model provider.
///
/// Implementations own transport, request shaping and retries; the engine
/// never retries a failed call itself.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a prompt and receive the complete assistant response.
    fn execute(
        &self,
        prompt: Prompt,
        model: &ModelConfig,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<ChatMessage>>;

    /// Send a prompt and receive a stream of deltas.
    ///
    /// The default replays `execute` as a finished stream.
    fn execute_streaming(
        &self,
        prompt: Prompt,
        model: &ModelConfig,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let response = self.execute(prompt, model, tools);
        Box::pin(async move {
            let message = response.await?;
            Ok(futures::stream::iter(message_to_deltas(message).into_iter().map(Ok)).boxed())
        })
    }

    /// Ask for `choices` alternative responses to the same prompt.
    ///
    /// The default fans out `choices` concurrent `execute` calls and joins them.
    fn execute_multiple_choices(
        &self,
        prompt: Prompt,
        model: &ModelConfig,
        tools: &[ToolDefinition],
        choices: usize,
    ) -> BoxFuture<'_, Result<Vec<ChatMessage>>> {
        let calls: Vec<_> = (0..choices.max(1))
            .map(|_| self.execute(prompt.clone(), model, tools))
            .collect();
        Box::pin(futures::future::try_join_all(calls))
    }

    /// Classify a prompt for harmful content.
    fn moderate(&self, prompt: Prompt, model: &ModelConfig) -> BoxFuture<'_, Result<ModerationResult>> {
        let _ = (prompt, model);
        Box::pin(async { Err(StrandError::Moderation("moderation not supported".into())) })
    }
}

/// Tool: a named, schema-described callable the model may request.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in LLM tool calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input, checked before every invocation.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with given input and context.
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>>;

    /// Timeout in seconds for this tool; `None` uses the engine default.
    fn timeout_secs(&self) -> Option<u64> {
        None
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

/// Checkpoint store: persistence backend for run snapshots.
///
/// Only the contract lives here; storage engines are external.
pub trait CheckpointStore: Send + Sync + 'static {
    /// Persist a checkpoint.
    fn save(&self, checkpoint: Checkpoint) -> BoxFuture<'_, Result<()>>;

    /// Load a specific checkpoint of a run.
    fn load(&self, run_id: &RunId, checkpoint_id: &str) -> BoxFuture<'_, Result<Checkpoint>>;

    /// Load the most recent checkpoint of a run, if any.
    fn latest(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<Checkpoint>>>;

    /// All checkpoints of a run, oldest first.
    fn list(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<Checkpoint>>>;

    /// Delete every checkpoint of a run, returning how many were removed.
    fn delete_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<usize>>;
}

/// Split a complete response into the deltas a streaming client would emit.
pub fn message_to_deltas(message: ChatMessage) -> Vec<StreamDelta> {
    let mut deltas = Vec::new();
    let mut tool_index = 0;
    for block in message.content {
        match block {
            ContentBlock::Text { text } => deltas.push(StreamDelta::TextDelta(text)),
            ContentBlock::ToolUse { id, name, input } => {
                deltas.push(StreamDelta::ToolUseStart {
                    index: tool_index,
                    id,
                    name,
                });
                deltas.push(StreamDelta::ToolInputDelta {
                    index: tool_index,
                    delta: input.to_string(),
                });
                tool_index += 1;
            }
            ContentBlock::ToolResult { .. } => {}
        }
    }
    let reason = if tool_index > 0 {
        StopReason::ToolUse
    } else {
        StopReason::EndTurn
    };
    deltas.push(StreamDelta::Stop(reason));
    deltas
}

/// Accumulator for streaming tool call deltas.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    input_json: String,
}

/// Drain a delta stream into a single assistant message.
///
/// Each delta is passed to `on_delta` before it is folded in, so callers can
/// forward text as it arrives.
pub async fn collect_stream(
    mut stream: BoxStream<'_, Result<StreamDelta>>,
    mut on_delta: impl FnMut(&StreamDelta),
) -> Result<ChatMessage> {
    let mut text_content = String::new();
    let mut tool_calls: Vec<ToolCallAccumulator> = Vec::new();

    while let Some(delta) = stream.next().await {
        let delta = delta?;
        on_delta(&delta);
        match delta {
            StreamDelta::TextDelta(text) => text_content.push_str(&text),
            StreamDelta::ToolUseStart { index, id, name } => {
                while tool_calls.len() <= index {
                    tool_calls.push(ToolCallAccumulator::default());
                }
                tool_calls[index].id = id;
                tool_calls[index].name = name;
            }
            StreamDelta::ToolInputDelta { index, delta } => {
                if let Some(tc) = tool_calls.get_mut(index) {
                    tc.input_json.push_str(&delta);
                }
            }
            StreamDelta::Stop(_) => break,
        }
    }

    let mut content = Vec::new();
    if !text_content.is_empty() {
        content.push(ContentBlock::Text { text: text_content });
    }
    for tc in tool_calls {
        let input = if tc.input_json.trim().is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            serde_json::from_str(&tc.input_json)
                .map_err(|e| StrandError::LlmStream(format!("tool input for {}: {}", tc.name, e)))?
        };
        content.push(ContentBlock::ToolUse {
            id: tc.id,
            name: tc.name,
            input,
        });
    }

    Ok(ChatMessage {
        role: Role::Assistant,
        content,
        timestamp: Some(chrono::Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    impl LlmClient for Echo {
        fn execute(
            &self,
            prompt: Prompt,
            _model: &ModelConfig,
            _tools: &[ToolDefinition],
        ) -> BoxFuture<'_, Result<ChatMessage>> {
            Box::pin(async move {
                let last = prompt.messages.last().map(|m| m.text()).unwrap_or_default();
                if last == "tool" {
                    Ok(ChatMessage::assistant_tool_calls(vec![ToolCall::new(
                        "c1",
                        "calc",
                        json!({"expression": "2+2"}),
                    )]))
                } else {
                    Ok(ChatMessage::assistant_text(last))
                }
            })
        }
    }

    fn prompt(text: &str) -> Prompt {
        let mut p = Prompt::new("p");
        p.push(ChatMessage::user(text));
        p
    }

    #[tokio::test]
    async fn test_default_streaming_round_trips_tool_calls() {
        let llm = Echo;
        let model = ModelConfig::default();
        let stream = llm.execute_streaming(prompt("tool"), &model, &[]).await.unwrap();
        let mut seen = 0;
        let message = collect_stream(stream, |_| seen += 1).await.unwrap();
        assert_eq!(seen, 3);
        let calls = message.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments, json!({"expression": "2+2"}));
    }

    #[tokio::test]
    async fn test_default_multiple_choices_fans_out() {
        let llm = Echo;
        let model = ModelConfig::default();
        let choices = llm
            .execute_multiple_choices(prompt("hi"), &model, &[], 3)
            .await
            .unwrap();
        assert_eq!(choices.len(), 3);
        assert!(choices.iter().all(|c| c.text() == "hi"));
    }

    #[tokio::test]
    async fn test_default_moderation_is_unsupported() {
        let llm = Echo;
        let err = llm
            .moderate(prompt("hi"), &ModelConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StrandError::Moderation(_)));
    }
}
