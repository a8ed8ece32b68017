//! Session history compression used by history-compression nodes.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use strand_core::error::Result;
use strand_core::types::{ChatMessage, ContentBlock, Prompt, Role};

use crate::context::AgentContext;

pub const SUMMARY_MARKER: &str = "[Conversation Summary]";

/// How a compression node shrinks the session.
///
/// System messages are always kept. A kept tail never starts with a tool
/// result whose tool call was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum HistoryCompression {
    /// Drop everything but the last `count` messages.
    KeepLast { count: usize },
    /// Replace everything but the last `keep_last` messages with a
    /// model-written summary.
    Summarize { keep_last: usize },
    /// Summarize the whole conversation into one message.
    WholeHistory,
}

impl Default for HistoryCompression {
    fn default() -> Self {
        Self::Summarize { keep_last: 4 }
    }
}

impl HistoryCompression {
    /// Compress the session of `ctx`. Returns how many messages were removed.
    ///
    /// A failed or empty summary falls back to `KeepLast` with the same tail.
    pub async fn apply(&self, ctx: &AgentContext) -> Result<usize> {
        let messages = ctx.messages().await;
        let before = messages.len();

        let compressed = match self {
            Self::KeepLast { count } => keep_last(&messages, *count),
            Self::Summarize { keep_last: tail } => summarize(ctx, &messages, *tail).await,
            Self::WholeHistory => summarize(ctx, &messages, 0).await,
        };

        let removed = before.saturating_sub(compressed.len());
        if compressed != messages {
            ctx.replace_messages(compressed).await;
            info!(run_id = %ctx.run_id(), before, removed, "Compressed history");
        }
        Ok(removed)
    }
}

fn is_tool_result(message: &ChatMessage) -> bool {
    message
        .content
        .iter()
        .any(|block| matches!(block, ContentBlock::ToolResult { .. }))
}

/// Index where the kept tail of the non-system messages starts.
fn tail_start(body: &[&ChatMessage], keep: usize) -> usize {
    let mut start = body.len().saturating_sub(keep);
    while start > 0 && start < body.len() && is_tool_result(body[start]) {
        start -= 1;
    }
    start
}

/// System messages plus the last `count` other messages.
pub fn keep_last(messages: &[ChatMessage], count: usize) -> Vec<ChatMessage> {
    let (system, body): (Vec<&ChatMessage>, Vec<&ChatMessage>) =
        messages.iter().partition(|m| m.role == Role::System);
    let start = tail_start(&body, count);
    system
        .into_iter()
        .chain(body[start..].iter().copied())
        .cloned()
        .collect()
}

async fn summarize(ctx: &AgentContext, messages: &[ChatMessage], keep: usize) -> Vec<ChatMessage> {
    let (system, body): (Vec<&ChatMessage>, Vec<&ChatMessage>) =
        messages.iter().partition(|m| m.role == Role::System);
    let start = tail_start(&body, keep);
    if start == 0 {
        return messages.to_vec();
    }

    let mut conversation = String::new();
    for message in &body[..start] {
        conversation.push_str(&format!("{:?}: {}\n", message.role, transcript_text(message)));
    }

    let mut prompt = Prompt::new(format!("{}-summary", ctx.run_id()));
    prompt.push(ChatMessage::user(format!(
        "Summarize the following conversation concisely, preserving key facts, \
         decisions, tool results and open questions. Output only the summary.\n\n{}",
        conversation
    )));

    let summary = match ctx.request_llm_with(prompt).await {
        Ok(response) if !response.text().trim().is_empty() => response.text(),
        Ok(_) => {
            warn!(run_id = %ctx.run_id(), "Empty summary, keeping tail only");
            return keep_last(messages, keep);
        }
        Err(e) => {
            warn!(run_id = %ctx.run_id(), error = %e, "Summarization failed, keeping tail only");
            return keep_last(messages, keep);
        }
    };

    system
        .into_iter()
        .cloned()
        .chain(std::iter::once(ChatMessage::user(format!(
            "{}\n{}",
            SUMMARY_MARKER, summary
        ))))
        .chain(body[start..].iter().map(|m| (*m).clone()))
        .collect()
}

/// Text of a message including tool traffic, for the summarizer.
fn transcript_text(message: &ChatMessage) -> String {
    message
        .content
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => text.clone(),
            ContentBlock::ToolUse { name, input, .. } => format!("[called {} with {}]", name, input),
            ContentBlock::ToolResult { content, .. } => format!("[tool result: {}]", content),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
