//! Built-in message processors for the trace feature.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::{debug, info};

use strand_core::error::Result;
use strand_core::event::{AgentEvent, EventBus};

use super::message::{FeatureMessage, MessageProcessor};

/// Writes every message through `tracing` at info level.
#[derive(Debug, Default)]
pub struct LogMessageProcessor;

impl MessageProcessor for LogMessageProcessor {
    fn name(&self) -> &str {
        "log"
    }

    fn process_message(&self, message: FeatureMessage) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let detail = serde_json::to_string(&message.envelope.event)?;
            info!(
                feature = %message.feature,
                run_id = %message.envelope.run_id,
                strategy = %message.envelope.strategy,
                event = %message.envelope.kind(),
                detail = %truncate_str(&detail, 500),
                "Trace event"
            );
            Ok(())
        })
    }
}

/// Publishes every message's envelope on a broadcast bus so any number of
/// subscribers can tail a run.
pub struct BroadcastMessageProcessor {
    bus: Arc<EventBus>,
}

impl BroadcastMessageProcessor {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }
}

impl MessageProcessor for BroadcastMessageProcessor {
    fn name(&self) -> &str {
        "broadcast"
    }

    fn process_message(&self, message: FeatureMessage) -> BoxFuture<'_, Result<()>> {
        self.bus.publish(message.envelope);
        Box::pin(async { Ok(()) })
    }
}

/// Append-only JSONL run log.
///
/// Each run gets `{dir}/{run_id}.jsonl`, one JSON object per line, flushed
/// after every line so a crash leaves all earlier lines intact. The file is
/// closed when the run's terminal event is written.
pub struct JsonlMessageProcessor {
    dir: PathBuf,
    writers: Mutex<HashMap<String, BufWriter<tokio::fs::File>>>,
}

/// A single line of the run log.
#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    run_id: &'a str,
    agent_id: &'a str,
    strategy: &'a str,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl JsonlMessageProcessor {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            writers: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the log file for `run_id`.
    pub fn log_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", run_id))
    }

    async fn open(&self, run_id: &str) -> Result<BufWriter<tokio::fs::File>> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.log_path(run_id);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        debug!(path = %path.display(), "Run log opened");
        Ok(BufWriter::new(file))
    }
}

impl MessageProcessor for JsonlMessageProcessor {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn process_message(&self, message: FeatureMessage) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let envelope = &message.envelope;
            let run_id = envelope.run_id.as_str();
            let entry = LogEntry {
                timestamp: envelope.timestamp.to_rfc3339(),
                run_id,
                agent_id: envelope.agent_id.as_str(),
                strategy: &envelope.strategy,
                event_type: envelope.kind().as_str(),
                detail: event_detail(&envelope.event),
            };
            let mut line = serde_json::to_string(&entry)?;
            line.push('\n');

            let mut writers = self.writers.lock().await;
            if !writers.contains_key(run_id) {
                let writer = self.open(run_id).await?;
                writers.insert(run_id.to_string(), writer);
            }
            if let Some(writer) = writers.get_mut(run_id) {
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await?;
            }

            if envelope.event.is_terminal() {
                if let Some(mut writer) = writers.remove(run_id) {
                    writer.shutdown().await?;
                }
            }
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut writers = self.writers.lock().await;
            for (_, mut writer) in writers.drain() {
                writer.flush().await?;
            }
            Ok(())
        })
    }
}

/// Event payload without its tag, with bulky tool fields shortened.
fn event_detail(event: &AgentEvent) -> Option<serde_json::Value> {
    match event {
        AgentEvent::ToolCallStarting {
            call_id,
            tool,
            arguments,
        } => Some(serde_json::json!({
            "call_id": call_id,
            "tool": tool,
            "arguments": truncate_json(arguments, 500),
        })),
        AgentEvent::ToolCallCompleted {
            call_id,
            tool,
            content,
        } => Some(serde_json::json!({
            "call_id": call_id,
            "tool": tool,
            "content_preview": truncate_str(content, 200),
        })),
        other => match serde_json::to_value(other).ok()? {
            serde_json::Value::Object(mut fields) => {
                fields.remove("type");
                (!fields.is_empty()).then_some(serde_json::Value::Object(fields))
            }
            _ => None,
        },
    }
}

/// Truncate a JSON value for logging.
fn truncate_json(value: &serde_json::Value, max_len: usize) -> String {
    let s = value.to_string();
    if s.len() <= max_len {
        s
    } else {
        format!("{}...", truncate_str(&s, max_len))
    }
}

/// Truncate a string for logging, on a char boundary.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strand_core::event::EventEnvelope;
    use strand_core::types::{AgentId, RunId};

    fn message(run_id: &RunId, event: AgentEvent) -> FeatureMessage {
        FeatureMessage::new(
            "trace",
            EventEnvelope::new(AgentId::from("agent"), run_id.clone(), "loop", event),
        )
    }

    #[tokio::test]
    async fn test_jsonl_one_file_per_run() {
        let dir = tempfile::tempdir().unwrap();
        let processor = JsonlMessageProcessor::new(dir.path().join("runs"));
        let run = RunId::from("run-1");

        processor
            .process_message(message(
                &run,
                AgentEvent::AgentStarting { input: json!("2+2") },
            ))
            .await
            .unwrap();
        processor
            .process_message(message(
                &run,
                AgentEvent::ToolCallStarting {
                    call_id: "c1".into(),
                    tool: "calculator".into(),
                    arguments: json!({"expression": "2+2"}),
                },
            ))
            .await
            .unwrap();
        processor
            .process_message(message(
                &run,
                AgentEvent::AgentCompleted { result: json!("4") },
            ))
            .await
            .unwrap();

        let content = std::fs::read_to_string(processor.log_path("run-1")).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["event_type"], "agent_starting");
        assert_eq!(lines[0]["detail"]["input"], "2+2");
        assert_eq!(lines[1]["detail"]["tool"], "calculator");
        assert_eq!(lines[2]["event_type"], "agent_completed");
        assert_eq!(lines[2]["run_id"], "run-1");
        assert!(processor.writers.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_publishes_envelope() {
        let bus = Arc::new(EventBus::new(8));
        let mut rx = bus.subscribe();
        let processor = BroadcastMessageProcessor::new(Arc::clone(&bus));
        processor
            .process_message(message(
                &RunId::from("r"),
                AgentEvent::StrategyStarting {
                    strategy: "loop".into(),
                },
            ))
            .await
            .unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.run_id.as_str(), "r");
    }

    #[test]
    fn test_event_detail_drops_tag() {
        let detail = event_detail(&AgentEvent::AgentExecutionFailed {
            error: "boom".into(),
        })
        .unwrap();
        assert_eq!(detail, json!({"error": "boom"}));
    }

    #[test]
    fn test_truncate_json() {
        let value = json!({"key": "a very long string that should be truncated"});
        let result = truncate_json(&value, 20);
        assert!(result.len() <= 23);
        assert!(result.ends_with("..."));
    }

    #[test]
    fn test_truncate_str_char_boundary() {
        assert_eq!(truncate_str("héllo", 2), "h");
        assert_eq!(truncate_str("short", 10), "short");
    }
}
