//! Mocks and fixtures shared by the strand test suites.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use strand_core::config::{EngineConfig, ModelConfig};
use strand_core::error::{Result, StrandError};
use strand_core::event::{AgentEvent, EventEnvelope, EventKind};
use strand_core::traits::{LlmClient, Tool};
use strand_core::types::*;

// ---------------------------------------------------------------------------
// LLM
// ---------------------------------------------------------------------------

enum Scripted {
    Reply(ChatMessage),
    Fail(String),
}

/// An LLM client that replays a fixed script, one entry per call.
///
/// When the script runs out the fallback reply is used; without a fallback
/// the call fails with `LlmRequest`.
#[derive(Clone)]
pub struct MockLlmClient {
    script: Arc<Mutex<VecDeque<Scripted>>>,
    fallback: Option<ChatMessage>,
    prompts: Arc<Mutex<Vec<Prompt>>>,
    moderation: Option<ModerationResult>,
    delay: Option<Duration>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback: None,
            prompts: Arc::new(Mutex::new(Vec::new())),
            moderation: None,
            delay: None,
        }
    }

    /// Queue a plain text reply.
    pub fn reply_text(self, text: impl Into<String>) -> Self {
        self.reply(ChatMessage::assistant_text(text))
    }

    /// Queue a reply requesting a single tool call.
    pub fn reply_tool_call(self, id: &str, tool: &str, arguments: Value) -> Self {
        self.reply(ChatMessage::assistant_tool_calls(vec![ToolCall::new(
            id, tool, arguments,
        )]))
    }

    /// Queue a reply requesting several tool calls at once.
    pub fn reply_tool_calls(self, calls: Vec<ToolCall>) -> Self {
        self.reply(ChatMessage::assistant_tool_calls(calls))
    }

    pub fn reply(self, message: ChatMessage) -> Self {
        self.lock_script().push_back(Scripted::Reply(message));
        self
    }

    /// Queue a failing call.
    pub fn fail(self, message: impl Into<String>) -> Self {
        self.lock_script().push_back(Scripted::Fail(message.into()));
        self
    }

    pub fn with_fallback_text(mut self, text: impl Into<String>) -> Self {
        self.fallback = Some(ChatMessage::assistant_text(text));
        self
    }

    pub fn with_moderation(mut self, result: ModerationResult) -> Self {
        self.moderation = Some(result);
        self
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    /// Every prompt received so far, in call order.
    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().unwrap().clone()
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<Scripted>> {
        self.script.lock().unwrap()
    }

    fn next_reply(&self) -> Result<ChatMessage> {
        match self.lock_script().pop_front() {
            Some(Scripted::Reply(message)) => Ok(message),
            Some(Scripted::Fail(message)) => Err(StrandError::LlmRequest(message)),
            None => self
                .fallback
                .clone()
                .ok_or_else(|| StrandError::LlmRequest("mock script exhausted".into())),
        }
    }
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmClient for MockLlmClient {
    fn execute(
        &self,
        prompt: Prompt,
        _model: &ModelConfig,
        _tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<ChatMessage>> {
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.prompts.lock().unwrap().push(prompt);
            self.next_reply()
        })
    }

    fn moderate(&self, _prompt: Prompt, _model: &ModelConfig) -> BoxFuture<'_, Result<ModerationResult>> {
        let result = self.moderation.clone();
        Box::pin(async move {
            result.ok_or_else(|| StrandError::Moderation("moderation not scripted".into()))
        })
    }
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// Evaluates arithmetic expressions such as `2+2` or `(1 + 2) * 3`.
pub struct CalculatorTool;

impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Evaluate an arithmetic expression"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "expression": { "type": "string" } },
            "required": ["expression"],
            "additionalProperties": false
        })
    }

    fn execute(&self, input: Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let expression = input["expression"].as_str().unwrap_or_default();
            match evaluate(expression) {
                Some(value) if value.fract() == 0.0 => Ok(ToolResult::success(format!("{}", value as i64))),
                Some(value) => Ok(ToolResult::success(value.to_string())),
                None => Ok(ToolResult::error(format!("cannot evaluate '{}'", expression))),
            }
        })
    }
}

fn evaluate(expression: &str) -> Option<f64> {
    let tokens: Vec<char> = expression.chars().filter(|c| !c.is_whitespace()).collect();
    let mut pos = 0;
    let value = parse_sum(&tokens, &mut pos)?;
    (pos == tokens.len()).then_some(value)
}

fn parse_sum(tokens: &[char], pos: &mut usize) -> Option<f64> {
    let mut value = parse_product(tokens, pos)?;
    while let Some(&op) = tokens.get(*pos) {
        if op != '+' && op != '-' {
            break;
        }
        *pos += 1;
        let rhs = parse_product(tokens, pos)?;
        value = if op == '+' { value + rhs } else { value - rhs };
    }
    Some(value)
}

fn parse_product(tokens: &[char], pos: &mut usize) -> Option<f64> {
    let mut value = parse_atom(tokens, pos)?;
    while let Some(&op) = tokens.get(*pos) {
        if op != '*' && op != '/' {
            break;
        }
        *pos += 1;
        let rhs = parse_atom(tokens, pos)?;
        if op == '/' && rhs == 0.0 {
            return None;
        }
        value = if op == '*' { value * rhs } else { value / rhs };
    }
    Some(value)
}

fn parse_atom(tokens: &[char], pos: &mut usize) -> Option<f64> {
    match tokens.get(*pos)? {
        '(' => {
            *pos += 1;
            let value = parse_sum(tokens, pos)?;
            if tokens.get(*pos) != Some(&')') {
                return None;
            }
            *pos += 1;
            Some(value)
        }
        '-' => {
            *pos += 1;
            parse_atom(tokens, pos).map(|v| -v)
        }
        _ => {
            let start = *pos;
            while tokens
                .get(*pos)
                .is_some_and(|c| c.is_ascii_digit() || *c == '.')
            {
                *pos += 1;
            }
            tokens[start..*pos].iter().collect::<String>().parse().ok()
        }
    }
}

/// A tool that always returns an error.
pub struct FailingTool {
    name: String,
}

impl FailingTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Tool for FailingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object" })
    }

    fn execute(&self, _input: Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            Err(StrandError::ToolExecution {
                tool: self.name.clone(),
                message: "intentional failure".into(),
            })
        })
    }
}

/// A tool that sleeps before succeeding.
pub struct SlowTool {
    name: String,
    delay: Duration,
}

impl SlowTool {
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
        }
    }
}

impl Tool for SlowTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Sleeps, then succeeds"
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object" })
    }

    fn execute(&self, _input: Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(ToolResult::success(format!("{} done", self.name)))
        })
    }
}

/// A tool that panics when called, by default once its future is polled.
pub struct PanickingTool {
    name: String,
    eager: bool,
}

impl PanickingTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            eager: false,
        }
    }

    /// Panic inside `execute` itself, before any future is returned.
    pub fn eager(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            eager: true,
        }
    }
}

impl Tool for PanickingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Panics"
    }

    fn input_schema(&self) -> Value {
        Value::Null
    }

    fn execute(&self, _input: Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        if self.eager {
            panic!("{} panicked before returning a future", self.name);
        }
        Box::pin(async move { panic!("{} panicked on purpose", self.name) })
    }
}

/// A tool that accepts anything and remembers every input it was given.
#[derive(Clone)]
pub struct RecordingTool {
    name: String,
    calls: Arc<Mutex<Vec<Value>>>,
}

impl RecordingTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<Value> {
        self.calls.lock().unwrap().clone()
    }
}

impl Tool for RecordingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Records its inputs"
    }

    fn input_schema(&self) -> Value {
        Value::Null
    }

    fn execute(&self, input: Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(input);
            Ok(ToolResult::success(format!("{} ok", self.name)))
        })
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Collects events in delivery order.
#[derive(Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<EventEnvelope>>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, envelope: EventEnvelope) {
        self.events.lock().unwrap().push(envelope);
    }

    pub fn envelopes(&self) -> Vec<EventEnvelope> {
        self.events.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<AgentEvent> {
        self.envelopes().into_iter().map(|e| e.event).collect()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().iter().map(|e| e.kind()).collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }

    /// Node ids in the order their execution started.
    pub fn started_nodes(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                AgentEvent::NodeExecutionStarting { node_id, .. } => Some(node_id),
                _ => None,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Config fixtures
// ---------------------------------------------------------------------------

pub fn model_config() -> ModelConfig {
    ModelConfig::default()
}

/// Minimal valid engine configuration.
pub fn engine_config() -> EngineConfig {
    EngineConfig::parse(MINIMAL_CONFIG).unwrap()
}

pub const MINIMAL_CONFIG: &str = r#"
[model]
provider = "mock"
model_id = "mock-model"
"#;

/// Write `contents` to a `strand.toml` inside a fresh temporary directory.
pub fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("strand.toml");
    std::fs::write(&path, contents).unwrap();
    (dir, path)
}

/// Parse a TOML snippet, for tests that inspect raw tables.
pub fn toml_value(contents: &str) -> toml::Value {
    toml::from_str(contents).unwrap()
}

/// A timestamp fixed for snapshot-style assertions.
pub fn fixed_time() -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&chrono::Utc)
}
