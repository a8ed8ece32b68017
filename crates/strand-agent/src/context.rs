use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use strand_core::checkpoint::Checkpoint;
use strand_core::config::{AgentConfig, ModelConfig, ToolsConfig};
use strand_core::error::Result;
use strand_core::event::{AgentEvent, EventEnvelope};
use strand_core::traits::{collect_stream, LlmClient};
use strand_core::types::*;
use strand_tools::{RollbackRegistry, ToolCallObserver, ToolExecutor, ToolRegistry};

use crate::feature::{Feature, FeaturePipeline};
use crate::handoff::Handoff;

struct ContextInner {
    agent_id: AgentId,
    run_id: RunId,
    strategy: String,
    session: Arc<RwLock<Prompt>>,
    llm: Arc<dyn LlmClient>,
    model: ModelConfig,
    config: AgentConfig,
    executor: ToolExecutor,
    pipeline: Arc<FeaturePipeline>,
    cancel: CancellationToken,
    handoff: Option<Handoff>,
    nested: bool,
}

/// Everything a node can see while a run executes.
///
/// Cheap to clone. The session (message history) is shared by every clone
/// and by nested subgraph contexts; only the node currently executing
/// writes to it.
#[derive(Clone)]
pub struct AgentContext {
    inner: Arc<ContextInner>,
}

impl AgentContext {
    pub fn builder(llm: Arc<dyn LlmClient>) -> ContextBuilder {
        ContextBuilder::new(llm)
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.inner.agent_id
    }

    pub fn run_id(&self) -> &RunId {
        &self.inner.run_id
    }

    pub fn strategy(&self) -> &str {
        &self.inner.strategy
    }

    pub fn model(&self) -> &ModelConfig {
        &self.inner.model
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn llm(&self) -> &Arc<dyn LlmClient> {
        &self.inner.llm
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        self.inner.executor.registry()
    }

    pub fn executor(&self) -> &ToolExecutor {
        &self.inner.executor
    }

    pub fn rollback(&self) -> &Arc<RollbackRegistry> {
        self.inner.pipeline.rollback()
    }

    pub fn pipeline(&self) -> &Arc<FeaturePipeline> {
        &self.inner.pipeline
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Whether this context belongs to a subgraph rather than the top-level graph.
    pub fn is_nested(&self) -> bool {
        self.inner.nested
    }

    /// Inbound request and outbound sink, when the run serves a protocol request.
    pub fn handoff(&self) -> Option<&Handoff> {
        self.inner.handoff.as_ref()
    }

    /// Look up an installed feature.
    pub fn feature<F: Feature>(&self) -> Result<Arc<F>> {
        self.inner.pipeline.feature::<F>()
    }

    /// Deliver an event to the installed features.
    pub async fn emit(&self, event: AgentEvent) {
        let envelope = EventEnvelope::new(
            self.inner.agent_id.clone(),
            self.inner.run_id.clone(),
            self.inner.strategy.clone(),
            event,
        );
        self.inner.pipeline.dispatch(envelope, self).await;
    }

    // -- session ----------------------------------------------------------

    /// Snapshot of the session prompt.
    pub async fn prompt(&self) -> Prompt {
        self.inner.session.read().await.clone()
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.inner.session.read().await.messages.clone()
    }

    pub async fn append(&self, message: ChatMessage) {
        self.inner.session.write().await.push(message);
    }

    pub async fn replace_messages(&self, messages: Vec<ChatMessage>) {
        self.inner.session.write().await.messages = messages;
    }

    /// Mutate the session in place under the write lock.
    pub async fn update_session<R>(&self, f: impl FnOnce(&mut Prompt) -> R) -> R {
        let mut session = self.inner.session.write().await;
        f(&mut session)
    }

    /// Serializable run state positioned before `node_id` runs with `input`.
    pub async fn checkpoint(&self, node_id: &str, input: serde_json::Value) -> Checkpoint {
        let prompt = self.prompt().await;
        Checkpoint::new(
            self.inner.agent_id.clone(),
            self.inner.run_id.clone(),
            self.inner.strategy.clone(),
            node_id,
            input,
            prompt.id,
            prompt.messages,
            self.rollback().current_seq(),
        )
    }

    /// Put the session back the way `checkpoint` recorded it.
    pub async fn restore(&self, checkpoint: &Checkpoint) {
        let mut session = self.inner.session.write().await;
        session.id = checkpoint.prompt_id.clone();
        session.messages = checkpoint.messages.clone();
    }

    // -- LLM --------------------------------------------------------------

    /// Send the session prompt to the model with the tools in scope.
    pub async fn request_llm(&self) -> Result<ChatMessage> {
        let (prompt, tools) = self.llm_call_starting().await;
        let response = self
            .inner
            .llm
            .execute(prompt.clone(), &self.inner.model, &tools)
            .await
            .inspect_err(|e| warn!(run_id = %self.inner.run_id, error = %e, "LLM call failed"))?;
        self.llm_call_completed(&prompt, std::slice::from_ref(&response))
            .await;
        Ok(response)
    }

    /// Like `request_llm`, streaming deltas to `on_delta` as they arrive.
    pub async fn request_llm_streaming(
        &self,
        on_delta: impl FnMut(&StreamDelta),
    ) -> Result<ChatMessage> {
        let (prompt, tools) = self.llm_call_starting().await;
        let stream = self
            .inner
            .llm
            .execute_streaming(prompt.clone(), &self.inner.model, &tools)
            .await?;
        let response = collect_stream(stream, on_delta).await?;
        self.llm_call_completed(&prompt, std::slice::from_ref(&response))
            .await;
        Ok(response)
    }

    /// Ask for `choices` alternative responses to the session prompt.
    pub async fn request_llm_choices(&self, choices: usize) -> Result<Vec<ChatMessage>> {
        let (prompt, tools) = self.llm_call_starting().await;
        let responses = self
            .inner
            .llm
            .execute_multiple_choices(prompt.clone(), &self.inner.model, &tools, choices)
            .await?;
        self.llm_call_completed(&prompt, &responses).await;
        Ok(responses)
    }

    /// Send an arbitrary prompt without tools, outside the session.
    pub async fn request_llm_with(&self, prompt: Prompt) -> Result<ChatMessage> {
        self.emit(AgentEvent::LlmCallStarting {
            prompt_id: prompt.id.clone(),
            model: self.inner.model.model_id.clone(),
            tools: Vec::new(),
        })
        .await;
        let response = self
            .inner
            .llm
            .execute(prompt.clone(), &self.inner.model, &[])
            .await?;
        self.llm_call_completed(&prompt, std::slice::from_ref(&response))
            .await;
        Ok(response)
    }

    /// Classify `message` for harmful content.
    pub async fn moderate(&self, message: &ChatMessage) -> Result<ModerationResult> {
        let session_id = self.inner.session.read().await.id.clone();
        let mut prompt = Prompt::new(format!("{}-moderation", session_id));
        prompt.push(message.clone());
        let result = self.inner.llm.moderate(prompt, &self.inner.model).await?;
        self.emit(AgentEvent::ModerationCompleted {
            prompt_id: session_id,
            result: result.clone(),
        })
        .await;
        Ok(result)
    }

    async fn llm_call_starting(&self) -> (Prompt, Vec<ToolDefinition>) {
        let prompt = self.prompt().await;
        let tools = self.tools().definitions();
        debug!(
            run_id = %self.inner.run_id,
            prompt_id = %prompt.id,
            messages = prompt.len(),
            tools = tools.len(),
            "Requesting LLM"
        );
        self.emit(AgentEvent::LlmCallStarting {
            prompt_id: prompt.id.clone(),
            model: self.inner.model.model_id.clone(),
            tools: tools.iter().map(|t| t.name.clone()).collect(),
        })
        .await;
        (prompt, tools)
    }

    async fn llm_call_completed(&self, prompt: &Prompt, responses: &[ChatMessage]) {
        self.emit(AgentEvent::LlmCallCompleted {
            prompt_id: prompt.id.clone(),
            model: self.inner.model.model_id.clone(),
            responses: responses.len(),
            tool_calls: responses.iter().map(|r| r.tool_calls().len()).sum(),
        })
        .await;
    }

    // -- tools ------------------------------------------------------------

    pub async fn execute_tool(&self, call: ToolCall) -> ToolCallOutcome {
        self.inner
            .executor
            .execute(call, &self.inner.agent_id, &self.inner.run_id, self)
            .await
    }

    /// Run several calls, concurrently when `parallel` is set.
    /// Outcomes are returned in request order either way.
    pub async fn execute_tools(&self, calls: Vec<ToolCall>, parallel: bool) -> Vec<ToolCallOutcome> {
        if parallel {
            self.inner
                .executor
                .execute_parallel(
                    calls,
                    &self.inner.agent_id,
                    &self.inner.run_id,
                    Arc::new(self.clone()),
                )
                .await
        } else {
            self.inner
                .executor
                .execute_sequential(calls, &self.inner.agent_id, &self.inner.run_id, self)
                .await
        }
    }

    /// A context for a nested graph: same run identity and session, tools
    /// restricted to `tool_scope`, cancelled together with this one.
    pub fn scoped(&self, tool_scope: Option<&[String]>) -> AgentContext {
        let executor = match tool_scope {
            Some(names) => self
                .inner
                .executor
                .with_registry(Arc::new(self.tools().scoped(names))),
            None => self.inner.executor.clone(),
        };
        AgentContext {
            inner: Arc::new(ContextInner {
                agent_id: self.inner.agent_id.clone(),
                run_id: self.inner.run_id.clone(),
                strategy: self.inner.strategy.clone(),
                session: Arc::clone(&self.inner.session),
                llm: Arc::clone(&self.inner.llm),
                model: self.inner.model.clone(),
                config: self.inner.config.clone(),
                executor,
                pipeline: Arc::clone(&self.inner.pipeline),
                cancel: self.inner.cancel.child_token(),
                handoff: self.inner.handoff.clone(),
                nested: true,
            }),
        }
    }
}

impl ToolCallObserver for AgentContext {
    fn on_event(&self, event: AgentEvent) -> BoxFuture<'_, ()> {
        Box::pin(self.emit(event))
    }
}

/// Assembles an `AgentContext` for one run.
pub struct ContextBuilder {
    llm: Arc<dyn LlmClient>,
    agent_id: AgentId,
    run_id: RunId,
    strategy: String,
    model: ModelConfig,
    config: AgentConfig,
    tools: Arc<ToolRegistry>,
    tool_timeout_secs: u64,
    pipeline: Option<Arc<FeaturePipeline>>,
    cancel: CancellationToken,
    handoff: Option<Handoff>,
    prompt: Prompt,
}

impl ContextBuilder {
    fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            agent_id: AgentId::new(),
            run_id: RunId::new(),
            strategy: "default".to_string(),
            model: ModelConfig::default(),
            config: AgentConfig::default(),
            tools: Arc::new(ToolRegistry::new()),
            tool_timeout_secs: ToolsConfig::default().default_timeout_secs,
            pipeline: None,
            cancel: CancellationToken::new(),
            handoff: None,
            prompt: Prompt::new(uuid::Uuid::new_v4().to_string()),
        }
    }

    pub fn agent_id(mut self, id: AgentId) -> Self {
        self.agent_id = id;
        self
    }

    pub fn run_id(mut self, id: RunId) -> Self {
        self.run_id = id;
        self
    }

    pub fn strategy(mut self, name: impl Into<String>) -> Self {
        self.strategy = name.into();
        self
    }

    pub fn model(mut self, model: ModelConfig) -> Self {
        self.model = model;
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn tool_timeout_secs(mut self, secs: u64) -> Self {
        self.tool_timeout_secs = secs;
        self
    }

    pub fn pipeline(mut self, pipeline: Arc<FeaturePipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn handoff(mut self, handoff: Handoff) -> Self {
        self.handoff = Some(handoff);
        self
    }

    /// Initial session contents.
    pub fn prompt(mut self, prompt: Prompt) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn build(self) -> AgentContext {
        let pipeline = self
            .pipeline
            .unwrap_or_else(|| Arc::new(FeaturePipeline::empty()));
        let executor = ToolExecutor::new(self.tools, self.tool_timeout_secs)
            .with_rollback(Arc::clone(pipeline.rollback()));
        AgentContext {
            inner: Arc::new(ContextInner {
                agent_id: self.agent_id,
                run_id: self.run_id,
                strategy: self.strategy,
                session: Arc::new(RwLock::new(self.prompt)),
                llm: self.llm,
                model: self.model,
                config: self.config,
                executor,
                pipeline,
                cancel: self.cancel,
                handoff: self.handoff,
                nested: false,
            }),
        }
    }
}
