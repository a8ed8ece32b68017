use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use strand_core::checkpoint::Checkpoint;
use strand_core::config::EngineConfig;
use strand_core::error::{Result, StrandError};
use strand_core::event::{AgentEvent, EventBus};
use strand_core::keyed_mutex::KeyedMutex;
use strand_core::traits::{CheckpointStore, LlmClient, Tool};
use strand_core::types::{AgentId, ChatMessage, Prompt, RunId};
use strand_tools::{RollbackRegistry, RollbackReport, ToolRegistry};

use crate::context::AgentContext;
use crate::feature::{
    Feature, FeaturePipeline, Persistence, PersistenceFeatureConfig, PipelineBuilder, Trace, TraceFeatureConfig,
};
use crate::graph::{Graph, Interpreter, NodeValue};
use crate::handoff::{Handoff, OutboundSink, RequestContext, TaskState};

/// Per-run options for `Agent::run_with`.
#[derive(Default, Clone)]
pub struct RunOptions {
    run_id: Option<RunId>,
    session_key: Option<String>,
    cancel: Option<CancellationToken>,
    handoff: Option<Handoff>,
}

impl RunOptions {
    pub fn run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Runs sharing a session key never overlap.
    pub fn session_key(mut self, key: impl Into<String>) -> Self {
        self.session_key = Some(key.into());
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn handoff(mut self, handoff: Handoff) -> Self {
        self.handoff = Some(handoff);
        self
    }
}

enum Entry<I> {
    Input(I),
    Checkpoint(Checkpoint),
}

/// A graph bound to a model, tools and installed features.
///
/// Every run gets a fresh `AgentContext`; tools, features and the rollback
/// log are shared across runs.
pub struct Agent<I, O> {
    id: AgentId,
    config: EngineConfig,
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    graph: Graph<I, O>,
    pipeline: Arc<FeaturePipeline>,
    event_bus: Option<Arc<EventBus>>,
    session_locks: Arc<KeyedMutex<String>>,
}

impl<I: NodeValue, O: NodeValue> Agent<I, O> {
    pub fn builder(graph: Graph<I, O>, llm: Arc<dyn LlmClient>, config: EngineConfig) -> AgentBuilder<I, O> {
        AgentBuilder::new(graph, llm, config)
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn graph(&self) -> &Graph<I, O> {
        &self.graph
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn pipeline(&self) -> &Arc<FeaturePipeline> {
        &self.pipeline
    }

    /// Bus the trace feature broadcasts on, if tracing is configured.
    pub fn event_bus(&self) -> Option<&Arc<EventBus>> {
        self.event_bus.as_ref()
    }

    pub fn rollback(&self) -> &Arc<RollbackRegistry> {
        self.pipeline.rollback()
    }

    pub fn session_locks(&self) -> &Arc<KeyedMutex<String>> {
        &self.session_locks
    }

    /// The installed instance of `F`.
    pub fn feature<F: Feature>(&self) -> Result<Arc<F>> {
        self.pipeline.feature::<F>()
    }

    pub async fn run(&self, input: I) -> Result<O> {
        self.run_with(input, RunOptions::default()).await
    }

    pub async fn run_with(&self, input: I, options: RunOptions) -> Result<O> {
        self.execute(Entry::Input(input), options).await
    }

    /// Continue the checkpoint's run from the node it was taken before.
    pub async fn resume(&self, checkpoint: Checkpoint, options: RunOptions) -> Result<O> {
        let options = RunOptions {
            run_id: Some(checkpoint.run_id.clone()),
            ..options
        };
        self.execute(Entry::Checkpoint(checkpoint), options).await
    }

    /// Most recent checkpoint saved for `run_id`. Requires `Persistence`.
    pub async fn latest_checkpoint(&self, run_id: &RunId) -> Result<Option<Checkpoint>> {
        self.feature::<Persistence>()?.latest(run_id).await
    }

    /// Compensate the tool calls the checkpoint's run made after it.
    pub async fn rollback_to(&self, checkpoint: &Checkpoint) -> RollbackReport {
        let report = self
            .rollback()
            .rollback_run_to(&checkpoint.run_id, checkpoint.rollback_seq, &self.tools)
            .await;
        if !report.is_clean() {
            warn!(
                run_id = %checkpoint.run_id,
                failed = report.failures.len(),
                "Rollback finished with failures"
            );
        }
        report
    }

    fn context(&self, run_id: RunId, options: &RunOptions) -> AgentContext {
        let mut prompt = Prompt::new(run_id.as_str());
        if let Some(system) = &self.config.agent.system_prompt {
            prompt = prompt.with_system(system.as_str());
        }
        let mut builder = AgentContext::builder(Arc::clone(&self.llm))
            .agent_id(self.id.clone())
            .run_id(run_id)
            .strategy(self.graph.name())
            .model(self.config.model.clone())
            .config(self.config.agent.clone())
            .tools(Arc::clone(&self.tools))
            .tool_timeout_secs(self.config.tools.default_timeout_secs)
            .pipeline(Arc::clone(&self.pipeline))
            .prompt(prompt);
        if let Some(token) = &options.cancel {
            builder = builder.cancel(token.clone());
        }
        if let Some(handoff) = &options.handoff {
            builder = builder.handoff(handoff.clone());
        }
        builder.build()
    }

    async fn execute(&self, entry: Entry<I>, options: RunOptions) -> Result<O> {
        let _session = match &options.session_key {
            Some(key) => Some(self.session_locks.lock(key.clone()).await),
            None => None,
        };

        let run_id = options.run_id.clone().unwrap_or_default();
        let ctx = self.context(run_id, &options);
        let input = match &entry {
            Entry::Input(input) => serde_json::to_value(input).unwrap_or_default(),
            Entry::Checkpoint(checkpoint) => checkpoint.input.clone(),
        };

        let start = Instant::now();
        info!(agent_id = %self.id, run_id = %ctx.run_id(), graph = %self.graph.name(), "Agent run starting");

        let result = self
            .pipeline
            .scoped(async {
                ctx.emit(AgentEvent::AgentStarting { input }).await;
                let interpreter = Interpreter::new(ctx.clone());
                let result = match entry {
                    Entry::Input(input) => interpreter.run(&self.graph, input).await,
                    Entry::Checkpoint(checkpoint) => interpreter.resume(&self.graph, &checkpoint).await,
                };
                if let Ok(output) = &result {
                    ctx.emit(AgentEvent::AgentCompleted {
                        result: serde_json::to_value(output).unwrap_or_default(),
                    })
                    .await;
                }
                result
            })
            .await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => info!(run_id = %ctx.run_id(), elapsed_ms, "Agent run complete"),
            Err(e) => warn!(run_id = %ctx.run_id(), elapsed_ms, error = %e, "Agent run failed"),
        }
        result
    }
}

impl Agent<String, String> {
    /// Serve one protocol request: the request text is the run input and
    /// task status is reported through `sink`.
    ///
    /// Requests in the same protocol context run one at a time.
    pub async fn serve(&self, request: RequestContext, sink: OutboundSink, options: RunOptions) -> Result<String> {
        let text = request.message.text();
        let options = RunOptions {
            session_key: options.session_key.or_else(|| Some(request.context_id.clone())),
            handoff: Some(Handoff::new(request, sink.clone())),
            ..options
        };

        sink.update_status(TaskState::Submitted, None).await?;
        sink.update_status(TaskState::Working, None).await?;

        match self.run_with(text, options).await {
            Ok(answer) => {
                sink.complete(ChatMessage::assistant_text(answer.as_str())).await?;
                Ok(answer)
            }
            Err(e) => {
                let reported = match &e {
                    StrandError::Cancelled => sink.update_status(TaskState::Canceled, None).await,
                    other => sink.fail(other.to_string()).await,
                };
                if let Err(send_error) = reported {
                    warn!(error = %send_error, "Could not report task failure");
                }
                Err(e)
            }
        }
    }
}

/// Assembles an `Agent`.
pub struct AgentBuilder<I, O> {
    id: AgentId,
    config: EngineConfig,
    llm: Arc<dyn LlmClient>,
    graph: Graph<I, O>,
    tools: ToolRegistry,
    pipeline: PipelineBuilder,
    event_bus: Option<Arc<EventBus>>,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    session_locks: Option<Arc<KeyedMutex<String>>>,
}

impl<I: NodeValue, O: NodeValue> AgentBuilder<I, O> {
    fn new(graph: Graph<I, O>, llm: Arc<dyn LlmClient>, config: EngineConfig) -> Self {
        Self {
            id: AgentId::new(),
            config,
            llm,
            graph,
            tools: ToolRegistry::new(),
            pipeline: PipelineBuilder::new(),
            event_bus: None,
            checkpoint_store: None,
            session_locks: None,
        }
    }

    pub fn id(mut self, id: AgentId) -> Self {
        self.id = id;
        self
    }

    pub fn tool(mut self, tool: impl Tool) -> Self {
        self.tools.register(tool);
        self
    }

    pub fn tool_arc(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.register_arc(tool);
        self
    }

    /// Replace the whole registry.
    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Pair a side-effecting tool with the tool that undoes it.
    pub fn compensate(self, forward: impl Into<String>, compensator: impl Into<String>) -> Result<Self> {
        self.pipeline.rollback().register(forward, compensator)?;
        Ok(self)
    }

    pub fn install<F: Feature>(mut self, config: F::Config) -> Result<Self> {
        self.pipeline.install::<F>(config)?;
        Ok(self)
    }

    /// Bus the trace feature publishes to when `[trace]` is enabled.
    /// Without one, `build` creates a bus of `agent.event_bus_capacity`.
    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Install `Persistence` over `store` using the `[persistence]` settings.
    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    /// Share session locks with other agents.
    pub fn session_locks(mut self, locks: Arc<KeyedMutex<String>>) -> Self {
        self.session_locks = Some(locks);
        self
    }

    pub fn build(mut self) -> Result<Agent<I, O>> {
        if self.config.trace.enabled && !self.pipeline.is_installed(Trace::KEY) {
            let capacity = self.config.agent.event_bus_capacity;
            let bus = self
                .event_bus
                .get_or_insert_with(|| Arc::new(EventBus::new(capacity)))
                .clone();
            let trace = TraceFeatureConfig::from_settings(&self.config.trace, Some(bus));
            self.pipeline.install::<Trace>(trace)?;
        }
        if let Some(store) = self.checkpoint_store.take() {
            if self.pipeline.is_installed(Persistence::KEY) {
                return Err(StrandError::Config(
                    "a checkpoint store was given but Persistence is already installed".into(),
                ));
            }
            let persistence = PersistenceFeatureConfig::from_settings(&self.config.persistence, Some(store));
            self.pipeline.install::<Persistence>(persistence)?;
        }

        let pipeline = self.pipeline.build();
        info!(
            agent_id = %self.id,
            graph = %self.graph.name(),
            tools = self.tools.len(),
            features = ?pipeline.installed(),
            "Agent built"
        );

        Ok(Agent {
            id: self.id,
            config: self.config,
            llm: self.llm,
            tools: Arc::new(self.tools),
            graph: self.graph,
            pipeline: Arc::new(pipeline),
            event_bus: self.event_bus,
            session_locks: self
                .session_locks
                .unwrap_or_else(|| Arc::new(KeyedMutex::new())),
        })
    }
}
