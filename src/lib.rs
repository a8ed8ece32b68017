//! strand: an agent execution graph engine.
//!
//! Agents are typed node graphs walked by an interpreter. LLM requests, tool
//! execution (single or fanned out), history compression, moderation and
//! nested subgraphs are node kinds; routing is first-match over typed edges.
//! Cross-cutting concerns such as tracing and checkpointing are features
//! that observe each run through the event pipeline.
//!
//! ```no_run
//! # async fn demo(llm: std::sync::Arc<dyn strand::LlmClient>) -> strand::Result<()> {
//! use strand::{configured_tool_loop, Agent, EngineConfig};
//!
//! let config = EngineConfig::load(std::path::Path::new("strand.toml"))?;
//! let graph = configured_tool_loop("assistant", &config.agent)?;
//! let agent = Agent::builder(graph, llm, config).build()?;
//! let answer = agent.run("What is 2+2?".to_string()).await?;
//! println!("{answer}");
//! # Ok(())
//! # }
//! ```

pub use strand_agent as agent;
pub use strand_core as core;
pub use strand_tools as tools;

pub use strand_agent::{
    configured_tool_loop, on_assistant_message, on_clean, on_harmful, on_moderation_failed, on_tool_call, on_tool_calls,
    on_tool_failure, on_tool_success, single_run, tool_loop, Agent, AgentBuilder, AgentContext, EventHandler,
    EventHandlerConfig, Feature, Graph, GraphBuilder, Handoff, HistoryCompression, InMemoryCheckpointStore, Interpreter, Moderated,
    NodeHandle, NodeKind, NodeValue, OutboundEvent, OutboundSink, Persistence, PersistenceFeatureConfig,
    PipelineBuilder, RequestContext, Route, RunOptions, TaskState, Trace, TraceFeatureConfig, FINISH_NODE_ID,
    START_NODE_ID,
};
pub use strand_core::config::EngineConfig;
pub use strand_core::error::{GraphError, Result, StrandError};
pub use strand_core::event::{AgentEvent, EventBus, EventEnvelope, EventKind};
pub use strand_core::keyed_mutex::{KeyedMutex, KeyedMutexGuard};
pub use strand_core::traits::{CheckpointStore, LlmClient, Tool};
pub use strand_core::Checkpoint;
pub use strand_tools::{RollbackRegistry, RollbackReport, ToolExecutor, ToolRegistry, TypedTool};
