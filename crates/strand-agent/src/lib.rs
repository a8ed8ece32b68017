//! Agent runtime: typed execution graphs, the interpreter that walks them,
//! and the feature pipeline that observes each run.

pub mod agent;
pub mod checkpoint;
pub mod compression;
pub mod context;
pub mod feature;
pub mod graph;
pub mod handoff;

pub use agent::{Agent, AgentBuilder, RunOptions};
pub use checkpoint::InMemoryCheckpointStore;
pub use compression::HistoryCompression;
pub use context::{AgentContext, ContextBuilder};
pub use feature::{
    EventHandler, EventHandlerConfig, Feature, FeatureMessage, FeaturePipeline, MessageProcessor, Persistence,
    PersistenceFeatureConfig, PipelineBuilder, ProcessorHandle, Trace, TraceFeatureConfig,
};
pub use graph::{
    configured_tool_loop, on_assistant_message, on_clean, on_harmful, on_moderation_failed, on_tool_call, on_tool_calls,
    on_tool_failure, on_tool_success, single_run, tool_loop, Graph, GraphBuilder, Interpreter, Moderated, NodeHandle,
    NodeKind, NodeValue, Route, FINISH_NODE_ID, START_NODE_ID,
};
pub use handoff::{Handoff, OutboundEvent, OutboundSink, RequestContext, TaskState};
