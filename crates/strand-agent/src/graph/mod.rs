//! Graph execution engine.
//!
//! A graph is an arena of typed nodes connected by routed edges. The
//! interpreter walks it from the start sentinel to the finish sentinel,
//! taking the first outgoing edge whose route matches each node's output.
//! Backward edges are plain node ids, so tool loops are ordinary cycles.

mod builder;
mod edge;
mod interpreter;
mod node;
mod nodes;
mod strategies;

pub use builder::{
    EdgeDescription, Graph, GraphBuilder, GraphDescription, NodeDescription, NodeHandle, FINISH_NODE_ID,
    START_NODE_ID,
};
pub use edge::{
    on_assistant_message, on_clean, on_harmful, on_moderation_failed, on_tool_call, on_tool_calls,
    on_tool_failure, on_tool_success, Edge, Route,
};
pub use interpreter::Interpreter;
pub use node::{Node, NodeKind, NodeValue};
pub use nodes::Moderated;
pub use strategies::{configured_tool_loop, single_run, tool_loop};
