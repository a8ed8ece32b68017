//! Prebuilt graphs for the common agent shapes.

use strand_core::config::AgentConfig;
use strand_core::error::GraphError;

use super::builder::{Graph, GraphBuilder};
use super::edge::{on_assistant_message, on_tool_calls};

/// One model call, no tools: the input is the user message, the output is
/// the assistant's text.
pub fn single_run(name: impl Into<String>) -> Result<Graph<String, String>, GraphError> {
    let mut builder = GraphBuilder::new(name);
    let start = builder.start();
    let finish = builder.finish();
    let llm = builder.llm_request("llm");

    builder.forward(&start, &llm);
    builder.edge(&llm, &finish, on_assistant_message());
    builder.build()
}

/// The tool-calling loop.
///
/// ```text
/// start -> llm --tool calls--> tools -> send_results --tool calls--> tools
///           \                                 \
///            `--assistant text--> finish <-----`--assistant text
/// ```
///
/// Tool outcomes go back to the model until it answers without requesting
/// tools. `parallel` dispatches all calls of one response together.
pub fn tool_loop(name: impl Into<String>, parallel: bool) -> Result<Graph<String, String>, GraphError> {
    let mut builder = GraphBuilder::new(name);
    let start = builder.start();
    let finish = builder.finish();
    let llm = builder.llm_request("llm");
    let tools = builder.execute_tools("tools", parallel);
    let send_results = builder.llm_send_tool_results("send_results");

    builder.forward(&start, &llm);
    builder.edge(&llm, &tools, on_tool_calls());
    builder.edge(&llm, &finish, on_assistant_message());
    builder.forward(&tools, &send_results);
    builder.edge(&send_results, &tools, on_tool_calls());
    builder.edge(&send_results, &finish, on_assistant_message());
    builder.build()
}

/// `tool_loop` dispatching tool calls as `[agent] parallel_tools` says.
pub fn configured_tool_loop(name: impl Into<String>, config: &AgentConfig) -> Result<Graph<String, String>, GraphError> {
    tool_loop(name, config.parallel_tools)
}
