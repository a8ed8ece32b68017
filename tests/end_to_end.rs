use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use strand::core::types::{ToolCall, ToolCallOutcome, ToolFailure};
use strand::{
    on_assistant_message, on_tool_call, tool_loop, Agent, AgentEvent, EventHandler, EventHandlerConfig, EventKind,
    GraphBuilder, Route, RunOptions, StrandError, ToolRegistry,
};
use strand_test_utils::{engine_config, CalculatorTool, EventRecorder, FailingTool, MockLlmClient, SlowTool};
use tokio_util::sync::CancellationToken;

fn recording(recorder: &EventRecorder) -> EventHandlerConfig {
    let recorder = recorder.clone();
    EventHandlerConfig::default().on_any(move |envelope| recorder.record(envelope.clone()))
}

/// start -> ask -> calculate -> answer -> finish
fn calculator_graph() -> strand::Graph<String, String> {
    let mut builder = GraphBuilder::new("calculator");
    let start = builder.start();
    let finish = builder.finish();
    let ask = builder.llm_request("ask");
    let calculate = builder.execute_tool("calculate");
    let answer = builder.llm_send_tool_result("answer");

    builder.forward(&start, &ask);
    builder.edge(&ask, &calculate, on_tool_call());
    builder.edge(&ask, &finish, on_assistant_message());
    builder.forward(&calculate, &answer);
    builder.edge(&answer, &finish, on_assistant_message());
    builder.build().unwrap()
}

#[tokio::test]
async fn test_two_plus_two() {
    let llm = MockLlmClient::new()
        .reply_tool_call("call-1", "calculator", json!({"expression": "2+2"}))
        .reply_text("4");
    let recorder = EventRecorder::default();
    let agent = Agent::builder(calculator_graph(), Arc::new(llm.clone()), engine_config())
        .tool(CalculatorTool)
        .install::<EventHandler>(recording(&recorder))
        .unwrap()
        .build()
        .unwrap();

    let answer = agent.run("2+2".into()).await.unwrap();
    assert_eq!(answer.parse::<i64>().unwrap(), 4);

    assert_eq!(recorder.count(EventKind::LlmCallStarting), 2);
    assert_eq!(recorder.count(EventKind::ToolCallStarting), 1);
    assert_eq!(recorder.count(EventKind::ToolCallCompleted), 1);
    assert_eq!(recorder.started_nodes(), vec!["__start__", "ask", "calculate", "answer"]);

    let tool_result = recorder.events().into_iter().find_map(|event| match event {
        AgentEvent::ToolCallCompleted { content, .. } => Some(content),
        _ => None,
    });
    assert_eq!(tool_result.as_deref(), Some("4"));

    // The second model call saw the tool result.
    let second = &llm.prompts()[1];
    assert_eq!(second.messages.len(), 3);
    assert!(second.messages[2].content.iter().any(|block| matches!(
        block,
        strand::core::types::ContentBlock::ToolResult { content, .. } if content == "4"
    )));

    let kinds = recorder.kinds();
    assert_eq!(kinds.first(), Some(&EventKind::AgentStarting));
    assert_eq!(kinds.last(), Some(&EventKind::AgentCompleted));
}

#[tokio::test(start_paused = true)]
async fn test_parallel_tools_join_all_outcomes() {
    let mut builder = GraphBuilder::<Vec<ToolCall>, Vec<ToolCallOutcome>>::new("fan_out");
    let start = builder.start();
    let finish = builder.finish();
    let tools = builder.execute_tools("tools", true);
    builder.forward(&start, &tools);
    builder.forward(&tools, &finish);
    let graph = builder.build().unwrap();

    let registry = ToolRegistry::new()
        .with(SlowTool::new("slow", Duration::from_secs(3)))
        .with(SlowTool::new("quick", Duration::from_millis(10)))
        .with(FailingTool::new("broken"));
    let agent = Agent::builder(graph, Arc::new(MockLlmClient::new()), engine_config())
        .tools(registry)
        .build()
        .unwrap();

    let calls = vec![
        ToolCall::new("a", "slow", json!({})),
        ToolCall::new("b", "broken", json!({})),
        ToolCall::new("c", "quick", json!({})),
    ];
    let started = tokio::time::Instant::now();
    let outcomes = agent.run(calls).await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(outcomes.len(), 3);
    let ids: Vec<&str> = outcomes.iter().map(|o| o.call_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert_eq!(outcomes.iter().filter(|o| o.is_success()).count(), 2);
    assert!(matches!(outcomes[1].failure, Some(ToolFailure::ExecutionFailed { .. })));
    assert_eq!(outcomes[0].content, "slow done");
}

#[tokio::test(start_paused = true)]
async fn test_cancel_interrupts_parallel_tools() {
    let mut builder = GraphBuilder::<Vec<ToolCall>, Vec<ToolCallOutcome>>::new("fan_out");
    let start = builder.start();
    let finish = builder.finish();
    let tools = builder.execute_tools("tools", true);
    builder.forward(&start, &tools);
    builder.forward(&tools, &finish);
    let graph = builder.build().unwrap();

    let recorder = EventRecorder::default();
    let registry = ToolRegistry::new()
        .with(SlowTool::new("crawl", Duration::from_secs(60)))
        .with(SlowTool::new("index", Duration::from_secs(60)));
    let agent = Agent::builder(graph, Arc::new(MockLlmClient::new()), engine_config())
        .tools(registry)
        .install::<EventHandler>(recording(&recorder))
        .unwrap()
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let calls = vec![
        ToolCall::new("a", "crawl", json!({})),
        ToolCall::new("b", "index", json!({})),
    ];
    let started = tokio::time::Instant::now();
    let err = agent
        .run_with(calls, RunOptions::default().cancel(cancel))
        .await
        .unwrap_err();

    assert!(matches!(err, StrandError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(recorder.count(EventKind::ToolCallStarting), 2);
    assert_eq!(recorder.count(EventKind::ToolCallCompleted), 0);
    assert_eq!(recorder.count(EventKind::AgentCompleted), 0);
}

#[tokio::test]
async fn test_panicking_node_reports_failure_once() {
    let mut builder = GraphBuilder::<String, String>::new("fragile");
    let start = builder.start();
    let finish = builder.finish();
    let parse = builder.transform("parse", |text: String| -> String {
        if text.is_empty() {
            panic!("empty input");
        }
        text
    });
    builder.forward(&start, &parse);
    builder.forward(&parse, &finish);

    let recorder = EventRecorder::default();
    let agent = Agent::builder(builder.build().unwrap(), Arc::new(MockLlmClient::new()), engine_config())
        .install::<EventHandler>(recording(&recorder))
        .unwrap()
        .build()
        .unwrap();

    let err = agent.run(String::new()).await.unwrap_err();
    assert!(matches!(err, StrandError::NodeExecution { ref node_id, .. } if node_id == "parse"));
    assert_eq!(recorder.count(EventKind::AgentExecutionFailed), 1);
    assert_eq!(recorder.count(EventKind::AgentCompleted), 0);

    // The agent stays usable after a panicking run.
    assert_eq!(agent.run("ok".into()).await.unwrap(), "ok");
}

#[tokio::test]
async fn test_tool_failure_is_routed_back_to_model() {
    let llm = MockLlmClient::new()
        .reply_tool_call("c1", "broken", json!({}))
        .reply_text("the tool is broken");
    let agent = Agent::builder(tool_loop("react", false).unwrap(), Arc::new(llm.clone()), engine_config())
        .tool(FailingTool::new("broken"))
        .build()
        .unwrap();

    assert_eq!(agent.run("try it".into()).await.unwrap(), "the tool is broken");
    let last_prompt = llm.prompts().pop().unwrap();
    assert!(last_prompt.messages.iter().any(|m| m.content.iter().any(|block| matches!(
        block,
        strand::core::types::ContentBlock::ToolResult { is_error: true, .. }
    ))));
}

#[tokio::test]
async fn test_runaway_loop_hits_iteration_limit() {
    let llm = MockLlmClient::new().with_fallback_text("unused");
    let mut config = engine_config();
    config.agent.max_iterations = 5;

    let mut builder = GraphBuilder::<u32, u32>::new("spin");
    let start = builder.start();
    let finish = builder.finish();
    let step = builder.transform("step", |n: u32| n + 1);
    builder.forward(&start, &step);
    builder.edge(&step, &finish, Route::when(|n: &u32| *n > 1_000));
    builder.forward(&step, &step);
    let graph = builder.build().unwrap();

    let recorder = EventRecorder::default();
    let agent = Agent::builder(graph, Arc::new(llm), config)
        .install::<EventHandler>(recording(&recorder))
        .unwrap()
        .build()
        .unwrap();

    let err = agent.run(0).await.unwrap_err();
    assert!(matches!(err, strand::StrandError::MaxIterationsExceeded(5)));
    assert!(err.is_configuration());
    assert_eq!(recorder.count(EventKind::AgentExecutionFailed), 1);
}

#[tokio::test]
async fn test_subgraph_inside_tool_loop() {
    // The outer graph delegates arithmetic to a nested tool loop that can
    // only see the calculator.
    let mut builder = GraphBuilder::<String, String>::new("delegate");
    let start = builder.start();
    let finish = builder.finish();
    let math = builder.subgraph("math", tool_loop("math", true).unwrap(), Some(vec!["calculator".into()]));
    let report = builder.transform("report", |answer: String| format!("math says {}", answer));
    builder.forward(&start, &math);
    builder.forward(&math, &report);
    builder.forward(&report, &finish);
    let graph = builder.build().unwrap();

    let llm = MockLlmClient::new()
        .reply_tool_call("c1", "calculator", json!({"expression": "6*7"}))
        .reply_text("42");
    let recorder = EventRecorder::default();
    let agent = Agent::builder(graph, Arc::new(llm), engine_config())
        .tool(CalculatorTool)
        .install::<EventHandler>(recording(&recorder))
        .unwrap()
        .build()
        .unwrap();

    assert_eq!(agent.run("what is 6*7".into()).await.unwrap(), "math says 42");
    assert_eq!(
        recorder.started_nodes(),
        vec!["__start__", "math", "__start__", "llm", "tools", "send_results", "report"]
    );
    assert_eq!(recorder.count(EventKind::StrategyStarting), 1);
}
