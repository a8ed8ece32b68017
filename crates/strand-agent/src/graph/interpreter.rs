use std::any::type_name;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures::FutureExt;
use tracing::{debug, error, info};

use strand_core::checkpoint::Checkpoint;
use strand_core::error::{Result, StrandError};
use strand_core::event::AgentEvent;

use super::builder::{Graph, GraphData, FINISH_NODE_ID, START_NODE_ID};
use super::node::{AnyValue, NodeKind, NodeValue};
use crate::context::AgentContext;

/// A run that stopped before reaching the finish node.
pub(crate) struct StepFailure {
    pub(crate) node_id: String,
    pub(crate) error: StrandError,
}

impl StepFailure {
    fn at(node_id: &str, error: StrandError) -> Self {
        Self {
            node_id: node_id.to_string(),
            error,
        }
    }
}

/// Walks a graph from its start sentinel to its finish sentinel.
///
/// Exactly one node of a run executes at a time. Each node is raced against
/// the run's cancellation token, and the first outgoing edge whose route
/// matches the node's output decides where the run goes next.
pub struct Interpreter {
    ctx: AgentContext,
}

impl Interpreter {
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &AgentContext {
        &self.ctx
    }

    /// Run `graph` on `input` and return the value delivered to finish.
    pub async fn run<I: NodeValue, O: NodeValue>(&self, graph: &Graph<I, O>, input: I) -> Result<O> {
        self.ctx
            .emit(AgentEvent::StrategyStarting {
                strategy: graph.name().to_string(),
            })
            .await;
        let result = run_from(graph.data(), &self.ctx, START_NODE_ID, Box::new(input)).await;
        self.conclude(graph, result).await
    }

    /// Continue a run from a checkpoint: the session is restored and the
    /// checkpoint's node runs next with its recorded input.
    pub async fn resume<I: NodeValue, O: NodeValue>(
        &self,
        graph: &Graph<I, O>,
        checkpoint: &Checkpoint,
    ) -> Result<O> {
        let node = graph.data().node(&checkpoint.node_id).map_err(|_| {
            StrandError::Checkpoint(format!(
                "node '{}' does not exist in graph '{}'",
                checkpoint.node_id,
                graph.name()
            ))
        })?;
        let input = node.decode_input(checkpoint.input.clone())?;
        self.ctx.restore(checkpoint).await;

        info!(
            run_id = %self.ctx.run_id(),
            checkpoint_id = %checkpoint.checkpoint_id,
            node_id = %checkpoint.node_id,
            "Resuming from checkpoint"
        );
        self.ctx
            .emit(AgentEvent::StrategyStarting {
                strategy: graph.name().to_string(),
            })
            .await;
        let result = run_from(graph.data(), &self.ctx, &checkpoint.node_id, input).await;
        self.conclude(graph, result).await
    }

    async fn conclude<I, O: NodeValue>(
        &self,
        graph: &Graph<I, O>,
        result: std::result::Result<AnyValue, StepFailure>,
    ) -> Result<O> {
        let result = result.and_then(|value| {
            value.downcast::<O>().map(|v| *v).map_err(|_| {
                StepFailure::at(
                    FINISH_NODE_ID,
                    StrandError::TypeMismatch {
                        node_id: FINISH_NODE_ID.to_string(),
                        expected: type_name::<O>(),
                    },
                )
            })
        });

        match result {
            Ok(output) => {
                self.ctx
                    .emit(AgentEvent::StrategyCompleted {
                        strategy: graph.name().to_string(),
                        result: serde_json::to_value(&output).unwrap_or_default(),
                    })
                    .await;
                Ok(output)
            }
            Err(StepFailure { node_id, error }) => {
                error!(
                    run_id = %self.ctx.run_id(),
                    graph = %graph.name(),
                    node_id = %node_id,
                    error = %error,
                    "Run failed"
                );
                self.ctx
                    .emit(AgentEvent::AgentExecutionFailed {
                        error: format!("node '{}': {}", node_id, error),
                    })
                    .await;
                Err(error)
            }
        }
    }
}

/// Execute `data` starting at `entry` until the finish node receives a value.
pub(crate) async fn run_from(
    data: &GraphData,
    ctx: &AgentContext,
    entry: &str,
    input: AnyValue,
) -> std::result::Result<AnyValue, StepFailure> {
    let max_iterations = ctx.config().max_iterations;
    let mut current = entry.to_string();
    let mut value = input;
    let mut steps = 0usize;

    loop {
        let node = data
            .node(&current)
            .map_err(|e| StepFailure::at(&current, e))?;
        if *node.kind() == NodeKind::Finish {
            debug!(graph = %data.name(), steps, "Reached finish");
            return Ok(value);
        }

        if ctx.is_cancelled() {
            return Err(StepFailure::at(&current, StrandError::Cancelled));
        }
        steps += 1;
        if steps > max_iterations {
            return Err(StepFailure::at(
                &current,
                StrandError::MaxIterationsExceeded(max_iterations),
            ));
        }

        ctx.emit(AgentEvent::NodeExecutionStarting {
            node_id: current.clone(),
            input: node.encode_input(&value),
        })
        .await;
        debug!(graph = %data.name(), node_id = %current, kind = node.kind().name(), "Executing node");

        let started = Instant::now();
        let operation = AssertUnwindSafe(async { node.execute(value, ctx.clone()).await }).catch_unwind();
        let output = tokio::select! {
            biased;
            _ = ctx.cancel_token().cancelled() => Err(StrandError::Cancelled),
            result = operation => result.unwrap_or_else(|_| {
                Err(StrandError::NodeExecution {
                    node_id: current.clone(),
                    message: "node panicked".into(),
                })
            }),
        }
        .map_err(|e| StepFailure::at(&current, e))?;

        ctx.emit(AgentEvent::NodeExecutionCompleted {
            node_id: current.clone(),
            output: node.encode_output(&output),
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
        .await;

        let mut next = None;
        for edge in data.outgoing(&current) {
            let forwarded = std::panic::catch_unwind(AssertUnwindSafe(|| edge.forward(&output)))
                .unwrap_or_else(|_| {
                    Some(Err(StrandError::NodeExecution {
                        node_id: current.clone(),
                        message: format!("edge to '{}' panicked", edge.to()),
                    }))
                });
            match forwarded {
                Some(Ok(forwarded)) => {
                    debug!(from = %current, to = %edge.to(), label = edge.label().unwrap_or(""), "Edge taken");
                    next = Some((edge.to().to_string(), forwarded));
                    break;
                }
                Some(Err(e)) => return Err(StepFailure::at(&current, e)),
                None => {}
            }
        }

        match next {
            Some((to, forwarded)) => {
                current = to;
                value = forwarded;
            }
            None => {
                return Err(StepFailure::at(
                    &current,
                    StrandError::NoMatchingEdge {
                        node_id: current.clone(),
                    },
                ))
            }
        }
    }
}
