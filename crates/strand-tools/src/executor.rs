use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use strand_core::error::StrandError;
use strand_core::event::AgentEvent;
use strand_core::types::{AgentId, RunId, ToolCall, ToolCallOutcome, ToolContext, ToolFailure};

use crate::registry::ToolRegistry;
use crate::rollback::RollbackRegistry;
use crate::schema;

/// Receives the tool lifecycle events of an executor.
///
/// Events are awaited in order: `ToolCallStarting` is delivered before the
/// tool runs and the terminal event after it returns.
pub trait ToolCallObserver: Send + Sync + 'static {
    fn on_event(&self, event: AgentEvent) -> BoxFuture<'_, ()>;
}

/// Observer that drops every event.
pub struct NoopObserver;

impl ToolCallObserver for NoopObserver {
    fn on_event(&self, _event: AgentEvent) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Runs tool calls against a registry and turns every outcome into data.
///
/// Nothing a tool does can fail the caller. Unknown tools, bad arguments,
/// tool errors, panics and timeouts all come back as a failed `ToolCallOutcome`.
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    rollback: Option<Arc<RollbackRegistry>>,
    default_timeout_secs: u64,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, default_timeout_secs: u64) -> Self {
        Self {
            registry,
            rollback: None,
            default_timeout_secs,
        }
    }

    /// Record successful calls in `rollback` so they can be compensated later.
    pub fn with_rollback(mut self, rollback: Arc<RollbackRegistry>) -> Self {
        self.rollback = Some(rollback);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn rollback(&self) -> Option<&Arc<RollbackRegistry>> {
        self.rollback.as_ref()
    }

    /// Same executor over a different set of tools.
    pub fn with_registry(&self, registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            rollback: self.rollback.clone(),
            default_timeout_secs: self.default_timeout_secs,
        }
    }

    /// Execute one call.
    pub async fn execute(
        &self,
        call: ToolCall,
        agent_id: &AgentId,
        run_id: &RunId,
        observer: &dyn ToolCallObserver,
    ) -> ToolCallOutcome {
        observer
            .on_event(AgentEvent::ToolCallStarting {
                call_id: call.id.clone(),
                tool: call.name.clone(),
                arguments: call.arguments.clone(),
            })
            .await;

        let start = Instant::now();
        let outcome = self.invoke(&call, agent_id, run_id).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match &outcome.failure {
            None => {
                info!(tool = %call.name, call_id = %call.id, elapsed_ms, "Tool call succeeded");
                if let Some(rollback) = &self.rollback {
                    rollback.record(run_id, &call.name, call.arguments.clone(), &outcome.content);
                }
                observer
                    .on_event(AgentEvent::ToolCallCompleted {
                        call_id: outcome.call_id.clone(),
                        tool: outcome.tool.clone(),
                        content: outcome.content.clone(),
                    })
                    .await;
            }
            Some(failure) => {
                warn!(tool = %call.name, call_id = %call.id, elapsed_ms, error = %failure, "Tool call failed");
                observer
                    .on_event(AgentEvent::ToolCallFailed {
                        call_id: outcome.call_id.clone(),
                        tool: outcome.tool.clone(),
                        failure: failure.clone(),
                    })
                    .await;
            }
        }

        outcome
    }

    /// Execute every call concurrently and wait for all of them.
    ///
    /// Results come back in request order regardless of completion order.
    /// A failing call never cancels its siblings.
    pub async fn execute_parallel(
        &self,
        calls: Vec<ToolCall>,
        agent_id: &AgentId,
        run_id: &RunId,
        observer: Arc<dyn ToolCallObserver>,
    ) -> Vec<ToolCallOutcome> {
        if calls.is_empty() {
            return Vec::new();
        }
        debug!(count = calls.len(), "Executing tool calls in parallel");

        let mut set = JoinSet::new();
        for (index, call) in calls.iter().cloned().enumerate() {
            let executor = self.clone();
            let observer = Arc::clone(&observer);
            let agent_id = agent_id.clone();
            let run_id = run_id.clone();
            set.spawn(async move {
                let outcome = executor
                    .execute(call, &agent_id, &run_id, observer.as_ref())
                    .await;
                (index, outcome)
            });
        }

        let mut slots: Vec<Option<ToolCallOutcome>> = vec![None; calls.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(e) => warn!(error = %e, "Tool task aborted"),
            }
        }

        slots
            .into_iter()
            .zip(calls.iter())
            .map(|(slot, call)| {
                slot.unwrap_or_else(|| {
                    ToolCallOutcome::failed(
                        call,
                        ToolFailure::ExecutionFailed {
                            message: "tool task aborted".into(),
                        },
                    )
                })
            })
            .collect()
    }

    /// Execute calls one after another, in order.
    pub async fn execute_sequential(
        &self,
        calls: Vec<ToolCall>,
        agent_id: &AgentId,
        run_id: &RunId,
        observer: &dyn ToolCallObserver,
    ) -> Vec<ToolCallOutcome> {
        let mut outcomes = Vec::with_capacity(calls.len());
        for call in calls {
            outcomes.push(self.execute(call, agent_id, run_id, observer).await);
        }
        outcomes
    }

    async fn invoke(&self, call: &ToolCall, agent_id: &AgentId, run_id: &RunId) -> ToolCallOutcome {
        let Some(tool) = self.registry.get(&call.name) else {
            return ToolCallOutcome::failed(call, ToolFailure::NotFound);
        };

        if let Err(message) = schema::validate_arguments(&tool.input_schema(), &call.arguments) {
            return ToolCallOutcome::failed(call, ToolFailure::InvalidArguments { message });
        }

        let timeout_secs = tool.timeout_secs().unwrap_or(self.default_timeout_secs);
        let ctx = ToolContext::new(agent_id.clone(), run_id.clone(), call.id.clone());

        let arguments = call.arguments.clone();
        let guarded = AssertUnwindSafe(async move { tool.execute(arguments, ctx).await }).catch_unwind();

        match tokio::time::timeout(Duration::from_secs(timeout_secs), guarded).await {
            Ok(Err(_)) => ToolCallOutcome::failed(
                call,
                ToolFailure::ExecutionFailed {
                    message: "tool panicked".into(),
                },
            ),
            Ok(Ok(Ok(result))) if !result.is_error => ToolCallOutcome::success(call, result.content),
            Ok(Ok(Ok(result))) => ToolCallOutcome::failed(
                call,
                ToolFailure::ExecutionFailed {
                    message: result.content,
                },
            ),
            Ok(Ok(Err(StrandError::InvalidToolArguments { message, .. }))) => {
                ToolCallOutcome::failed(call, ToolFailure::InvalidArguments { message })
            }
            Ok(Ok(Err(e))) => ToolCallOutcome::failed(
                call,
                ToolFailure::ExecutionFailed {
                    message: e.to_string(),
                },
            ),
            Err(_) => ToolCallOutcome::failed(call, ToolFailure::TimedOut { timeout_secs }),
        }
    }
}
