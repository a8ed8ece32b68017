//! Compensating actions for side-effecting tools.
//!
//! Each forward tool may have exactly one compensating tool. Successful
//! forward calls are appended to a log with increasing sequence numbers;
//! rolling back to a sequence point replays the newer part of the log in
//! reverse, handing each compensator the original arguments and result.
//! A second registration for the same forward tool is rejected.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use strand_core::error::{RollbackError, StrandError};
use strand_core::types::{AgentId, RunId, ToolContext};

use crate::registry::ToolRegistry;

/// Timeout for compensators that do not declare their own.
const COMPENSATOR_TIMEOUT_SECS: u64 = 30;

/// Pairing of a forward tool with the tool that undoes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackEntry {
    pub forward: String,
    pub compensator: String,
}

/// One successful forward call, as recorded in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedCall {
    pub seq: u64,
    pub run_id: RunId,
    pub tool: String,
    pub arguments: serde_json::Value,
    pub result: String,
}

/// What a rollback did, entry by entry.
#[derive(Debug, Default)]
pub struct RollbackReport {
    /// Sequence numbers whose compensator succeeded, in the order run.
    pub compensated: Vec<u64>,
    /// Sequence numbers with no registered compensator.
    pub skipped: Vec<u64>,
    pub failures: Vec<RollbackError>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Default)]
struct RollbackState {
    compensators: HashMap<String, String>,
    log: Vec<AppliedCall>,
    last_seq: u64,
}

/// Shared across runs; every method takes `&self`.
#[derive(Default)]
pub struct RollbackRegistry {
    state: Mutex<RollbackState>,
}

impl RollbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pair `forward` with `compensator`.
    pub fn register(
        &self,
        forward: impl Into<String>,
        compensator: impl Into<String>,
    ) -> Result<(), RollbackError> {
        let forward = forward.into();
        let mut state = self.state();
        if state.compensators.contains_key(&forward) {
            return Err(RollbackError::DuplicateCompensator(forward));
        }
        state.compensators.insert(forward, compensator.into());
        Ok(())
    }

    pub fn compensator_for(&self, tool: &str) -> Option<String> {
        self.state().compensators.get(tool).cloned()
    }

    pub fn entries(&self) -> Vec<RollbackEntry> {
        let mut entries: Vec<RollbackEntry> = self
            .state()
            .compensators
            .iter()
            .map(|(forward, compensator)| RollbackEntry {
                forward: forward.clone(),
                compensator: compensator.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.forward.cmp(&b.forward));
        entries
    }

    /// Append a successful forward call and return its sequence number.
    pub fn record(
        &self,
        run_id: &RunId,
        tool: &str,
        arguments: serde_json::Value,
        result: impl Into<String>,
    ) -> u64 {
        let mut state = self.state();
        state.last_seq += 1;
        let seq = state.last_seq;
        state.log.push(AppliedCall {
            seq,
            run_id: run_id.clone(),
            tool: tool.to_string(),
            arguments,
            result: result.into(),
        });
        debug!(seq, tool = %tool, run_id = %run_id, "Recorded tool call for rollback");
        seq
    }

    /// Sequence number of the newest recorded call (0 before any call).
    pub fn current_seq(&self) -> u64 {
        self.state().last_seq
    }

    /// Snapshot of the log, oldest first.
    pub fn log(&self) -> Vec<AppliedCall> {
        self.state().log.clone()
    }

    /// Undo every logged call newer than `point`, newest first.
    pub async fn rollback_to(&self, point: u64, tools: &ToolRegistry) -> RollbackReport {
        let undo = self.take_after(point, None);
        self.compensate(undo, tools).await
    }

    /// Like `rollback_to`, but only touches calls made by `run_id`.
    pub async fn rollback_run_to(
        &self,
        run_id: &RunId,
        point: u64,
        tools: &ToolRegistry,
    ) -> RollbackReport {
        let undo = self.take_after(point, Some(run_id));
        self.compensate(undo, tools).await
    }

    /// Remove and return the log entries after `point`, oldest first.
    fn take_after(&self, point: u64, run_id: Option<&RunId>) -> Vec<AppliedCall> {
        let mut state = self.state();
        let (undo, keep): (Vec<AppliedCall>, Vec<AppliedCall>) =
            std::mem::take(&mut state.log).into_iter().partition(|call| {
                call.seq > point && run_id.map_or(true, |id| &call.run_id == id)
            });
        state.log = keep;
        undo
    }

    async fn compensate(&self, undo: Vec<AppliedCall>, tools: &ToolRegistry) -> RollbackReport {
        let mut report = RollbackReport::default();

        for call in undo.into_iter().rev() {
            let Some(compensator) = self.compensator_for(&call.tool) else {
                debug!(seq = call.seq, tool = %call.tool, "No compensator, skipping");
                report.skipped.push(call.seq);
                continue;
            };

            let Some(tool) = tools.get(&compensator) else {
                warn!(seq = call.seq, compensator = %compensator, "Compensating tool not registered");
                report
                    .failures
                    .push(RollbackError::CompensatorNotFound(compensator));
                continue;
            };

            let input = serde_json::json!({
                "arguments": call.arguments,
                "result": call.result,
            });
            let ctx = ToolContext::new(
                AgentId::from("rollback"),
                call.run_id.clone(),
                format!("rollback-{}", call.seq),
            );

            let timeout_secs = tool.timeout_secs().unwrap_or(COMPENSATOR_TIMEOUT_SECS);
            let guarded = AssertUnwindSafe(async { tool.execute(input, ctx).await }).catch_unwind();
            let outcome = match tokio::time::timeout(Duration::from_secs(timeout_secs), guarded).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(StrandError::ToolExecution {
                    tool: compensator.clone(),
                    message: "compensator panicked".into(),
                }),
                Err(_) => Err(StrandError::ToolTimeout {
                    tool: compensator.clone(),
                    timeout_secs,
                }),
            };

            match outcome {
                Ok(result) if !result.is_error => {
                    info!(seq = call.seq, tool = %call.tool, compensator = %compensator, "Rolled back tool call");
                    report.compensated.push(call.seq);
                }
                Ok(result) => {
                    warn!(seq = call.seq, compensator = %compensator, error = %result.content, "Compensator reported an error");
                    report.failures.push(RollbackError::CompensatorFailed {
                        tool: compensator,
                        seq: call.seq,
                        message: result.content,
                    });
                }
                Err(e) => {
                    warn!(seq = call.seq, compensator = %compensator, error = %e, "Compensator failed");
                    report.failures.push(RollbackError::CompensatorFailed {
                        tool: compensator,
                        seq: call.seq,
                        message: e.to_string(),
                    });
                }
            }
        }

        report
    }

    fn state(&self) -> MutexGuard<'_, RollbackState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use strand_test_utils::{FailingTool, PanickingTool, RecordingTool, SlowTool};

    fn run() -> RunId {
        RunId::from("run-1")
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = RollbackRegistry::new();
        registry.register("create_file", "delete_file").unwrap();
        let err = registry.register("create_file", "other").unwrap_err();
        assert_eq!(err, RollbackError::DuplicateCompensator("create_file".into()));
        assert_eq!(registry.compensator_for("create_file").as_deref(), Some("delete_file"));
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let registry = RollbackRegistry::new();
        assert_eq!(registry.current_seq(), 0);
        let a = registry.record(&run(), "x", json!({}), "ok");
        let b = registry.record(&run(), "x", json!({}), "ok");
        assert!(b > a);
        assert_eq!(registry.current_seq(), b);
        assert_eq!(registry.log().len(), 2);
    }

    #[tokio::test]
    async fn test_rollback_reverse_order_with_original_arguments() {
        let undo = RecordingTool::new("undo_a");
        let tools = ToolRegistry::new().with(undo.clone());
        let registry = RollbackRegistry::new();
        registry.register("a", "undo_a").unwrap();

        let point = registry.current_seq();
        registry.record(&run(), "a", json!({"n": 1}), "first");
        registry.record(&run(), "a", json!({"n": 2}), "second");

        let report = registry.rollback_to(point, &tools).await;
        assert!(report.is_clean());
        assert_eq!(report.compensated, vec![2, 1]);

        let calls = undo.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0]["arguments"], json!({"n": 2}));
        assert_eq!(calls[0]["result"], "second");
        assert_eq!(calls[1]["arguments"], json!({"n": 1}));
        assert!(registry.log().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_excludes_point_and_skips_uncompensated() {
        let undo = RecordingTool::new("undo_a");
        let tools = ToolRegistry::new().with(undo.clone());
        let registry = RollbackRegistry::new();
        registry.register("a", "undo_a").unwrap();

        let keep = registry.record(&run(), "a", json!({"n": 0}), "kept");
        registry.record(&run(), "read_only", json!({}), "data");
        registry.record(&run(), "a", json!({"n": 1}), "undone");

        let report = registry.rollback_to(keep, &tools).await;
        assert_eq!(report.compensated, vec![3]);
        assert_eq!(report.skipped, vec![2]);
        assert_eq!(undo.calls().len(), 1);
        assert_eq!(registry.log().len(), 1);
        assert_eq!(registry.log()[0].seq, keep);
    }

    #[tokio::test]
    async fn test_compensator_failure_does_not_abort() {
        let undo = RecordingTool::new("undo_b");
        let tools = ToolRegistry::new()
            .with(FailingTool::new("undo_a"))
            .with(undo.clone());
        let registry = RollbackRegistry::new();
        registry.register("a", "undo_a").unwrap();
        registry.register("b", "undo_b").unwrap();

        registry.record(&run(), "b", json!({}), "b1");
        registry.record(&run(), "a", json!({}), "a1");

        let report = registry.rollback_to(0, &tools).await;
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            report.failures[0],
            RollbackError::CompensatorFailed { seq: 2, .. }
        ));
        assert_eq!(report.compensated, vec![1]);
        assert_eq!(undo.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_panicking_compensator_does_not_abort() {
        let undo = RecordingTool::new("undo_b");
        for undo_a in [PanickingTool::new("undo_a"), PanickingTool::eager("undo_a")] {
            let tools = ToolRegistry::new().with(undo_a).with(undo.clone());
            let registry = RollbackRegistry::new();
            registry.register("a", "undo_a").unwrap();
            registry.register("b", "undo_b").unwrap();

            registry.record(&run(), "b", json!({}), "b1");
            registry.record(&run(), "a", json!({}), "a1");

            let report = registry.rollback_to(0, &tools).await;
            assert_eq!(report.compensated, vec![1]);
            assert_eq!(report.failures.len(), 1);
            match &report.failures[0] {
                RollbackError::CompensatorFailed { tool, seq, message } => {
                    assert_eq!(tool, "undo_a");
                    assert_eq!(*seq, 2);
                    assert!(message.contains("panicked"), "{}", message);
                }
                other => panic!("unexpected failure: {:?}", other),
            }
            assert!(registry.log().is_empty());
        }
        assert_eq!(undo.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_compensator_times_out() {
        let undo = RecordingTool::new("undo_b");
        let tools = ToolRegistry::new()
            .with(SlowTool::new("undo_a", Duration::from_secs(3600)))
            .with(undo.clone());
        let registry = RollbackRegistry::new();
        registry.register("a", "undo_a").unwrap();
        registry.register("b", "undo_b").unwrap();

        registry.record(&run(), "b", json!({}), "b1");
        registry.record(&run(), "a", json!({}), "a1");

        let started = tokio::time::Instant::now();
        let report = registry.rollback_to(0, &tools).await;
        assert!(started.elapsed() < Duration::from_secs(3600));
        assert!(matches!(
            report.failures[..],
            [RollbackError::CompensatorFailed { seq: 2, .. }]
        ));
        assert_eq!(report.compensated, vec![1]);
        assert_eq!(undo.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_run_scoped_rollback_leaves_other_runs() {
        let undo = RecordingTool::new("undo_a");
        let tools = ToolRegistry::new().with(undo.clone());
        let registry = RollbackRegistry::new();
        registry.register("a", "undo_a").unwrap();

        let other = RunId::from("run-2");
        registry.record(&run(), "a", json!({}), "mine");
        registry.record(&other, "a", json!({}), "theirs");

        let report = registry.rollback_run_to(&run(), 0, &tools).await;
        assert_eq!(report.compensated, vec![1]);
        let log = registry.log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].run_id, other);
    }

    #[tokio::test]
    async fn test_missing_compensator_tool_reported() {
        let registry = RollbackRegistry::new();
        registry.register("a", "undo_a").unwrap();
        registry.record(&run(), "a", json!({}), "x");
        let report = registry.rollback_to(0, &ToolRegistry::new()).await;
        assert_eq!(
            report.failures,
            vec![RollbackError::CompensatorNotFound("undo_a".into())]
        );
    }
}
