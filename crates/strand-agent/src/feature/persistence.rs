use std::sync::Arc;

use tracing::{debug, info};

use strand_core::checkpoint::Checkpoint;
use strand_core::config::PersistenceConfig;
use strand_core::error::{FeatureInstallError, Result};
use strand_core::event::{AgentEvent, EventKind};
use strand_core::traits::CheckpointStore;
use strand_core::types::RunId;
use strand_tools::{RollbackRegistry, RollbackReport, ToolRegistry};

use super::{Feature, PipelineBuilder};
use crate::checkpoint::InMemoryCheckpointStore;
use crate::context::AgentContext;
use crate::graph::FINISH_NODE_ID;

pub struct PersistenceFeatureConfig {
    /// Defaults to an `InMemoryCheckpointStore`.
    pub store: Option<Arc<dyn CheckpointStore>>,
    /// Save a checkpoint before every top-level node execution.
    pub auto_checkpoint: bool,
}

impl Default for PersistenceFeatureConfig {
    fn default() -> Self {
        Self::from_settings(&PersistenceConfig::default(), None)
    }
}

impl PersistenceFeatureConfig {
    pub fn from_settings(settings: &PersistenceConfig, store: Option<Arc<dyn CheckpointStore>>) -> Self {
        Self {
            store,
            auto_checkpoint: settings.auto_checkpoint,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn auto_checkpoint(mut self, enabled: bool) -> Self {
        self.auto_checkpoint = enabled;
        self
    }
}

/// Checkpoints runs through a `CheckpointStore` and undoes tool side
/// effects back to a checkpoint.
pub struct Persistence {
    store: Arc<dyn CheckpointStore>,
    rollback: Arc<RollbackRegistry>,
    auto_checkpoint: bool,
}

impl Persistence {
    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn auto_checkpoint(&self) -> bool {
        self.auto_checkpoint
    }

    /// Snapshot the run positioned before `node_id` and save it.
    pub async fn create_checkpoint(
        &self,
        ctx: &AgentContext,
        node_id: &str,
        input: serde_json::Value,
    ) -> Result<Checkpoint> {
        let checkpoint = ctx.checkpoint(node_id, input).await;
        self.store.save(checkpoint.clone()).await?;
        debug!(
            run_id = %checkpoint.run_id,
            node_id = %node_id,
            checkpoint_id = %checkpoint.checkpoint_id,
            "Checkpoint saved"
        );
        Ok(checkpoint)
    }

    pub async fn latest(&self, run_id: &RunId) -> Result<Option<Checkpoint>> {
        self.store.latest(run_id).await
    }

    /// Compensate every tool call the checkpoint's run made after it was taken.
    pub async fn rollback(&self, checkpoint: &Checkpoint, tools: &ToolRegistry) -> RollbackReport {
        let report = self
            .rollback
            .rollback_run_to(&checkpoint.run_id, checkpoint.rollback_seq, tools)
            .await;
        info!(
            run_id = %checkpoint.run_id,
            checkpoint_id = %checkpoint.checkpoint_id,
            compensated = report.compensated.len(),
            skipped = report.skipped.len(),
            failed = report.failures.len(),
            "Rolled back to checkpoint"
        );
        report
    }
}

impl Feature for Persistence {
    type Config = PersistenceFeatureConfig;
    const KEY: &'static str = "persistence";

    fn install(
        config: Self::Config,
        pipeline: &mut PipelineBuilder,
    ) -> std::result::Result<Self, FeatureInstallError> {
        let store = config
            .store
            .unwrap_or_else(|| Arc::new(InMemoryCheckpointStore::new()));

        if config.auto_checkpoint {
            let store = Arc::clone(&store);
            pipeline.on(EventKind::NodeExecutionStarting, move |envelope, ctx| {
                let position = match &envelope.event {
                    AgentEvent::NodeExecutionStarting { node_id, input }
                        if !ctx.is_nested() && node_id != FINISH_NODE_ID =>
                    {
                        Some((node_id.clone(), input.clone()))
                    }
                    _ => None,
                };
                let ctx = ctx.clone();
                let store = Arc::clone(&store);
                async move {
                    if let Some((node_id, input)) = position {
                        let checkpoint = ctx.checkpoint(&node_id, input).await;
                        store.save(checkpoint).await?;
                    }
                    Ok(())
                }
            });
        }

        Ok(Self {
            store,
            rollback: Arc::clone(pipeline.rollback()),
            auto_checkpoint: config.auto_checkpoint,
        })
    }
}
