use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use futures::future::BoxFuture;

use strand_core::checkpoint::Checkpoint;
use strand_core::error::{Result, StrandError};
use strand_core::traits::CheckpointStore;
use strand_core::types::RunId;

/// Process-local checkpoint store.
///
/// Keeps every checkpoint of every run, oldest first. Suitable for tests and
/// short-lived agents; durable backends implement the same trait elsewhere.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    runs: Mutex<HashMap<RunId, Vec<Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total checkpoints across all runs.
    pub fn len(&self) -> usize {
        self.runs().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<RunId, Vec<Checkpoint>>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn save(&self, checkpoint: Checkpoint) -> BoxFuture<'_, Result<()>> {
        self.runs()
            .entry(checkpoint.run_id.clone())
            .or_default()
            .push(checkpoint);
        Box::pin(async { Ok(()) })
    }

    fn load(&self, run_id: &RunId, checkpoint_id: &str) -> BoxFuture<'_, Result<Checkpoint>> {
        let found = self
            .runs()
            .get(run_id)
            .and_then(|cps| cps.iter().find(|cp| cp.checkpoint_id == checkpoint_id).cloned())
            .ok_or_else(|| StrandError::CheckpointNotFound {
                run_id: run_id.to_string(),
                checkpoint_id: checkpoint_id.to_string(),
            });
        Box::pin(async move { found })
    }

    fn latest(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<Checkpoint>>> {
        let latest = self.runs().get(run_id).and_then(|cps| cps.last().cloned());
        Box::pin(async move { Ok(latest) })
    }

    fn list(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<Checkpoint>>> {
        let all = self.runs().get(run_id).cloned().unwrap_or_default();
        Box::pin(async move { Ok(all) })
    }

    fn delete_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<usize>> {
        let removed = self.runs().remove(run_id).map_or(0, |cps| cps.len());
        Box::pin(async move { Ok(removed) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strand_core::types::{AgentId, ChatMessage};

    fn checkpoint(run: &RunId, node: &str) -> Checkpoint {
        Checkpoint::new(
            AgentId::from("agent"),
            run.clone(),
            "loop",
            node,
            json!("input"),
            "prompt-1",
            vec![ChatMessage::user("hi")],
            0,
        )
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = InMemoryCheckpointStore::new();
        let run = RunId::from("run-1");
        let cp = checkpoint(&run, "llm");
        let id = cp.checkpoint_id.clone();
        store.save(cp).await.unwrap();

        let loaded = store.load(&run, &id).await.unwrap();
        assert_eq!(loaded.node_id, "llm");
        assert_eq!(loaded.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_latest_and_list_order() {
        let store = InMemoryCheckpointStore::new();
        let run = RunId::from("run-1");
        store.save(checkpoint(&run, "first")).await.unwrap();
        store.save(checkpoint(&run, "second")).await.unwrap();
        store.save(checkpoint(&RunId::from("other"), "x")).await.unwrap();

        let latest = store.latest(&run).await.unwrap().unwrap();
        assert_eq!(latest.node_id, "second");
        let nodes: Vec<_> = store
            .list(&run)
            .await
            .unwrap()
            .into_iter()
            .map(|cp| cp.node_id)
            .collect();
        assert_eq!(nodes, vec!["first", "second"]);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_missing_checkpoint() {
        let store = InMemoryCheckpointStore::new();
        let run = RunId::from("nope");
        assert!(matches!(
            store.load(&run, "x").await,
            Err(StrandError::CheckpointNotFound { .. })
        ));
        assert!(store.latest(&run).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_run() {
        let store = InMemoryCheckpointStore::new();
        let run = RunId::from("run-1");
        store.save(checkpoint(&run, "a")).await.unwrap();
        store.save(checkpoint(&run, "b")).await.unwrap();
        assert_eq!(store.delete_run(&run).await.unwrap(), 2);
        assert!(store.is_empty());
    }
}
