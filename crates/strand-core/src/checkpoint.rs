use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{AgentId, ChatMessage, RunId};

/// A serializable snapshot of a run: session state plus execution position.
///
/// `node_id` is the node about to execute and `input` is the JSON form of the
/// value it will receive, so resuming from a checkpoint replays nothing that
/// already completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub agent_id: AgentId,
    pub run_id: RunId,
    pub strategy: String,
    pub node_id: String,
    pub input: serde_json::Value,
    pub prompt_id: String,
    pub messages: Vec<ChatMessage>,
    /// Rollback log position at capture time.
    pub rollback_seq: u64,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_id: AgentId,
        run_id: RunId,
        strategy: impl Into<String>,
        node_id: impl Into<String>,
        input: serde_json::Value,
        prompt_id: impl Into<String>,
        messages: Vec<ChatMessage>,
        rollback_seq: u64,
    ) -> Self {
        Self {
            checkpoint_id: Uuid::new_v4().to_string(),
            agent_id,
            run_id,
            strategy: strategy.into(),
            node_id: node_id.into(),
            input,
            prompt_id: prompt_id.into(),
            messages,
            rollback_seq,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_json_is_lossless() {
        let cp = Checkpoint::new(
            AgentId::from("calc"),
            RunId::from("run-1"),
            "tool-loop",
            "execute_tool",
            serde_json::json!({"id": "c1", "name": "calc", "arguments": {}}),
            "prompt-1",
            vec![ChatMessage::user("2+2")],
            7,
        );
        let json = serde_json::to_string(&cp).unwrap();
        let restored: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.checkpoint_id, cp.checkpoint_id);
        assert_eq!(restored.node_id, "execute_tool");
        assert_eq!(restored.input, cp.input);
        assert_eq!(restored.messages[0].text(), "2+2");
        assert_eq!(restored.rollback_seq, 7);
    }
}
