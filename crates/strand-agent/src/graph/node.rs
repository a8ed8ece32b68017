use std::any::{type_name, Any};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use strand_core::error::{Result, StrandError};

use crate::context::AgentContext;

/// Bound for every value that crosses an edge.
///
/// Serializability keeps a checkpoint's "next node input" lossless and lets
/// node events carry the value as JSON.
pub trait NodeValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> NodeValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// A type-erased node value as stored inside the graph arena.
pub(crate) type AnyValue = Box<dyn Any + Send>;

pub(crate) type NodeOp =
    Arc<dyn Fn(AnyValue, AgentContext) -> BoxFuture<'static, Result<AnyValue>> + Send + Sync>;

/// What a node does. Fixed when the node is added to a builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    /// Entry sentinel; passes its input through.
    Start,
    /// Terminal sentinel; the value it receives is the run result.
    Finish,
    Transform,
    LlmRequest {
        choices: usize,
    },
    ToolExecution {
        parallel: bool,
    },
    HistoryCompression,
    Moderation,
    /// A nested graph with its own start and finish.
    Subgraph {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_scope: Option<Vec<String>>,
    },
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Finish => "finish",
            Self::Transform => "transform",
            Self::LlmRequest { .. } => "llm_request",
            Self::ToolExecution { .. } => "tool_execution",
            Self::HistoryCompression => "history_compression",
            Self::Moderation => "moderation",
            Self::Subgraph { .. } => "subgraph",
        }
    }
}

#[derive(Clone, Copy)]
struct ValueCodec {
    encode_input: fn(&AnyValue) -> Value,
    encode_output: fn(&AnyValue) -> Value,
    decode_input: fn(Value) -> std::result::Result<AnyValue, serde_json::Error>,
}

/// A node in the graph arena.
///
/// The operation is stored type-erased; the types it was declared with are
/// kept by name for diagnostics and by codec for checkpoints.
pub struct Node {
    id: String,
    kind: NodeKind,
    input_type: &'static str,
    output_type: &'static str,
    op: NodeOp,
    codec: ValueCodec,
}

impl Node {
    pub(crate) fn new<I, O, F>(id: String, kind: NodeKind, f: F) -> Self
    where
        I: NodeValue,
        O: NodeValue,
        F: Fn(I, AgentContext) -> BoxFuture<'static, Result<O>> + Send + Sync + 'static,
    {
        let node_id = id.clone();
        let op: NodeOp = Arc::new(
            move |input: AnyValue, ctx: AgentContext| -> BoxFuture<'static, Result<AnyValue>> {
                match input.downcast::<I>() {
                    Ok(input) => {
                        let fut = f(*input, ctx);
                        Box::pin(async move { fut.await.map(|out| Box::new(out) as AnyValue) })
                    }
                    Err(_) => {
                        let err = StrandError::TypeMismatch {
                            node_id: node_id.clone(),
                            expected: type_name::<I>(),
                        };
                        Box::pin(async move { Err(err) })
                    }
                }
            },
        );

        Self {
            id,
            kind,
            input_type: type_name::<I>(),
            output_type: type_name::<O>(),
            op,
            codec: ValueCodec {
                encode_input: encode::<I>,
                encode_output: encode::<O>,
                decode_input: decode::<I>,
            },
        }
    }

    /// A node that forwards its input unchanged.
    pub(crate) fn identity<T: NodeValue>(id: String, kind: NodeKind) -> Self {
        Self::new::<T, T, _>(id, kind, |value, _ctx| -> BoxFuture<'static, Result<T>> {
            Box::pin(async move { Ok(value) })
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn input_type(&self) -> &'static str {
        self.input_type
    }

    pub fn output_type(&self) -> &'static str {
        self.output_type
    }

    pub(crate) fn execute(&self, input: AnyValue, ctx: AgentContext) -> BoxFuture<'static, Result<AnyValue>> {
        (self.op)(input, ctx)
    }

    pub(crate) fn encode_input(&self, value: &AnyValue) -> Value {
        (self.codec.encode_input)(value)
    }

    pub(crate) fn encode_output(&self, value: &AnyValue) -> Value {
        (self.codec.encode_output)(value)
    }

    /// Rebuild this node's input from its JSON form.
    pub(crate) fn decode_input(&self, value: Value) -> Result<AnyValue> {
        (self.codec.decode_input)(value).map_err(|e| {
            StrandError::Checkpoint(format!(
                "input for node '{}' is not a valid {}: {}",
                self.id, self.input_type, e
            ))
        })
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("input_type", &self.input_type)
            .field("output_type", &self.output_type)
            .finish()
    }
}

fn encode<T: NodeValue>(value: &AnyValue) -> Value {
    (**value)
        .downcast_ref::<T>()
        .and_then(|v| serde_json::to_value(v).ok())
        .unwrap_or(Value::Null)
}

fn decode<T: NodeValue>(value: Value) -> std::result::Result<AnyValue, serde_json::Error> {
    serde_json::from_value::<T>(value).map(|v| Box::new(v) as AnyValue)
}
