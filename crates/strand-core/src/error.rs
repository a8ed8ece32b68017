use thiserror::Error;

#[derive(Debug, Error)]
pub enum StrandError {
    // Graph / configuration errors
    #[error("Graph build failed: {0}")]
    Graph(#[from] GraphError),

    #[error("No matching edge from node '{node_id}'")]
    NoMatchingEdge { node_id: String },

    #[error("Node '{node_id}' expected input of type {expected}")]
    TypeMismatch { node_id: String, expected: &'static str },

    #[error("Agent exceeded max iterations ({0})")]
    MaxIterationsExceeded(usize),

    #[error("Node '{node_id}' failed: {message}")]
    NodeExecution { node_id: String, message: String },

    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    #[error("LLM moderation failed: {0}")]
    Moderation(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid arguments for tool {tool}: {message}")]
    InvalidToolArguments { tool: String, message: String },

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    // Feature errors
    #[error("Feature install failed: {0}")]
    FeatureInstall(#[from] FeatureInstallError),

    #[error("Feature not installed: {0}")]
    FeatureNotInstalled(String),

    #[error("Feature handler failed: {feature}: {message}")]
    FeatureHandler { feature: String, message: String },

    #[error("Message processor failed: {0}")]
    MessageProcessor(String),

    // Rollback errors
    #[error("Rollback error: {0}")]
    Rollback(#[from] RollbackError),

    // Persistence errors
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Checkpoint not found: run {run_id}, checkpoint {checkpoint_id}")]
    CheckpointNotFound { run_id: String, checkpoint_id: String },

    // Protocol handoff
    #[error("Outbound sink closed")]
    OutboundClosed,

    #[error("Agent cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StrandError {
    /// Errors caused by a malformed graph or engine configuration rather than
    /// by anything that happened while talking to a model or a tool.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Graph(_)
                | Self::NoMatchingEdge { .. }
                | Self::TypeMismatch { .. }
                | Self::MaxIterationsExceeded(_)
                | Self::Config(_)
                | Self::ConfigNotFound(_)
        )
    }

    /// Tool failures are never fatal to a run; they are turned into data.
    pub fn is_tool_error(&self) -> bool {
        matches!(
            self,
            Self::ToolNotFound(_)
                | Self::InvalidToolArguments { .. }
                | Self::ToolExecution { .. }
                | Self::ToolTimeout { .. }
        )
    }
}

/// Validation failures reported by `GraphBuilder::build`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("node '{0}' is declared more than once")]
    DuplicateNode(String),

    #[error("sentinel id '{0}' is reserved and cannot be reused")]
    DuplicateSentinel(String),

    #[error("edge references unknown node '{0}'")]
    UnknownNode(String),

    #[error("node '{0}' is unreachable from start")]
    UnreachableNode(String),

    #[error("finish node is never targeted by an edge")]
    FinishNotTargeted,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeatureInstallError {
    #[error("feature '{0}' is already installed")]
    DuplicateKey(String),

    #[error("feature '{feature}' requires '{dependency}' to be installed first")]
    MissingDependency { feature: String, dependency: String },

    #[error("feature '{feature}' rejected its configuration: {message}")]
    InvalidConfig { feature: String, message: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RollbackError {
    #[error("tool '{0}' already has a compensating tool registered")]
    DuplicateCompensator(String),

    #[error("compensating tool '{0}' is not in the tool registry")]
    CompensatorNotFound(String),

    #[error("compensating tool '{tool}' failed for sequence {seq}: {message}")]
    CompensatorFailed { tool: String, seq: u64, message: String },
}

pub type Result<T> = std::result::Result<T, StrandError>;
