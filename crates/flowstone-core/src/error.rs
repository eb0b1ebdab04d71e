//! Engine error taxonomy.

use uuid::Uuid;

/// Which limit an execution exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Duration,
    NodeCount,
    LoopDepth,
    LoopIterations,
    DataSize,
    AccumulatorSize,
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Duration => "maximum execution duration",
            Self::NodeCount => "maximum node executions",
            Self::LoopDepth => "maximum loop depth",
            Self::LoopIterations => "maximum loop iterations",
            Self::DataSize => "maximum data size",
            Self::AccumulatorSize => "maximum accumulator size",
        };
        write!(f, "{s}")
    }
}

/// Errors surfaced by the workflow engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed graph, unknown node type, missing start/end.
    #[error("invalid workflow definition: {0}")]
    Definition(#[from] crate::definition::DefinitionError),

    /// The execution row does not exist.
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// The workflow has been deactivated.
    #[error("workflow is not active: {0}")]
    WorkflowInactive(Uuid),

    /// An abuse-prevention limit was hit. Terminal.
    #[error("limit exceeded: {0}")]
    LimitExceeded(LimitKind),

    /// A synchronous node failed, failing the execution.
    #[error("node execution failed ({node_id}): {message}")]
    NodeFailed { node_id: String, message: String },

    /// Cooperative cancellation during traversal. Resumable.
    #[error("execution interrupted")]
    Interrupted,

    /// The wall-clock budget (original-start based) elapsed. Terminal.
    #[error("execution deadline exceeded")]
    DeadlineExceeded,

    /// Store failure; the current attempt fails and recovery reclaims it.
    #[error("store error: {0}")]
    Store(String),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether a re-queued attempt could make progress.
    ///
    /// Cancellation leaves the execution `interrupted`; everything else is
    /// either terminal or a system fault handled by recovery.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_interruption_is_resumable() {
        assert!(EngineError::Interrupted.is_resumable());
        assert!(!EngineError::DeadlineExceeded.is_resumable());
        assert!(!EngineError::LimitExceeded(LimitKind::LoopDepth).is_resumable());
        assert!(!EngineError::NodeFailed {
            node_id: "a".into(),
            message: "boom".into()
        }
        .is_resumable());
    }

    #[test]
    fn node_failure_message_names_the_node() {
        let err = EngineError::NodeFailed {
            node_id: "transform-1".into(),
            message: "missing field".into(),
        };
        assert_eq!(
            err.to_string(),
            "node execution failed (transform-1): missing field"
        );
    }
}
