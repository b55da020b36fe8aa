use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the expression evaluator.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EvalError {
    /// The expression failed to compile.
    #[error("expression compile error: {0}")]
    Compile(String),

    /// The expression failed at runtime (unknown variable, operation cap, ...).
    #[error("expression execution error: {0}")]
    Execution(String),

    /// The expression produced a value of the wrong type.
    #[error("expression produced {got}, expected {expected}")]
    Type { expected: &'static str, got: String },
}

/// Errors surfaced by the engine API.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FlowError {
    /// No active flow definition with this code.
    #[error("flow not found: {0}")]
    FlowNotFound(String),

    /// No node with this code in the flow definition.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// No node instance with this id.
    #[error("node instance not found: {0}")]
    NodeInstanceNotFound(Uuid),

    /// No flow instance with this id.
    #[error("flow instance not found: {0}")]
    FlowInstanceNotFound(Uuid),

    /// The node instance is no longer open for completion (completed,
    /// cancelled, or its flow instance is terminal).
    #[error("node instance {0} is no longer open for completion")]
    AlreadyDone(Uuid),

    /// The processor is not in the node instance's candidate set.
    #[error("user {user} is not a candidate for node instance {node_instance}")]
    NotCandidate { user: String, node_instance: Uuid },

    /// No outgoing edge's guard held at a branching node. When raised on the
    /// first hop of a routing step, no state has been written.
    #[error("no outgoing route matched at node {0}")]
    NoRoute(String),

    /// Expression evaluation failed where no documented fallback exists.
    #[error(transparent)]
    Eval(#[from] EvalError),

    /// A malformed or structurally invalid process definition.
    #[error("definition error: {0}")]
    Definition(String),

    /// The underlying store failed; no engine state was changed by this call.
    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),
}

impl From<anyhow::Error> for FlowError {
    fn from(err: anyhow::Error) -> Self {
        FlowError::Store(err)
    }
}

/// Convenience result alias for engine operations.
pub type Result<T> = std::result::Result<T, FlowError>;
