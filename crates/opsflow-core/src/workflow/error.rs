//! Error taxonomy for workflow execution.

use thiserror::Error;

/// Errors that can occur while validating or executing a workflow.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkflowError {
    /// Structural or configuration problem (missing required field, bad input shape).
    #[error("validation error: {0}")]
    Validation(String),

    /// An edge or branch references a node that does not exist.
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// The node graph contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// The run dispatched more nodes than its budget allows.
    #[error("validation error: maximum step limit of {max} exceeded")]
    StepLimitExceeded { max: u32 },

    /// The run exceeded its wall-clock budget.
    #[error("validation error: maximum duration of {max_ms}ms exceeded")]
    DurationExceeded { max_ms: u64 },

    /// An operation lost its race against the node timer.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The tool executor reported a failure.
    #[error("tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },

    /// An injected handler (AI step, loop iteration, parallel branch) failed.
    #[error("handler error: {0}")]
    Handler(String),

    /// A node needs a collaborator that was not supplied.
    #[error("{0} handler not configured")]
    HandlerNotConfigured(String),

    /// AI step output did not match its declared schema.
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),

    /// The run was cancelled by its host.
    #[error("workflow cancelled")]
    Cancelled,
}

impl WorkflowError {
    /// Shorthand for a missing required configuration field.
    pub fn missing_field(node_id: &str, field: &str) -> Self {
        WorkflowError::Validation(format!("node '{node_id}' requires '{field}'"))
    }

    /// Whether this error came from the per-node timer.
    pub fn is_timeout(&self) -> bool {
        matches!(self, WorkflowError::Timeout { .. })
    }
}
