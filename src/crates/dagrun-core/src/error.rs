//! Error types for the execution core.
//!
//! Construction-time errors ([`CoreError::CycleDetected`],
//! [`CoreError::StepNotFound`]) abort graph construction before a run begins.
//! Per-step errors are confined to the failing node's state and recorded as
//! the scheduler's `last_error` only for the final status decision; they never
//! unwind the event loop.

use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors produced by graph construction, evaluation and step execution.
#[derive(Error, Debug)]
pub enum CoreError {
    /// The step graph contains a dependency cycle
    #[error("dependency cycle detected in step graph")]
    CycleDetected,

    /// A `depends` entry references a step that does not exist
    #[error("step not found: {name}")]
    StepNotFound {
        /// The unresolved step name
        name: String,
    },

    /// Graph structure invalid for reasons other than cycles/missing steps
    #[error("invalid DAG: {0}")]
    Validation(String),

    /// A dependency failed and the dependent does not continue on failure
    #[error("upstream step failed: {step}")]
    UpstreamFailed {
        /// Name of the failed dependency
        step: String,
    },

    /// A dependency was skipped and the dependent does not continue on skip
    #[error("upstream step skipped: {step}")]
    UpstreamSkipped {
        /// Name of the skipped dependency
        step: String,
    },

    /// A precondition evaluated to unmet
    #[error("precondition not met: {0}")]
    PreconditionNotMet(String),

    /// The executor completed with a non-zero exit code
    #[error("command exited with code {exit_code}")]
    ExecutorFailure {
        /// Exit code reported by the executor
        exit_code: i32,
    },

    /// The step exceeded its own timeout (recorded as exit code 124)
    #[error("step timed out")]
    StepTimeout,

    /// The run was canceled, by signal or by the DAG-level timeout
    #[error("run canceled")]
    Canceled,

    /// The event loop stalled with unfinished nodes and no runnable work
    #[error("deadlock detected: no runnable steps remain but the graph is unfinished")]
    DeadlockDetected,

    /// Captured output exceeded the configured cap; partial data is retained
    #[error("output size exceeded the {limit} byte limit")]
    OutputSizeExceeded {
        /// The configured cap in bytes
        limit: usize,
    },

    /// String expansion or condition evaluation failed
    #[error("evaluation error: {0}")]
    Eval(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An error from the model/sink layer
    #[error(transparent)]
    Model(#[from] dagrun_model::ModelError),
}

impl CoreError {
    /// Exit code recorded on the node for this error, when one applies.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CoreError::ExecutorFailure { exit_code } => Some(*exit_code),
            CoreError::StepTimeout => Some(124),
            _ => None,
        }
    }

    /// Whether this error represents cancellation rather than failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, CoreError::Canceled)
    }
}
