//! Crate-wide error taxonomy.
//!
//! Every fallible operation in `veritas-core` returns [`Result`]. Variants
//! are grouped the way the orchestrator needs to reason about them: a
//! [`Error::Transient`] is worth retrying, a [`Error::Permanent`] is not,
//! and the remaining variants describe plan-level outcomes rather than
//! step-level causes.

use std::time::Duration;

use crate::types::StepId;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Reasons a [`crate::process::ProcessBuilder`] can fail to build a tree.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BuildError {
    /// The dependency graph implied by a template contains a cycle.
    #[error("cycle detected among steps: {0:?}")]
    CycleDetected(Vec<StepId>),

    /// The analyzed query's intent has no matching process template.
    #[error("no process template registered for intent `{0}`")]
    UnknownIntent(String),

    /// A template references a parameter the analysis did not provide.
    #[error("template `{template}` requires parameter `{parameter}`, which was not supplied")]
    MissingParameter {
        /// Name of the template being instantiated.
        template: String,
        /// Name of the missing parameter.
        parameter: String,
    },
}

/// Errors that are worth retrying: the underlying condition may clear on its own.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransientError {
    /// A step did not complete within its allotted budget.
    #[error("step timed out after {0:?}")]
    Timeout(Duration),

    /// A required external interface (retrieval, generation) reported itself unavailable.
    #[error("external interface unavailable: {0}")]
    Unavailable(String),

    /// An external interface asked the caller to back off.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Suggested wait before retrying, if the interface provided one.
        retry_after: Option<Duration>,
    },
}

/// Errors that retrying will not fix.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PermanentError {
    /// A handler produced a result that does not match its declared schema.
    #[error("step `{step}` produced a result violating its schema: {detail}")]
    SchemaViolation {
        /// Step that produced the invalid result.
        step: StepId,
        /// Human-readable description of the violation.
        detail: String,
    },

    /// An operation was attempted from a plan state that does not permit it.
    #[error("invalid state transition: {0}")]
    InvalidState(String),

    /// The requested operation is not supported by the current configuration.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
}

/// Top-level crate error.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Query analysis rejected the input before any plan was built.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Process-tree construction failed.
    #[error("failed to build process tree")]
    Build(#[from] BuildError),

    /// A step failed with a retryable cause.
    #[error("transient failure in step `{step}`")]
    Transient {
        /// Step the failure originated from.
        step: StepId,
        /// Underlying transient cause.
        #[source]
        source: TransientError,
    },

    /// A step failed with a non-retryable cause.
    #[error("permanent failure in step `{step}`")]
    Permanent {
        /// Step the failure originated from.
        step: StepId,
        /// Underlying permanent cause.
        #[source]
        source: PermanentError,
    },

    /// The quality gate rejected a step's result after exhausting retries.
    #[error("step `{step}` rejected by quality gate after {attempts} attempt(s): {reason}")]
    QualityRejected {
        /// Step whose result was rejected.
        step: StepId,
        /// Number of attempts made.
        attempts: u32,
        /// Reason the quality gate gave for the rejection.
        reason: String,
    },

    /// The plan was cancelled, either by explicit request or a shutdown.
    #[error("plan cancelled: {0}")]
    Cancelled(String),

    /// The plan's overall wall-clock budget elapsed before completion.
    #[error("plan deadline exceeded after {0:?}")]
    PlanDeadlineExceeded(Duration),

    /// A checkpoint failed its integrity check on restore.
    #[error("checkpoint integrity error")]
    Checkpoint(#[from] crate::orchestrator::checkpoint::CheckpointIntegrityError),

    /// Something went wrong that does not fit any other variant; this
    /// indicates a bug rather than an expected runtime condition.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True if retrying the operation that produced this error might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient { .. })
    }
}
