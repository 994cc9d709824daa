//! Structured error taxonomy shared by the scheduler and the sampling loop.
//!
//! `OrchestratorError` gives callers a pattern-matchable error instead of a
//! bag of `anyhow::Error`s. `FailureCategory` classifies the error for the
//! purposes of the error-handling design in §7: which failures are user
//! faults, which ones implicitly pause a target's queue, and which ones are
//! simply retried by a handler before ever reaching here.

use thiserror::Error;

/// Classification of a job-terminating failure.
///
/// This mirrors the taxonomy in the design: validation failures never touch
/// job state, blocking failures pause the target's queue until an operator
/// resolves them, and the rest are terminal `error`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    /// Caller fault: bad parameters, unknown API, invalid transition request.
    Validation,
    /// Operator-recoverable: the job is `paused`, blocking its target's queue.
    Blocking,
    /// Transient provider/network error that exhausted its retry budget.
    Transient,
    /// Token budget exceeded mid-run.
    Budget,
    /// Lease expired or was stolen; the worker that held it is presumed dead.
    Lease,
    /// The model ended its turn without satisfying the extraction contract.
    ModelContract,
    /// The job was cancelled, either before or during execution.
    Cancellation,
}

/// Errors surfaced by the orchestrator's core engine.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("job {job_id} blocked: {reason}")]
    Blocking { job_id: uuid::Uuid, reason: String },

    #[error("transient failure: {0}")]
    Transient(#[source] anyhow::Error),

    #[error("exceeded token limit")]
    Budget,

    #[error("Lease expired; worker likely terminated")]
    Lease,

    #[error("Model ended its turn without providing any extractions")]
    ModelContract,

    #[error("Job was interrupted by user")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

impl From<crate::persistence::StoreError> for OrchestratorError {
    fn from(err: crate::persistence::StoreError) -> Self {
        OrchestratorError::Storage(anyhow::anyhow!(err))
    }
}

impl OrchestratorError {
    pub fn category(&self) -> FailureCategory {
        match self {
            OrchestratorError::Validation(_) => FailureCategory::Validation,
            OrchestratorError::Blocking { .. } => FailureCategory::Blocking,
            OrchestratorError::Transient(_) => FailureCategory::Transient,
            OrchestratorError::Budget => FailureCategory::Budget,
            OrchestratorError::Lease => FailureCategory::Lease,
            OrchestratorError::ModelContract => FailureCategory::ModelContract,
            OrchestratorError::Cancelled => FailureCategory::Cancellation,
            OrchestratorError::Storage(_) => FailureCategory::Transient,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
