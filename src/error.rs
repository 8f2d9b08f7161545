//! Engine-level error type.

use crate::cohort::ScheduleError;
use crate::curriculum::CurriculumError;
use crate::ids::TaskId;
use crate::scoring::ScoringError;
use crate::store::StoreError;
use crate::task::{PolicyError, SubmissionError, TaskError};

/// Errors surfaced by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Illegal transition, re-decided submission, or no open slot left.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("policy misconfiguration: {0}")]
    PolicyMisconfiguration(#[from] PolicyError),

    #[error("schedule misconfiguration: {0}")]
    ScheduleMisconfiguration(#[from] ScheduleError),

    /// Soft failure; callers log it and fall back to human review.
    #[error("external scoring unavailable: {0}")]
    ExternalScoringUnavailable(#[from] ScoringError),

    #[error("task {task_id} holds {pending} unreviewed submissions")]
    ReconciliationConflict { task_id: TaskId, pending: usize },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("write conflict persisted after {attempts} attempts")]
    WriteConflict { attempts: u32 },

    #[error("invalid position: {0}")]
    InvalidPosition(#[from] CurriculumError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<TaskError> for EngineError {
    fn from(e: TaskError) -> Self {
        EngineError::InvalidState(e.to_string())
    }
}

impl From<SubmissionError> for EngineError {
    fn from(e: SubmissionError) -> Self {
        EngineError::InvalidState(e.to_string())
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Missing(what) => EngineError::NotFound(what),
            other => EngineError::Store(other),
        }
    }
}

impl EngineError {
    /// Whether the operation may succeed when retried against fresh state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Store(StoreError::Conflict(_)))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
