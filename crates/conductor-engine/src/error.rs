//! Caller-facing errors of the orchestrator.

use conductor_core::DeploymentStatus;
use conductor_state::StateError;
use thiserror::Error;

use crate::validator::ValidationReport;

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum OrchestratorError {
    #[error("validation failed: {0}")]
    Validation(ValidationReport),

    #[error("deployment not found: {0}")]
    NotFound(String),

    #[error("cannot {operation} deployment {id} in status {status}")]
    InvalidState {
        id: String,
        status: DeploymentStatus,
        operation: &'static str,
    },

    #[error("no previous version known for deployment {0}")]
    NoPreviousVersion(String),

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    State(#[from] StateError),
}
