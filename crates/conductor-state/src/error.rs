//! Error types for the deployment store.

use conductor_core::DeploymentStatus;
use thiserror::Error;

/// Result type alias for store operations.
pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StateError {
    #[error("deployment not found: {0}")]
    NotFound(String),

    #[error("deployment already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: DeploymentStatus,
        to: DeploymentStatus,
    },
}
