//! Health gate errors.

use conductor_core::Cancelled;
use thiserror::Error;

pub type HealthResult<T> = Result<T, HealthError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum HealthError {
    #[error("environment {environment} unhealthy after {attempts} probe(s)")]
    Unhealthy { environment: String, attempts: u32 },

    #[error("health check cancelled")]
    Cancelled,
}

impl From<Cancelled> for HealthError {
    fn from(_: Cancelled) -> Self {
        HealthError::Cancelled
    }
}
