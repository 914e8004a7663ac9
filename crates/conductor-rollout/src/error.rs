//! Execution errors raised inside a strategy executor.

use conductor_core::{CanaryMetrics, Cancelled, SubstrateError};
use conductor_health::HealthError;
use thiserror::Error;

pub type RolloutResult<T> = Result<T, RolloutError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RolloutError {
    #[error("scheduler error: {0}")]
    Substrate(SubstrateError),

    #[error("{operation} timed out for {environment}")]
    Timeout {
        operation: &'static str,
        environment: String,
    },

    #[error("environment {environment} unhealthy after {attempts} probe(s)")]
    Unhealthy { environment: String, attempts: u32 },

    #[error("canary rejected: {reason}")]
    CanaryRejected {
        reason: String,
        metrics: Option<CanaryMetrics>,
    },

    #[error("rollout cancelled")]
    Cancelled,
}

impl From<SubstrateError> for RolloutError {
    fn from(err: SubstrateError) -> Self {
        match err {
            SubstrateError::Timeout {
                operation, target, ..
            } => RolloutError::Timeout {
                operation,
                environment: target,
            },
            other => RolloutError::Substrate(other),
        }
    }
}

impl From<Cancelled> for RolloutError {
    fn from(_: Cancelled) -> Self {
        RolloutError::Cancelled
    }
}

impl From<HealthError> for RolloutError {
    fn from(err: HealthError) -> Self {
        match err {
            HealthError::Unhealthy {
                environment,
                attempts,
            } => RolloutError::Unhealthy {
                environment,
                attempts,
            },
            HealthError::Cancelled => RolloutError::Cancelled,
        }
    }
}
