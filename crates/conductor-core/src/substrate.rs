//! Collaborator interfaces — the execution substrate Conductor drives.
//!
//! The orchestrator never talks to a cluster directly. Everything it
//! needs from the outside world goes through these traits:
//!
//! ```text
//! Substrate
//!   ├── Scheduler   (environments, readiness, traffic, scaling)
//!   ├── Registry    (image:tag existence)
//!   ├── HealthProbe (readiness probe + live canary metrics)
//!   └── Notifier    (human-readable outcome messages)
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{CanaryMetrics, ResourceRequirements};

/// Result type alias for collaborator calls.
pub type SubstrateResult<T> = Result<T, SubstrateError>;

/// Errors reported by collaborators.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SubstrateError {
    #[error("environment not found: {0}")]
    NotFound(String),

    #[error("{operation} timed out for {target} after {timeout:?}")]
    Timeout {
        operation: &'static str,
        target: String,
        timeout: Duration,
    },

    #[error("{operation} rejected: {message}")]
    Rejected {
        operation: &'static str,
        message: String,
    },

    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

/// Desired state of a named scheduler environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentSpec {
    pub name: String,
    /// Full image reference (`image:tag`).
    pub image: String,
    pub replicas: u32,
    pub resources: ResourceRequirements,
    pub env: BTreeMap<String, String>,
    pub manifests: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

/// Share of a route's live traffic sent to one environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrafficWeight {
    pub environment: String,
    /// Percentage, 0-100. Weights on a route sum to 100.
    pub percent: u8,
}

impl TrafficWeight {
    pub fn new(environment: impl Into<String>, percent: u8) -> Self {
        Self {
            environment: environment.into(),
            percent,
        }
    }
}

/// Cluster scheduler driven by the strategy executors.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Check manifests for syntactic validity. Returns one message per problem.
    async fn validate_manifests(&self, manifests: &[String]) -> SubstrateResult<Vec<String>>;

    /// Current replica count of an environment, `None` if it does not exist.
    async fn replicas(&self, name: &str) -> SubstrateResult<Option<u32>>;

    async fn create_environment(&self, spec: &EnvironmentSpec) -> SubstrateResult<()>;

    /// Update an existing environment in place (image, replicas, env).
    async fn update_environment(&self, spec: &EnvironmentSpec) -> SubstrateResult<()>;

    async fn delete_environment(&self, name: &str) -> SubstrateResult<()>;

    async fn wait_for_rollout(&self, name: &str, timeout: Duration) -> SubstrateResult<()>;

    async fn wait_for_ready(&self, name: &str, timeout: Duration) -> SubstrateResult<()>;

    async fn wait_for_termination(&self, name: &str, timeout: Duration) -> SubstrateResult<()>;

    /// Replace the weights of a traffic route.
    async fn route_traffic(&self, route: &str, weights: &[TrafficWeight]) -> SubstrateResult<()>;

    async fn scale(&self, name: &str, replicas: u32) -> SubstrateResult<()>;
}

/// Container image registry.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn image_exists(&self, image: &str, tag: &str) -> SubstrateResult<bool>;
}

/// Probe transport against a named environment.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// One readiness probe, bounded by `timeout`.
    async fn probe(&self, environment: &str, path: &str, timeout: Duration) -> SubstrateResult<bool>;

    /// One sample of live traffic metrics.
    async fn sample_metrics(&self, environment: &str) -> SubstrateResult<CanaryMetrics>;
}

/// Fire-and-forget outcome delivery (chat, paging, email...).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> SubstrateResult<()>;
}

/// The full set of collaborators, cheaply cloneable across tasks.
#[derive(Clone)]
pub struct Substrate {
    pub scheduler: Arc<dyn Scheduler>,
    pub registry: Arc<dyn Registry>,
    pub probe: Arc<dyn HealthProbe>,
    pub notifier: Arc<dyn Notifier>,
}

impl Substrate {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        registry: Arc<dyn Registry>,
        probe: Arc<dyn HealthProbe>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            scheduler,
            registry,
            probe,
            notifier,
        }
    }
}
