//! conductor-sim — an in-memory execution substrate.
//!
//! `SimCluster` implements every collaborator trait against a shared
//! in-memory model: environments, traffic routes, a registry, per-environment
//! health and canary metrics. Every call is recorded, and individual
//! operations can be made to fail or stall, which is how the rollout and
//! orchestrator tests exercise failure paths. The daemon's `simulate`
//! command drives a full rollout against it.

mod cluster;

pub use cluster::{SimCall, SimCluster, SimEnvironment};

use std::collections::BTreeMap;
use std::time::Duration;

use conductor_core::{DeploymentRequest, HealthCheckConfig, ResourceRequirements};

/// A small, valid request with millisecond-scale health checks.
pub fn sample_request(service: &str, environment: &str, version: &str) -> DeploymentRequest {
    DeploymentRequest {
        service: service.to_string(),
        version: version.to_string(),
        environment: environment.to_string(),
        image: format!("registry.local/{service}"),
        replicas: 4,
        strategy: None,
        resources: ResourceRequirements {
            cpu_cores: 0.5,
            memory_mb: 256,
            storage_mb: 512,
        },
        health_check: HealthCheckConfig {
            path: "/healthz".to_string(),
            timeout: Duration::from_millis(50),
            interval: Duration::from_millis(1),
            retries: 3,
        },
        manifests: Vec::new(),
        env: BTreeMap::new(),
        auto_rollback: false,
        rollback: false,
        canary: None,
    }
}
