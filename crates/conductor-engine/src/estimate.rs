//! Rollout time estimate for progress display. Not a deadline.

use std::time::Duration;

use conductor_core::config::EstimateConfig;
use conductor_core::{DeploymentRequest, DeploymentStrategy};

/// base + strategy cost + per-replica cost + worst-case health checking.
pub fn estimate(
    request: &DeploymentRequest,
    strategy: DeploymentStrategy,
    config: &EstimateConfig,
) -> Duration {
    let strategy_secs = match strategy {
        DeploymentStrategy::RollingUpdate => config.rolling_secs,
        DeploymentStrategy::BlueGreen => config.blue_green_secs,
        DeploymentStrategy::Canary => config.canary_secs,
        DeploymentStrategy::Recreate => config.recreate_secs,
    };
    let fixed = config
        .base_secs
        .saturating_add(strategy_secs)
        .saturating_add(u64::from(request.replicas).saturating_mul(config.per_replica_secs));

    let health = &request.health_check;
    Duration::from_secs(fixed).saturating_add(health.timeout.saturating_mul(health.retries))
}
