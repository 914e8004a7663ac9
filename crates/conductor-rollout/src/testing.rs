//! Test fixtures: rollout contexts wired to a simulated cluster.

use std::time::Duration;

use conductor_core::config::ConductorConfig;
use conductor_core::{CancelToken, Deployment, DeploymentStrategy};
use conductor_sim::{SimCluster, sample_request};
use conductor_state::EventBus;

use crate::context::RolloutContext;

/// Millisecond-scale timings so executors finish quickly.
pub(crate) fn fast_config() -> ConductorConfig {
    let mut config = ConductorConfig::default();
    config.rollout.rollout_timeout = Duration::from_secs(2);
    config.rollout.readiness_timeout = Duration::from_secs(2);
    config.rollout.termination_timeout = Duration::from_secs(2);
    config.rollout.blue_green_grace = Duration::from_millis(5);
    config.rollout.canary_sample_interval = Duration::from_millis(5);
    config.canary.monitoring_duration = Duration::from_millis(20);
    config
}

pub(crate) fn context(
    sim: &SimCluster,
    service: &str,
    environment: &str,
    version: &str,
    strategy: DeploymentStrategy,
) -> RolloutContext {
    context_with(sim, service, environment, version, strategy, fast_config())
}

pub(crate) fn context_with(
    sim: &SimCluster,
    service: &str,
    environment: &str,
    version: &str,
    strategy: DeploymentStrategy,
    config: ConductorConfig,
) -> RolloutContext {
    cancellable(sim, service, environment, version, strategy, config, CancelToken::never())
}

pub(crate) fn cancellable(
    sim: &SimCluster,
    service: &str,
    environment: &str,
    version: &str,
    strategy: DeploymentStrategy,
    config: ConductorConfig,
    cancel: CancelToken,
) -> RolloutContext {
    let request = sample_request(service, environment, version);
    let deployment = Deployment::pending("test-deployment".to_string(), request, strategy, None);
    let logger = EventBus::default().logger(&deployment.id);
    RolloutContext::new(&deployment, sim.substrate(), &config, cancel, logger)
}
