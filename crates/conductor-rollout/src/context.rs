//! Shared executor plumbing.
//!
//! Every scheduler call made before cutover goes through [`RolloutContext::call`]
//! or [`RolloutContext::bounded`], which race it against the deployment's
//! cancel token. Once traffic has moved to the new version the rollout is
//! committed: the remaining steps run to completion even if a cancel
//! arrives, and their failures are recorded as warnings.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use conductor_core::config::{ConductorConfig, RolloutConfig};
use conductor_core::{
    CancelToken, CanaryThresholds, Deployment, DeploymentRequest, DeploymentStrategy,
    EnvironmentSpec, Scheduler, Substrate, SubstrateError, SubstrateResult, TrafficWeight,
};
use conductor_health::{CanaryEvaluator, CanaryVerdict, HealthEvaluator};
use conductor_state::DeploymentLogger;

use crate::error::{RolloutError, RolloutResult};
use crate::slots::SlotNames;

/// Step of a rollout, reported on the deployment's log stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum RolloutPhase {
    /// Updating the live environment in place.
    Updating { environment: String },
    /// Creating the environment that will carry the new version.
    Staging { environment: String, replicas: u32 },
    /// Waiting for an in-place update to finish rolling out.
    AwaitingRollout { environment: String },
    /// Waiting for the scheduler to report readiness.
    ReadinessGate { environment: String },
    /// Probing the staged environment.
    HealthGate { environment: String },
    /// Canary receives a share of traffic while metrics are sampled.
    CanaryObserving { environment: String, percent: u8 },
    /// Canary passed and is scaled to full size.
    CanaryPromoting { environment: String, replicas: u32 },
    /// All traffic moves to the new environment.
    Cutover { environment: String },
    /// Grace period before the outgoing environment goes away.
    Draining { environment: String },
    /// Removing the outgoing environment.
    Retiring { environment: String },
    /// Waiting for the old environment to terminate.
    Terminating { environment: String },
}

impl RolloutPhase {
    fn describe(&self) -> String {
        match self {
            RolloutPhase::Updating { environment } => format!("updating {environment} in place"),
            RolloutPhase::Staging {
                environment,
                replicas,
            } => format!("creating {environment} with {replicas} replica(s)"),
            RolloutPhase::AwaitingRollout { environment } => {
                format!("waiting for rollout of {environment}")
            }
            RolloutPhase::ReadinessGate { environment } => {
                format!("waiting for {environment} to become ready")
            }
            RolloutPhase::HealthGate { environment } => format!("health checking {environment}"),
            RolloutPhase::CanaryObserving {
                environment,
                percent,
            } => format!("observing canary {environment} at {percent}% of traffic"),
            RolloutPhase::CanaryPromoting {
                environment,
                replicas,
            } => format!("promoting canary {environment} to {replicas} replica(s)"),
            RolloutPhase::Cutover { environment } => {
                format!("switching all traffic to {environment}")
            }
            RolloutPhase::Draining { environment } => format!("draining {environment}"),
            RolloutPhase::Retiring { environment } => format!("deleting {environment}"),
            RolloutPhase::Terminating { environment } => {
                format!("waiting for {environment} to terminate")
            }
        }
    }
}

/// What a successful rollout left behind.
#[derive(Debug, Clone, PartialEq)]
pub struct RolloutReport {
    pub strategy: DeploymentStrategy,
    /// Environment serving the new version.
    pub live_environment: String,
    pub phases: Vec<RolloutPhase>,
    /// Non-fatal problems after cutover.
    pub warnings: Vec<String>,
    pub canary: Option<CanaryVerdict>,
}

/// Everything an executor needs to drive one deployment.
pub struct RolloutContext {
    deployment_id: String,
    request: DeploymentRequest,
    strategy: DeploymentStrategy,
    substrate: Substrate,
    settings: RolloutConfig,
    thresholds: CanaryThresholds,
    cancel: CancelToken,
    logger: DeploymentLogger,
    names: SlotNames,
    phases: Vec<RolloutPhase>,
    warnings: Vec<String>,
    verdict: Option<CanaryVerdict>,
}

impl RolloutContext {
    pub fn new(
        deployment: &Deployment,
        substrate: Substrate,
        config: &ConductorConfig,
        cancel: CancelToken,
        logger: DeploymentLogger,
    ) -> Self {
        let request = deployment.request.clone();
        Self {
            deployment_id: deployment.id.clone(),
            strategy: deployment.strategy,
            thresholds: config.canary.resolve(request.canary.as_ref()),
            names: SlotNames::for_request(&request),
            request,
            substrate,
            settings: config.rollout.clone(),
            cancel,
            logger,
            phases: Vec::new(),
            warnings: Vec::new(),
            verdict: None,
        }
    }

    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    pub fn request(&self) -> &DeploymentRequest {
        &self.request
    }

    pub fn strategy(&self) -> DeploymentStrategy {
        self.strategy
    }

    pub fn settings(&self) -> &RolloutConfig {
        &self.settings
    }

    pub fn thresholds(&self) -> &CanaryThresholds {
        &self.thresholds
    }

    pub fn names(&self) -> &SlotNames {
        &self.names
    }

    pub fn logger(&self) -> &DeploymentLogger {
        &self.logger
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn scheduler(&self) -> &dyn Scheduler {
        self.substrate.scheduler.as_ref()
    }

    pub fn health(&self) -> HealthEvaluator {
        HealthEvaluator::new(self.substrate.probe.clone())
    }

    pub fn canary(&self) -> CanaryEvaluator {
        CanaryEvaluator::new(self.substrate.probe.clone(), self.settings.canary_sample_interval)
    }

    /// Record and announce the next step.
    pub async fn enter(&mut self, phase: RolloutPhase) {
        debug!(deployment_id = %self.deployment_id, ?phase, "rollout phase");
        self.logger.info(phase.describe()).await;
        self.phases.push(phase);
    }

    /// Run a scheduler call unless the deployment is cancelled first.
    pub async fn call<T>(&self, fut: impl Future<Output = SubstrateResult<T>>) -> RolloutResult<T> {
        Ok(self.cancel.run(fut).await??)
    }

    /// Like [`call`](Self::call), also failing once `timeout` elapses even
    /// if the scheduler ignores its own deadline.
    pub async fn bounded<T>(
        &self,
        operation: &'static str,
        environment: &str,
        timeout: Duration,
        fut: impl Future<Output = SubstrateResult<T>>,
    ) -> RolloutResult<T> {
        match self.cancel.run(tokio::time::timeout(timeout, fut)).await? {
            Ok(result) => Ok(result?),
            Err(_) => Err(RolloutError::Timeout {
                operation,
                environment: environment.to_string(),
            }),
        }
    }

    /// Environment spec carrying this request at `replicas`.
    pub fn environment_spec(&self, name: &str, replicas: u32) -> EnvironmentSpec {
        let request = &self.request;
        let labels = [
            ("conductor.io/service", request.service.as_str()),
            ("conductor.io/environment", request.environment.as_str()),
            ("conductor.io/version", request.version.as_str()),
            ("conductor.io/deployment", self.deployment_id.as_str()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        EnvironmentSpec {
            name: name.to_string(),
            image: request.image_ref(),
            replicas,
            resources: request.resources.clone(),
            env: request.env.clone(),
            manifests: request.manifests.clone(),
            labels,
        }
    }

    /// Remove a staging environment left behind by an interrupted rollout.
    pub async fn clear_stale(&mut self, environment: &str) -> RolloutResult<()> {
        if self.call(self.scheduler().replicas(environment)).await?.is_none() {
            return Ok(());
        }
        self.logger
            .warn(format!("{environment} left over from an earlier rollout, removing it"))
            .await;
        self.call(self.scheduler().delete_environment(environment))
            .await?;
        self.await_termination(environment).await
    }

    /// Create `environment` running the new version at `replicas`.
    ///
    /// If the create may have gone through before failing (cancelled,
    /// timed out, scheduler unreachable), the environment is discarded.
    pub async fn provision(&mut self, environment: &str, replicas: u32) -> RolloutResult<()> {
        self.enter(RolloutPhase::Staging {
            environment: environment.to_string(),
            replicas,
        })
        .await;
        let spec = self.environment_spec(environment, replicas);
        let result = self.call(self.scheduler().create_environment(&spec)).await;
        if let Err(e) = &result {
            // A rejected create left nothing behind.
            if !matches!(e, RolloutError::Substrate(SubstrateError::Rejected { .. })) {
                self.discard(environment).await;
            }
        }
        result
    }

    /// Block until the scheduler reports `environment` ready.
    pub async fn await_ready(&mut self, environment: &str) -> RolloutResult<()> {
        self.enter(RolloutPhase::ReadinessGate {
            environment: environment.to_string(),
        })
        .await;
        let timeout = self.settings.readiness_timeout;
        self.bounded(
            "wait_for_ready",
            environment,
            timeout,
            self.scheduler().wait_for_ready(environment, timeout),
        )
        .await
    }

    /// Block until `environment` is fully gone.
    pub async fn await_termination(&mut self, environment: &str) -> RolloutResult<()> {
        self.enter(RolloutPhase::Terminating {
            environment: environment.to_string(),
        })
        .await;
        let timeout = self.settings.termination_timeout;
        self.bounded(
            "wait_for_termination",
            environment,
            timeout,
            self.scheduler().wait_for_termination(environment, timeout),
        )
        .await
    }

    /// Send all of the route's traffic to `environment`.
    pub async fn route_all(&self, environment: &str) -> SubstrateResult<()> {
        self.scheduler()
            .route_traffic(self.names.route(), &[TrafficWeight::new(environment, 100)])
            .await
    }

    /// Best-effort removal of an environment this rollout created and is
    /// abandoning. Runs even when cancelled.
    pub async fn discard(&self, environment: &str) {
        match self.scheduler().delete_environment(environment).await {
            Ok(()) => {
                self.logger
                    .info(format!("removed {environment} after failed rollout"))
                    .await
            }
            Err(SubstrateError::NotFound(_)) => {
                debug!(deployment_id = %self.deployment_id, %environment, "nothing to remove");
            }
            Err(e) => {
                self.logger
                    .warn(format!("could not remove {environment}: {e}"))
                    .await
            }
        }
    }

    /// Delete the outgoing environment after cutover. Failure leaves the
    /// new version serving and is only recorded as a warning.
    pub async fn retire(&mut self, environment: &str) {
        self.enter(RolloutPhase::Retiring {
            environment: environment.to_string(),
        })
        .await;
        let result = self.scheduler().delete_environment(environment).await;
        if let Err(e) = result {
            self.warn(format!("old environment {environment} not deleted: {e}"))
                .await;
        }
    }

    pub async fn warn(&mut self, message: String) {
        self.logger.warn(message.clone()).await;
        self.warnings.push(message);
    }

    pub fn record_verdict(&mut self, verdict: CanaryVerdict) {
        self.verdict = Some(verdict);
    }

    /// Close out a successful rollout.
    pub fn finish(&mut self, live_environment: String) -> RolloutReport {
        RolloutReport {
            strategy: self.strategy,
            live_environment,
            phases: std::mem::take(&mut self.phases),
            warnings: std::mem::take(&mut self.warnings),
            canary: self.verdict.take(),
        }
    }
}
