use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use conductor_core::{
    CanaryMetrics, EnvironmentSpec, HealthProbe, Notifier, Registry, Scheduler, Substrate,
    SubstrateError, SubstrateResult, TrafficWeight,
};

/// Matches every target of an operation in `fail_on` and `stall`.
const ANY: &str = "*";

/// An environment as the simulated scheduler sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct SimEnvironment {
    pub name: String,
    pub image: String,
    pub replicas: u32,
    pub labels: BTreeMap<String, String>,
}

/// One recorded collaborator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimCall {
    pub operation: &'static str,
    pub target: String,
}

#[derive(Default)]
struct SimState {
    environments: BTreeMap<String, SimEnvironment>,
    created_replicas: BTreeMap<String, u32>,
    routes: BTreeMap<String, Vec<TrafficWeight>>,
    route_history: BTreeMap<String, Vec<Vec<TrafficWeight>>>,
    missing_images: BTreeSet<String>,
    broken_images: BTreeSet<String>,
    degraded_images: BTreeSet<String>,
    unhealthy: BTreeSet<String>,
    metrics: BTreeMap<String, CanaryMetrics>,
    failures: BTreeSet<(&'static str, String)>,
    stalls: BTreeSet<(&'static str, String)>,
    panics: BTreeSet<(&'static str, String)>,
    calls: Vec<SimCall>,
    notifications: Vec<String>,
    latency: Duration,
}

fn injected(set: &BTreeSet<(&'static str, String)>, operation: &'static str, target: &str) -> bool {
    set.contains(&(operation, target.to_string())) || set.contains(&(operation, ANY.to_string()))
}

/// Metrics every environment reports unless told otherwise.
fn healthy_metrics() -> CanaryMetrics {
    CanaryMetrics {
        error_rate: 0.5,
        average_response_time_ms: 120.0,
        request_count: 1_000,
        sample_duration: Duration::from_secs(30),
    }
}

/// Metrics reported by environments running a degraded image.
fn degraded_metrics() -> CanaryMetrics {
    CanaryMetrics {
        error_rate: 25.0,
        average_response_time_ms: 2_400.0,
        request_count: 1_000,
        sample_duration: Duration::from_secs(30),
    }
}

/// Simulated cluster. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct SimCluster {
    state: Arc<RwLock<SimState>>,
}

impl SimCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// All four collaborators backed by this cluster.
    pub fn substrate(&self) -> Substrate {
        let shared = Arc::new(self.clone());
        Substrate::new(shared.clone(), shared.clone(), shared.clone(), shared)
    }

    // ── Setup ─────────────────────────────────────────────────────

    /// Add a running environment without recording a call.
    pub async fn seed_environment(&self, name: &str, image: &str, replicas: u32) {
        let mut state = self.state.write().await;
        state.environments.insert(
            name.to_string(),
            SimEnvironment {
                name: name.to_string(),
                image: image.to_string(),
                replicas,
                labels: BTreeMap::new(),
            },
        );
    }

    /// Point a route entirely at one environment without recording a call.
    pub async fn route_to(&self, route: &str, environment: &str) {
        let mut state = self.state.write().await;
        state
            .routes
            .insert(route.to_string(), vec![TrafficWeight::new(environment, 100)]);
    }

    /// Make the registry report `image:tag` as absent.
    pub async fn remove_image(&self, image: &str, tag: &str) {
        self.state
            .write()
            .await
            .missing_images
            .insert(format!("{image}:{tag}"));
    }

    /// Make environments running `image_ref` fail to be created or updated.
    pub async fn break_image(&self, image_ref: &str) {
        self.state
            .write()
            .await
            .broken_images
            .insert(image_ref.to_string());
    }

    /// Make environments running `image_ref` start fine but fail health
    /// probes and report canary metrics far outside any sane threshold.
    pub async fn degrade_image(&self, image_ref: &str) {
        self.state
            .write()
            .await
            .degraded_images
            .insert(image_ref.to_string());
    }

    pub async fn set_healthy(&self, environment: &str, healthy: bool) {
        let mut state = self.state.write().await;
        if healthy {
            state.unhealthy.remove(environment);
        } else {
            state.unhealthy.insert(environment.to_string());
        }
    }

    pub async fn set_metrics(&self, environment: &str, metrics: CanaryMetrics) {
        self.state
            .write()
            .await
            .metrics
            .insert(environment.to_string(), metrics);
    }

    /// Make `operation` on `target` (or `"*"`) fail with `Rejected`.
    pub async fn fail_on(&self, operation: &'static str, target: &str) {
        self.state
            .write()
            .await
            .failures
            .insert((operation, target.to_string()));
    }

    /// Make `operation` on `target` (or `"*"`) hang. Waits honor their
    /// timeout; everything else hangs until dropped.
    pub async fn stall(&self, operation: &'static str, target: &str) {
        self.state
            .write()
            .await
            .stalls
            .insert((operation, target.to_string()));
    }

    /// Make `operation` on `target` (or `"*"`) panic.
    pub async fn panic_on(&self, operation: &'static str, target: &str) {
        self.state
            .write()
            .await
            .panics
            .insert((operation, target.to_string()));
    }

    /// Delay applied to every call.
    pub async fn set_latency(&self, latency: Duration) {
        self.state.write().await.latency = latency;
    }

    // ── Inspection ────────────────────────────────────────────────

    pub async fn environment(&self, name: &str) -> Option<SimEnvironment> {
        self.state.read().await.environments.get(name).cloned()
    }

    pub async fn environments(&self) -> Vec<String> {
        self.state.read().await.environments.keys().cloned().collect()
    }

    /// Replica count an environment was created with.
    pub async fn created_replicas(&self, name: &str) -> Option<u32> {
        self.state.read().await.created_replicas.get(name).copied()
    }

    pub async fn route(&self, route: &str) -> Option<Vec<TrafficWeight>> {
        self.state.read().await.routes.get(route).cloned()
    }

    /// Every weight set applied to a route, oldest first.
    pub async fn route_history(&self, route: &str) -> Vec<Vec<TrafficWeight>> {
        self.state
            .read()
            .await
            .route_history
            .get(route)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn calls(&self) -> Vec<SimCall> {
        self.state.read().await.calls.clone()
    }

    /// Targets of every call to `operation`, in order.
    pub async fn calls_to(&self, operation: &str) -> Vec<String> {
        self.state
            .read()
            .await
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .map(|c| c.target.clone())
            .collect()
    }

    pub async fn notifications(&self) -> Vec<String> {
        self.state.read().await.notifications.clone()
    }

    // ── Call plumbing ─────────────────────────────────────────────

    /// Record a call and apply injected latency and failures. Returns
    /// whether the call should stall.
    async fn begin(&self, operation: &'static str, target: &str) -> SubstrateResult<bool> {
        let (latency, stalled, failed, panics) = {
            let mut state = self.state.write().await;
            state.calls.push(SimCall {
                operation,
                target: target.to_string(),
            });
            (
                state.latency,
                injected(&state.stalls, operation, target),
                injected(&state.failures, operation, target),
                injected(&state.panics, operation, target),
            )
        };
        debug!(operation, %target, "sim call");
        if panics {
            panic!("injected panic in {operation} on {target}");
        }

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if failed {
            return Err(SubstrateError::Rejected {
                operation,
                message: format!("injected failure on {target}"),
            });
        }
        Ok(stalled)
    }

    /// Body of the `wait_for_*` calls.
    async fn wait(
        &self,
        operation: &'static str,
        name: &str,
        timeout: Duration,
        done: impl Fn(&SimState) -> Option<SubstrateResult<()>>,
    ) -> SubstrateResult<()> {
        let stalled = self.begin(operation, name).await?;
        if !stalled {
            if let Some(result) = done(&*self.state.read().await) {
                return result;
            }
        }
        tokio::time::sleep(timeout).await;
        Err(SubstrateError::Timeout {
            operation,
            target: name.to_string(),
            timeout,
        })
    }

    async fn hang_if(&self, stalled: bool) {
        if stalled {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl Scheduler for SimCluster {
    async fn validate_manifests(&self, manifests: &[String]) -> SubstrateResult<Vec<String>> {
        let stalled = self.begin("validate_manifests", ANY).await?;
        self.hang_if(stalled).await;
        Ok(manifests
            .iter()
            .enumerate()
            .filter(|(_, m)| !m.contains("kind:"))
            .map(|(i, _)| format!("manifest {i}: missing `kind`"))
            .collect())
    }

    async fn replicas(&self, name: &str) -> SubstrateResult<Option<u32>> {
        let stalled = self.begin("replicas", name).await?;
        self.hang_if(stalled).await;
        Ok(self
            .state
            .read()
            .await
            .environments
            .get(name)
            .map(|e| e.replicas))
    }

    async fn create_environment(&self, spec: &EnvironmentSpec) -> SubstrateResult<()> {
        let stalled = self.begin("create_environment", &spec.name).await?;
        self.hang_if(stalled).await;
        let mut state = self.state.write().await;
        check_image(&state, "create_environment", &spec.image)?;
        if state.environments.contains_key(&spec.name) {
            return Err(SubstrateError::Rejected {
                operation: "create_environment",
                message: format!("{} already exists", spec.name),
            });
        }
        state.environments.insert(
            spec.name.clone(),
            SimEnvironment {
                name: spec.name.clone(),
                image: spec.image.clone(),
                replicas: spec.replicas,
                labels: spec.labels.clone(),
            },
        );
        state.created_replicas.insert(spec.name.clone(), spec.replicas);
        Ok(())
    }

    async fn update_environment(&self, spec: &EnvironmentSpec) -> SubstrateResult<()> {
        let stalled = self.begin("update_environment", &spec.name).await?;
        self.hang_if(stalled).await;
        let mut state = self.state.write().await;
        check_image(&state, "update_environment", &spec.image)?;
        let env = state
            .environments
            .get_mut(&spec.name)
            .ok_or_else(|| SubstrateError::NotFound(spec.name.clone()))?;
        env.image = spec.image.clone();
        env.replicas = spec.replicas;
        env.labels = spec.labels.clone();
        Ok(())
    }

    async fn delete_environment(&self, name: &str) -> SubstrateResult<()> {
        let stalled = self.begin("delete_environment", name).await?;
        self.hang_if(stalled).await;
        self.state
            .write()
            .await
            .environments
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| SubstrateError::NotFound(name.to_string()))
    }

    async fn wait_for_rollout(&self, name: &str, timeout: Duration) -> SubstrateResult<()> {
        self.wait("wait_for_rollout", name, timeout, |s| {
            Some(exists(s, name))
        })
        .await
    }

    async fn wait_for_ready(&self, name: &str, timeout: Duration) -> SubstrateResult<()> {
        self.wait("wait_for_ready", name, timeout, |s| Some(exists(s, name)))
            .await
    }

    async fn wait_for_termination(&self, name: &str, timeout: Duration) -> SubstrateResult<()> {
        // Still present means it never finishes terminating.
        self.wait("wait_for_termination", name, timeout, |s| {
            (!s.environments.contains_key(name)).then_some(Ok(()))
        })
        .await
    }

    async fn route_traffic(&self, route: &str, weights: &[TrafficWeight]) -> SubstrateResult<()> {
        let stalled = self.begin("route_traffic", route).await?;
        self.hang_if(stalled).await;

        let total: u32 = weights.iter().map(|w| u32::from(w.percent)).sum();
        if total != 100 {
            return Err(SubstrateError::Rejected {
                operation: "route_traffic",
                message: format!("weights on {route} sum to {total}, not 100"),
            });
        }

        let mut state = self.state.write().await;
        if let Some(missing) = weights
            .iter()
            .find(|w| !state.environments.contains_key(&w.environment))
        {
            return Err(SubstrateError::NotFound(missing.environment.clone()));
        }
        state.routes.insert(route.to_string(), weights.to_vec());
        state
            .route_history
            .entry(route.to_string())
            .or_default()
            .push(weights.to_vec());
        Ok(())
    }

    async fn scale(&self, name: &str, replicas: u32) -> SubstrateResult<()> {
        let stalled = self.begin("scale", name).await?;
        self.hang_if(stalled).await;
        let mut state = self.state.write().await;
        let env = state
            .environments
            .get_mut(name)
            .ok_or_else(|| SubstrateError::NotFound(name.to_string()))?;
        env.replicas = replicas;
        Ok(())
    }
}

fn check_image(state: &SimState, operation: &'static str, image: &str) -> SubstrateResult<()> {
    if state.broken_images.contains(image) {
        return Err(SubstrateError::Rejected {
            operation,
            message: format!("{image} crashed on start"),
        });
    }
    Ok(())
}

fn exists(state: &SimState, name: &str) -> SubstrateResult<()> {
    if state.environments.contains_key(name) {
        Ok(())
    } else {
        Err(SubstrateError::NotFound(name.to_string()))
    }
}

#[async_trait]
impl Registry for SimCluster {
    async fn image_exists(&self, image: &str, tag: &str) -> SubstrateResult<bool> {
        let reference = format!("{image}:{tag}");
        let stalled = self.begin("image_exists", &reference).await?;
        self.hang_if(stalled).await;
        Ok(!self.state.read().await.missing_images.contains(&reference))
    }
}

#[async_trait]
impl HealthProbe for SimCluster {
    async fn probe(&self, environment: &str, _path: &str, timeout: Duration) -> SubstrateResult<bool> {
        if self.begin("probe", environment).await? {
            tokio::time::sleep(timeout).await;
            return Err(SubstrateError::Timeout {
                operation: "probe",
                target: environment.to_string(),
                timeout,
            });
        }
        let state = self.state.read().await;
        let env = state
            .environments
            .get(environment)
            .ok_or_else(|| SubstrateError::NotFound(environment.to_string()))?;
        Ok(!state.unhealthy.contains(environment) && !state.degraded_images.contains(&env.image))
    }

    async fn sample_metrics(&self, environment: &str) -> SubstrateResult<CanaryMetrics> {
        let stalled = self.begin("sample_metrics", environment).await?;
        self.hang_if(stalled).await;
        let state = self.state.read().await;
        let env = state
            .environments
            .get(environment)
            .ok_or_else(|| SubstrateError::NotFound(environment.to_string()))?;
        if let Some(metrics) = state.metrics.get(environment) {
            return Ok(metrics.clone());
        }
        if state.degraded_images.contains(&env.image) {
            return Ok(degraded_metrics());
        }
        Ok(healthy_metrics())
    }
}

#[async_trait]
impl Notifier for SimCluster {
    async fn notify(&self, message: &str) -> SubstrateResult<()> {
        let stalled = self.begin("notify", ANY).await?;
        self.hang_if(stalled).await;
        self.state
            .write()
            .await
            .notifications
            .push(message.to_string());
        Ok(())
    }
}
