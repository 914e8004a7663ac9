//! Orchestrator — accepts deployments and owns their execution tasks.
//!
//! `create` validates, records a PENDING deployment and spawns one task per
//! deployment, returning without waiting for the rollout. The task moves
//! the record to IN_PROGRESS, runs the resolved strategy in a nested task
//! (so a panic surfaces as a `JoinError` instead of tearing anything else
//! down), records the outcome, notifies, and triggers auto-rollback.
//!
//! Each running deployment has a `TaskSlot` holding its join handle, its
//! cancel signal and a completion flag.
//!
//! Deployments of the same service to the same environment share scheduler
//! environments and a route, so they run one at a time: a task waits on its
//! route's lane, still PENDING, until the deployment ahead of it has
//! recorded its outcome.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use conductor_core::{
    CancelHandle, CancelToken, ConductorConfig, Deployment, DeploymentFilter, DeploymentId,
    DeploymentRequest, DeploymentStatus, Substrate,
};
use conductor_rollout::{RolloutContext, RolloutError, RolloutReport, SlotNames, resolve_strategy};
use conductor_state::{DeploymentEvent, DeploymentLog, DeploymentStore, EventBus, StateError};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::estimate;
use crate::validator::{ValidationReport, Validator};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Per-deployment execution state.
struct TaskSlot {
    handle: JoinHandle<()>,
    cancel: CancelHandle,
    /// Flips to `true` once the task has recorded its outcome and run any
    /// follow-up (notification dispatch, auto-rollback).
    finished: watch::Receiver<bool>,
}

struct Inner {
    store: DeploymentStore,
    substrate: Substrate,
    config: ConductorConfig,
    validator: Validator,
    tasks: RwLock<HashMap<DeploymentId, TaskSlot>>,
    /// Execution locks keyed by route name.
    lanes: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    closed: AtomicBool,
}

/// How an execution task ended.
enum Outcome {
    Completed(RolloutReport),
    Failed(String),
    Cancelled,
}

/// Deployment orchestrator. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(substrate: Substrate, config: ConductorConfig) -> Self {
        Self::with_store(substrate, config, DeploymentStore::new(EventBus::default()))
    }

    /// Use an existing store (and the event bus it publishes on).
    pub fn with_store(substrate: Substrate, config: ConductorConfig, store: DeploymentStore) -> Self {
        Self {
            inner: Arc::new(Inner {
                validator: Validator::new(substrate.clone()),
                store,
                substrate,
                config,
                tasks: RwLock::new(HashMap::new()),
                lanes: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ConductorConfig {
        &self.inner.config
    }

    /// Validate and accept a deployment. Returns as soon as the record is
    /// stored and its execution task is scheduled.
    pub async fn create(&self, request: DeploymentRequest) -> OrchestratorResult<DeploymentId> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ShuttingDown);
        }
        let report = self.inner.validator.validate(&request).await;
        if !report.is_valid {
            warn!(
                service = %request.service,
                version = %request.version,
                errors = ?report.errors,
                "deployment rejected"
            );
            return Err(OrchestratorError::Validation(report));
        }

        let id = Uuid::now_v7().to_string();
        let strategy = resolve_strategy(&request);
        let previous_version = self
            .inner
            .store
            .latest_completed_version(&request.service, &request.environment)
            .await;

        info!(
            deployment_id = %id,
            service = %request.service,
            version = %request.version,
            environment = %request.environment,
            %strategy,
            previous_version = ?previous_version,
            rollback = request.rollback,
            "deployment accepted"
        );

        let route = SlotNames::for_request(&request).route().to_string();
        let deployment = Deployment::pending(id.clone(), request, strategy, previous_version);

        // `shutdown` closes before draining the task table, so under its
        // lock a task is either registered in time to be drained or the
        // close is visible here.
        let mut tasks = self.inner.tasks.write().await;
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ShuttingDown);
        }
        self.inner.store.insert(deployment).await?;
        let slot = spawn(&self.inner, &id, route);
        tasks.insert(id.clone(), slot);
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> OrchestratorResult<Deployment> {
        self.inner
            .store
            .get(id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))
    }

    /// Deployments matching `filter`, newest first.
    pub async fn list(&self, filter: &DeploymentFilter) -> Vec<Deployment> {
        self.inner.store.list(filter).await
    }

    /// Redeploy an earlier version as a new deployment.
    ///
    /// `target_version` defaults to the source's previous version. The
    /// source must have completed or failed; it is never modified.
    pub async fn rollback(
        &self,
        id: &str,
        target_version: Option<String>,
    ) -> OrchestratorResult<DeploymentId> {
        let source = self.get(id).await?;
        if !matches!(
            source.status,
            DeploymentStatus::Completed | DeploymentStatus::Failed
        ) {
            return Err(OrchestratorError::InvalidState {
                id: id.to_string(),
                status: source.status,
                operation: "roll back",
            });
        }

        let version = target_version
            .or_else(|| source.previous_version.clone())
            .ok_or_else(|| OrchestratorError::NoPreviousVersion(id.to_string()))?;

        info!(deployment_id = %id, from = %source.version(), to = %version, "rolling back");
        let mut request = source.request;
        request.version = version;
        request.rollback = true;
        self.create(request).await
    }

    /// Cancel a deployment that has not reached a terminal status.
    ///
    /// The record becomes CANCELLED immediately; the execution task is
    /// signalled and removes whatever it staged.
    pub async fn cancel(&self, id: &str) -> OrchestratorResult<Deployment> {
        let current = self.get(id).await?;
        if current.is_terminal() {
            return Err(OrchestratorError::InvalidState {
                id: id.to_string(),
                status: current.status,
                operation: "cancel",
            });
        }

        let deployment = match self
            .inner
            .store
            .transition(id, DeploymentStatus::Cancelled, Some("cancelled by user".to_string()))
            .await
        {
            Ok(d) => d,
            // Finished between the read and the transition.
            Err(StateError::InvalidTransition { from, .. }) => {
                return Err(OrchestratorError::InvalidState {
                    id: id.to_string(),
                    status: from,
                    operation: "cancel",
                });
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(slot) = self.inner.tasks.read().await.get(id) {
            slot.cancel.cancel();
        }
        info!(deployment_id = %id, "deployment cancelled");
        Ok(deployment)
    }

    /// Rough rollout duration for progress display.
    pub fn estimate_time(&self, request: &DeploymentRequest) -> Duration {
        estimate::estimate(request, resolve_strategy(request), &self.inner.config.estimate)
    }

    /// Run pre-flight checks without creating anything.
    pub async fn validate(&self, request: &DeploymentRequest) -> ValidationReport {
        self.inner.validator.validate(request).await
    }

    /// Lifecycle events of a deployment from now on.
    pub async fn subscribe_events(
        &self,
        id: &str,
    ) -> OrchestratorResult<broadcast::Receiver<DeploymentEvent>> {
        self.ensure_exists(id).await?;
        let events = self.inner.store.bus().subscribe_events(id).await;
        self.release_if_finished(id).await;
        Ok(events)
    }

    /// Log lines of a deployment from now on.
    pub async fn subscribe_logs(
        &self,
        id: &str,
    ) -> OrchestratorResult<broadcast::Receiver<DeploymentLog>> {
        self.ensure_exists(id).await?;
        let logs = self.inner.store.bus().subscribe_logs(id).await;
        self.release_if_finished(id).await;
        Ok(logs)
    }

    /// Ids of deployments whose execution task is still running.
    pub async fn active_tasks(&self) -> Vec<DeploymentId> {
        let mut ids: Vec<_> = self.inner.tasks.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Wait until a deployment's execution task has finished, including its
    /// auto-rollback hand-off, and return the final record.
    pub async fn wait(&self, id: &str) -> OrchestratorResult<Deployment> {
        let finished = self
            .inner
            .tasks
            .read()
            .await
            .get(id)
            .map(|slot| slot.finished.clone());
        if let Some(mut finished) = finished {
            // A dropped sender means the task is gone either way.
            let _ = finished.wait_for(|done| *done).await;
        }
        self.get(id).await
    }

    /// Cancel every running task and wait for all of them to exit.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let slots: Vec<(DeploymentId, TaskSlot)> = self.inner.tasks.write().await.drain().collect();
        info!(tasks = slots.len(), "orchestrator shutting down");

        for (_, slot) in &slots {
            slot.cancel.cancel();
        }
        for (id, slot) in slots {
            if let Err(e) = slot.handle.await {
                warn!(deployment_id = %id, error = %e, "execution task ended abnormally");
            }
        }
        info!("orchestrator stopped");
    }

    async fn ensure_exists(&self, id: &str) -> OrchestratorResult<()> {
        if self.inner.store.contains(id).await {
            Ok(())
        } else {
            Err(OrchestratorError::NotFound(id.to_string()))
        }
    }

    /// A subscription opened after the terminal event would otherwise keep
    /// the deployment's channels alive forever.
    async fn release_if_finished(&self, id: &str) {
        let terminal = self
            .inner
            .store
            .get(id)
            .await
            .is_some_and(|d| d.is_terminal());
        if terminal {
            self.inner.store.bus().finish(id).await;
        }
    }
}

/// Start a deployment's execution task. The caller holds the task table's
/// write lock until the slot is inserted, so the task cannot deregister
/// before it is registered.
fn spawn(inner: &Arc<Inner>, id: &str, route: String) -> TaskSlot {
    let cancel = CancelHandle::new();
    let (finished_tx, finished) = watch::channel(false);
    let handle = tokio::spawn(run_deployment(
        inner.clone(),
        id.to_string(),
        route,
        cancel.token(),
        finished_tx,
    ));
    TaskSlot {
        handle,
        cancel,
        finished,
    }
}

/// Body of a deployment's execution task.
async fn run_deployment(
    inner: Arc<Inner>,
    id: DeploymentId,
    route: String,
    cancel: CancelToken,
    finished: watch::Sender<bool>,
) {
    let lane = route_lane(&inner, &route).await;
    match take_turn(&inner, &id, &route, &lane, &cancel).await {
        Some(_turn) => match inner
            .store
            .transition(&id, DeploymentStatus::InProgress, None)
            .await
        {
            Ok(deployment) => {
                let outcome = execute(&inner, &deployment, &cancel).await;
                record(&inner, &deployment, outcome).await;
            }
            Err(e) => debug!(deployment_id = %id, error = %e, "deployment not started"),
        },
        None => abandon(&inner, &id).await,
    }
    release_lane(&inner, &route, lane).await;

    inner.tasks.write().await.remove(&id);
    let _ = finished.send(true);
}

async fn route_lane(inner: &Inner, route: &str) -> Arc<Mutex<()>> {
    inner
        .lanes
        .lock()
        .await
        .entry(route.to_string())
        .or_default()
        .clone()
}

/// Wait until no other deployment is executing on `route`. `None` if
/// cancelled while waiting.
async fn take_turn(
    inner: &Inner,
    id: &str,
    route: &str,
    lane: &Arc<Mutex<()>>,
    cancel: &CancelToken,
) -> Option<OwnedMutexGuard<()>> {
    if let Ok(turn) = lane.clone().try_lock_owned() {
        return Some(turn);
    }
    debug!(deployment_id = %id, %route, "queued behind another deployment");
    inner
        .store
        .bus()
        .logger(id)
        .info(format!("waiting for the running deployment of {route} to finish"))
        .await;
    cancel.run(lane.clone().lock_owned()).await.ok()
}

/// Drop the lane once nobody else holds or waits on it.
async fn release_lane(inner: &Inner, route: &str, lane: Arc<Mutex<()>>) {
    let mut lanes = inner.lanes.lock().await;
    drop(lane);
    if lanes.get(route).is_some_and(|l| Arc::strong_count(l) == 1) {
        lanes.remove(route);
    }
}

/// A deployment cancelled while queued never started.
async fn abandon(inner: &Inner, id: &str) {
    match inner
        .store
        .transition(id, DeploymentStatus::Cancelled, Some("execution cancelled".to_string()))
        .await
    {
        Ok(_) => info!(deployment_id = %id, "queued deployment cancelled during shutdown"),
        // Cancelled by the user, which woke the wait.
        Err(e) => debug!(deployment_id = %id, error = %e, "queued deployment dropped"),
    }
}

async fn execute(inner: &Arc<Inner>, deployment: &Deployment, cancel: &CancelToken) -> Outcome {
    let logger = inner.store.bus().logger(&deployment.id);
    logger
        .info(format!(
            "starting {} rollout of {} {} to {}",
            deployment.strategy,
            deployment.service(),
            deployment.version(),
            deployment.environment()
        ))
        .await;

    let mut ctx = RolloutContext::new(
        deployment,
        inner.substrate.clone(),
        &inner.config,
        cancel.clone(),
        logger,
    );
    let joined = tokio::spawn(async move { conductor_rollout::execute(&mut ctx).await }).await;

    match joined {
        Ok(Ok(report)) => Outcome::Completed(report),
        Ok(Err(RolloutError::Cancelled)) => Outcome::Cancelled,
        Ok(Err(e)) => Outcome::Failed(e.to_string()),
        Err(e) if e.is_panic() => Outcome::Failed("execution panicked".to_string()),
        Err(_) => Outcome::Cancelled,
    }
}

/// Store the outcome, notify, and start auto-rollback when asked to.
async fn record(inner: &Arc<Inner>, deployment: &Deployment, outcome: Outcome) {
    let id = deployment.id.as_str();
    let logger = inner.store.bus().logger(id);
    let (status, error) = match &outcome {
        Outcome::Completed(_) => (DeploymentStatus::Completed, None),
        Outcome::Failed(message) => (DeploymentStatus::Failed, Some(message.clone())),
        Outcome::Cancelled => (DeploymentStatus::Cancelled, Some("execution cancelled".to_string())),
    };

    let stored = match inner.store.transition(id, status, error).await {
        Ok(stored) => stored,
        Err(e) => {
            // Cancelled by the user while the executor was still unwinding.
            debug!(deployment_id = %id, error = %e, "outcome not recorded");
            logger.info("rollout stopped after cancellation").await;
            return;
        }
    };

    match outcome {
        Outcome::Completed(report) => {
            info!(
                deployment_id = %id,
                live = %report.live_environment,
                warnings = report.warnings.len(),
                "deployment completed"
            );
            logger
                .info(format!("{} now serving {}", report.live_environment, stored.version()))
                .await;
            notify(
                inner,
                format!(
                    "Deployment {id} of {} {} to {} completed",
                    stored.service(),
                    stored.version(),
                    stored.environment()
                ),
            );
        }
        Outcome::Failed(message) => {
            error!(deployment_id = %id, error = %message, "deployment failed");
            logger.error(format!("rollout failed: {message}")).await;
            notify(
                inner,
                format!(
                    "Deployment {id} of {} {} to {} failed: {message}",
                    stored.service(),
                    stored.version(),
                    stored.environment()
                ),
            );
            if stored.request.auto_rollback {
                auto_rollback(inner.clone(), stored).await;
            }
        }
        Outcome::Cancelled => info!(deployment_id = %id, "deployment cancelled during shutdown"),
    }
}

/// Deliver a notification without holding up the caller.
fn notify(inner: &Inner, message: String) {
    let notifier = inner.substrate.notifier.clone();
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&message).await {
            warn!(error = %e, "notification not delivered");
        }
    });
}

/// Roll a failed deployment back to its previous version, once.
///
/// Boxed because it re-enters `create`, which spawns another
/// `run_deployment`.
fn auto_rollback(inner: Arc<Inner>, failed: Deployment) -> BoxFuture {
    Box::pin(async move {
        let id = failed.id.clone();
        if failed.request.rollback {
            warn!(deployment_id = %id, "rollback deployment failed, not rolling back again");
            return;
        }
        if inner.closed.load(Ordering::SeqCst) {
            debug!(deployment_id = %id, "shutting down, auto-rollback skipped");
            return;
        }
        let Some(previous) = failed.previous_version.clone() else {
            warn!(deployment_id = %id, "auto-rollback skipped, no previous version");
            return;
        };

        let orchestrator = Orchestrator { inner };
        match orchestrator.rollback(&id, Some(previous.clone())).await {
            Ok(rollback_id) => {
                info!(deployment_id = %id, %rollback_id, version = %previous, "auto-rollback started");
            }
            Err(e) => error!(deployment_id = %id, error = %e, "auto-rollback failed"),
        }
    })
}
