//! Orchestrator integration tests against the simulated cluster.
//!
//! Every test drives the public API only: create, wait for the execution
//! task, then inspect records, events and the simulated substrate.

use std::time::Duration;

use conductor_core::{
    CanaryConfig, ConductorConfig, Deployment, DeploymentFilter, DeploymentRequest,
    DeploymentStatus, DeploymentStrategy, TrafficWeight,
};
use conductor_engine::estimate::estimate;
use conductor_engine::{Orchestrator, OrchestratorError};
use conductor_sim::{SimCluster, sample_request};
use conductor_state::{DeploymentStore, EventBus, EventKind};

fn fast_config() -> ConductorConfig {
    let mut config = ConductorConfig::default();
    config.rollout.rollout_timeout = Duration::from_secs(2);
    config.rollout.readiness_timeout = Duration::from_secs(2);
    config.rollout.termination_timeout = Duration::from_secs(2);
    config.rollout.blue_green_grace = Duration::from_millis(5);
    config.rollout.canary_sample_interval = Duration::from_millis(5);
    config.canary.monitoring_duration = Duration::from_millis(20);
    config
}

fn orchestrator(sim: &SimCluster) -> Orchestrator {
    Orchestrator::new(sim.substrate(), fast_config())
}

async fn deploy(orch: &Orchestrator, request: DeploymentRequest) -> Deployment {
    let id = orch.create(request).await.unwrap();
    orch.wait(&id).await.unwrap()
}

async fn wait_for_status(orch: &Orchestrator, id: &str, status: DeploymentStatus) {
    for _ in 0..200 {
        if orch.get(id).await.unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{id} never reached {status}");
}

fn assert_completion_invariant(d: &Deployment) {
    assert_eq!(d.completed_at.is_some(), d.status.is_terminal(), "{d:?}");
}

// ── create / validation ───────────────────────────────────────────

#[tokio::test]
async fn invalid_request_creates_nothing_and_reports_every_error() {
    let sim = SimCluster::new();
    let orch = orchestrator(&sim);
    let mut request = sample_request("api", "prod", "2.0");
    request.version = String::new();
    request.resources.memory_mb = 0;
    request.resources.storage_mb = 0;

    let err = orch.create(request).await.unwrap_err();

    let OrchestratorError::Validation(report) = err else {
        panic!("expected validation error, got {err:?}");
    };
    assert!(!report.is_valid);
    assert_eq!(
        report.errors,
        vec![
            "version is required",
            "memory must be greater than zero",
            "storage must be greater than zero",
        ]
    );
    assert!(orch.list(&DeploymentFilter::All).await.is_empty());
    assert!(sim.calls_to("create_environment").await.is_empty());
}

#[tokio::test]
async fn create_returns_before_rollout_finishes() {
    let sim = SimCluster::new();
    sim.stall("wait_for_rollout", "*").await;
    let orch = orchestrator(&sim);

    let id = orch.create(sample_request("api", "dev", "1.0")).await.unwrap();

    let record = orch.get(&id).await.unwrap();
    assert!(!record.is_terminal());
    assert_eq!(record.strategy, DeploymentStrategy::RollingUpdate);
    assert_eq!(orch.active_tasks().await, vec![id.clone()]);
    orch.shutdown().await;
}

#[tokio::test]
async fn production_request_resolves_to_blue_green() {
    let sim = SimCluster::new();
    let orch = orchestrator(&sim);

    let done = deploy(&orch, sample_request("api", "prod", "2.0")).await;

    assert_eq!(done.strategy, DeploymentStrategy::BlueGreen);
    assert_eq!(done.status, DeploymentStatus::Completed);
    assert_completion_invariant(&done);
    assert!(done.error.is_none());
}

#[tokio::test]
async fn staging_with_canary_config_resolves_to_canary_of_one_replica() {
    let sim = SimCluster::new();
    sim.seed_environment("api-staging-blue", "registry.local/api:1.9", 4).await;
    sim.route_to("api-staging", "api-staging-blue").await;
    let orch = orchestrator(&sim);
    let mut request = sample_request("api", "staging", "2.0");
    request.canary = Some(CanaryConfig {
        monitoring_duration: Some(Duration::from_millis(20)),
        ..Default::default()
    });

    let done = deploy(&orch, request).await;

    assert_eq!(done.strategy, DeploymentStrategy::Canary);
    assert_eq!(done.status, DeploymentStatus::Completed);
    assert_eq!(sim.created_replicas("api-staging-green").await, Some(1));
    assert_eq!(sim.environment("api-staging-green").await.unwrap().replicas, 4);
}

#[tokio::test]
async fn previous_version_is_the_last_completed_one() {
    let sim = SimCluster::new();
    let orch = orchestrator(&sim);

    let first = deploy(&orch, sample_request("api", "dev", "1.9")).await;
    assert_eq!(first.previous_version, None);

    let second = deploy(&orch, sample_request("api", "dev", "2.0")).await;
    assert_eq!(second.previous_version.as_deref(), Some("1.9"));

    // Other environments keep their own history.
    let other = deploy(&orch, sample_request("api", "qa", "2.0")).await;
    assert_eq!(other.previous_version, None);
}

#[tokio::test]
async fn executor_failure_is_recorded_with_its_message() {
    let sim = SimCluster::new();
    sim.break_image("registry.local/api:2.0").await;
    let orch = orchestrator(&sim);

    let failed = deploy(&orch, sample_request("api", "dev", "2.0")).await;

    assert_eq!(failed.status, DeploymentStatus::Failed);
    assert_completion_invariant(&failed);
    assert!(failed.error.as_deref().unwrap().contains("crashed on start"));
}

#[tokio::test]
async fn panicking_executor_fails_only_its_own_deployment() {
    let sim = SimCluster::new();
    sim.panic_on("wait_for_rollout", "api-dev-blue").await;
    let orch = orchestrator(&sim);

    let panicked = orch.create(sample_request("api", "dev", "1.0")).await.unwrap();
    let healthy = orch.create(sample_request("web", "dev", "1.0")).await.unwrap();

    let panicked = orch.wait(&panicked).await.unwrap();
    let healthy = orch.wait(&healthy).await.unwrap();
    assert_eq!(panicked.status, DeploymentStatus::Failed);
    assert_eq!(panicked.error.as_deref(), Some("execution panicked"));
    assert_eq!(healthy.status, DeploymentStatus::Completed);
}

#[tokio::test]
async fn concurrent_deployments_all_finish() {
    let sim = SimCluster::new();
    sim.set_latency(Duration::from_millis(2)).await;
    let orch = orchestrator(&sim);

    let mut ids = Vec::new();
    for service in ["api", "web", "worker", "billing"] {
        ids.push(orch.create(sample_request(service, "dev", "1.0")).await.unwrap());
    }
    for id in ids {
        assert_eq!(orch.wait(&id).await.unwrap().status, DeploymentStatus::Completed);
    }
    assert!(orch.active_tasks().await.is_empty());
}

#[tokio::test]
async fn overlapping_deployments_of_one_route_run_in_turn() {
    let sim = SimCluster::new();
    sim.seed_environment("api-prod-blue", "registry.local/api:1.9", 4).await;
    sim.route_to("api-prod", "api-prod-blue").await;
    sim.set_latency(Duration::from_millis(10)).await;
    let orch = orchestrator(&sim);

    let first = orch.create(sample_request("api", "prod", "2.0")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(25)).await;
    let second = orch.create(sample_request("api", "prod", "2.1")).await.unwrap();
    assert_eq!(orch.get(&second).await.unwrap().status, DeploymentStatus::Pending);

    let first = orch.wait(&first).await.unwrap();
    let second = orch.wait(&second).await.unwrap();
    assert_eq!(first.status, DeploymentStatus::Completed);
    assert_eq!(second.status, DeploymentStatus::Completed);

    // The second rollout staged into the slot the first one had retired.
    assert_eq!(
        sim.calls_to("create_environment").await,
        vec!["api-prod-green", "api-prod-blue"]
    );
    assert_eq!(
        sim.calls_to("delete_environment").await,
        vec!["api-prod-blue", "api-prod-green"]
    );
    assert_eq!(
        sim.environment("api-prod-blue").await.unwrap().image,
        "registry.local/api:2.1"
    );
    assert!(sim.environment("api-prod-green").await.is_none());
    assert_eq!(
        sim.route("api-prod").await,
        Some(vec![TrafficWeight::new("api-prod-blue", 100)])
    );
}

#[tokio::test]
async fn queued_deployment_can_be_cancelled() {
    let sim = SimCluster::new();
    sim.stall("wait_for_rollout", "*").await;
    let orch = orchestrator(&sim);
    let running = orch.create(sample_request("api", "dev", "1.0")).await.unwrap();
    wait_for_status(&orch, &running, DeploymentStatus::InProgress).await;
    let queued = orch.create(sample_request("api", "dev", "1.1")).await.unwrap();

    let cancelled = orch.cancel(&queued).await.unwrap();

    assert_eq!(orch.wait(&queued).await.unwrap(), cancelled);
    assert_eq!(orch.get(&running).await.unwrap().status, DeploymentStatus::InProgress);

    orch.cancel(&running).await.unwrap();
    orch.wait(&running).await.unwrap();
    assert_eq!(sim.calls_to("create_environment").await, vec!["api-dev-blue"]);
}

// ── get / list ────────────────────────────────────────────────────

#[tokio::test]
async fn terminal_snapshots_are_stable() {
    let sim = SimCluster::new();
    let orch = orchestrator(&sim);
    let done = deploy(&orch, sample_request("api", "dev", "1.0")).await;

    let again = orch.get(&done.id).await.unwrap();
    let third = orch.get(&done.id).await.unwrap();
    assert_eq!(done, again);
    assert_eq!(again, third);
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let orch = orchestrator(&SimCluster::new());
    assert!(matches!(orch.get("nope").await, Err(OrchestratorError::NotFound(_))));
    assert!(matches!(orch.cancel("nope").await, Err(OrchestratorError::NotFound(_))));
    assert!(matches!(
        orch.rollback("nope", None).await,
        Err(OrchestratorError::NotFound(_))
    ));
    assert!(matches!(
        orch.subscribe_events("nope").await,
        Err(OrchestratorError::NotFound(_))
    ));
}

#[tokio::test]
async fn list_filters_and_orders_newest_first() {
    let sim = SimCluster::new();
    sim.break_image("registry.local/web:1.0").await;
    let orch = orchestrator(&sim);

    let a = deploy(&orch, sample_request("api", "dev", "1.0")).await;
    let b = deploy(&orch, sample_request("web", "dev", "1.0")).await;
    let c = deploy(&orch, sample_request("api", "qa", "1.0")).await;

    let all: Vec<_> = orch
        .list(&DeploymentFilter::All)
        .await
        .into_iter()
        .map(|d| d.id)
        .collect();
    assert_eq!(all, vec![c.id.clone(), b.id.clone(), a.id.clone()]);

    let api = orch.list(&DeploymentFilter::Service("api".to_string())).await;
    assert_eq!(api.len(), 2);

    let qa = orch.list(&DeploymentFilter::Environment("qa".to_string())).await;
    assert_eq!(qa[0].id, c.id);

    let failed = orch
        .list(&DeploymentFilter::Status(DeploymentStatus::Failed))
        .await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, b.id);

    let window = orch
        .list(&DeploymentFilter::CreatedBetween {
            from: b.created_at,
            to: c.created_at,
        })
        .await;
    assert_eq!(window.len(), 2);
}

// ── cancel ────────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_in_progress_deployment() {
    let sim = SimCluster::new();
    sim.stall("wait_for_rollout", "*").await;
    let orch = orchestrator(&sim);
    let id = orch.create(sample_request("api", "dev", "1.0")).await.unwrap();
    wait_for_status(&orch, &id, DeploymentStatus::InProgress).await;

    let cancelled = orch.cancel(&id).await.unwrap();

    assert_eq!(cancelled.status, DeploymentStatus::Cancelled);
    assert_eq!(cancelled.error.as_deref(), Some("cancelled by user"));
    assert_completion_invariant(&cancelled);

    // The task unwinds and removes the environment it created.
    let settled = orch.wait(&id).await.unwrap();
    assert_eq!(settled, cancelled);
    assert!(sim.environment("api-dev-blue").await.is_none());
}

#[tokio::test]
async fn cancel_is_rejected_once_terminal() {
    let sim = SimCluster::new();
    let orch = orchestrator(&sim);
    let done = deploy(&orch, sample_request("api", "dev", "1.0")).await;

    let err = orch.cancel(&done.id).await.unwrap_err();
    assert_eq!(
        err,
        OrchestratorError::InvalidState {
            id: done.id.clone(),
            status: DeploymentStatus::Completed,
            operation: "cancel",
        }
    );
    assert_eq!(orch.get(&done.id).await.unwrap(), done);
}

#[tokio::test]
async fn cancelled_stays_cancelled() {
    let sim = SimCluster::new();
    sim.stall("wait_for_rollout", "*").await;
    let orch = orchestrator(&sim);
    let id = orch.create(sample_request("api", "dev", "1.0")).await.unwrap();
    orch.cancel(&id).await.unwrap();

    assert!(matches!(
        orch.cancel(&id).await,
        Err(OrchestratorError::InvalidState { .. })
    ));
    assert_eq!(orch.wait(&id).await.unwrap().status, DeploymentStatus::Cancelled);
}

// ── rollback ──────────────────────────────────────────────────────

#[tokio::test]
async fn rollback_creates_a_new_deployment_of_the_previous_version() {
    let sim = SimCluster::new();
    let orch = orchestrator(&sim);
    deploy(&orch, sample_request("api", "dev", "1.9")).await;
    let current = deploy(&orch, sample_request("api", "dev", "2.0")).await;

    let rollback_id = orch.rollback(&current.id, None).await.unwrap();

    assert_ne!(rollback_id, current.id);
    let rollback = orch.wait(&rollback_id).await.unwrap();
    assert_eq!(rollback.version(), "1.9");
    assert!(rollback.request.rollback);
    assert_eq!(rollback.status, DeploymentStatus::Completed);
    assert_eq!(orch.get(&current.id).await.unwrap(), current);
    assert_eq!(
        sim.environment("api-dev-blue").await.unwrap().image,
        "registry.local/api:1.9"
    );
}

#[tokio::test]
async fn rollback_to_explicit_version() {
    let sim = SimCluster::new();
    let orch = orchestrator(&sim);
    let only = deploy(&orch, sample_request("api", "dev", "2.0")).await;

    let id = orch.rollback(&only.id, Some("1.5".to_string())).await.unwrap();
    assert_eq!(orch.wait(&id).await.unwrap().version(), "1.5");
}

#[tokio::test]
async fn rollback_preconditions() {
    let sim = SimCluster::new();
    let orch = orchestrator(&sim);

    let first = deploy(&orch, sample_request("api", "dev", "1.0")).await;
    assert_eq!(
        orch.rollback(&first.id, None).await,
        Err(OrchestratorError::NoPreviousVersion(first.id.clone()))
    );

    sim.stall("wait_for_rollout", "*").await;
    let running = orch.create(sample_request("api", "dev", "1.1")).await.unwrap();
    assert!(matches!(
        orch.rollback(&running, None).await,
        Err(OrchestratorError::InvalidState { .. })
    ));

    orch.cancel(&running).await.unwrap();
    assert!(matches!(
        orch.rollback(&running, Some("1.0".to_string())).await,
        Err(OrchestratorError::InvalidState { .. })
    ));
}

// ── auto-rollback ─────────────────────────────────────────────────

fn with_auto_rollback(version: &str) -> DeploymentRequest {
    let mut request = sample_request("api", "dev", version);
    request.auto_rollback = true;
    request
}

#[tokio::test]
async fn failed_deployment_rolls_back_exactly_once() {
    let sim = SimCluster::new();
    let orch = orchestrator(&sim);
    deploy(&orch, sample_request("api", "dev", "1.9")).await;
    sim.break_image("registry.local/api:2.0").await;

    let failed = deploy(&orch, with_auto_rollback("2.0")).await;
    assert_eq!(failed.status, DeploymentStatus::Failed);
    assert_eq!(failed.previous_version.as_deref(), Some("1.9"));

    let rollbacks: Vec<_> = orch
        .list(&DeploymentFilter::All)
        .await
        .into_iter()
        .filter(|d| d.request.rollback)
        .collect();
    assert_eq!(rollbacks.len(), 1);
    assert_eq!(rollbacks[0].version(), "1.9");

    let settled = orch.wait(&rollbacks[0].id).await.unwrap();
    assert_eq!(settled.status, DeploymentStatus::Completed);
    assert_eq!(orch.list(&DeploymentFilter::All).await.len(), 3);
}

#[tokio::test]
async fn no_auto_rollback_without_the_flag() {
    let sim = SimCluster::new();
    let orch = orchestrator(&sim);
    deploy(&orch, sample_request("api", "dev", "1.9")).await;
    sim.break_image("registry.local/api:2.0").await;

    deploy(&orch, sample_request("api", "dev", "2.0")).await;

    assert_eq!(orch.list(&DeploymentFilter::All).await.len(), 2);
}

#[tokio::test]
async fn failed_rollback_is_not_rolled_back_again() {
    let sim = SimCluster::new();
    let orch = orchestrator(&sim);
    deploy(&orch, sample_request("api", "dev", "1.9")).await;
    sim.break_image("registry.local/api:2.0").await;
    sim.break_image("registry.local/api:1.9").await;

    deploy(&orch, with_auto_rollback("2.0")).await;
    let rollback = orch
        .list(&DeploymentFilter::All)
        .await
        .into_iter()
        .find(|d| d.request.rollback)
        .unwrap();
    let rollback = orch.wait(&rollback.id).await.unwrap();

    assert_eq!(rollback.status, DeploymentStatus::Failed);
    assert_eq!(orch.list(&DeploymentFilter::All).await.len(), 3);
}

#[tokio::test]
async fn auto_rollback_needs_a_previous_version() {
    let sim = SimCluster::new();
    sim.break_image("registry.local/api:2.0").await;
    let orch = orchestrator(&sim);

    let failed = deploy(&orch, with_auto_rollback("2.0")).await;

    assert_eq!(failed.status, DeploymentStatus::Failed);
    assert_eq!(orch.list(&DeploymentFilter::All).await.len(), 1);
}

// ── streams and notifications ─────────────────────────────────────

#[tokio::test]
async fn events_end_with_the_terminal_status() {
    let sim = SimCluster::new();
    sim.set_latency(Duration::from_millis(2)).await;
    let orch = orchestrator(&sim);
    let id = orch.create(sample_request("api", "prod", "2.0")).await.unwrap();
    let mut events = orch.subscribe_events(&id).await.unwrap();

    let mut seen = Vec::new();
    loop {
        let event = events.recv().await.unwrap();
        let terminal = event.is_terminal();
        seen.push(event);
        if terminal {
            break;
        }
    }

    assert_eq!(seen.last().unwrap().kind, EventKind::Completed);
    for pair in seen.windows(2) {
        assert!(pair[0].status.can_transition_to(pair[1].status));
    }
}

#[tokio::test]
async fn logs_follow_the_rollout() {
    let sim = SimCluster::new();
    sim.stall("wait_for_ready", "*").await;
    let orch = orchestrator(&sim);
    let id = orch.create(sample_request("api", "prod", "2.0")).await.unwrap();
    let mut logs = orch.subscribe_logs(&id).await.unwrap();
    for _ in 0..200 {
        if !sim.calls_to("wait_for_ready").await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    orch.cancel(&id).await.unwrap();
    orch.wait(&id).await.unwrap();

    let mut messages = Vec::new();
    while let Ok(line) = logs.try_recv() {
        messages.push(line.message);
    }
    assert!(
        messages.iter().any(|m| m == "removed api-prod-blue after failed rollout"),
        "{messages:?}"
    );
}

#[tokio::test]
async fn outcomes_are_notified() {
    let sim = SimCluster::new();
    let orch = orchestrator(&sim);
    let done = deploy(&orch, sample_request("api", "dev", "1.0")).await;

    for _ in 0..100 {
        if !sim.notifications().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let notes = sim.notifications().await;
    assert_eq!(notes.len(), 1);
    assert!(notes[0].contains(&done.id));
    assert!(notes[0].ends_with("completed"));
}

#[tokio::test]
async fn notifier_failure_does_not_affect_the_deployment() {
    let sim = SimCluster::new();
    sim.fail_on("notify", "*").await;
    let orch = orchestrator(&sim);

    let done = deploy(&orch, sample_request("api", "dev", "1.0")).await;
    assert_eq!(done.status, DeploymentStatus::Completed);
}

// ── estimate / validate / shutdown ────────────────────────────────

#[tokio::test]
async fn estimate_uses_the_resolved_strategy() {
    let orch = orchestrator(&SimCluster::new());
    let request = sample_request("api", "prod", "2.0");
    assert_eq!(
        orch.estimate_time(&request),
        estimate(&request, DeploymentStrategy::BlueGreen, &orch.config().estimate)
    );
}

#[tokio::test]
async fn validate_has_no_side_effects() {
    let sim = SimCluster::new();
    let orch = orchestrator(&sim);
    let report = orch.validate(&sample_request("api", "prod", "2.0")).await;
    assert!(report.is_valid);
    assert!(orch.list(&DeploymentFilter::All).await.is_empty());
}

#[tokio::test]
async fn shutdown_cancels_running_tasks() {
    let sim = SimCluster::new();
    sim.stall("wait_for_rollout", "*").await;
    let orch = orchestrator(&sim);
    let id = orch.create(sample_request("api", "dev", "1.0")).await.unwrap();

    orch.shutdown().await;

    assert!(orch.active_tasks().await.is_empty());
    let record = orch.get(&id).await.unwrap();
    assert_eq!(record.status, DeploymentStatus::Cancelled);
    assert_completion_invariant(&record);
}

#[tokio::test]
async fn shutdown_cancels_queued_deployments() {
    let sim = SimCluster::new();
    sim.stall("wait_for_rollout", "*").await;
    let orch = orchestrator(&sim);
    let running = orch.create(sample_request("api", "dev", "1.0")).await.unwrap();
    wait_for_status(&orch, &running, DeploymentStatus::InProgress).await;
    let queued = orch.create(sample_request("api", "dev", "1.1")).await.unwrap();

    orch.shutdown().await;

    for id in [&running, &queued] {
        let record = orch.get(id).await.unwrap();
        assert_eq!(record.status, DeploymentStatus::Cancelled);
        assert_eq!(record.error.as_deref(), Some("execution cancelled"));
        assert_completion_invariant(&record);
    }
}

#[tokio::test]
async fn create_after_shutdown_is_refused() {
    let sim = SimCluster::new();
    let orch = orchestrator(&sim);
    orch.shutdown().await;

    let err = orch.create(sample_request("api", "dev", "1.0")).await.unwrap_err();

    assert_eq!(err, OrchestratorError::ShuttingDown);
    assert!(orch.list(&DeploymentFilter::All).await.is_empty());
    assert!(orch.active_tasks().await.is_empty());
    assert!(sim.calls().await.is_empty());
}

#[tokio::test]
async fn finished_deployments_release_their_streams() {
    let sim = SimCluster::new();
    let bus = EventBus::default();
    let orch = Orchestrator::with_store(
        sim.substrate(),
        fast_config(),
        DeploymentStore::new(bus.clone()),
    );

    let done = deploy(&orch, sample_request("api", "dev", "1.0")).await;
    assert_eq!(bus.channel_count().await, 0);

    let late = orch.subscribe_events(&done.id).await.unwrap();
    assert_eq!(bus.channel_count().await, 1);
    drop(late);

    deploy(&orch, sample_request("web", "dev", "1.0")).await;
    assert_eq!(bus.channel_count().await, 0);
}
