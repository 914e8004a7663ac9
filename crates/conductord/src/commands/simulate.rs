//! `conductord simulate` — drive one deployment end to end against an
//! in-memory cluster and stream what happens as JSON lines.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use conductor_core::{ConductorConfig, DeploymentFilter, DeploymentRequest, DeploymentStatus};
use conductor_engine::Orchestrator;
use conductor_sim::SimCluster;

use super::load_request;

pub struct SimulateOptions {
    pub previous: Option<String>,
    pub fail_health: bool,
    pub break_image: bool,
    pub fast: bool,
}

pub async fn simulate(
    mut config: ConductorConfig,
    path: &Path,
    options: SimulateOptions,
) -> anyhow::Result<()> {
    let mut request = load_request(path)?;
    if options.fast {
        shrink_waits(&mut config, &mut request);
    }

    let sim = SimCluster::new();
    let orchestrator = Orchestrator::new(sim.substrate(), config);

    if let Some(previous) = &options.previous {
        seed_previous(&orchestrator, &request, previous).await?;
    }

    let image_ref = request.image_ref();
    if options.break_image {
        sim.break_image(&image_ref).await;
    }
    if options.fail_health {
        sim.degrade_image(&image_ref).await;
    }

    let id = orchestrator
        .create(request.clone())
        .await
        .context("deployment rejected")?;
    let mut events = orchestrator.subscribe_events(&id).await?;
    let mut logs = orchestrator.subscribe_logs(&id).await?;

    let finished = orchestrator.wait(&id);
    tokio::pin!(finished);
    let (mut events_open, mut logs_open) = (true, true);
    let deployment = loop {
        tokio::select! {
            event = events.recv(), if events_open => match event {
                Ok(event) => println!("{}", json!({ "event": event })),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => events_open = false,
            },
            line = logs.recv(), if logs_open => match line {
                Ok(line) => println!("{}", json!({ "log": line })),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "log stream lagged"),
                Err(RecvError::Closed) => logs_open = false,
            },
            deployment = &mut finished => break deployment?,
        }
    };
    while let Ok(event) = events.try_recv() {
        println!("{}", json!({ "event": event }));
    }
    while let Ok(line) = logs.try_recv() {
        println!("{}", json!({ "log": line }));
    }

    println!("{}", json!({ "deployment": deployment }));

    // An auto-rollback may still be running.
    let filter = DeploymentFilter::Service(request.service.clone());
    for record in orchestrator.list(&filter).await {
        let record = if record.is_terminal() {
            record
        } else {
            orchestrator.wait(&record.id).await?
        };
        println!(
            "{}",
            json!({
                "summary": {
                    "id": record.id,
                    "version": record.version(),
                    "strategy": record.strategy,
                    "status": record.status,
                    "rollback": record.request.rollback,
                    "error": record.error,
                }
            })
        );
    }

    for message in sim.notifications().await {
        info!(%message, "notification sent");
    }
    orchestrator.shutdown().await;

    if deployment.status != DeploymentStatus::Completed {
        bail!(
            "deployment {} ended {}: {}",
            deployment.id,
            deployment.status,
            deployment.error.unwrap_or_default()
        );
    }
    Ok(())
}

/// Deploy `version` of the same service so the simulated rollout has a
/// live environment to replace.
async fn seed_previous(
    orchestrator: &Orchestrator,
    request: &DeploymentRequest,
    version: &str,
) -> anyhow::Result<()> {
    let mut previous = request.clone();
    previous.version = version.to_string();
    previous.auto_rollback = false;

    let id = orchestrator
        .create(previous)
        .await
        .with_context(|| format!("deploying previous version {version}"))?;
    let deployment = orchestrator.wait(&id).await?;
    if deployment.status != DeploymentStatus::Completed {
        bail!(
            "previous version {version} did not deploy: {}",
            deployment.error.unwrap_or_default()
        );
    }
    info!(%version, environment = %request.environment, "previous version live");
    Ok(())
}

fn shrink_waits(config: &mut ConductorConfig, request: &mut DeploymentRequest) {
    let rollout = &mut config.rollout;
    rollout.rollout_timeout = Duration::from_secs(2);
    rollout.readiness_timeout = Duration::from_secs(2);
    rollout.termination_timeout = Duration::from_secs(2);
    rollout.blue_green_grace = Duration::from_millis(5);
    rollout.canary_sample_interval = Duration::from_millis(5);
    config.canary.monitoring_duration = Duration::from_millis(20);

    request.health_check.timeout = Duration::from_millis(50);
    request.health_check.interval = Duration::from_millis(1);
    if let Some(canary) = request.canary.as_mut() {
        canary.monitoring_duration = None;
    }
}
