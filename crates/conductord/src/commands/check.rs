//! `conductord validate` and `conductord estimate`.

use std::path::Path;

use anyhow::bail;
use tracing::info;

use conductor_core::ConductorConfig;
use conductor_core::duration::format_duration;
use conductor_engine::Orchestrator;
use conductor_sim::SimCluster;

use super::load_request;

/// Validate a request against an empty simulated cluster.
pub async fn validate(config: &ConductorConfig, path: &Path) -> anyhow::Result<()> {
    let request = load_request(path)?;
    let orchestrator = Orchestrator::new(SimCluster::new().substrate(), config.clone());

    let report = orchestrator.validate(&request).await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.is_valid {
        bail!("{} is invalid: {report}", path.display());
    }
    info!(service = %request.service, version = %request.version, "request is valid");
    Ok(())
}

pub fn estimate(config: &ConductorConfig, path: &Path) -> anyhow::Result<()> {
    let request = load_request(path)?;
    let strategy = conductor_rollout::resolve_strategy(&request);
    let duration = conductor_engine::estimate::estimate(&request, strategy, &config.estimate);

    println!("strategy:  {strategy}");
    println!("estimate:  {}", format_duration(duration));
    Ok(())
}
